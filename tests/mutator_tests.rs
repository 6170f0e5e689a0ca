//! Mutator pipeline behavior: variant splitting and edge rewriting,
//! reverse dependencies, renames, replacements, created modules.


use std::path::PathBuf;
use std::sync::Arc;

use cyanotype::module::DepTag;
use cyanotype::parser::{Pos, Property, Value};
use cyanotype::registry::Registry;
use cyanotype::{Engine, EngineError};

use fixture::{GenLog, cc_engine_with};

use test_log::test;

#[derive(Debug)]
struct TestTag;

impl DepTag for TestTag {}

fn engine_with_mutators(
    files: &[(&str, &str)],
    log: Arc<GenLog>,
    configure: impl FnOnce(&mut Registry),
) -> Result<Engine, Vec<EngineError>> {
    let mut registry = Registry::new();
    fixture::register_cc(&mut registry);
    configure(&mut registry);
    let mut engine = cc_engine_with(files, log, registry)?;
    engine.parse_blueprints(&[PathBuf::from("Blueprints")])?;
    engine.resolve()?;
    Ok(engine)
}

// Splitting a library on buildType yields one generator run per value,
// and a dependent that was not split follows the first (default) value.
#[test]
fn variant_split_and_edge_rewriting() {
    let log = Arc::new(GenLog::default());
    let mut engine = engine_with_mutators(
        &[(
            "Blueprints",
            r#"
cc_shared_lib { name: "foo", srcs: ["foo.cc"] }
cc_binary { name: "bar", srcs: ["bar.c"], deps: ["foo"] }
"#,
        )],
        log.clone(),
        |registry| {
            registry.register_bottom_up_mutator(
                "build_type",
                Box::new(|ctx| {
                    if ctx.module_type() == "cc_shared_lib" {
                        ctx.create_variations("buildType", &["debug", "release"]);
                    }
                }),
            );
        },
    )
    .unwrap();

    let variants = engine.module_variants("foo");
    assert_eq!(variants.len(), 2);
    let variations = |id| -> Vec<(String, String)> {
        engine
            .graph()
            .variations(id)
            .iter()
            .map(|(d, v)| (d.to_string(), v.to_string()))
            .collect()
    };
    assert_eq!(
        variations(variants[0]),
        vec![("buildType".to_string(), "debug".to_string())]
    );
    assert_eq!(
        variations(variants[1]),
        vec![("buildType".to_string(), "release".to_string())]
    );

    // bar was not split, so its edge points at the debug variant.
    let bar = engine.module_by_name("bar").unwrap();
    let mut targets = Vec::new();
    engine.graph().visit_direct_deps(bar, |id, _| targets.push(id));
    assert_eq!(targets, vec![variants[0]]);

    engine.generate().unwrap();
    let visited = log.visited.lock().unwrap().clone();
    let foo_runs = visited.iter().filter(|v| v.starts_with("foo")).count();
    assert_eq!(foo_runs, 2, "{visited:?}");
    assert!(visited.contains(&"foo:buildType=debug".to_string()));
    assert!(visited.contains(&"foo:buildType=release".to_string()));
}

// A source that already carries a value for the dimension follows it
// into the split target.
#[test]
fn split_source_follows_its_own_value() {
    let engine = engine_with_mutators(
        &[(
            "Blueprints",
            r#"
cc_shared_lib { name: "dep", srcs: ["d.cc"] }
cc_shared_lib { name: "user", srcs: ["u.cc"], deps: ["dep"] }
"#,
        )],
        Arc::new(GenLog::default()),
        |registry| {
            registry.register_bottom_up_mutator(
                "build_type",
                Box::new(|ctx| {
                    if ctx.module_type() == "cc_shared_lib" {
                        ctx.create_variations("buildType", &["debug", "release"]);
                    }
                }),
            );
        },
    )
    .unwrap();

    let dep_variants = engine.module_variants("dep");
    let user_variants = engine.module_variants("user");
    for (user, expected_dep) in user_variants.iter().zip(dep_variants.iter()) {
        let mut targets = Vec::new();
        engine.graph().visit_direct_deps(*user, |id, _| targets.push(id));
        assert_eq!(targets, vec![*expected_dep]);
    }
}

// Reverse dependencies become edges from the named module to the one
// that requested them, applied at pass end.
#[test]
fn reverse_dependency() {
    let engine = engine_with_mutators(
        &[(
            "Blueprints",
            r#"
cc_shared_lib { name: "plugin", srcs: ["p.cc"] }
cc_binary { name: "host", srcs: ["h.c"] }
"#,
        )],
        Arc::new(GenLog::default()),
        |registry| {
            registry.register_bottom_up_mutator(
                "plugins",
                Box::new(|ctx| {
                    if ctx.module_name() == "plugin" {
                        ctx.add_reverse_dependency("host", Arc::new(TestTag));
                    }
                }),
            );
        },
    )
    .unwrap();

    let host = engine.module_by_name("host").unwrap();
    let plugin = engine.module_by_name("plugin").unwrap();
    let mut targets = Vec::new();
    engine.graph().visit_direct_deps(host, |id, _| targets.push(id));
    assert_eq!(targets, vec![plugin]);
}

// The new name only resolves after the pass completes.
#[test]
fn rename_takes_effect_at_pass_end() {
    let engine = engine_with_mutators(
        &[("Blueprints", r#"cc_binary { name: "old", srcs: ["o.c"] }"#)],
        Arc::new(GenLog::default()),
        |registry| {
            registry.register_bottom_up_mutator(
                "renamer",
                Box::new(|ctx| {
                    if ctx.module_name() == "old" {
                        ctx.rename("new");
                    }
                }),
            );
        },
    )
    .unwrap();

    assert!(engine.module_by_name("old").is_none());
    assert!(engine.module_by_name("new").is_some());
}

// replace_dependencies redirects edges aimed at the named module to the
// caller.
#[test]
fn replace_dependencies() {
    let engine = engine_with_mutators(
        &[(
            "Blueprints",
            r#"
cc_shared_lib { name: "orig", srcs: ["o.cc"] }
cc_shared_lib { name: "wrapper", srcs: ["w.cc"], deps: ["orig"] }
cc_binary { name: "user", srcs: ["u.c"], deps: ["orig"] }
"#,
        )],
        Arc::new(GenLog::default()),
        |registry| {
            registry.register_bottom_up_mutator(
                "wrap",
                Box::new(|ctx| {
                    if ctx.module_name() == "wrapper" {
                        ctx.replace_dependencies("orig");
                    }
                }),
            );
        },
    )
    .unwrap();

    let user = engine.module_by_name("user").unwrap();
    let wrapper = engine.module_by_name("wrapper").unwrap();
    let mut targets = Vec::new();
    engine.graph().visit_direct_deps(user, |id, _| targets.push(id));
    assert_eq!(targets, vec![wrapper]);

    // The wrapper's own edge to the original must survive, or the
    // replacement would orphan it.
    let orig = engine.module_by_name("orig").unwrap();
    let mut wrapper_deps = Vec::new();
    engine
        .graph()
        .visit_direct_deps(wrapper, |id, _| wrapper_deps.push(id));
    assert_eq!(wrapper_deps, vec![orig]);
}

// Top-down mutators can synthesize brand-new modules, visible to later
// lookups.
#[test]
fn create_module_from_mutator() {
    let engine = engine_with_mutators(
        &[("Blueprints", r#"cc_binary { name: "seed", srcs: ["s.c"] }"#)],
        Arc::new(GenLog::default()),
        |registry| {
            registry.register_top_down_mutator(
                "synthesize",
                Box::new(|ctx| {
                    if ctx.module_name() == "seed" {
                        let pos = Pos::default();
                        ctx.create_module(
                            "cc_shared_lib",
                            vec![
                                Property {
                                    name: "name".into(),
                                    pos,
                                    value: Value::String(pos, "generated".to_string()),
                                },
                                Property {
                                    name: "srcs".into(),
                                    pos,
                                    value: Value::List(
                                        pos,
                                        vec![Value::String(pos, "g.cc".to_string())],
                                    ),
                                },
                            ],
                        );
                    }
                }),
            );
        },
    )
    .unwrap();

    let generated = engine.module_by_name("generated").unwrap();
    assert_eq!(engine.graph().module_type_name(generated), "cc_shared_lib");
}

// Mutator errors accumulate per module and fail the pipeline at the end
// of the pass.
#[test]
fn mutator_errors_accumulate() {
    let result = engine_with_mutators(
        &[(
            "Blueprints",
            r#"
cc_binary { name: "one", srcs: ["1.c"] }
cc_binary { name: "two", srcs: ["2.c"] }
"#,
        )],
        Arc::new(GenLog::default()),
        |registry| {
            registry.register_bottom_up_mutator(
                "complain",
                Box::new(|ctx| {
                    let name = ctx.module_name();
                    ctx.errorf(format!("{name} is unacceptable"));
                }),
            );
        },
    );

    let errors = fixture::error_strings(result.unwrap_err());
    assert_eq!(errors.len(), 2, "{errors:?}");
    assert!(errors.iter().any(|e| e.contains("\"one\"")), "{errors:?}");
    assert!(errors.iter().any(|e| e.contains("\"two\"")), "{errors:?}");
}

// A cycle introduced by a mutator is caught at the pass boundary.
#[test]
fn mutator_cycle_detected_at_pass_end() {
    let result = engine_with_mutators(
        &[(
            "Blueprints",
            r#"
cc_shared_lib { name: "a", srcs: ["a.cc"], deps: ["b"] }
cc_shared_lib { name: "b", srcs: ["b.cc"] }
"#,
        )],
        Arc::new(GenLog::default()),
        |registry| {
            registry.register_bottom_up_mutator(
                "close_loop",
                Box::new(|ctx| {
                    if ctx.module_name() == "b" {
                        ctx.add_dependency("a", Arc::new(TestTag));
                    }
                }),
            );
        },
    );

    let errors = fixture::error_strings(result.unwrap_err());
    assert!(errors.iter().any(|e| e.contains("cycle")), "{errors:?}");
}
