//! End-to-end scenarios over the in-memory tree: parse, bind, resolve,
//! generate, emit.


use std::path::PathBuf;
use std::sync::Arc;

use cyanotype::generate::{GenerateError, ModuleContext};
use cyanotype::module::Module;
use cyanotype::ninja_defs::RuleParams;
use cyanotype::registry::{NewModule, Registry};

use fixture::{GenLog, cc_engine, error_strings, generate_manifest};

use test_log::test;

// 1) A single binary with no deps: one compile, one link, one phony.
#[test]
fn single_binary_manifest() {
    let manifest = generate_manifest(&[(
        "Blueprints",
        r#"
cc_binary {
    name: "hello",
    srcs: ["hello.c"],
}
"#,
    )])
    .unwrap();

    assert!(manifest.contains("rule cc.cc\n"), "{manifest}");
    assert!(manifest.contains("rule cc.link\n"), "{manifest}");
    assert!(
        manifest.contains("build out/hello/hello.c.o: cc.cc hello.c\n"),
        "{manifest}"
    );
    assert!(
        manifest.contains("build out/hello: cc.link out/hello/hello.c.o\n"),
        "{manifest}"
    );
    assert!(manifest.contains("build hello: phony out/hello\n"), "{manifest}");
    // The phony rule itself is built in; it must not be defined.
    assert!(!manifest.contains("rule phony"), "{manifest}");
}

// 2) A binary against a shared library: include paths propagate to the
//    compile step, linker flags and the implicit .so to the link step.
#[test]
fn shared_library_dependency() {
    let manifest = generate_manifest(&[(
        "Blueprints",
        r#"
cc_shared_lib {
    name: "foo",
    srcs: ["foo.cc"],
    includePaths: ["include"],
}

cc_binary {
    name: "bar",
    srcs: ["bar.c"],
    deps: ["foo"],
}
"#,
    )])
    .unwrap();

    assert!(
        manifest.contains("build out/bar/bar.c.o: cc.cc bar.c\n    cFlags = -Iinclude\n"),
        "{manifest}"
    );
    assert!(
        manifest.contains(
            "build out/bar: cc.link out/bar/bar.c.o | out/foo/libfoo.so\n    \
             ldFlags = -Lout/foo -lfoo -Wl,-rpath=out/foo\n"
        ),
        "{manifest}"
    );
}

// 3) Generators run after the generators of everything they depend on.
#[test]
fn dependency_ordering() {
    let log = Arc::new(GenLog::default());
    let mut engine = cc_engine(
        &[(
            "Blueprints",
            r#"
cc_shared_lib { name: "base", srcs: ["base.cc"] }
cc_shared_lib { name: "mid", srcs: ["mid.cc"], deps: ["base"] }
cc_binary { name: "app", srcs: ["app.c"], deps: ["mid", "base"] }
"#,
        )],
        log.clone(),
    )
    .unwrap();
    engine.parse_blueprints(&[PathBuf::from("Blueprints")]).unwrap();
    engine.resolve().unwrap();
    engine.generate().unwrap();

    let visited = log.visited.lock().unwrap().clone();
    let pos = |name: &str| {
        visited
            .iter()
            .position(|v| v == name)
            .unwrap_or_else(|| panic!("{name} not generated; log {visited:?}"))
    };
    assert!(pos("base") < pos("mid"));
    assert!(pos("mid") < pos("app"));
}

// 4) A cycle names every module involved, and nothing generates.
#[test]
fn cycle_is_reported() {
    let log = Arc::new(GenLog::default());
    let mut engine = cc_engine(
        &[(
            "Blueprints",
            r#"
cc_shared_lib { name: "A", srcs: ["a.cc"], deps: ["B"] }
cc_shared_lib { name: "B", srcs: ["b.cc"], deps: ["A"] }
"#,
        )],
        log.clone(),
    )
    .unwrap();
    engine.parse_blueprints(&[PathBuf::from("Blueprints")]).unwrap();
    let errors = error_strings(engine.resolve().unwrap_err());
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(errors[0].contains("cycle"), "{errors:?}");
    assert!(errors[0].contains("A") && errors[0].contains("B"), "{errors:?}");
    assert!(log.visited.lock().unwrap().is_empty());
}

#[test]
fn unknown_dependency_is_an_error() {
    let mut engine = cc_engine(
        &[(
            "Blueprints",
            r#"cc_binary { name: "app", srcs: ["a.c"], deps: ["nope"] }"#,
        )],
        Arc::new(()),
    )
    .unwrap();
    engine.parse_blueprints(&[PathBuf::from("Blueprints")]).unwrap();
    let errors = error_strings(engine.resolve().unwrap_err());
    assert!(
        errors[0].contains("depends on undefined module \"nope\""),
        "{errors:?}"
    );
}

#[test]
fn duplicate_module_names_are_an_error() {
    let mut engine = cc_engine(
        &[(
            "Blueprints",
            r#"
cc_binary { name: "dup", srcs: ["a.c"] }
cc_binary { name: "dup", srcs: ["b.c"] }
"#,
        )],
        Arc::new(()),
    )
    .unwrap();
    let errors = error_strings(engine.parse_blueprints(&[PathBuf::from("Blueprints")]).unwrap_err());
    assert!(errors[0].contains("already defined"), "{errors:?}");
}

#[test]
fn unknown_module_type_is_an_error() {
    let mut engine = cc_engine(
        &[("Blueprints", r#"java_library { name: "x" }"#)],
        Arc::new(()),
    )
    .unwrap();
    let errors = error_strings(engine.parse_blueprints(&[PathBuf::from("Blueprints")]).unwrap_err());
    assert!(
        errors[0].contains("unknown module type \"java_library\""),
        "{errors:?}"
    );
}

// A module that opts in to missing dependencies records them instead of
// failing resolution.
struct Tolerant;

impl Module for Tolerant {
    fn generate(&self, ctx: &mut ModuleContext<'_>) -> Result<(), GenerateError> {
        let missing: Vec<&str> = ctx.missing_deps().iter().map(|s| s.as_str()).collect();
        assert_eq!(missing, vec!["gone"]);
        Ok(())
    }

    fn handles_missing_deps(&self) -> bool {
        true
    }
}

#[test]
fn missing_deps_opt_in() {
    let mut registry = Registry::new();
    fixture::register_cc(&mut registry);
    registry.register_module_type("tolerant", || NewModule {
        logic: Arc::new(Tolerant),
        receivers: vec![],
    });

    let mut engine = fixture::cc_engine_with(
        &[("Blueprints", r#"tolerant { name: "t", deps: ["gone"] }"#)],
        Arc::new(()),
        registry,
    )
    .unwrap();
    engine.parse_blueprints(&[PathBuf::from("Blueprints")]).unwrap();
    engine.resolve().unwrap();
    engine.generate().unwrap();
}

// A rule whose command names a package that was never imported fails
// generation, before anything could be written.
struct BadRule {
    pkg: cyanotype::registry::PackageId,
}

impl Module for BadRule {
    fn generate(&self, ctx: &mut ModuleContext<'_>) -> Result<(), GenerateError> {
        ctx.rule(
            self.pkg,
            "broken",
            RuleParams {
                command: "${nonexistent.X} $in $out".to_string(),
                ..Default::default()
            },
            &[],
        )?;
        Ok(())
    }
}

#[test]
fn unimported_package_reference_fails_emission() {
    let mut registry = Registry::new();
    let pkg = fixture::register_cc(&mut registry);
    registry.register_module_type("bad_rule", move || NewModule {
        logic: Arc::new(BadRule { pkg }),
        receivers: vec![],
    });

    let mut engine = fixture::cc_engine_with(
        &[("Blueprints", r#"bad_rule { name: "b" }"#)],
        Arc::new(()),
        registry,
    )
    .unwrap();
    engine.parse_blueprints(&[PathBuf::from("Blueprints")]).unwrap();
    engine.resolve().unwrap();
    let errors = error_strings(engine.generate().unwrap_err());
    assert!(
        errors[0].contains("package \"nonexistent\" is not imported"),
        "{errors:?}"
    );
}

// Blueprints in subdirectories are reached through subdirs, and module
// dirs prefix their source paths.
#[test]
fn subdirs_are_parsed() {
    let manifest = generate_manifest(&[
        ("Blueprints", "subdirs = [\"lib\"]\n"),
        (
            "lib/Blueprints",
            r#"cc_binary { name: "sub", srcs: ["sub.c"] }"#,
        ),
    ])
    .unwrap();
    assert!(
        manifest.contains("build out/sub/sub.c.o: cc.cc lib/sub.c\n"),
        "{manifest}"
    );
}

// Re-rendering with unchanged inputs is byte-identical.
#[test]
fn manifest_is_deterministic() {
    let files = &[(
        "Blueprints",
        r#"
cc_shared_lib { name: "foo", srcs: ["foo.cc"] }
cc_binary { name: "bar", srcs: ["bar.c"], deps: ["foo"] }
"#,
    )];
    let first = generate_manifest(files).unwrap();
    let second = generate_manifest(files).unwrap();
    assert_eq!(first, second);
}
