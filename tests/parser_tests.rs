//! Blueprints parsing and property binding.

use cyanotype::parser::{self, Definition, Value};
use cyanotype::props::{self, PropValue, PropertyReceiver, PropertySchema};

use expect_test::expect;
use smol_str::SmolStr;

fn parse_ok(src: &str) -> parser::ParsedFile {
    let parsed = parser::parse("Blueprints", src);
    assert!(parsed.errors.is_empty(), "{:?}", parsed.errors);
    parsed
}

fn parse_errs(src: &str) -> Vec<String> {
    parser::parse("Blueprints", src)
        .errors
        .into_iter()
        .map(|e| e.to_string())
        .collect()
}

#[test]
fn assignments_and_module_calls() {
    let parsed = parse_ok(
        r#"
srcs_extra = ["b.c"]

cc_binary {
    name: "hello",
    srcs: ["a.c"] + srcs_extra,
    nested: { k: "v" },
    count: 3,
    fast: true,
}
"#,
    );
    expect![[r#"
        ModuleCall {
            type_name: "cc_binary",
            type_pos: Pos {
                line: 4,
                col: 1,
            },
            props: [
                Property {
                    name: "name",
                    pos: Pos {
                        line: 5,
                        col: 5,
                    },
                    value: String(
                        Pos {
                            line: 5,
                            col: 11,
                        },
                        "hello",
                    ),
                },
                Property {
                    name: "srcs",
                    pos: Pos {
                        line: 6,
                        col: 5,
                    },
                    value: List(
                        Pos {
                            line: 6,
                            col: 11,
                        },
                        [
                            String(
                                Pos {
                                    line: 6,
                                    col: 12,
                                },
                                "a.c",
                            ),
                            String(
                                Pos {
                                    line: 6,
                                    col: 21,
                                },
                                "b.c",
                            ),
                        ],
                    ),
                },
                Property {
                    name: "nested",
                    pos: Pos {
                        line: 7,
                        col: 5,
                    },
                    value: Map(
                        Pos {
                            line: 7,
                            col: 13,
                        },
                        [
                            Property {
                                name: "k",
                                pos: Pos {
                                    line: 7,
                                    col: 15,
                                },
                                value: String(
                                    Pos {
                                        line: 7,
                                        col: 18,
                                    },
                                    "v",
                                ),
                            },
                        ],
                    ),
                },
                Property {
                    name: "count",
                    pos: Pos {
                        line: 8,
                        col: 5,
                    },
                    value: Int(
                        Pos {
                            line: 8,
                            col: 12,
                        },
                        3,
                    ),
                },
                Property {
                    name: "fast",
                    pos: Pos {
                        line: 9,
                        col: 5,
                    },
                    value: Bool(
                        Pos {
                            line: 9,
                            col: 11,
                        },
                        true,
                    ),
                },
            ],
            end_line: 10,
        }
    "#]]
    .assert_debug_eq(match &parsed.file.defs[1] {
        Definition::Module(call) => call,
        other => panic!("expected a module call, got {other:?}"),
    });
}

#[test]
fn string_concatenation() {
    let parsed = parse_ok("full = \"abc\" + \"def\"\n");
    let Definition::Assignment(a) = &parsed.file.defs[0] else {
        panic!("expected an assignment");
    };
    assert_eq!(a.value.as_str(), Some("abcdef"));
}

#[test]
fn append_assignment() {
    let parsed = parse_ok("xs = [\"a\"]\nxs += [\"b\"]\n");
    let Definition::Assignment(a) = &parsed.file.defs[1] else {
        panic!("expected an assignment");
    };
    assert!(a.append);
    assert_eq!(a.value.as_string_list(), Some(vec!["a", "b"]));
}

#[test]
fn mismatched_concatenation_is_an_error() {
    let errors = parse_errs("bad = \"abc\" + [\"def\"]\n");
    assert_eq!(
        errors,
        vec!["Blueprints:1:13: cannot concatenate string and list"]
    );
}

#[test]
fn undefined_variable_reference() {
    let errors = parse_errs("x = missing\n");
    assert_eq!(errors, vec!["Blueprints:1:5: variable missing is not defined"]);
}

#[test]
fn redefinition_is_an_error() {
    let errors = parse_errs("x = \"a\"\nx = \"b\"\n");
    assert_eq!(
        errors,
        vec!["Blueprints:2:1: variable x is already defined at 1:1"]
    );
}

#[test]
fn append_after_reference_is_an_error() {
    let errors = parse_errs("x = [\"a\"]\ny = x\nx += [\"b\"]\n");
    assert_eq!(
        errors,
        vec!["Blueprints:3:1: cannot append to variable x, it was referenced at 2:5"]
    );
}

#[test]
fn subdirs_are_directives_not_defs() {
    let parsed = parse_ok("subdirs = [\"a\", \"b/c\"]\noptional_subdirs = [\"maybe\"]\n");
    assert!(parsed.file.defs.is_empty());
    let dirs: Vec<&str> = parsed
        .directives
        .subdirs
        .iter()
        .map(|(d, _)| d.as_str())
        .collect();
    assert_eq!(dirs, vec!["a", "b/c"]);
    assert_eq!(parsed.directives.optional_subdirs.len(), 1);
}

#[test]
fn multiple_errors_accumulate() {
    let errors = parse_errs("x = nope\ny = \"a\" + 3\n");
    assert_eq!(errors.len(), 2, "{errors:?}");
}

// Binder behavior.

fn bind_one_receiver(
    schema: std::sync::Arc<PropertySchema>,
    src: &str,
    target_os: &str,
) -> (PropertyReceiver, Vec<String>) {
    let parsed = parser::parse("Blueprints", src);
    assert!(parsed.errors.is_empty(), "{:?}", parsed.errors);
    let Definition::Module(call) = &parsed.file.defs[0] else {
        panic!("expected a module call");
    };
    let mut receivers = vec![PropertyReceiver::new(schema)];
    let mut errors = Vec::new();
    props::bind(
        &mut receivers,
        &call.props,
        &SmolStr::new("Blueprints"),
        target_os,
        &mut errors,
    );
    (
        receivers.pop().unwrap(),
        errors.into_iter().map(|e| e.to_string()).collect(),
    )
}

fn test_schema() -> std::sync::Arc<PropertySchema> {
    PropertySchema::builder()
        .string("name")
        .string_list("srcs")
        .bool("fast")
        .int("count")
        .map(
            "nested",
            PropertySchema::builder()
                .string("k")
                .build()
                .as_ref()
                .clone(),
        )
        .mutated("installed", cyanotype::props::PropertyKind::Bool)
        .os_sections()
        .build()
}

#[test]
fn binds_all_shapes() {
    let (receiver, errors) = bind_one_receiver(
        test_schema(),
        r#"m { name: "x", srcs: ["a.c"], fast: true, count: 7, nested: { k: "v" } }"#,
        "linux",
    );
    assert!(errors.is_empty(), "{errors:?}");
    let values = receiver.values();
    assert_eq!(values.string("name"), Some("x"));
    assert_eq!(values.string_list("srcs"), ["a.c"]);
    assert_eq!(values.bool("fast"), Some(true));
    assert_eq!(values.int("count"), Some(7));
    assert_eq!(values.map("nested").unwrap().string("k"), Some("v"));
}

#[test]
fn unknown_property_is_an_error() {
    let (_, errors) = bind_one_receiver(test_schema(), r#"m { name: "x", bogus: 1 }"#, "linux");
    assert_eq!(
        errors,
        vec!["Blueprints:1:16: unrecognized property \"bogus\""]
    );
}

#[test]
fn type_mismatch_reports_expected_shape() {
    let (_, errors) = bind_one_receiver(test_schema(), r#"m { srcs: "a.c" }"#, "linux");
    assert_eq!(
        errors,
        vec!["Blueprints:1:11: expected a list of strings for property \"srcs\", found string"]
    );
}

#[test]
fn duplicate_property_is_an_error() {
    let (_, errors) =
        bind_one_receiver(test_schema(), r#"m { name: "a", name: "b" }"#, "linux");
    assert_eq!(
        errors,
        vec!["Blueprints:1:16: property \"name\" already set at 1:5"]
    );
}

#[test]
fn mutated_property_is_rejected_from_blueprints() {
    let (_, errors) = bind_one_receiver(test_schema(), r#"m { installed: true }"#, "linux");
    assert_eq!(
        errors,
        vec!["Blueprints:1:5: property \"installed\" cannot be set from a Blueprints file"]
    );
}

#[test]
fn matching_is_first_char_case_insensitive() {
    let schema = PropertySchema::builder().string_list("Srcs").build();
    let parsed = parser::parse("Blueprints", r#"m { srcs: ["a.c"] }"#);
    let Definition::Module(call) = &parsed.file.defs[0] else {
        panic!("expected a module call");
    };
    let mut receivers = vec![PropertyReceiver::new(schema)];
    let mut errors = Vec::new();
    props::bind(
        &mut receivers,
        &call.props,
        &SmolStr::new("Blueprints"),
        "linux",
        &mut errors,
    );
    assert!(errors.is_empty(), "{errors:?}");
    assert_eq!(receivers[0].values().string_list("Srcs"), ["a.c"]);
}

// The section matching the target OS merges after the generic section:
// lists append, scalars override.
#[test]
fn os_sections_merge_after_generic() {
    let src = r#"
m {
    name: "x",
    srcs: ["common.c"],
    fast: false,
    linux: { srcs: ["linux.c"], fast: true },
    darwin: { srcs: ["darwin.c"] },
}
"#;
    let (receiver, errors) = bind_one_receiver(test_schema(), src, "linux");
    assert!(errors.is_empty(), "{errors:?}");
    assert_eq!(
        receiver.values().string_list("srcs"),
        ["common.c", "linux.c"]
    );
    assert_eq!(receiver.values().bool("fast"), Some(true));

    let (receiver, errors) = bind_one_receiver(test_schema(), src, "darwin");
    assert!(errors.is_empty(), "{errors:?}");
    assert_eq!(
        receiver.values().string_list("srcs"),
        ["common.c", "darwin.c"]
    );
    assert_eq!(receiver.values().bool("fast"), Some(false));
}

#[test]
fn programmatic_set_accepts_mutated_fields() {
    let mut receiver = PropertyReceiver::new(test_schema());
    receiver
        .set("installed", PropValue::Bool(true))
        .unwrap();
    assert_eq!(receiver.values().bool("installed"), Some(true));
    assert!(receiver.set("bogus", PropValue::Bool(true)).is_err());
}

#[test]
fn to_value_round_trips_through_bind() {
    let original = PropValue::StringList(vec!["a.c".to_string(), "b.c".to_string()]);
    let value = props::to_value(&original);
    match value {
        Value::List(_, ref elems) => assert_eq!(elems.len(), 2),
        ref other => panic!("expected a list, got {other:?}"),
    }
}
