//! The two-stage controller, driven against a real temporary tree.


use std::path::{Path, PathBuf};
use std::sync::Arc;

use cyanotype::bootstrap::{self, Args, PrimaryBuilder, Toolchain, cleanup};
use cyanotype::generate::{GenerateError, ModuleContext, SingletonContext};
use cyanotype::module::Module;
use cyanotype::ninja_defs::{BuildParams, PHONY_RULE};
use cyanotype::registry::{NewModule, PackageId, Registry};
use cyanotype::{Config, Stage};

use clap::Parser;
use test_log::test;

/// A stand-in for the language toolchain: "builds" the primary builder
/// with a phony edge and reports a fixed binary path.
struct StubToolchain;

impl Toolchain for StubToolchain {
    fn primary_builder(
        &self,
        ctx: &mut SingletonContext<'_>,
        pkg: PackageId,
    ) -> Result<PrimaryBuilder, GenerateError> {
        ctx.build(
            pkg,
            PHONY_RULE,
            BuildParams {
                outputs: vec!["bin/builder".to_string()],
                ..Default::default()
            },
        )?;
        Ok(PrimaryBuilder {
            binary: "bin/builder".to_string(),
            test_targets: vec![],
        })
    }
}

/// A module type the bootstrap stage builds; its generator stays quiet.
struct BuilderModule;

impl Module for BuilderModule {
    fn generate(&self, _ctx: &mut ModuleContext<'_>) -> Result<(), GenerateError> {
        Ok(())
    }
}

fn registry() -> Registry {
    let mut registry = Registry::new();
    fixture::register_cc(&mut registry);
    registry.register_bootstrap_module_type("builder_module", || NewModule {
        logic: Arc::new(BuilderModule),
        receivers: vec![],
    });
    registry
}

fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, contents).unwrap();
    path
}

fn run_stage(dir: &Path, stage: Stage, output: &str) -> String {
    let module_list = write(dir, "Blueprints.list", "Blueprints\n");
    write(
        dir,
        "Blueprints",
        r#"
builder_module { name: "primary" }
cc_binary { name: "hello", srcs: ["hello.c"] }
"#,
    );

    let args = Args {
        output: dir.join(output),
        glob_file: dir.join(".bootstrap/build-globs.ninja"),
        build_dir: dir.join("out"),
        ninja_build_dir: dir.join(".ninja"),
        depfile: Some(dir.join(format!("{output}.d"))),
        docs: None,
        module_list,
        empty_ninja_file: false,
        run_tests: false,
        legacy_check_file: None,
        legacy_timestamp: None,
    };
    let config = Config {
        stage,
        srcdir: dir.to_path_buf(),
        ..Default::default()
    };

    let _ = bootstrap::run(
        args,
        config,
        Arc::new(()),
        registry(),
        Arc::new(StubToolchain),
    );
    std::fs::read_to_string(dir.join(output)).unwrap()
}

// Starting clean, the primary stage emits a manifest whose root target
// is the primary builder plus the rule that writes the main manifest.
#[test]
fn primary_stage_manifest_shape() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = run_stage(dir.path(), Stage::Primary, "bootstrap.ninja");

    assert!(manifest.contains("build bin/builder: phony\n"), "{manifest}");
    assert!(manifest.contains("rule s.bootstrap.generate\n"), "{manifest}");
    assert!(manifest.contains("generator = 1"), "{manifest}");
    assert!(manifest.contains("restat = 1"), "{manifest}");
    assert!(
        manifest.contains("build build.ninja: s.bootstrap.generate | bin/builder\n"),
        "{manifest}"
    );
    assert!(manifest.contains("default build.ninja\n"), "{manifest}");
    // Primary stage ignores module types outside the bootstrap set.
    assert!(!manifest.contains("out/hello"), "{manifest}");
}

// The main stage is full generation plus the self-regeneration rule and
// the glob manifest inclusion.
#[test]
fn main_stage_manifest_shape() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = run_stage(dir.path(), Stage::Main, "build.ninja");

    assert!(manifest.contains("rule cc.cc\n"), "{manifest}");
    assert!(
        manifest.contains("build out/hello/hello.c.o: cc.cc hello.c\n"),
        "{manifest}"
    );
    assert!(manifest.contains("rule s.bootstrap.generate\n"), "{manifest}");
    assert!(manifest.contains("subninja "), "{manifest}");
    assert!(manifest.contains("build-globs.ninja"), "{manifest}");
    // Main stage does not default the manifest; Ninja's generator rule
    // handling covers it.
    assert!(!manifest.contains("default build.ninja"), "{manifest}");

    // The depfile lists the parsed Blueprints file.
    let depfile = std::fs::read_to_string(dir.path().join("build.ninja.d")).unwrap();
    assert!(depfile.contains("Blueprints"), "{depfile}");

    // The glob manifest exists, even with no globs observed.
    assert!(dir.path().join(".bootstrap/build-globs.ninja").exists());
}

// Re-running with unchanged inputs rewrites nothing: the manifest is
// byte-identical and keeps its mtime.
#[test]
fn rerun_preserves_manifest_mtime() {
    let dir = tempfile::tempdir().unwrap();
    let first = run_stage(dir.path(), Stage::Main, "build.ninja");
    let first_mtime = std::fs::metadata(dir.path().join("build.ninja"))
        .unwrap()
        .modified()
        .unwrap();

    let second = run_stage(dir.path(), Stage::Main, "build.ninja");
    let second_mtime = std::fs::metadata(dir.path().join("build.ninja"))
        .unwrap()
        .modified()
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(first_mtime, second_mtime);
}

#[test]
fn args_parse_spec_flags() {
    let args = Args::parse_from([
        "builder",
        "-o",
        "out.ninja",
        "--glob-file",
        "globs.ninja",
        "-b",
        "outdir",
        "-n",
        "ninjadir",
        "-d",
        "out.ninja.d",
        "-l",
        "list",
        "--empty-ninja-file",
        "-t",
    ]);
    assert_eq!(args.output, PathBuf::from("out.ninja"));
    assert_eq!(args.glob_file, PathBuf::from("globs.ninja"));
    assert_eq!(args.build_dir, PathBuf::from("outdir"));
    assert_eq!(args.ninja_build_dir, PathBuf::from("ninjadir"));
    assert_eq!(args.depfile, Some(PathBuf::from("out.ninja.d")));
    assert_eq!(args.module_list, PathBuf::from("list"));
    assert!(args.empty_ninja_file);
    assert!(args.run_tests);
}

// The staleness collector removes logged outputs that are no longer
// targets, prunes emptied directories, and leaves everything else.
#[test]
fn stale_outputs_are_removed() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "out/gone/stale.o", "");
    write(dir.path(), "out/live.o", "");
    write(dir.path(), "src/untouchable.c", "");

    let log = write(
        dir.path(),
        ".ninja_log",
        "# ninja log v5\n\
         0\t1\t2\tout/gone/stale.o\tabc\n\
         0\t1\t2\tout/live.o\tdef\n\
         0\t1\t2\tsrc/untouchable.c\tghi\n",
    );

    let removed = cleanup::remove_stale_outputs(
        &log,
        dir.path(),
        &["out/".to_string()],
        &["out/live.o".to_string()],
    )
    .unwrap();

    assert_eq!(removed, vec![PathBuf::from("out/gone/stale.o")]);
    assert!(!dir.path().join("out/gone/stale.o").exists());
    assert!(!dir.path().join("out/gone").exists(), "emptied dir pruned");
    assert!(dir.path().join("out/live.o").exists());
    assert!(dir.path().join("src/untouchable.c").exists());
}

#[test]
fn unsupported_log_header_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let log = write(dir.path(), ".ninja_log", "# ninja log v4\n");
    let err = cleanup::read_ninja_log(&log).unwrap_err();
    assert!(err.to_string().contains("unsupported"), "{err}");
}
