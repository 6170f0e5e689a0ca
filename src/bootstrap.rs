//! The two-stage bootstrap controller.
//!
//! The primary stage emits a manifest whose root target is the primary
//! builder binary itself, plus the rule that (re)generates the main
//! manifest by invoking that binary. The main stage is full generation;
//! its manifest carries the same regeneration rule (generator + restat +
//! depfile), so a single Ninja invocation can rebuild a stale primary
//! builder, re-run it, and continue to the user's target transparently.

use std::any::Any;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, info};

use crate::config::{Config, Stage};
use crate::engine::{Engine, EngineError};
use crate::generate::{GenerateError, SingletonContext};
use crate::glob;
use crate::module::Singleton;
use crate::ninja_defs::{BuildParams, DepsFormat, RuleParams};
use crate::registry::{PackageId, Registry};
use crate::source::{LocalSourceTree, SourceTree};

pub mod cleanup;

/// Command-line surface of a primary builder.
#[derive(Debug, Parser)]
#[clap(version)]
pub struct Args {
    /// Output manifest
    #[clap(short = 'o', default_value = "build.ninja", value_name = "PATH")]
    pub output: PathBuf,

    /// Output glob manifest
    #[clap(
        long = "glob-file",
        default_value = ".bootstrap/build-globs.ninja",
        value_name = "PATH"
    )]
    pub glob_file: PathBuf,

    /// Build output directory
    #[clap(short = 'b', default_value = "out", value_name = "DIR")]
    pub build_dir: PathBuf,

    /// Ninja build directory
    #[clap(short = 'n', default_value = ".", value_name = "DIR")]
    pub ninja_build_dir: PathBuf,

    /// Write a depfile listing every parsed Blueprints file
    #[clap(short = 'd', value_name = "PATH")]
    pub depfile: Option<PathBuf>,

    /// Emit documentation to the given path and skip manifest generation
    #[clap(long, value_name = "PATH")]
    pub docs: Option<PathBuf>,

    /// Module list file naming the root Blueprints files
    #[clap(short = 'l', value_name = "FILE")]
    pub module_list: PathBuf,

    /// Emit a zero-byte manifest at the end of the main stage
    #[clap(long)]
    pub empty_ninja_file: bool,

    /// Build and run tests of the bootstrap modules
    #[clap(short = 't')]
    pub run_tests: bool,

    /// Unsupported flag of older bootstrap generations
    #[clap(short = 'c', hide = true, value_name = "PATH")]
    pub legacy_check_file: Option<String>,

    /// Unsupported flag of older bootstrap generations
    #[clap(long = "timestamp", hide = true, value_name = "PATH")]
    pub legacy_timestamp: Option<String>,
}

/// What the toolchain produced for the primary builder.
#[derive(Debug, Clone)]
pub struct PrimaryBuilder {
    /// Path of the builder binary, as built by the emitted rules.
    pub binary: String,
    /// Test targets to build and run under `-t`.
    pub test_targets: Vec<String>,
}

/// Interface to the language toolchain that compiles the primary
/// builder. The toolchain emits whatever rules and build statements
/// produce the binaries from the bootstrap modules; everything else
/// about it lives outside this crate.
pub trait Toolchain: Send + Sync {
    fn primary_builder(
        &self,
        ctx: &mut SingletonContext<'_>,
        pkg: PackageId,
    ) -> Result<PrimaryBuilder, GenerateError>;

    /// Path of the glob helper binary the glob manifest invokes.
    fn glob_helper(&self) -> String {
        "cyglob".to_string()
    }
}

#[derive(Debug, thiserror::Error)]
enum BootstrapError {
    #[error("the {flag} flag belongs to a retired bootstrap scheme and is no longer accepted")]
    LegacyFlag { flag: &'static str },

    #[error("cannot read module list {path}: {message}")]
    ModuleList { path: String, message: String },

    #[error("cannot write {path}: {message}")]
    Output { path: String, message: String },
}

/// The glue singleton: builds the primary builder through the toolchain
/// and wires the manifest-regeneration rule.
struct BootstrapSingleton {
    pkg: PackageId,
    toolchain: Arc<dyn Toolchain>,
    output: PathBuf,
    glob_file: PathBuf,
    glob_dir: PathBuf,
    build_dir: PathBuf,
    ninja_build_dir: PathBuf,
    module_list: PathBuf,
    run_tests: bool,
}

impl BootstrapSingleton {
    /// The command that re-invokes the primary builder for the main
    /// stage.
    fn generate_command(&self, binary: &str, main_manifest: &Path) -> String {
        let depfile = format!("{}.d", main_manifest.display());
        let argv: Vec<String> = vec![
            binary.to_string(),
            "-o".into(),
            main_manifest.display().to_string(),
            "--glob-file".into(),
            self.glob_file.display().to_string(),
            "-b".into(),
            self.build_dir.display().to_string(),
            "-n".into(),
            self.ninja_build_dir.display().to_string(),
            "-d".into(),
            depfile,
            "-l".into(),
            self.module_list.display().to_string(),
        ];
        shlex::try_join(argv.iter().map(|s| s.as_str()))
            .unwrap_or_else(|_| argv.join(" "))
    }
}

impl Singleton for BootstrapSingleton {
    fn generate(&self, ctx: &mut SingletonContext<'_>) -> Result<(), GenerateError> {
        let stage = ctx.engine_config().stage;
        let builder = self.toolchain.primary_builder(ctx, self.pkg)?;

        // In the primary stage the generate rule's target is the main
        // manifest the builder will write next; in the main stage it
        // regenerates this run's own output.
        let main_manifest = match stage {
            Stage::Main => self.output.clone(),
            Stage::Primary => PathBuf::from("build.ninja"),
        };
        let depfile = format!("{}.d", main_manifest.display());

        let generate = ctx.rule(
            self.pkg,
            "generate",
            RuleParams {
                command: self.generate_command(&builder.binary, &main_manifest),
                description: Some(format!("generate {}", main_manifest.display())),
                depfile: Some(depfile),
                deps: DepsFormat::Gcc,
                generator: true,
                restat: true,
                ..Default::default()
            },
            &[],
        )?;

        let mut implicits = vec![builder.binary.clone()];
        for result in ctx.glob_results() {
            implicits.push(
                glob::glob_file_path(&self.glob_dir, &result)
                    .display()
                    .to_string(),
            );
        }

        ctx.build(
            self.pkg,
            generate,
            BuildParams {
                comment: Some("Regenerates the main manifest when its inputs change.".into()),
                outputs: vec![main_manifest.display().to_string()],
                implicits,
                default: stage == Stage::Primary,
                ..Default::default()
            },
        )?;

        if self.run_tests && !builder.test_targets.is_empty() {
            ctx.build(
                self.pkg,
                crate::ninja_defs::PHONY_RULE,
                BuildParams {
                    outputs: vec!["bootstrap_tests".into()],
                    inputs: builder.test_targets.clone(),
                    default: true,
                    ..Default::default()
                },
            )?;
        }

        debug!("bootstrap glue emitted for {:?} stage", stage);
        Ok(())
    }
}

/// Drive a complete run of the primary builder: parse, resolve,
/// generate, and write the manifest plus its side-channel files. This is
/// what a primary builder's `main` delegates to after registering its
/// module types.
pub fn run(
    args: Args,
    config: Config,
    user_config: Arc<dyn Any + Send + Sync>,
    registry: Registry,
    toolchain: Arc<dyn Toolchain>,
) -> ExitCode {
    match run_inner(args, config, user_config, registry, toolchain) {
        Ok(()) => ExitCode::SUCCESS,
        Err(errors) => {
            report_errors(&errors);
            ExitCode::FAILURE
        }
    }
}

fn run_inner(
    args: Args,
    mut config: Config,
    user_config: Arc<dyn Any + Send + Sync>,
    mut registry: Registry,
    toolchain: Arc<dyn Toolchain>,
) -> Result<(), Vec<EngineError>> {
    if args.legacy_check_file.is_some() {
        return Err(vec![other(BootstrapError::LegacyFlag { flag: "-c" })]);
    }
    if args.legacy_timestamp.is_some() {
        return Err(vec![other(BootstrapError::LegacyFlag {
            flag: "--timestamp",
        })]);
    }

    config.outdir = args.build_dir.clone();
    config.ninja_build_dir = args.ninja_build_dir.clone();

    let source: Arc<dyn SourceTree> = Arc::new(LocalSourceTree);
    let roots = read_module_list(&args.module_list)?;
    let glob_dir = args.ninja_build_dir.join("globs");

    let pkg = registry.package("bootstrap");
    let singleton = Arc::new(BootstrapSingleton {
        pkg,
        toolchain: toolchain.clone(),
        output: args.output.clone(),
        glob_file: args.glob_file.clone(),
        glob_dir: glob_dir.clone(),
        build_dir: args.build_dir.clone(),
        ninja_build_dir: args.ninja_build_dir.clone(),
        module_list: args.module_list.clone(),
        run_tests: args.run_tests,
    });
    registry.register_singleton("bootstrap", move || singleton.clone() as Arc<dyn Singleton>);

    let mut engine = Engine::new(registry, config, user_config, source)?;
    engine.parse_blueprints(&roots)?;
    engine.resolve()?;

    if let Some(docs) = &args.docs {
        return write_docs(&engine, docs);
    }

    engine.generate()?;
    engine.add_subninja(args.glob_file.display().to_string());

    // The glob manifest re-evaluates every observed glob at build time.
    let helper = PathBuf::from(toolchain.glob_helper());
    let glob_text = glob::glob_manifest(engine.glob_cache(), &helper, &glob_dir);
    crate::ninja_writer::write_ninja_file(&args.glob_file, &glob_text)
        .map_err(|e| vec![EngineError::Write(e)])?;

    if let Some(depfile) = &args.depfile {
        write_depfile(&engine, &args.output, depfile)?;
    }

    if args.empty_ninja_file && engine.config().stage == Stage::Main {
        crate::ninja_writer::write_ninja_file(&args.output, "")
            .map_err(|e| vec![EngineError::Write(e)])?;
    } else {
        let changed = engine.write_manifest(&args.output).map_err(|e| vec![e])?;
        info!(
            path = %args.output.display(),
            changed,
            "manifest written"
        );
    }

    // Emission succeeded; sweep dead outputs out of the build tree.
    let config = engine.config();
    if !config.stale_prefixes.is_empty() && config.stage == Stage::Main {
        let mut keep: Vec<String> = engine.target_files();
        keep.push(args.output.display().to_string());
        keep.push(args.glob_file.display().to_string());
        for result in engine.glob_results() {
            keep.push(glob::glob_file_path(&glob_dir, &result).display().to_string());
        }
        keep.extend(config.stale_exemptions.iter().cloned());
        let log = config.ninja_build_dir.join(".ninja_log");
        match cleanup::remove_stale_outputs(&log, &config.top, &config.stale_prefixes, &keep) {
            Ok(removed) if !removed.is_empty() => {
                info!(count = removed.len(), "removed stale outputs");
            }
            Ok(_) => {}
            Err(e) => debug!("stale output sweep skipped: {e}"),
        }
    }

    Ok(())
}

fn other(e: BootstrapError) -> EngineError {
    EngineError::Controller(e.to_string())
}

fn read_module_list(path: &Path) -> Result<Vec<PathBuf>, Vec<EngineError>> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        vec![other(BootstrapError::ModuleList {
            path: path.display().to_string(),
            message: e.to_string(),
        })]
    })?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(PathBuf::from)
        .collect())
}

/// The generation depfile: the manifest depends on every parsed
/// Blueprints file plus whatever extra files generators recorded.
fn write_depfile(engine: &Engine, output: &Path, depfile: &Path) -> Result<(), Vec<EngineError>> {
    let mut contents = format!("{}:", output.display());
    for file in engine.parsed_files() {
        contents.push(' ');
        contents.push_str(&file.display().to_string().replace(' ', "\\ "));
    }
    for dep in engine.generated_file_deps() {
        contents.push(' ');
        contents.push_str(&dep.replace(' ', "\\ "));
    }
    contents.push('\n');
    std::fs::write(depfile, contents).map_err(|e| {
        vec![other(BootstrapError::Output {
            path: depfile.display().to_string(),
            message: e.to_string(),
        })]
    })
}

/// Documentation mode: list the registered module types. Rendering rich
/// documentation is a separate tool's job; the controller only honors
/// the skip-manifest contract.
fn write_docs(engine: &Engine, path: &Path) -> Result<(), Vec<EngineError>> {
    let mut out = String::from("Module types:\n");
    for name in engine.registered_module_types() {
        out.push_str("  ");
        out.push_str(&name);
        out.push('\n');
    }
    std::fs::write(path, out).map_err(|e| {
        vec![other(BootstrapError::Output {
            path: path.display().to_string(),
            message: e.to_string(),
        })]
    })
}

/// Report accumulated errors to standard error, with a red `error:`
/// prefix when that is a terminal.
pub fn report_errors(errors: &[EngineError]) {
    let mut stderr = std::io::stderr().lock();
    let red = stderr.is_terminal();
    for error in errors {
        let prefix = if red {
            "\x1b[31merror:\x1b[0m"
        } else {
            "error:"
        };
        let _ = writeln!(stderr, "{prefix} {error}");
    }
}
