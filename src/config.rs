//! Engine configuration.

use std::path::PathBuf;

/// Which manifest this run of the engine produces.
///
/// The primary stage builds the primary builder itself and the rules to
/// re-invoke it; the main stage is full generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Primary,
    Main,
}

/// The engine configuration, owned by the primary builder's `main` and
/// threaded through every phase. Domain-specific configuration travels
/// separately as an opaque value handed to generators.
#[derive(Debug, Clone)]
pub struct Config {
    pub stage: Stage,
    /// Root of the source tree. Surfaced to rules as `${SRCDIR}`.
    pub srcdir: PathBuf,
    /// Build output directory. Surfaced to rules as `${OUTDIR}`.
    pub outdir: PathBuf,
    /// Directory Ninja runs in. Surfaced to rules as `${TOP}`.
    pub top: PathBuf,
    /// Directory for Ninja bookkeeping (`builddir`).
    pub ninja_build_dir: PathBuf,
    /// File name of Blueprints files looked for in subdirectories.
    pub blueprint_name: String,
    /// OS name used when merging OS property sections.
    pub target_os: &'static str,
    /// Worker count for the generation phase.
    pub parallelism: usize,
    /// Path prefixes the staleness collector may delete under. Empty
    /// disables the sweep.
    pub stale_prefixes: Vec<String>,
    /// Paths under the prefixes the collector must never delete.
    pub stale_exemptions: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stage: Stage::Main,
            srcdir: PathBuf::from("."),
            outdir: PathBuf::from("out"),
            top: PathBuf::from("."),
            ninja_build_dir: PathBuf::from("out/.ninja"),
            blueprint_name: "Blueprints".to_string(),
            target_os: host_os(),
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            stale_prefixes: Vec::new(),
            stale_exemptions: Vec::new(),
        }
    }
}

impl Config {
    /// A default configuration with the `SRCDIR`, `OUTDIR` and `TOP`
    /// environment variables applied on top.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(srcdir) = std::env::var("SRCDIR") {
            config.srcdir = PathBuf::from(srcdir);
        }
        if let Ok(outdir) = std::env::var("OUTDIR") {
            config.outdir = PathBuf::from(outdir);
        }
        if let Ok(top) = std::env::var("TOP") {
            config.top = PathBuf::from(top);
        }
        config
    }
}

/// The OS name used for property-section merging on this host.
pub fn host_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}
