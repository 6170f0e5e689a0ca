use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use cyanotype::glob::{GLOB_FILE_VERSION, glob_single_file, write_version_mismatch};

/// Re-evaluates one glob and maintains its file-list file. Invoked by
/// the glob manifest; not intended for interactive use.
#[derive(Debug, clap::Parser)]
#[clap(name = "cyglob", version)]
struct Args {
    /// File-list file to write
    #[clap(short = 'o', value_name = "FILE")]
    output: PathBuf,

    /// Argument-contract version the manifest was generated with
    #[clap(short = 'v', value_name = "VERSION")]
    version: u32,

    /// The glob pattern to evaluate
    #[clap(short = 'p', value_name = "PATTERN")]
    pattern: String,

    /// Patterns to exclude; repeatable
    #[clap(short = 'e', value_name = "PATTERN")]
    excludes: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // A version mismatch means the manifest that invoked us predates
    // this helper. Dirty the output on purpose and succeed: the next
    // build then regenerates the glob manifest through the primary
    // builder, which writes the current argument shape.
    if args.version != GLOB_FILE_VERSION {
        write_version_mismatch(&args.output, args.version)
            .with_context(|| format!("writing {}", args.output.display()))?;
        return Ok(());
    }

    glob_single_file(
        std::path::Path::new("."),
        &args.pattern,
        &args.excludes,
        &args.output,
    )
    .with_context(|| format!("evaluating glob {:?}", args.pattern))?;
    Ok(())
}
