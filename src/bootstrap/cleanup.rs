//! Removal of outputs that no longer correspond to any target.
//!
//! After a successful emission, the Ninja log names every file a past
//! build produced. Anything under the configured prefixes that is no
//! longer a current target (or an exemption) is deleted, along with any
//! directories the deletions left empty, up to the working-directory
//! boundary.

use std::collections::HashSet;
use std::io::{self, BufRead};
use std::path::{Component, Path, PathBuf};

use tracing::debug;

const NINJA_LOG_HEADER: &str = "# ninja log v5";

/// Parse a Ninja log and return the output paths it records.
pub fn read_ninja_log(path: &Path) -> io::Result<Vec<String>> {
    let file = std::fs::File::open(path)?;
    let mut lines = io::BufReader::new(file).lines();

    let Some(header) = lines.next().transpose()? else {
        return Ok(Vec::new());
    };
    if header.trim() != NINJA_LOG_HEADER {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported ninja log header {header:?}"),
        ));
    }

    let mut outputs = Vec::new();
    for line in lines {
        let line = line?;
        // start, end, mtime, output path, command hash.
        let mut fields = line.split('\t');
        let output = fields.nth(3);
        if let Some(output) = output {
            outputs.push(output.to_string());
        }
    }
    Ok(outputs)
}

/// Delete files recorded in the Ninja log that live under one of
/// `prefixes` and are not in `keep`, then prune empty parent
/// directories up to `base`. Log entries are relative to `base`, the
/// directory Ninja runs in. Returns the removed paths.
pub fn remove_stale_outputs(
    log_path: &Path,
    base: &Path,
    prefixes: &[String],
    keep: &[String],
) -> io::Result<Vec<PathBuf>> {
    let outputs = match read_ninja_log(log_path) {
        Ok(outputs) => outputs,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();

    let mut removed = Vec::new();
    for output in outputs {
        if keep.contains(output.as_str()) {
            continue;
        }
        let path = Path::new(&output);
        if !is_safe_relative(path) {
            continue;
        }
        if !prefixes.iter().any(|p| output.starts_with(p.as_str())) {
            continue;
        }
        match std::fs::remove_file(base.join(path)) {
            Ok(()) => {
                debug!("removed stale output {output}");
                removed.push(path.to_path_buf());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }

    // Prune directories the removals emptied, walking up but never past
    // the base boundary.
    for path in &removed {
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d.as_os_str().is_empty() {
                break;
            }
            match std::fs::remove_dir(base.join(d)) {
                Ok(()) => {
                    debug!("removed empty directory {}", d.display());
                    dir = d.parent();
                }
                Err(_) => break,
            }
        }
    }

    Ok(removed)
}

/// Only relative paths that stay inside the working directory are
/// eligible for deletion.
fn is_safe_relative(path: &Path) -> bool {
    if path.is_absolute() {
        return false;
    }
    let mut depth = 0i32;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}
