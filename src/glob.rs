//! File-system globbing with excludes, caching, and the side-channel
//! manifest that re-triggers generation when glob results change.
//!
//! Every glob observed during generation is recorded in the cache. The
//! cache is then written out as a secondary Ninja manifest whose targets
//! are per-glob file-list files: at build time each rule re-evaluates its
//! pattern, rewrites the file list only if it changed (enabling restat),
//! and emits a depfile naming the traversed directories. The main
//! manifest depends on the file-list files, so a change anywhere in a
//! traversed directory re-runs exactly the affected globs.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use globset::{GlobBuilder, GlobMatcher};
use indexmap::IndexMap;
use smol_str::SmolStr;
use tracing::debug;
use xxhash_rust::xxh3::Xxh3;

use crate::source::{SourceTree, LOCAL_SOURCE_TREE};

/// Version of the glob helper's argument contract. Bumped whenever the
/// shape of the arguments or the file-list format changes, so stale
/// manifests regenerate themselves through the primary builder.
pub const GLOB_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, thiserror::Error)]
pub enum GlobError {
    #[error("invalid glob pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("glob {pattern:?}: cannot read {path}: {message}")]
    Io {
        pattern: String,
        path: String,
        message: String,
    },
}

/// The outcome of one glob query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobResult {
    pub pattern: String,
    /// Sorted and deduplicated.
    pub excludes: Vec<String>,
    /// Matching paths relative to the source root, sorted.
    pub matches: Vec<String>,
    /// Directories traversed while evaluating, in traversal order. These
    /// are the depfile entries of the glob's file-list rule.
    pub dirs: Vec<String>,
}

impl GlobResult {
    /// The name of this glob's file-list file, stable across runs.
    pub fn file_list_name(&self) -> String {
        let mut hasher = Xxh3::new();
        hasher.update(self.pattern.as_bytes());
        hasher.update(&[0]);
        for exclude in &self.excludes {
            hasher.update(exclude.as_bytes());
            hasher.update(&[0]);
        }
        format!("{:032x}", hasher.digest128())
    }

    /// The file-list file contents: one match per line.
    pub fn file_list(&self) -> String {
        let mut out = String::new();
        for m in &self.matches {
            out.push_str(m);
            out.push('\n');
        }
        out
    }
}

type GlobKey = (SmolStr, Vec<String>);

/// The glob cache. Queries with an identical pattern and semantically
/// identical excludes (empty and absent are the same) hit the cache. Safe
/// for concurrent readers; writes take the lock.
pub struct GlobCache {
    srcdir: PathBuf,
    inner: RwLock<IndexMap<GlobKey, Arc<GlobResult>>>,
}

impl GlobCache {
    pub fn new(srcdir: impl Into<PathBuf>) -> Self {
        Self {
            srcdir: srcdir.into(),
            inner: RwLock::new(IndexMap::new()),
        }
    }

    /// Evaluate `pattern` with `excludes` against the local filesystem,
    /// or return the cached result.
    pub fn glob(&self, pattern: &str, excludes: &[String]) -> Result<Arc<GlobResult>, GlobError> {
        self.glob_in(&LOCAL_SOURCE_TREE, pattern, excludes)
    }

    /// As [`Self::glob`], reading through a caller-supplied tree.
    pub fn glob_in(
        &self,
        source: &dyn SourceTree,
        pattern: &str,
        excludes: &[String],
    ) -> Result<Arc<GlobResult>, GlobError> {
        let mut sorted: Vec<String> = excludes.to_vec();
        sorted.sort();
        sorted.dedup();
        let key: GlobKey = (SmolStr::new(pattern), sorted);

        if let Some(hit) = self.inner.read().unwrap().get(&key) {
            return Ok(hit.clone());
        }

        let result = Arc::new(glob_once(source, &self.srcdir, pattern, &key.1)?);
        debug!(
            pattern,
            matches = result.matches.len(),
            "glob evaluated"
        );
        let mut inner = self.inner.write().unwrap();
        // A racing writer may have filled the slot; keep the first.
        let entry = inner.entry(key).or_insert(result);
        Ok(entry.clone())
    }

    /// Every result observed so far, sorted by pattern and excludes for
    /// deterministic manifest emission.
    pub fn results(&self) -> Vec<Arc<GlobResult>> {
        let inner = self.inner.read().unwrap();
        let mut keyed: Vec<(GlobKey, Arc<GlobResult>)> = inner
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        keyed.into_iter().map(|(_, v)| v).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }
}

struct Walker<'a> {
    source: &'a dyn SourceTree,
    srcdir: &'a Path,
    pattern: &'a str,
    components: Vec<Component>,
    excludes: Vec<GlobMatcher>,
    matches: Vec<String>,
    dirs: Vec<String>,
}

enum Component {
    /// A literal path component.
    Literal(String),
    /// A component with wildcards, matched against entry names.
    Matcher(GlobMatcher),
    /// `**`: recurse through the whole subtree.
    Recursive,
}

/// Evaluate one glob without consulting the cache.
fn glob_once(
    source: &dyn SourceTree,
    srcdir: &Path,
    pattern: &str,
    excludes: &[String],
) -> Result<GlobResult, GlobError> {
    if pattern.starts_with('/') || pattern.is_empty() {
        return Err(GlobError::InvalidPattern {
            pattern: pattern.to_string(),
            message: "patterns must be relative and non-empty".to_string(),
        });
    }

    let mut components = Vec::new();
    for comp in pattern.split('/') {
        if comp.is_empty() || comp == "." || comp == ".." {
            return Err(GlobError::InvalidPattern {
                pattern: pattern.to_string(),
                message: format!("invalid path component {comp:?}"),
            });
        }
        if comp == "**" {
            components.push(Component::Recursive);
        } else if comp.contains("**") {
            return Err(GlobError::InvalidPattern {
                pattern: pattern.to_string(),
                message: "'**' must be a path component on its own".to_string(),
            });
        } else if comp.contains(['*', '?', '[']) {
            components.push(Component::Matcher(compile(comp, pattern)?));
        } else {
            components.push(Component::Literal(comp.to_string()));
        }
    }

    let exclude_matchers = excludes
        .iter()
        .map(|e| compile(e, pattern))
        .collect::<Result<Vec<_>, _>>()?;

    let mut walker = Walker {
        source,
        srcdir,
        pattern,
        components,
        excludes: exclude_matchers,
        matches: Vec::new(),
        dirs: Vec::new(),
    };
    walker.walk(&PathBuf::new(), 0)?;
    walker.matches.sort();

    Ok(GlobResult {
        pattern: pattern.to_string(),
        excludes: excludes.to_vec(),
        matches: walker.matches,
        dirs: walker.dirs,
    })
}

fn compile(glob: &str, pattern: &str) -> Result<GlobMatcher, GlobError> {
    GlobBuilder::new(glob)
        .literal_separator(true)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|e| GlobError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })
}

impl Walker<'_> {
    fn excluded(&self, rel: &Path) -> bool {
        self.excludes.iter().any(|e| e.is_match(rel))
    }

    fn walk(&mut self, dir: &Path, component: usize) -> Result<(), GlobError> {
        match &self.components[component] {
            Component::Literal(name) => {
                let rel = dir.join(name);
                if self.excluded(&rel) {
                    return Ok(());
                }
                let last = component + 1 == self.components.len();
                if last {
                    if self.source.exists(&self.srcdir.join(&rel)) {
                        self.matches.push(path_str(&rel));
                    }
                } else if self.source.is_dir(&self.srcdir.join(&rel)) {
                    self.walk(&rel, component + 1)?;
                }
                Ok(())
            }
            Component::Recursive => self.walk_recursive(dir, component),
            Component::Matcher(_) => {
                let entries = self.list(dir)?;
                let last = component + 1 == self.components.len();
                for entry in entries {
                    let rel = dir.join(&entry.name);
                    let Component::Matcher(matcher) = &self.components[component] else {
                        unreachable!()
                    };
                    if !matcher.is_match(Path::new(&entry.name)) || self.excluded(&rel) {
                        continue;
                    }
                    if last {
                        self.matches.push(path_str(&rel));
                    } else if entry.is_dir {
                        self.walk(&rel, component + 1)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// `**` matches zero or more directories: the remaining pattern is
    /// tried in this directory and in every subdirectory.
    fn walk_recursive(&mut self, dir: &Path, component: usize) -> Result<(), GlobError> {
        if component + 1 < self.components.len() {
            self.walk(dir, component + 1)?;
        }
        let entries = self.list(dir)?;
        for entry in entries {
            if !entry.is_dir || entry.name.starts_with('.') {
                continue;
            }
            let rel = dir.join(&entry.name);
            if self.excluded(&rel) {
                continue;
            }
            self.walk_recursive(&rel, component)?;
        }
        Ok(())
    }

    /// List a directory, recording it in the dep set.
    fn list(&mut self, dir: &Path) -> Result<Vec<crate::source::DirEntry>, GlobError> {
        let rel = if dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            dir.to_path_buf()
        };
        let rel_str = path_str(&rel);
        if !self.dirs.contains(&rel_str) {
            self.dirs.push(rel_str);
        }
        self.source
            .list_dir(&self.srcdir.join(dir))
            .map_err(|e| GlobError::Io {
                pattern: self.pattern.to_string(),
                path: path_str(&rel),
                message: e.to_string(),
            })
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Write `contents` to `path` only if it differs from what is already
/// there. Returns whether the file was written.
pub fn write_file_if_changed(path: &Path, contents: &str) -> io::Result<bool> {
    match std::fs::read_to_string(path) {
        Ok(existing) if existing == contents => return Ok(false),
        _ => {}
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(true)
}

/// The helper-side implementation of one glob rule: re-evaluate the
/// pattern, rewrite the file list only if it changed, and write a depfile
/// naming the traversed directories.
pub fn glob_single_file(
    srcdir: &Path,
    pattern: &str,
    excludes: &[String],
    out: &Path,
) -> Result<(), GlobError> {
    let cache = GlobCache::new(srcdir);
    let result = cache.glob(pattern, excludes)?;

    let io_err = |e: io::Error| GlobError::Io {
        pattern: pattern.to_string(),
        path: out.display().to_string(),
        message: e.to_string(),
    };

    write_file_if_changed(out, &result.file_list()).map_err(io_err)?;

    let mut depfile = String::new();
    depfile.push_str(&makefile_escape(&path_str(out)));
    depfile.push(':');
    for dir in &result.dirs {
        depfile.push(' ');
        depfile.push_str(&makefile_escape(&path_str(&srcdir.join(dir))));
    }
    depfile.push('\n');
    let dep_path = PathBuf::from(format!("{}.d", out.display()));
    std::fs::write(&dep_path, depfile).map_err(io_err)?;
    Ok(())
}

/// What the helper writes when invoked with an unexpected version: an
/// intentionally stale output, unconditionally rewritten, so the next
/// build regenerates the glob manifest through the primary builder.
pub fn write_version_mismatch(out: &Path, got: u32) -> io::Result<()> {
    if let Some(parent) = out.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(out)?;
    writeln!(
        f,
        "# glob helper version mismatch: manifest expects {got}, helper speaks {GLOB_FILE_VERSION}"
    )
}

fn makefile_escape(s: &str) -> String {
    s.replace(' ', "\\ ")
}

/// Render the glob manifest: one file-list target per cached glob.
pub fn glob_manifest(cache: &GlobCache, helper: &Path, glob_dir: &Path) -> String {
    let mut out = String::new();
    out.push_str("# This file is generated; it re-evaluates every glob the\n");
    out.push_str("# last generation observed. Do not edit.\n\n");
    out.push_str("rule glob\n");
    out.push_str(&format!(
        "    command = {} -o $out -v {} $args\n",
        shlex::try_quote(&helper.to_string_lossy())
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| helper.to_string_lossy().into_owned()),
        GLOB_FILE_VERSION
    ));
    out.push_str("    depfile = $out.d\n");
    out.push_str("    deps = gcc\n");
    out.push_str("    restat = 1\n");
    out.push_str("    description = glob $out\n");

    for result in cache.results() {
        let file = glob_dir.join(result.file_list_name());
        let mut args = vec!["-p".to_string(), result.pattern.clone()];
        for exclude in &result.excludes {
            args.push("-e".to_string());
            args.push(exclude.clone());
        }
        let quoted = shlex::try_join(args.iter().map(|a| a.as_str()))
            .unwrap_or_else(|_| args.join(" "));
        out.push('\n');
        out.push_str(&format!(
            "build {}: glob\n",
            crate::ninja_string::escape(&path_str(&file), crate::ninja_string::Escape::Output)
        ));
        out.push_str(&format!("    args = {quoted}\n"));
    }
    out
}

/// The file-list path a given glob renders to, for wiring the main
/// manifest's dependencies.
pub fn glob_file_path(glob_dir: &Path, result: &GlobResult) -> PathBuf {
    glob_dir.join(result.file_list_name())
}
