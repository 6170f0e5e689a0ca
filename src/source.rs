//! Access to the source tree being described by Blueprints files.

use std::io;
use std::path::Path;

/// A directory entry as seen by [`SourceTree::list_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// A trait that abstracts over how the engine reads the source tree.
///
/// All file reads in the parser and all directory traversal in the glob
/// engine are directed through this trait, so tests can run against an
/// in-memory tree instead of the local filesystem.
///
/// A default implementation is available at [`LocalSourceTree`].
pub trait SourceTree: Send + Sync {
    /// Read a file to a string.
    fn read(&self, path: &Path) -> io::Result<String>;

    /// Test whether a path exists.
    fn exists(&self, path: &Path) -> bool;

    /// Test whether a path is a directory.
    fn is_dir(&self, path: &Path) -> bool;

    /// List a directory, sorted by name.
    fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;
}

/// The default implementation of [`SourceTree`], reading the local
/// filesystem.
pub struct LocalSourceTree;
pub static LOCAL_SOURCE_TREE: LocalSourceTree = LocalSourceTree;

impl SourceTree for LocalSourceTree {
    fn read(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type()?.is_dir();
            entries.push(DirEntry { name, is_dir });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}
