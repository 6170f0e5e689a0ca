//! Glob cache laws and the write-if-changed machinery.


use std::path::Path;
use std::sync::Arc;

use cyanotype::glob::{GlobCache, glob_manifest, write_file_if_changed};
use cyanotype::ninja_writer::write_ninja_file;

use fixture::MemoryTree;

use test_log::test;

fn tree() -> MemoryTree {
    MemoryTree::new(&[
        ("src/a.c", ""),
        ("src/b.c", ""),
        ("src/b.h", ""),
        ("src/gen/c.c", ""),
        ("docs/readme.md", ""),
    ])
}

fn cache() -> GlobCache {
    GlobCache::new("")
}

#[test]
fn basic_matching() {
    let result = cache().glob_in(&tree(), "src/*.c", &[]).unwrap();
    assert_eq!(result.matches, vec!["src/a.c", "src/b.c"]);
    assert_eq!(result.dirs, vec!["src"]);
}

#[test]
fn recursive_matching() {
    let result = cache().glob_in(&tree(), "src/**/*.c", &[]).unwrap();
    assert_eq!(result.matches, vec!["src/a.c", "src/b.c", "src/gen/c.c"]);
    assert!(result.dirs.contains(&"src".to_string()), "{:?}", result.dirs);
    assert!(
        result.dirs.contains(&"src/gen".to_string()),
        "{:?}",
        result.dirs
    );
}

#[test]
fn excludes_filter_matches() {
    let result = cache()
        .glob_in(&tree(), "src/*.c", &["src/b.c".to_string()])
        .unwrap();
    assert_eq!(result.matches, vec!["src/a.c"]);
}

// Queries with semantically identical excludes share one cache entry.
#[test]
fn cache_keys_normalize_excludes() {
    let cache = cache();
    let tree = tree();
    let a = cache
        .glob_in(&tree, "src/*.c", &["x".to_string(), "y".to_string()])
        .unwrap();
    let b = cache
        .glob_in(&tree, "src/*.c", &["y".to_string(), "x".to_string()])
        .unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    let no_excludes = cache.glob_in(&tree, "src/*.c", &[]).unwrap();
    let empty_again = cache.glob_in(&tree, "src/*.c", &[]).unwrap();
    assert!(Arc::ptr_eq(&no_excludes, &empty_again));
    assert!(!Arc::ptr_eq(&a, &no_excludes));
}

// Adding a file that the excludes reject must not change the result
// set.
#[test]
fn excluded_file_does_not_change_results() {
    let before = cache()
        .glob_in(&tree(), "src/*.c", &["src/extra*".to_string()])
        .unwrap();

    let grown = MemoryTree::new(&[
        ("src/a.c", ""),
        ("src/b.c", ""),
        ("src/b.h", ""),
        ("src/extra.c", ""),
        ("src/gen/c.c", ""),
        ("docs/readme.md", ""),
    ]);
    let after = cache()
        .glob_in(&grown, "src/*.c", &["src/extra*".to_string()])
        .unwrap();
    assert_eq!(before.matches, after.matches);
}

#[test]
fn invalid_patterns_are_rejected() {
    let err = cache().glob_in(&tree(), "/abs/*.c", &[]).unwrap_err();
    assert!(err.to_string().contains("relative"), "{err}");

    let err = cache().glob_in(&tree(), "src/a**/*.c", &[]).unwrap_err();
    assert!(err.to_string().contains("'**'"), "{err}");
}

#[test]
fn file_list_names_are_stable_per_key() {
    let cache = cache();
    let tree = tree();
    let a = cache.glob_in(&tree, "src/*.c", &[]).unwrap();
    let b = cache.glob_in(&tree, "src/*.h", &[]).unwrap();
    assert_ne!(a.file_list_name(), b.file_list_name());
    assert_eq!(a.file_list_name(), a.file_list_name());
}

#[test]
fn glob_manifest_lists_every_cached_glob() {
    let cache = cache();
    let tree = tree();
    cache.glob_in(&tree, "src/*.c", &[]).unwrap();
    cache
        .glob_in(&tree, "src/**/*.c", &["src/b.c".to_string()])
        .unwrap();

    let manifest = glob_manifest(&cache, Path::new("cyglob"), Path::new(".globs"));
    assert!(manifest.contains("rule glob\n"), "{manifest}");
    assert!(manifest.contains("restat = 1"), "{manifest}");
    assert!(manifest.contains("depfile = $out.d"), "{manifest}");
    assert!(manifest.contains("-p 'src/*.c'"), "{manifest}");
    assert!(
        manifest.contains("-p 'src/**/*.c' -e src/b.c"),
        "{manifest}"
    );
    assert_eq!(manifest.matches("build ").count(), 2, "{manifest}");
}

// Identical content leaves the file untouched, preserving its mtime.
#[test]
fn write_file_if_changed_preserves_mtime() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("list");

    assert!(write_file_if_changed(&path, "a\nb\n").unwrap());
    let first_mtime = std::fs::metadata(&path).unwrap().modified().unwrap();

    assert!(!write_file_if_changed(&path, "a\nb\n").unwrap());
    let second_mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
    assert_eq!(first_mtime, second_mtime);

    assert!(write_file_if_changed(&path, "a\n").unwrap());
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\n");
}

// The manifest writer has the same property, through the atomic
// temp-and-rename path.
#[test]
fn manifest_writer_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("build.ninja");

    assert!(write_ninja_file(&path, "rule x\n    command = true\n").unwrap());
    let first_mtime = std::fs::metadata(&path).unwrap().modified().unwrap();

    assert!(!write_ninja_file(&path, "rule x\n    command = true\n").unwrap());
    let second_mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
    assert_eq!(first_mtime, second_mtime);

    assert!(write_ninja_file(&path, "rule y\n    command = false\n").unwrap());
}
