#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use keel_source::{PathSource, Source, SourceError};

fn cm(name: &str) -> String {
    format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\n")
}

struct Tree(PathBuf);

impl Tree {
    // tree/
    //   dir/a.yaml     foo
    //   dir/b.yaml     bar, baz
    //   file.yaml      a, b
    fn new() -> Self {
        let root = std::env::temp_dir().join(format!("keel-source-{}", uuid::Uuid::new_v4())).join("tree");
        std::fs::create_dir_all(root.join("dir")).unwrap();
        std::fs::write(root.join("dir/a.yaml"), cm("foo")).unwrap();
        std::fs::write(root.join("dir/b.yaml"), format!("{}---\n{}", cm("bar"), cm("baz"))).unwrap();
        std::fs::write(root.join("file.yaml"), format!("{}---\n{}", cm("a"), cm("b"))).unwrap();
        Self(root)
    }

    fn path(&self, rel: &str) -> String {
        if rel.is_empty() { self.0.display().to_string() } else { self.0.join(rel).display().to_string() }
    }
}

impl Drop for Tree {
    fn drop(&mut self) {
        if let Some(parent) = self.0.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }
}

fn names(paths: &str, recursive: bool) -> Vec<String> {
    PathSource::new(paths)
        .recursive(recursive)
        .parse()
        .unwrap()
        .iter()
        .map(|r| r.name().to_string())
        .collect()
}

#[test]
fn directory_without_recursion_reads_only_its_files() {
    let t = Tree::new();
    assert_eq!(names(&t.path(""), false), vec!["a", "b"]);
}

#[test]
fn recursive_walk_is_name_ordered() {
    let t = Tree::new();
    assert_eq!(names(&t.path(""), true), vec!["foo", "bar", "baz", "a", "b"]);
}

#[test]
fn single_files() {
    let t = Tree::new();
    assert_eq!(names(&t.path("dir/b.yaml"), true), vec!["bar", "baz"]);
    assert_eq!(names(&t.path("file.yaml"), false), vec!["a", "b"]);
}

#[test]
fn comma_separated_paths_keep_order() {
    let t = Tree::new();
    let paths = format!("{},{}", t.path("file.yaml"), t.path("dir"));
    assert_eq!(names(&paths, true), vec!["a", "b", "foo", "bar", "baz"]);
}

#[test]
fn missing_and_empty_paths_fail() {
    let t = Tree::new();
    let missing = PathSource::new(t.path("missing")).parse().unwrap_err();
    assert!(matches!(missing, SourceError::Io { ref path, .. } if path == Path::new(&t.path("missing"))));
    assert!(matches!(PathSource::new("").parse(), Err(SourceError::EmptyPath)));
    let trailing = format!("{},", t.path("file.yaml"));
    assert!(matches!(PathSource::new(trailing).parse(), Err(SourceError::EmptyPath)));
}

#[test]
fn every_parse_rereads() {
    let t = Tree::new();
    let src = PathSource::new(t.path("dir/a.yaml"));
    assert_eq!(src.parse().unwrap().len(), 1);
    std::fs::write(t.path("dir/a.yaml"), format!("{}---\n{}", cm("foo"), cm("qux"))).unwrap();
    assert_eq!(src.parse().unwrap().len(), 2);
}
