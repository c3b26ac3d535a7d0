//! Keel sources: turn YAML/JSON manifests into ordered resources.

#![forbid(unsafe_code)]

use std::io::Read;
use std::path::{Path, PathBuf};

use keel_core::{doc, env_or, Resource};
use metrics::counter;
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("empty path")]
    EmptyPath,
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("read: {0}")]
    Read(#[source] std::io::Error),
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: Box<ureq::Error>,
    },
    #[error("parsing YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("converting YAML to JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("manifest payload too large (>{0} bytes)")]
    TooLarge(usize),
    #[error("document {0} too complex (>{1} nodes)")]
    TooComplex(usize, usize),
    #[error("document {0} is not an object")]
    NotAnObject(usize),
    #[error("document {0} missing {1}")]
    Missing(usize, &'static str),
}

pub type Result<T> = std::result::Result<T, SourceError>;

/// Anything that yields an ordered list of resources. Every call re-reads.
pub trait Source: Send + Sync {
    fn parse(&self) -> Result<Vec<Resource>>;
}

fn max_yaml_bytes() -> usize { env_or("KEEL_MAX_YAML_BYTES", 4_000_000) }

fn max_yaml_nodes() -> usize { env_or("KEEL_MAX_YAML_NODES", 200_000) }

/// Decode a multi-document YAML (or JSON) payload.
/// Null documents are skipped and `*List` kinds are flattened into their items.
pub fn parse_str(text: &str) -> Result<Vec<Resource>> {
    let max_bytes = max_yaml_bytes();
    if text.len() > max_bytes {
        return Err(SourceError::TooLarge(max_bytes));
    }
    let max_nodes = max_yaml_nodes();
    let mut out = Vec::new();
    for (idx, de) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let yaml = serde_yaml::Value::deserialize(de)?;
        if yaml.is_null() { continue; }
        let json = serde_json::to_value(yaml)?;
        if doc::node_budget_exceeded(&json, max_nodes) {
            return Err(SourceError::TooComplex(idx, max_nodes));
        }
        push_document(idx, json, &mut out)?;
    }
    counter!("source_documents", out.len() as u64);
    Ok(out)
}

fn push_document(idx: usize, json: Json, out: &mut Vec<Resource>) -> Result<()> {
    let Json::Object(mut map) = json else {
        return Err(SourceError::NotAnObject(idx));
    };
    let kind = map.get("kind").and_then(|v| v.as_str()).unwrap_or("").to_string();
    if kind.ends_with("List") {
        if let Some(Json::Array(items)) = map.shift_remove("items") {
            for item in items {
                push_document(idx, item, out)?;
            }
            return Ok(());
        }
    }
    if kind.is_empty() {
        return Err(SourceError::Missing(idx, "kind"));
    }
    if map.get("apiVersion").and_then(|v| v.as_str()).map_or(true, str::is_empty) {
        return Err(SourceError::Missing(idx, "apiVersion"));
    }
    out.push(Resource::from_value(Json::Object(map)).map_err(|_| SourceError::NotAnObject(idx))?);
    Ok(())
}

fn is_url(p: &str) -> bool {
    p.starts_with("http://") || p.starts_with("https://")
}

/// GET `url` and return the body, cut at the byte limit so `parse_str` rejects
/// oversized payloads.
fn fetch(url: &str) -> Result<String> {
    let resp = ureq::get(url)
        .call()
        .map_err(|source| SourceError::Fetch { url: url.to_string(), source: Box::new(source) })?;
    let mut text = String::new();
    resp.into_reader()
        .take(max_yaml_bytes() as u64 + 1)
        .read_to_string(&mut text)
        .map_err(SourceError::Read)?;
    Ok(text)
}

/// Manifest served over http(s). Error statuses fail the parse.
#[derive(Debug, Clone)]
pub struct UrlSource(String);

impl UrlSource {
    pub fn new(url: impl Into<String>) -> Self { Self(url.into()) }
}

impl Source for UrlSource {
    fn parse(&self) -> Result<Vec<Resource>> {
        let docs = parse_str(&fetch(&self.0)?)?;
        debug!(url = %self.0, documents = docs.len(), "parsed manifest url");
        Ok(docs)
    }
}

/// Comma-separated files, directories and http(s) URLs. Directory entries
/// are visited in name order; subdirectories only when `recursive`.
#[derive(Debug, Clone)]
pub struct PathSource {
    paths: String,
    recursive: bool,
}

impl PathSource {
    pub fn new(paths: impl Into<String>) -> Self {
        Self { paths: paths.into(), recursive: false }
    }

    pub fn recursive(mut self, yes: bool) -> Self {
        self.recursive = yes;
        self
    }

    fn parse_file(path: &Path, out: &mut Vec<Resource>) -> Result<()> {
        let text = std::fs::read_to_string(path).map_err(|source| SourceError::Io { path: path.to_path_buf(), source })?;
        let docs = parse_str(&text)?;
        debug!(path = %path.display(), documents = docs.len(), "parsed manifest file");
        out.extend(docs);
        Ok(())
    }

    fn walk(&self, path: &Path, root: bool, out: &mut Vec<Resource>) -> Result<()> {
        let io = |source| SourceError::Io { path: path.to_path_buf(), source };
        let meta = std::fs::metadata(path).map_err(io)?;
        if !meta.is_dir() {
            return Self::parse_file(path, out);
        }
        if !root && !self.recursive {
            return Ok(());
        }
        let mut entries = std::fs::read_dir(path)
            .map_err(io)?
            .map(|e| e.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(io)?;
        entries.sort();
        for entry in entries {
            self.walk(&entry, false, out)?;
        }
        Ok(())
    }
}

impl Source for PathSource {
    fn parse(&self) -> Result<Vec<Resource>> {
        let mut out = Vec::new();
        for p in self.paths.split(',') {
            let p = p.trim();
            if p.is_empty() {
                return Err(SourceError::EmptyPath);
            }
            if is_url(p) {
                out.extend(UrlSource::new(p).parse()?);
            } else {
                self.walk(Path::new(p), true, &mut out)?;
            }
        }
        Ok(out)
    }
}

/// In-memory manifest text.
#[derive(Debug, Clone)]
pub struct BytesSource(Vec<u8>);

impl BytesSource {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self { Self(bytes.into()) }
}

impl Source for BytesSource {
    fn parse(&self) -> Result<Vec<Resource>> {
        let text = std::str::from_utf8(&self.0)
            .map_err(|e| SourceError::Read(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        parse_str(text)
    }
}

/// Reads the whole stream on first parse; later calls reuse the buffer.
pub struct ReaderSource {
    buf: std::sync::Mutex<Option<String>>,
    reader: std::sync::Mutex<Box<dyn Read + Send>>,
}

impl ReaderSource {
    pub fn new(reader: impl Read + Send + 'static) -> Self {
        Self { buf: std::sync::Mutex::new(None), reader: std::sync::Mutex::new(Box::new(reader)) }
    }
}

impl Source for ReaderSource {
    fn parse(&self) -> Result<Vec<Resource>> {
        let mut buf = self.buf.lock().unwrap_or_else(|p| p.into_inner());
        if buf.is_none() {
            let mut text = String::new();
            let mut reader = self.reader.lock().unwrap_or_else(|p| p.into_inner());
            let limit = max_yaml_bytes() as u64;
            reader.by_ref().take(limit + 1).read_to_string(&mut text).map_err(SourceError::Read)?;
            *buf = Some(text);
        }
        parse_str(buf.as_deref().unwrap_or(""))
    }
}

/// Already-decoded documents.
#[derive(Debug, Clone, Default)]
pub struct SliceSource(Vec<Resource>);

impl SliceSource {
    pub fn new(resources: Vec<Resource>) -> Self { Self(resources) }
}

impl Source for SliceSource {
    fn parse(&self) -> Result<Vec<Resource>> { Ok(self.0.clone()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_document_yaml_skips_empty_docs() {
        let text = "---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\n---\n# comment only\n---\napiVersion: v1\nkind: Secret\nmetadata:\n  name: b\n";
        let got = parse_str(text).unwrap();
        assert_eq!(got.iter().map(|r| r.name()).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn json_documents_parse() {
        let got = parse_str(r#"{"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "x"}}"#).unwrap();
        assert_eq!(got[0].kind(), "Namespace");
    }

    #[test]
    fn lists_are_flattened() {
        let text = "apiVersion: v1\nkind: List\nitems:\n- apiVersion: v1\n  kind: ConfigMap\n  metadata: {name: one}\n- apiVersion: v1\n  kind: ConfigMap\n  metadata: {name: two}\n";
        let got = parse_str(text).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].name(), "two");
    }

    #[test]
    fn missing_identity_is_rejected() {
        let e = parse_str("kind: Foo\nmetadata:\n  name: x\n").unwrap_err().to_string();
        assert!(e.contains("missing apiVersion"), "e={}", e);
        let e = parse_str("apiVersion: v1\nmetadata:\n  name: x\n").unwrap_err().to_string();
        assert!(e.contains("missing kind"), "e={}", e);
        assert!(matches!(parse_str("- 1\n- 2\n"), Err(SourceError::NotAnObject(0))));
    }

    #[test]
    fn malformed_yaml_fails() {
        assert!(matches!(parse_str("apiVersion: v1\nkind: [unclosed\n"), Err(SourceError::Yaml(_))));
    }

    #[test]
    fn key_order_is_preserved() {
        let got = parse_str("kind: ConfigMap\napiVersion: v1\ndata:\n  z: '1'\n  a: '2'\n").unwrap();
        let keys: Vec<_> = got[0].as_value()["data"].as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["z", "a"]);
    }

    #[test]
    fn reader_source_is_restartable() {
        let src = ReaderSource::new(std::io::Cursor::new(b"apiVersion: v1\nkind: ConfigMap\nmetadata: {name: r}\n".to_vec()));
        assert_eq!(src.parse().unwrap().len(), 1);
        assert_eq!(src.parse().unwrap().len(), 1);
    }

    #[test]
    fn bytes_source_rejects_invalid_utf8() {
        assert!(BytesSource::new(vec![0xff, 0xfe]).parse().is_err());
    }
}
