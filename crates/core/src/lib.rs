//! Keel core types: the document model, resources and their identity.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod doc;

/// Default annotation holding the last-applied snapshot.
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";
/// Default annotation marking resources this library created.
pub const OWNERSHIP_ANNOTATION: &str = "manifestival";
/// Value of the ownership annotation on created resources.
pub const RESOURCE_CREATED: &str = "new";

#[derive(Debug, thiserror::Error)]
pub enum DocError {
    #[error("document is not an object")]
    NotAnObject,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// Split an `apiVersion` ("v1" or "apps/v1") and pair it with `kind`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", api_version),
        };
        Self::new(group, version, kind)
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind { group: self.group.clone(), kind: self.kind.clone() }
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

/// Version-free type identity. Two schema versions of one kind share it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: &str, kind: &str) -> Self {
        Self { group: group.to_string(), kind: kind.to_string() }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() { write!(f, "{}", self.kind) } else { write!(f, "{}.{}", self.kind, self.group) }
    }
}

/// Identity of one object across manifests and the live store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub group: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gk = GroupKind::new(&self.group, &self.kind);
        match self.namespace.as_deref() {
            Some(ns) => write!(f, "{} {}/{}", gk, ns, self.name),
            None => write!(f, "{} {}", gk, self.name),
        }
    }
}

/// One resource body. Always wraps a JSON object; accessors return empty
/// strings for absent identity fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Resource(Value);

impl TryFrom<Value> for Resource {
    type Error = DocError;

    fn try_from(v: Value) -> Result<Self, Self::Error> {
        if v.is_object() { Ok(Self(v)) } else { Err(DocError::NotAnObject) }
    }
}

impl From<Resource> for Value {
    fn from(r: Resource) -> Self { r.0 }
}

impl Resource {
    pub fn from_value(v: Value) -> Result<Self, DocError> { Self::try_from(v) }

    pub fn as_value(&self) -> &Value { &self.0 }

    pub fn as_value_mut(&mut self) -> &mut Value { &mut self.0 }

    pub fn into_value(self) -> Value { self.0 }

    pub fn object(&self) -> &Map<String, Value> {
        static EMPTY: OnceLock<Map<String, Value>> = OnceLock::new();
        self.0.as_object().unwrap_or_else(|| EMPTY.get_or_init(Map::new))
    }

    fn str_at(&self, path: &[&str]) -> &str {
        doc::get_path(&self.0, path).and_then(|v| v.as_str()).unwrap_or("")
    }

    fn set_str_at(&mut self, parent: &[&str], key: &str, value: &str) {
        if let Some(m) = doc::ensure_map_path(&mut self.0, parent) {
            m.insert(key.to_string(), Value::String(value.to_string()));
        }
    }

    pub fn api_version(&self) -> &str { self.str_at(&["apiVersion"]) }

    /// Empty for the core group.
    pub fn group(&self) -> &str {
        self.api_version().split_once('/').map_or("", |(g, _)| g)
    }

    pub fn version(&self) -> &str {
        let av = self.api_version();
        av.split_once('/').map_or(av, |(_, v)| v)
    }

    pub fn kind(&self) -> &str { self.str_at(&["kind"]) }

    pub fn name(&self) -> &str { self.str_at(&["metadata", "name"]) }

    pub fn generate_name(&self) -> &str { self.str_at(&["metadata", "generateName"]) }

    pub fn namespace(&self) -> Option<&str> {
        let ns = self.str_at(&["metadata", "namespace"]);
        if ns.is_empty() { None } else { Some(ns) }
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::from_api_version(self.api_version(), self.kind())
    }

    pub fn group_kind(&self) -> GroupKind { self.gvk().group_kind() }

    pub fn key(&self) -> ResourceKey {
        let gvk = self.gvk();
        ResourceKey {
            group: gvk.group,
            kind: gvk.kind,
            namespace: self.namespace().map(str::to_string),
            name: self.name().to_string(),
        }
    }

    pub fn set_name(&mut self, v: &str) { self.set_str_at(&["metadata"], "name", v) }

    pub fn set_namespace(&mut self, v: &str) { self.set_str_at(&["metadata"], "namespace", v) }

    pub fn labels(&self) -> Option<&Map<String, Value>> {
        doc::get_path(&self.0, &["metadata", "labels"]).and_then(|v| v.as_object())
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels().and_then(|m| m.get(key)).and_then(|v| v.as_str())
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.set_str_at(&["metadata", "labels"], key, value)
    }

    pub fn annotations(&self) -> Option<&Map<String, Value>> {
        doc::get_path(&self.0, &["metadata", "annotations"]).and_then(|v| v.as_object())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations().and_then(|m| m.get(key)).and_then(|v| v.as_str())
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.set_str_at(&["metadata", "annotations"], key, value)
    }

    /// Removes one annotation. An emptied annotations map stays in place.
    pub fn remove_annotation(&mut self, key: &str) -> Option<Value> {
        doc::remove_path(&mut self.0, &["metadata", "annotations", key])
    }

    /// `namespace/name` for log lines.
    pub fn display_name(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or(""), self.name())
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.gvk(), self.display_name())
    }
}

/// Read `key` from the environment, falling back to `default` when unset or unparsable.
pub fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

/// "1"/"true" (any case) enables a flag.
pub fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_ignores_version() {
        let a = Resource::from_value(json!({
            "apiVersion": "apps/v1beta1", "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "prod"}
        })).unwrap();
        let b = Resource::from_value(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"namespace": "prod", "name": "web"}
        })).unwrap();
        assert_ne!(a.gvk(), b.gvk());
        assert_eq!(a.key(), b.key());
        assert_eq!(a.group_kind(), GroupKind::new("apps", "Deployment"));
        assert_eq!((a.group(), a.version()), ("apps", "v1beta1"));
    }

    #[test]
    fn core_group_parses() {
        let gvk = GroupVersionKind::from_api_version("v1", "ConfigMap");
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.api_version(), "v1");
        assert_eq!(gvk.to_string(), "v1/ConfigMap");
    }

    #[test]
    fn annotations_round_trip() {
        let mut r = Resource::from_value(json!({"apiVersion": "v1", "kind": "ConfigMap"})).unwrap();
        assert!(r.annotations().is_none());
        r.set_annotation("a", "1");
        r.set_label("app", "x");
        assert_eq!(r.annotation("a"), Some("1"));
        assert_eq!(r.label("app"), Some("x"));
        assert_eq!(r.remove_annotation("a"), Some(json!("1")));
        assert_eq!(r.annotations().map(|m| m.len()), Some(0));
    }

    #[test]
    fn rejects_non_objects() {
        assert!(Resource::from_value(json!([1, 2])).is_err());
        let parsed: Result<Resource, _> = serde_json::from_str("\"nope\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn missing_fields_read_empty() {
        let r = Resource::from_value(json!({})).unwrap();
        assert_eq!(r.name(), "");
        assert_eq!(r.namespace(), None);
        assert_eq!(r.display_name(), "/");
    }
}
