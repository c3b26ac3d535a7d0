//! Per-kind field merge metadata and the oracle that looks it up.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use keel_core::GroupKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PatchStrategy {
    #[default]
    Merge,
    Replace,
}

/// Merge metadata for one field. For list fields, `fields` describes the
/// members of each element.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldMeta {
    #[serde(default)]
    pub strategy: PatchStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_key: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, FieldMeta>,
}

impl FieldMeta {
    pub fn new() -> Self { Self::default() }

    /// List merged element-wise by `key`.
    pub fn merge_list(key: &str) -> Self {
        Self { strategy: PatchStrategy::Merge, merge_key: Some(key.to_string()), fields: BTreeMap::new() }
    }

    /// Field replaced wholesale whenever it changes.
    pub fn replace() -> Self {
        Self { strategy: PatchStrategy::Replace, ..Self::default() }
    }

    pub fn with_field(mut self, name: &str, meta: FieldMeta) -> Self {
        self.fields.insert(name.to_string(), meta);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldMeta> { self.fields.get(name) }

    /// Merge key when this field is a keyed list under merge strategy.
    pub fn list_merge_key(&self) -> Option<&str> {
        match self.strategy {
            PatchStrategy::Merge => self.merge_key.as_deref(),
            PatchStrategy::Replace => None,
        }
    }

    pub fn is_replace(&self) -> bool { self.strategy == PatchStrategy::Replace }
}

/// Kind to merge metadata lookup. `None` means generic merge semantics.
pub trait SchemaOracle: Send + Sync {
    fn lookup(&self, gk: &GroupKind) -> Option<Arc<FieldMeta>>;
}

/// Knows no kinds; every patch is a plain merge patch.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSchema;

impl SchemaOracle for NoSchema {
    fn lookup(&self, _gk: &GroupKind) -> Option<Arc<FieldMeta>> { None }
}

/// Map-backed oracle populated by the host application.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    kinds: HashMap<GroupKind, Arc<FieldMeta>>,
}

impl SchemaRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, gk: GroupKind, meta: FieldMeta) -> &mut Self {
        self.kinds.insert(gk, Arc::new(meta));
        self
    }

    pub fn with(mut self, group: &str, kind: &str, meta: FieldMeta) -> Self {
        self.register(GroupKind::new(group, kind), meta);
        self
    }

    pub fn len(&self) -> usize { self.kinds.len() }

    pub fn is_empty(&self) -> bool { self.kinds.is_empty() }

    /// Registry preloaded with merge keys for common workload and service kinds.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        for (group, kind) in BUILTIN_KINDS {
            if let Some(meta) = builtin_meta_for(group, kind) {
                reg.register(GroupKind::new(group, kind), meta);
            }
        }
        reg
    }
}

impl SchemaOracle for SchemaRegistry {
    fn lookup(&self, gk: &GroupKind) -> Option<Arc<FieldMeta>> {
        self.kinds.get(gk).cloned()
    }
}

const BUILTIN_KINDS: &[(&str, &str)] = &[
    ("", "Pod"),
    ("", "PodTemplate"),
    ("", "ReplicationController"),
    ("", "Service"),
    ("apps", "Deployment"),
    ("apps", "StatefulSet"),
    ("apps", "DaemonSet"),
    ("apps", "ReplicaSet"),
    ("batch", "Job"),
    ("batch", "CronJob"),
];

fn container() -> FieldMeta {
    FieldMeta::merge_list("name")
        .with_field("ports", FieldMeta::merge_list("containerPort"))
        .with_field("env", FieldMeta::merge_list("name"))
        .with_field("volumeMounts", FieldMeta::merge_list("mountPath"))
        .with_field("volumeDevices", FieldMeta::merge_list("devicePath"))
}

fn pod_spec() -> FieldMeta {
    FieldMeta::new()
        .with_field("containers", container())
        .with_field("initContainers", container())
        .with_field("ephemeralContainers", container())
        .with_field("volumes", FieldMeta::merge_list("name"))
        .with_field("imagePullSecrets", FieldMeta::merge_list("name"))
        .with_field("hostAliases", FieldMeta::merge_list("ip"))
}

fn pod_template() -> FieldMeta {
    FieldMeta::new().with_field("metadata", object_meta()).with_field("spec", pod_spec())
}

fn object_meta() -> FieldMeta {
    FieldMeta::new().with_field("ownerReferences", FieldMeta::merge_list("uid"))
}

fn root(spec: FieldMeta) -> FieldMeta {
    FieldMeta::new().with_field("metadata", object_meta()).with_field("spec", spec)
}

/// Merge metadata for a built-in kind, `None` for kinds merged generically.
pub fn builtin_meta_for(group: &str, kind: &str) -> Option<FieldMeta> {
    let meta = match (group, kind) {
        ("", "Pod") => root(pod_spec()),
        ("", "PodTemplate") => FieldMeta::new().with_field("metadata", object_meta()).with_field("template", pod_template()),
        ("", "ReplicationController")
        | ("apps", "Deployment")
        | ("apps", "StatefulSet")
        | ("apps", "DaemonSet")
        | ("apps", "ReplicaSet")
        | ("batch", "Job") => root(FieldMeta::new().with_field("template", pod_template())),
        ("batch", "CronJob") => root(FieldMeta::new().with_field(
            "jobTemplate",
            FieldMeta::new().with_field("spec", FieldMeta::new().with_field("template", pod_template())),
        )),
        ("", "Service") => root(FieldMeta::new().with_field("ports", FieldMeta::merge_list("port"))),
        _ => return None,
    };
    Some(meta)
}
