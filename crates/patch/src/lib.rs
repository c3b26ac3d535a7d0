//! Keel patch engine: three-way patches between the last-applied snapshot,
//! the desired document and live state.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use keel_core::{doc, Resource, LAST_APPLIED_ANNOTATION};
use serde_json::{Map, Value};
use tracing::debug;

pub mod merge;
pub mod overlay;
pub mod schema;
pub mod strategic;

pub use merge::create_merge_patch as two_way;
use schema::{FieldMeta, NoSchema, SchemaOracle};

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("{0} is not an object")]
    NotAnObject(&'static str),
    #[error("malformed {annotation} annotation: {source}")]
    LastApplied {
        annotation: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialize snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PatchError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// RFC 7386 merge patch.
    Merge,
    /// Schema-aware patch with merge keys and `$patch` directives.
    Strategic,
}

/// A computed delta plus the snapshot to stamp once it lands.
#[derive(Debug, Clone)]
pub struct Patch {
    kind: PatchKind,
    delta: Value,
    last_applied: String,
    annotation: String,
    schema: Option<Arc<FieldMeta>>,
}

fn stripped(v: &Value, annotation: &str) -> Value {
    let mut v = v.clone();
    doc::remove_path(&mut v, &["metadata", "annotations", annotation]);
    v
}

/// Serialized `obj` without `annotation`.
pub fn last_applied_snapshot(obj: &Value, annotation: &str) -> Result<String> {
    Ok(serde_json::to_string(&stripped(obj, annotation))?)
}

impl Patch {
    /// Three-way patch. `original` of `None` counts as the empty document.
    /// Strategic when `schema` is given, RFC 7386 otherwise.
    pub fn three_way(
        original: Option<&Value>,
        modified: &Value,
        current: &Value,
        annotation: &str,
        schema: Option<Arc<FieldMeta>>,
    ) -> Result<Self> {
        let original = match original {
            Some(o) => stripped(o, annotation),
            None => Value::Object(Map::new()),
        };
        let modified = stripped(modified, annotation);
        let o = original.as_object().ok_or(PatchError::NotAnObject("original"))?;
        let m = modified.as_object().ok_or(PatchError::NotAnObject("modified"))?;
        let c = current.as_object().ok_or(PatchError::NotAnObject("current"))?;
        let (kind, delta) = match schema.as_deref() {
            Some(meta) => (PatchKind::Strategic, strategic::three_way(o, m, c, meta)),
            None => (PatchKind::Merge, merge::three_way(o, m, c)),
        };
        Ok(Self {
            kind,
            delta: Value::Object(delta),
            last_applied: serde_json::to_string(&modified)?,
            annotation: annotation.to_string(),
            schema,
        })
    }

    /// True when live already matches; skip the update.
    pub fn is_empty(&self) -> bool {
        self.delta.as_object().map_or(true, |m| m.is_empty())
    }

    pub fn kind(&self) -> PatchKind { self.kind }

    pub fn delta(&self) -> &Value { &self.delta }

    pub fn last_applied(&self) -> &str { &self.last_applied }

    /// Apply onto `live` and re-stamp the snapshot annotation. `live` is only
    /// replaced once both steps are done.
    pub fn merge(&self, live: &mut Resource) {
        let mut next = live.as_value().clone();
        match self.kind {
            PatchKind::Merge => merge::apply_merge_patch(&mut next, &self.delta),
            PatchKind::Strategic => strategic::apply(&mut next, &self.delta, self.schema.as_deref()),
        }
        if let Some(annotations) = doc::ensure_map_path(&mut next, &["metadata", "annotations"]) {
            annotations.insert(self.annotation.clone(), Value::String(self.last_applied.clone()));
        }
        if let Ok(next) = Resource::from_value(next) {
            *live = next;
        }
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.delta)
    }
}

/// Computes patches for resource pairs using the configured annotation and oracle.
#[derive(Clone)]
pub struct PatchEngine {
    annotation: String,
    oracle: Arc<dyn SchemaOracle>,
    rfc7386: bool,
}

impl Default for PatchEngine {
    fn default() -> Self { Self::new(LAST_APPLIED_ANNOTATION) }
}

impl fmt::Debug for PatchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchEngine")
            .field("annotation", &self.annotation)
            .field("rfc7386", &self.rfc7386)
            .finish_non_exhaustive()
    }
}

impl PatchEngine {
    pub fn new(annotation: &str) -> Self {
        Self { annotation: annotation.to_string(), oracle: Arc::new(NoSchema), rfc7386: false }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn SchemaOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    /// Ignore the oracle and always produce RFC 7386 patches.
    pub fn force_rfc7386(mut self, yes: bool) -> Self {
        self.rfc7386 = yes;
        self
    }

    pub fn annotation(&self) -> &str { &self.annotation }

    /// Last-applied document recorded on `live`. Missing or empty means none.
    pub fn original_of(&self, live: &Resource) -> Result<Option<Value>> {
        match live.annotation(&self.annotation) {
            None | Some("") => Ok(None),
            Some(raw) => serde_json::from_str(raw)
                .map(Some)
                .map_err(|source| PatchError::LastApplied { annotation: self.annotation.clone(), source }),
        }
    }

    /// Patch taking `live` to `spec`.
    pub fn diff(&self, spec: &Resource, live: &Resource) -> Result<Patch> {
        let original = self.original_of(live)?;
        let schema = if self.rfc7386 { None } else { self.oracle.lookup(&spec.group_kind()) };
        let patch = Patch::three_way(original.as_ref(), spec.as_value(), live.as_value(), &self.annotation, schema)?;
        debug!(name = %spec.name(), kind = %spec.kind(), patch_kind = ?patch.kind(), empty = patch.is_empty(), "computed patch");
        Ok(patch)
    }

    /// Snapshot of `spec` for the annotation.
    pub fn snapshot(&self, spec: &Resource) -> Result<String> {
        last_applied_snapshot(spec.as_value(), &self.annotation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::SchemaRegistry;
    use serde_json::json;

    const ANN: &str = LAST_APPLIED_ANNOTATION;

    fn res(v: Value) -> Resource {
        Resource::from_value(v).unwrap()
    }

    fn with_last_applied(mut live: Value, original: &Value) -> Value {
        let snap = last_applied_snapshot(original, ANN).unwrap();
        doc::ensure_map_path(&mut live, &["metadata", "annotations"]).unwrap().insert(ANN.into(), json!(snap));
        live
    }

    fn cm(data: Value) -> Value {
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}, "data": data})
    }

    #[test]
    fn same_original_and_modified_is_empty() {
        let d = cm(json!({"a": "1"}));
        let current = cm(json!({"a": "changed", "b": "foreign"}));
        let p = Patch::three_way(Some(&d), &d, &current, ANN, None).unwrap();
        assert!(p.is_empty());
    }

    #[test]
    fn converged_current_is_empty() {
        let original = cm(json!({"a": "1", "gone": "x"}));
        let modified = cm(json!({"a": "2"}));
        let p = Patch::three_way(Some(&original), &modified, &modified, ANN, None).unwrap();
        assert!(p.is_empty());
    }

    #[test]
    fn untouched_drift_is_not_reasserted() {
        let original = cm(json!({"a": "1", "k": "mine"}));
        let modified = cm(json!({"a": "2", "k": "mine"}));
        let mut live = res(cm(json!({"a": "1", "k": "theirs"})));
        let p = Patch::three_way(Some(&original), &modified, live.as_value(), ANN, None).unwrap();
        p.merge(&mut live);
        assert_eq!(live.as_value()["data"], json!({"a": "2", "k": "theirs"}));
    }

    #[test]
    fn merge_round_trips_and_stamps_snapshot() {
        let original = cm(json!({"a": "1", "drop": "x"}));
        let modified = cm(json!({"a": "2", "n": {"deep": [1, 2]}}));
        let mut live = res(with_last_applied(cm(json!({"a": "1", "drop": "x", "foreign": "y"})), &original));
        let engine = PatchEngine::default();
        let p = engine.diff(&res(modified.clone()), &live).unwrap();
        assert_eq!(p.kind(), PatchKind::Merge);
        assert!(!p.is_empty());
        p.merge(&mut live);
        assert_eq!(live.as_value()["data"], json!({"a": "2", "foreign": "y", "n": {"deep": [1, 2]}}));
        assert_eq!(live.annotation(ANN), Some(p.last_applied()));
        assert_eq!(p.last_applied(), engine.snapshot(&res(modified)).unwrap());
    }

    #[test]
    fn snapshot_never_contains_itself() {
        let mut spec = cm(json!({}));
        spec["metadata"]["annotations"] = json!({ANN: "stale", "keep": "me"});
        let snap: Value = serde_json::from_str(&last_applied_snapshot(&spec, ANN).unwrap()).unwrap();
        assert_eq!(snap["metadata"]["annotations"], json!({"keep": "me"}));

        let p = Patch::three_way(None, &spec, &cm(json!({})), ANN, None).unwrap();
        assert!(doc::get_path(p.delta(), &["metadata", "annotations", ANN]).is_none());
    }

    #[test]
    fn first_apply_is_purely_additive() {
        let modified = cm(json!({"a": "1"}));
        let mut live = res(cm(json!({"z": "pre-existing"})));
        let p = PatchEngine::default().diff(&res(modified), &live).unwrap();
        p.merge(&mut live);
        assert_eq!(live.as_value()["data"], json!({"z": "pre-existing", "a": "1"}));
    }

    #[test]
    fn first_apply_keeps_foreign_fields_under_empty_keys() {
        let mut spec = cm(json!({"a": "1"}));
        spec["metadata"]["annotations"] = Value::Null;
        let mut pre = cm(json!({}));
        pre["metadata"]["annotations"] = json!({"other-controller/owner": "x"});
        let strategic = SchemaRegistry::new().with("", "ConfigMap", FieldMeta::new());
        for engine in [PatchEngine::default(), PatchEngine::default().with_oracle(Arc::new(strategic))] {
            let mut live = res(pre.clone());
            let p = engine.diff(&res(spec.clone()), &live).unwrap();
            assert_eq!(p.delta(), &json!({"data": {"a": "1"}}));
            p.merge(&mut live);
            assert_eq!(live.annotation("other-controller/owner"), Some("x"));
            assert!(live.annotation(ANN).is_some());
        }
    }

    #[test]
    fn empty_or_malformed_annotation() {
        let engine = PatchEngine::default();
        let mut live = res(cm(json!({})));
        live.set_annotation(ANN, "");
        assert!(engine.original_of(&live).unwrap().is_none());
        live.set_annotation(ANN, "{not json");
        let err = engine.diff(&res(cm(json!({}))), &live).unwrap_err();
        assert!(matches!(err, PatchError::LastApplied { .. }));
    }

    fn deployment(image: &str, replicas: Option<u64>) -> Value {
        let mut d = json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "prod"},
            "spec": {"template": {"spec": {"containers": [
                {"name": "app", "image": image},
                {"name": "proxy", "image": "envoy"}
            ]}}}
        });
        if let Some(r) = replicas {
            d["spec"]["replicas"] = json!(r);
        }
        d
    }

    #[test]
    fn strategic_when_oracle_knows_kind() {
        let engine = PatchEngine::default().with_oracle(Arc::new(SchemaRegistry::builtin()));
        let original = deployment("app:1", None);
        let mut live = res(with_last_applied(deployment("app:1", Some(5)), &original));
        live.as_value_mut()["spec"]["template"]["spec"]["containers"][1]["resources"] = json!({"cpu": "1"});
        let p = engine.diff(&res(deployment("app:2", None)), &live).unwrap();
        assert_eq!(p.kind(), PatchKind::Strategic);
        assert_eq!(p.delta(), &json!({"spec": {"template": {"spec": {"containers": [{"name": "app", "image": "app:2"}]}}}}));
        p.merge(&mut live);
        let spec = &live.as_value()["spec"];
        assert_eq!(spec["replicas"], json!(5));
        assert_eq!(spec["template"]["spec"]["containers"][0]["image"], json!("app:2"));
        assert_eq!(spec["template"]["spec"]["containers"][1]["resources"], json!({"cpu": "1"}));

        let generic = engine.clone().force_rfc7386(true).diff(&res(deployment("app:2", None)), &res(deployment("app:1", Some(5)))).unwrap();
        assert_eq!(generic.kind(), PatchKind::Merge);
    }

    #[test]
    fn two_way_reexport() {
        assert_eq!(two_way(&json!({"a": 1}), &json!({"a": 2})), json!({"a": 2}));
    }
}
