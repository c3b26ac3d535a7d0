//! Predicates for `Manifest::filter`.

use std::collections::HashSet;
use std::sync::Arc;

use keel_core::{GroupVersionKind, Resource, ResourceKey};

pub type Predicate = Arc<dyn Fn(&Resource) -> bool + Send + Sync>;

pub fn predicate(f: impl Fn(&Resource) -> bool + Send + Sync + 'static) -> Predicate {
    Arc::new(f)
}

/// True when at least one of `preds` holds.
pub fn any(preds: Vec<Predicate>) -> Predicate {
    predicate(move |r| preds.iter().any(|p| p(r)))
}

/// True when every one of `preds` holds; vacuously true.
pub fn all(preds: Vec<Predicate>) -> Predicate {
    predicate(move |r| preds.iter().all(|p| p(r)))
}

/// True when none of `preds` holds.
pub fn none(preds: Vec<Predicate>) -> Predicate {
    predicate(move |r| !preds.iter().any(|p| p(r)))
}

pub fn not(pred: Predicate) -> Predicate {
    predicate(move |r| !pred(r))
}

pub fn everything() -> Predicate { predicate(|_| true) }

pub fn nothing() -> Predicate { predicate(|_| false) }

pub fn by_name(name: &str) -> Predicate {
    let name = name.to_string();
    predicate(move |r| r.name() == name)
}

/// Kind match, case sensitive.
pub fn by_kind(kind: &str) -> Predicate {
    let kind = kind.to_string();
    predicate(move |r| r.kind() == kind)
}

pub fn by_gvk(gvk: GroupVersionKind) -> Predicate {
    predicate(move |r| r.gvk() == gvk)
}

/// Label `key` present with `value`; an empty `value` matches any.
pub fn by_label(key: &str, value: &str) -> Predicate {
    let (key, value) = (key.to_string(), value.to_string());
    predicate(move |r| match r.label(&key) {
        Some(v) => value.is_empty() || v == value,
        None => false,
    })
}

/// Any of `labels` matches, with `by_label` semantics per pair.
pub fn by_labels(labels: &[(&str, &str)]) -> Predicate {
    any(labels.iter().map(|(k, v)| by_label(k, v)).collect())
}

/// Annotation `key` present with `value`; an empty `value` matches any.
pub fn by_annotation(key: &str, value: &str) -> Predicate {
    let (key, value) = (key.to_string(), value.to_string());
    predicate(move |r| match r.annotation(&key) {
        Some(v) => value.is_empty() || v == value,
        None => false,
    })
}

pub fn crds() -> Predicate { by_kind("CustomResourceDefinition") }

pub fn no_crds() -> Predicate { not(crds()) }

/// Resources sharing identity with one of `resources`, whatever their version.
pub fn in_manifest(resources: &[Resource]) -> Predicate {
    let keys: HashSet<ResourceKey> = resources.iter().map(Resource::key).collect();
    predicate(move |r| keys.contains(&r.key()))
}
