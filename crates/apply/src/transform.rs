//! Transformers for `Manifest::transform`. Each gets a private copy of a resource.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use keel_core::{doc, Resource};
use serde_json::{json, Value};

pub type Transformer = Arc<dyn Fn(&mut Resource) -> Result<()> + Send + Sync>;

pub fn transformer(f: impl Fn(&mut Resource) -> Result<()> + Send + Sync + 'static) -> Transformer {
    Arc::new(f)
}

const CLUSTER_SCOPED: &[&str] = &[
    "APIService",
    "ClusterRole",
    "ClusterRoleBinding",
    "CSIDriver",
    "CSINode",
    "CustomResourceDefinition",
    "IngressClass",
    "MutatingWebhookConfiguration",
    "Namespace",
    "Node",
    "PersistentVolume",
    "PodSecurityPolicy",
    "PriorityClass",
    "RuntimeClass",
    "StorageClass",
    "ValidatingWebhookConfiguration",
    "VolumeAttachment",
];

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED.contains(&kind)
}

/// `$NAME` or `${NAME}` reads the environment; anything else is literal.
fn expand(value: &str) -> Result<String> {
    let Some(var) = value.strip_prefix('$') else { return Ok(value.to_string()) };
    let var = var.strip_prefix('{').and_then(|v| v.strip_suffix('}')).unwrap_or(var);
    std::env::var(var).map_err(|_| anyhow!("environment variable {} is not set", var))
}

fn set_in_each(list: Option<&mut Value>, path: &[&str], key: &str, ns: &str, only: impl Fn(&Value) -> bool) {
    let Some(Value::Array(items)) = list else { return };
    for item in items.iter_mut().filter(|i| only(i)) {
        if let Some(m) = doc::ensure_map_path(item, path) {
            m.insert(key.to_string(), Value::String(ns.to_string()));
        }
    }
}

/// Set the namespace of namespaced resources, plus the namespace references
/// that binding subjects and webhook service configs carry.
pub fn inject_namespace(ns: &str) -> Transformer {
    let ns = ns.to_string();
    transformer(move |r| {
        let ns = expand(&ns)?;
        let kind = r.kind().to_string();
        let v = r.as_value_mut();
        match kind.as_str() {
            "ClusterRoleBinding" | "RoleBinding" => {
                let is_sa = |s: &Value| s.get("kind").and_then(|k| k.as_str()) == Some("ServiceAccount");
                set_in_each(v.get_mut("subjects"), &[], "namespace", &ns, is_sa);
            }
            "MutatingWebhookConfiguration" | "ValidatingWebhookConfiguration" => {
                let has_service = |w: &Value| doc::get_path(w, &["clientConfig", "service"]).is_some();
                set_in_each(v.get_mut("webhooks"), &["clientConfig", "service"], "namespace", &ns, has_service);
            }
            "APIService" => {
                if doc::get_path(v, &["spec", "service"]).is_some() {
                    if let Some(m) = doc::ensure_map_path(v, &["spec", "service"]) {
                        m.insert("namespace".into(), Value::String(ns.clone()));
                    }
                }
            }
            "CustomResourceDefinition" => {
                let path = ["spec", "conversion", "webhook", "clientConfig", "service"];
                if doc::get_path(v, &path).is_some() {
                    if let Some(m) = doc::ensure_map_path(v, &path) {
                        m.insert("namespace".into(), Value::String(ns.clone()));
                    }
                }
            }
            _ => {}
        }
        if !is_cluster_scoped(&kind) {
            r.set_namespace(&ns);
        }
        Ok(())
    })
}

/// Make `owner` the controlling owner of every namespaced resource.
pub fn inject_owner(owner: &Resource) -> Transformer {
    let reference = json!({
        "apiVersion": owner.api_version(),
        "kind": owner.kind(),
        "name": owner.name(),
        "uid": doc::get_path(owner.as_value(), &["metadata", "uid"]).cloned().unwrap_or(Value::Null),
        "controller": true,
        "blockOwnerDeletion": true,
    });
    let owner_name = owner.display_name();
    transformer(move |r| {
        if is_cluster_scoped(r.kind()) {
            return Ok(());
        }
        if !reference["uid"].is_string() {
            return Err(anyhow!("owner {} has no uid", owner_name));
        }
        let meta = doc::ensure_map_path(r.as_value_mut(), &["metadata"]).ok_or_else(|| anyhow!("resource is not an object"))?;
        meta.insert("ownerReferences".into(), Value::Array(vec![reference.clone()]));
        Ok(())
    })
}

/// Merge `labels` into every resource's labels.
pub fn inject_labels(labels: &[(&str, &str)]) -> Transformer {
    let labels: Vec<(String, String)> = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    transformer(move |r| {
        for (k, v) in &labels {
            r.set_label(k, v);
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(v: Value) -> Resource {
        Resource::from_value(v).unwrap()
    }

    #[test]
    fn namespace_skips_cluster_scoped_and_fixes_subjects() {
        let t = inject_namespace("foo");
        let mut crb = res(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRoleBinding",
            "metadata": {"name": "b"},
            "subjects": [{"kind": "ServiceAccount", "name": "sa", "namespace": "default"}, {"kind": "User", "name": "u"}]
        }));
        t(&mut crb).unwrap();
        assert_eq!(crb.namespace(), None);
        assert_eq!(crb.as_value()["subjects"][0]["namespace"], json!("foo"));
        assert!(crb.as_value()["subjects"][1].get("namespace").is_none());

        let mut cm = res(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}}));
        t(&mut cm).unwrap();
        assert_eq!(cm.namespace(), Some("foo"));
    }

    #[test]
    fn namespace_rewrites_webhook_services() {
        let mut hook = res(json!({
            "apiVersion": "admissionregistration.k8s.io/v1", "kind": "ValidatingWebhookConfiguration",
            "metadata": {"name": "h"},
            "webhooks": [{"name": "a", "clientConfig": {"service": {"name": "svc", "namespace": "x"}}}, {"name": "b", "clientConfig": {"url": "https://x"}}]
        }));
        inject_namespace("foo")(&mut hook).unwrap();
        assert_eq!(hook.as_value()["webhooks"][0]["clientConfig"]["service"]["namespace"], json!("foo"));
        assert!(hook.as_value()["webhooks"][1]["clientConfig"].get("service").is_none());
    }

    #[test]
    fn namespace_from_environment() {
        std::env::set_var("KEEL_TEST_INJECT_NS", "from-env");
        let mut cm = res(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}}));
        inject_namespace("${KEEL_TEST_INJECT_NS}")(&mut cm).unwrap();
        assert_eq!(cm.namespace(), Some("from-env"));
        assert!(inject_namespace("$KEEL_TEST_SURELY_UNSET")(&mut cm).is_err());
    }

    #[test]
    fn owner_requires_uid() {
        let owner = res(json!({"apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "w", "uid": "u-1"}}));
        let mut cm = res(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}}));
        inject_owner(&owner)(&mut cm).unwrap();
        assert_eq!(cm.as_value()["metadata"]["ownerReferences"][0]["uid"], json!("u-1"));

        let orphan = res(json!({"apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "w"}}));
        assert!(inject_owner(&orphan)(&mut cm).is_err());
        let mut ns = res(json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "n"}}));
        assert!(inject_owner(&orphan)(&mut ns).is_ok());
    }

    #[test]
    fn labels_merge() {
        let mut cm = res(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c", "labels": {"a": "1"}}}));
        inject_labels(&[("b", "2"), ("a", "3")])(&mut cm).unwrap();
        assert_eq!(cm.as_value()["metadata"]["labels"], json!({"a": "3", "b": "2"}));
    }
}
