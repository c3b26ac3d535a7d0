//! Keel kubehub: a `Client` backed by a Kubernetes API server.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use keel_apply::{ApplyOptions, Client as StoreClient, ClientError, DeleteOptions};
use keel_core::{GroupVersionKind, Resource};
use kube::{
    api::{Api, DeleteParams, PostParams, Preconditions, PropagationPolicy},
    core::{ApiResource, DynamicObject},
    discovery::{ApiCapabilities, Discovery, Scope},
    Client,
};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Resolves kinds through API discovery, run once on first use.
pub struct KubeClient {
    client: Client,
    discovery: OnceCell<Discovery>,
}

/// Connect with the ambient kubeconfig or in-cluster config.
pub async fn connect() -> Result<KubeClient> {
    let client = Client::try_default().await.context("building kube client")?;
    info!(namespace = %client.default_namespace(), "connected");
    Ok(KubeClient::new(client))
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client, discovery: OnceCell::new() }
    }

    async fn find_api_resource(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
        let discovery = self
            .discovery
            .get_or_try_init(|| async { Discovery::new(self.client.clone()).run().await })
            .await?;
        resolve(discovery, gvk).ok_or_else(|| anyhow!("GVK not found: {}", gvk))
    }

    async fn api_for(&self, r: &Resource) -> Result<Api<DynamicObject>, ClientError> {
        let (ar, namespaced) = self.find_api_resource(&r.gvk()).await?;
        let api = if namespaced {
            let ns = r.namespace().unwrap_or_else(|| self.client.default_namespace());
            Api::namespaced_with(self.client.clone(), ns, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok(api)
    }
}

/// Looks in the listing of the pinned version, which need not be the
/// preferred one.
fn resolve(discovery: &Discovery, gvk: &GroupVersionKind) -> Option<(ApiResource, bool)> {
    let group = discovery.get(&gvk.group)?;
    pick(group.versioned_resources(&gvk.version), gvk)
}

fn pick(listing: Vec<(ApiResource, ApiCapabilities)>, gvk: &GroupVersionKind) -> Option<(ApiResource, bool)> {
    listing
        .into_iter()
        .find(|(ar, _)| ar.kind == gvk.kind && ar.version == gvk.version)
        .map(|(ar, caps)| (ar, matches!(caps.scope, Scope::Namespaced)))
}

fn classify(e: kube::Error) -> ClientError {
    match e {
        kube::Error::Api(resp) => match resp.code {
            404 => ClientError::NotFound(resp.message),
            422 => ClientError::Invalid(resp.message),
            409 => ClientError::Conflict(resp.message),
            _ => ClientError::Other(anyhow!("{} ({}): {}", resp.reason, resp.code, resp.message)),
        },
        other => ClientError::Other(other.into()),
    }
}

fn to_dynamic(r: &Resource) -> Result<DynamicObject, ClientError> {
    serde_json::from_value(r.as_value().clone())
        .with_context(|| format!("converting {} to a dynamic object", r))
        .map_err(ClientError::Other)
}

fn from_dynamic(obj: &DynamicObject) -> Result<Resource, ClientError> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.shift_remove("managedFields");
    }
    Resource::from_value(raw).map_err(|e| ClientError::Other(e.into()))
}

fn post_params(opts: &ApplyOptions) -> PostParams {
    PostParams { dry_run: opts.dry_run, field_manager: opts.field_manager.clone() }
}

fn delete_params(opts: &DeleteOptions) -> DeleteParams {
    DeleteParams {
        dry_run: opts.dry_run,
        grace_period_seconds: opts.grace_period_seconds,
        propagation_policy: opts.propagation_policy.map(|p| match p {
            keel_apply::PropagationPolicy::Orphan => PropagationPolicy::Orphan,
            keel_apply::PropagationPolicy::Background => PropagationPolicy::Background,
            keel_apply::PropagationPolicy::Foreground => PropagationPolicy::Foreground,
        }),
        preconditions: opts.preconditions.as_ref().map(|p| Preconditions {
            resource_version: p.resource_version.clone(),
            uid: p.uid.clone(),
        }),
    }
}

#[async_trait::async_trait]
impl StoreClient for KubeClient {
    async fn get(&self, spec: &Resource) -> Result<Resource, ClientError> {
        let api = self.api_for(spec).await?;
        let obj = api.get(spec.name()).await.map_err(classify)?;
        from_dynamic(&obj)
    }

    async fn create(&self, obj: &Resource, opts: &ApplyOptions) -> Result<(), ClientError> {
        let api = self.api_for(obj).await?;
        let created = api.create(&post_params(opts), &to_dynamic(obj)?).await.map_err(classify)?;
        debug!(name = %obj.display_name(), rv = ?created.metadata.resource_version, "created");
        Ok(())
    }

    async fn update(&self, obj: &Resource, opts: &ApplyOptions) -> Result<(), ClientError> {
        let api = self.api_for(obj).await?;
        let updated = api.replace(obj.name(), &post_params(opts), &to_dynamic(obj)?).await.map_err(classify)?;
        debug!(name = %obj.display_name(), rv = ?updated.metadata.resource_version, "replaced");
        Ok(())
    }

    async fn delete(&self, spec: &Resource, opts: &DeleteOptions) -> Result<(), ClientError> {
        let api = self.api_for(spec).await?;
        api.delete(spec.name(), &delete_params(opts)).await.map_err(classify)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_apply::{Preconditions as Pre, PropagationPolicy as Policy};
    use kube::core::ErrorResponse;
    use serde_json::json;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: format!("code {code}"), reason: "Test".into(), code })
    }

    #[test]
    fn status_codes_map_to_client_errors() {
        assert!(matches!(classify(api_error(404)), ClientError::NotFound(_)));
        assert!(matches!(classify(api_error(422)), ClientError::Invalid(_)));
        assert!(matches!(classify(api_error(409)), ClientError::Conflict(_)));
        assert!(matches!(classify(api_error(500)), ClientError::Other(_)));
    }

    #[test]
    fn dynamic_round_trip_drops_managed_fields() {
        let r = Resource::from_value(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "c", "namespace": "ns", "managedFields": [{"manager": "x"}]},
            "data": {"k": "v"}
        }))
        .unwrap();
        let back = from_dynamic(&to_dynamic(&r).unwrap()).unwrap();
        assert_eq!(back.name(), "c");
        assert_eq!(back.as_value()["data"], json!({"k": "v"}));
        assert!(back.as_value()["metadata"].get("managedFields").is_none());
    }

    fn listing(version: &str, kinds: &[(&str, Scope)]) -> Vec<(ApiResource, ApiCapabilities)> {
        kinds
            .iter()
            .map(|(kind, scope)| {
                let ar = ApiResource::from_gvk(&kube::core::GroupVersionKind::gvk("autoscaling", version, kind));
                (ar, ApiCapabilities { scope: scope.clone(), subresources: vec![], operations: vec![] })
            })
            .collect()
    }

    #[test]
    fn pinned_version_resolves_from_its_listing() {
        let v1 = listing("v1", &[("HorizontalPodAutoscaler", Scope::Namespaced)]);
        let gvk = GroupVersionKind::new("autoscaling", "v1", "HorizontalPodAutoscaler");
        let (ar, namespaced) = pick(v1.clone(), &gvk).unwrap();
        assert_eq!((ar.version.as_str(), ar.kind.as_str()), ("v1", "HorizontalPodAutoscaler"));
        assert!(namespaced);

        assert!(pick(v1.clone(), &GroupVersionKind::new("autoscaling", "v1", "Scale")).is_none());
        assert!(pick(v1, &GroupVersionKind::new("autoscaling", "v2", "HorizontalPodAutoscaler")).is_none());

        let cluster = listing("v1", &[("Widget", Scope::Cluster)]);
        let (_, namespaced) = pick(cluster, &GroupVersionKind::new("autoscaling", "v1", "Widget")).unwrap();
        assert!(!namespaced);
    }

    #[test]
    fn options_translate() {
        let pp = post_params(&ApplyOptions { dry_run: true, field_manager: Some("keel".into()), overwrite: true });
        assert!(pp.dry_run);
        assert_eq!(pp.field_manager.as_deref(), Some("keel"));

        let dp = delete_params(&DeleteOptions {
            grace_period_seconds: Some(0),
            propagation_policy: Some(Policy::Foreground),
            preconditions: Some(Pre { resource_version: Some("7".into()), uid: None }),
            ..DeleteOptions::default()
        });
        assert_eq!(dp.grace_period_seconds, Some(0));
        assert!(matches!(dp.propagation_policy, Some(PropagationPolicy::Foreground)));
        assert_eq!(dp.preconditions.and_then(|p| p.resource_version).as_deref(), Some("7"));
    }
}
