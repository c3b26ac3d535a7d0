//! Keel apply: reconcile an ordered manifest against a store through a `Client`.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;

use keel_core::{doc, env_flag, Resource, LAST_APPLIED_ANNOTATION, OWNERSHIP_ANNOTATION, RESOURCE_CREATED};
use keel_patch::schema::SchemaOracle;
use keel_patch::{overlay, two_way, PatchEngine, PatchError};
use keel_source::{Source, SourceError};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod client;
pub mod fake;
pub mod filter;
pub mod transform;

pub use client::{ApplyOptions, Client, ClientError, DeleteOptions, Preconditions, PropagationPolicy};
pub use filter::Predicate;
pub use transform::Transformer;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error("cancelled")]
    Cancelled,
    #[error("transform {resource}: {source}")]
    Transform {
        resource: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("manifest has no client")]
    NoClient,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestConfig {
    /// Annotation holding the last-applied snapshot.
    pub last_applied_annotation: String,
    /// Annotation marking objects this library created.
    pub ownership_annotation: String,
    /// Always compute RFC 7386 patches, even for kinds with merge metadata.
    pub rfc7386: bool,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            last_applied_annotation: LAST_APPLIED_ANNOTATION.to_string(),
            ownership_annotation: OWNERSHIP_ANNOTATION.to_string(),
            rfc7386: false,
        }
    }
}

impl ManifestConfig {
    /// Defaults overridden by `KEEL_LAST_APPLIED_ANNOTATION`,
    /// `KEEL_OWNERSHIP_ANNOTATION` and `KEEL_RFC7386`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let non_empty = |key: &str, default: String| std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or(default);
        Self {
            last_applied_annotation: non_empty("KEEL_LAST_APPLIED_ANNOTATION", d.last_applied_annotation),
            ownership_annotation: non_empty("KEEL_OWNERSHIP_ANNOTATION", d.ownership_annotation),
            rfc7386: env_flag("KEEL_RFC7386"),
        }
    }
}

/// Per-resource outcome of `apply`, for callers that want to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
    Deleted,
    Skipped,
}

/// An ordered set of resources bound to a client. Every transformation
/// returns a new manifest; the original is left as it was.
#[derive(Clone)]
pub struct Manifest {
    resources: Vec<Resource>,
    client: Option<Arc<dyn Client>>,
    engine: PatchEngine,
    config: ManifestConfig,
    oracle: Option<Arc<dyn SchemaOracle>>,
}

impl std::fmt::Debug for Manifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manifest")
            .field("resources", &self.resources.len())
            .field("client", &self.client.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Manifest {
    pub fn new(resources: Vec<Resource>) -> Self {
        let config = ManifestConfig::default();
        Self { resources, client: None, engine: Self::engine_for(&config, None), config, oracle: None }
    }

    pub fn from_source(source: &dyn Source) -> std::result::Result<Self, SourceError> {
        Ok(Self::new(source.parse()?))
    }

    fn engine_for(config: &ManifestConfig, oracle: Option<&Arc<dyn SchemaOracle>>) -> PatchEngine {
        let engine = PatchEngine::new(&config.last_applied_annotation).force_rfc7386(config.rfc7386);
        match oracle {
            Some(o) => engine.with_oracle(o.clone()),
            None => engine,
        }
    }

    pub fn with_client(mut self, client: Arc<dyn Client>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_config(mut self, config: ManifestConfig) -> Self {
        self.engine = Self::engine_for(&config, self.oracle.as_ref());
        self.config = config;
        self
    }

    /// Merge metadata source for strategic patches.
    pub fn with_oracle(mut self, oracle: Arc<dyn SchemaOracle>) -> Self {
        self.oracle = Some(oracle);
        self.engine = Self::engine_for(&self.config, self.oracle.as_ref());
        self
    }

    pub fn config(&self) -> &ManifestConfig { &self.config }

    /// Deep copies of the resources, in order.
    pub fn resources(&self) -> Vec<Resource> { self.resources.clone() }

    pub fn len(&self) -> usize { self.resources.len() }

    pub fn is_empty(&self) -> bool { self.resources.is_empty() }

    /// This manifest's resources followed by each of `others`'.
    pub fn append(&self, others: &[&Manifest]) -> Self {
        let mut out = self.clone();
        for m in others {
            out.resources.extend(m.resources.iter().cloned());
        }
        out
    }

    /// Resources for which every predicate holds.
    pub fn filter(&self, preds: &[Predicate]) -> Self {
        let mut out = self.clone();
        out.resources.retain(|r| preds.iter().all(|p| p(r)));
        out
    }

    /// Run every transformer over a copy of each resource. Any error leaves
    /// `self` untouched and no new manifest is produced.
    pub fn transform(&self, fns: &[Transformer]) -> Result<Self> {
        let mut resources = Vec::with_capacity(self.resources.len());
        for r in &self.resources {
            let mut copy = r.clone();
            for f in fns {
                f(&mut copy).map_err(|source| Error::Transform { resource: r.to_string(), source })?;
            }
            resources.push(copy);
        }
        let mut out = self.clone();
        out.resources = resources;
        Ok(out)
    }

    /// First resource matching `api_version`, `kind` and `name`.
    pub fn find(&self, api_version: &str, kind: &str, name: &str) -> Option<Resource> {
        self.resources
            .iter()
            .find(|r| r.api_version() == api_version && r.kind() == kind && r.name() == name)
            .cloned()
    }

    fn client(&self) -> Result<&dyn Client> {
        self.client.as_deref().ok_or(Error::NoClient)
    }

    /// Create or update every resource in order.
    pub async fn apply(&self, token: &CancellationToken, opts: &ApplyOptions) -> Result<Vec<Outcome>> {
        let client = self.client()?;
        let mut outcomes = Vec::with_capacity(self.resources.len());
        for spec in &self.resources {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let t0 = std::time::Instant::now();
            counter!("apply_attempts", 1u64);
            match self.apply_one(client, token, spec, opts).await {
                Ok(outcome) => {
                    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                    outcomes.push(outcome);
                }
                Err(e) => {
                    counter!("apply_err", 1u64);
                    return Err(e);
                }
            }
        }
        Ok(outcomes)
    }

    async fn apply_one(&self, client: &dyn Client, token: &CancellationToken, spec: &Resource, opts: &ApplyOptions) -> Result<Outcome> {
        let Some(live) = self.get(client, token, spec).await? else {
            let mut obj = spec.clone();
            let snapshot = self.engine.snapshot(spec)?;
            obj.set_annotation(&self.config.ownership_annotation, RESOURCE_CREATED);
            obj.set_annotation(self.engine.annotation(), &snapshot);
            info!(kind = %spec.kind(), name = %spec.display_name(), "creating");
            race(token, client.create(&obj, opts)).await?;
            counter!("apply_create", 1u64);
            return Ok(Outcome::Created);
        };

        let patch = self.engine.diff(spec, &live)?;
        if patch.is_empty() {
            debug!(kind = %spec.kind(), name = %spec.display_name(), "unchanged");
            counter!("apply_noop", 1u64);
            return Ok(Outcome::Unchanged);
        }
        let owned = live.annotation(&self.config.ownership_annotation) == Some(RESOURCE_CREATED);
        let mut merged = live;
        patch.merge(&mut merged);
        if owned {
            merged.set_annotation(&self.config.ownership_annotation, RESOURCE_CREATED);
        }
        info!(kind = %spec.kind(), name = %spec.display_name(), patch = %patch, "updating");
        match race(token, client.update(&merged, opts)).await {
            Err(Error::Client(e)) if opts.overwrite && e.is_invalid() => {
                warn!(kind = %spec.kind(), name = %spec.display_name(), error = %e, "merged update rejected; overwriting");
                counter!("apply_overwrite_fallback", 1u64);
                if let Some(target) = merged.as_value_mut().as_object_mut() {
                    overlay::copy(spec.object(), target);
                }
                race(token, client.update(&merged, opts)).await?;
            }
            other => other?,
        }
        counter!("apply_update", 1u64);
        Ok(Outcome::Updated)
    }

    /// Delete every resource, last declared first. Missing objects are fine;
    /// namespaces are only removed when this library created them.
    pub async fn delete(&self, token: &CancellationToken, opts: &DeleteOptions) -> Result<Vec<Outcome>> {
        let client = self.client()?;
        let mut outcomes = Vec::with_capacity(self.resources.len());
        for spec in self.resources.iter().rev() {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(live) = self.get(client, token, spec).await? else {
                outcomes.push(Outcome::Skipped);
                continue;
            };
            if !self.ok_to_delete(&live) {
                info!(kind = %spec.kind(), name = %spec.display_name(), "not created here; leaving in place");
                counter!("delete_skipped", 1u64);
                outcomes.push(Outcome::Skipped);
                continue;
            }
            info!(kind = %spec.kind(), name = %spec.display_name(), "deleting");
            match race(token, client.delete(spec, opts)).await {
                Err(Error::Client(e)) if opts.ignore_not_found && e.is_not_found() => {
                    outcomes.push(Outcome::Skipped);
                    continue;
                }
                other => other?,
            }
            counter!("delete_ok", 1u64);
            outcomes.push(Outcome::Deleted);
        }
        Ok(outcomes)
    }

    /// RFC 7386 patches describing what `apply` would change, one per
    /// resource that is not already converged. Nothing is written.
    pub async fn dry_run(&self, token: &CancellationToken) -> Result<Vec<Json>> {
        let client = self.client()?;
        let mut out = Vec::new();
        for spec in &self.resources {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(live) = self.get(client, token, spec).await? else {
                out.push(spec.as_value().clone());
                continue;
            };
            let patch = self.engine.diff(spec, &live)?;
            if patch.is_empty() {
                continue;
            }
            let mut merged = live.clone();
            patch.merge(&mut merged);
            let mut base = live.into_value();
            if let Some(m) = base.as_object_mut() {
                doc::remove_key(m, "apiVersion");
                doc::remove_key(m, "kind");
            }
            doc::remove_path(&mut base, &["metadata", "name"]);
            out.push(two_way(&base, merged.as_value()));
        }
        Ok(out)
    }

    async fn get(&self, client: &dyn Client, token: &CancellationToken, spec: &Resource) -> Result<Option<Resource>> {
        if spec.name().is_empty() && !spec.generate_name().is_empty() {
            return Ok(None);
        }
        match race(token, client.get(spec)).await {
            Ok(live) => Ok(Some(live)),
            Err(Error::Client(e)) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn ok_to_delete(&self, live: &Resource) -> bool {
        match live.kind() {
            "Namespace" => live.annotation(&self.config.ownership_annotation) == Some(RESOURCE_CREATED),
            _ => true,
        }
    }
}

/// Await `fut` unless `token` fires first.
async fn race<T>(token: &CancellationToken, fut: impl Future<Output = std::result::Result<T, ClientError>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        res = fut => res.map_err(Error::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_source::BytesSource;
    use serde_json::json;

    fn cm(name: &str) -> Resource {
        Resource::from_value(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name}})).unwrap()
    }

    #[test]
    fn transform_is_atomic() {
        let m = Manifest::new(vec![cm("a"), cm("b")]);
        let fail_on_b = transform::transformer(|r| {
            r.set_label("touched", "yes");
            if r.name() == "b" { Err(anyhow::anyhow!("boom")) } else { Ok(()) }
        });
        let err = m.transform(&[fail_on_b]).unwrap_err();
        assert!(matches!(err, Error::Transform { .. }));
        assert!(m.resources().iter().all(|r| r.label("touched").is_none()));

        let ok = m.transform(&[transform::inject_labels(&[("x", "1")])]).unwrap();
        assert!(ok.resources().iter().all(|r| r.label("x") == Some("1")));
        assert!(m.resources().iter().all(|r| r.label("x").is_none()));
    }

    #[test]
    fn filter_append_find() {
        let m = Manifest::new(vec![cm("a"), cm("b")]);
        let only_b = m.filter(&[filter::by_name("b")]);
        assert_eq!(only_b.len(), 1);
        assert_eq!(m.len(), 2);
        let both = only_b.append(&[&m]);
        assert_eq!(both.resources().iter().map(|r| r.name().to_string()).collect::<Vec<_>>(), vec!["b", "a", "b"]);
        assert_eq!(m.find("v1", "ConfigMap", "a").map(|r| r.name().to_string()), Some("a".into()));
        assert!(m.find("v1", "Secret", "a").is_none());
        assert_eq!(m.filter(&[]).len(), 2);
    }

    #[test]
    fn resources_are_copies() {
        let m = Manifest::new(vec![cm("a")]);
        let mut rs = m.resources();
        rs[0].set_name("changed");
        assert_eq!(m.resources()[0].name(), "a");
    }

    #[test]
    fn from_source_parses() {
        let src = BytesSource::new("apiVersion: v1\nkind: ConfigMap\nmetadata: {name: a}\n---\napiVersion: v1\nkind: ConfigMap\nmetadata: {name: b}\n");
        let m = Manifest::from_source(&src).unwrap();
        assert_eq!(m.len(), 2);
    }

    #[tokio::test]
    async fn no_client_is_an_error() {
        let m = Manifest::new(vec![cm("a")]);
        let err = m.apply(&CancellationToken::new(), &ApplyOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::NoClient));
    }

    #[test]
    fn config_defaults() {
        let c = ManifestConfig::default();
        assert_eq!(c.last_applied_annotation, LAST_APPLIED_ANNOTATION);
        assert_eq!(c.ownership_annotation, "manifestival");
        assert!(!c.rfc7386);
        assert!(DeleteOptions::default().ignore_not_found);
        assert_eq!(ApplyOptions::default(), ApplyOptions { dry_run: false, field_manager: None, overwrite: false });
    }
}
