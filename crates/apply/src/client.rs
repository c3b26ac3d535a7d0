//! The store contract the orchestration drives.

use keel_core::Resource;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not_found: {0}")]
    NotFound(String),
    /// Structurally invalid update (immutable field, type conflict).
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound(_)) }

    pub fn is_invalid(&self) -> bool { matches!(self, Self::Invalid(_)) }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Ask the store to validate without persisting.
    pub dry_run: bool,
    pub field_manager: Option<String>,
    /// On an invalid update, overlay the desired document onto live and retry once.
    pub overwrite: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Preconditions {
    pub resource_version: Option<String>,
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PropagationPolicy {
    Orphan,
    Background,
    Foreground,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteOptions {
    pub dry_run: bool,
    pub grace_period_seconds: Option<u32>,
    pub preconditions: Option<Preconditions>,
    pub propagation_policy: Option<PropagationPolicy>,
    /// Treat a not-found answer from delete as success.
    pub ignore_not_found: bool,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self { dry_run: false, grace_period_seconds: None, preconditions: None, propagation_policy: None, ignore_not_found: true }
    }
}

/// CRUD access to the backing store. Lookups go by the resource's identity.
#[async_trait::async_trait]
pub trait Client: Send + Sync {
    async fn get(&self, spec: &Resource) -> Result<Resource, ClientError>;
    async fn create(&self, obj: &Resource, opts: &ApplyOptions) -> Result<(), ClientError>;
    async fn update(&self, obj: &Resource, opts: &ApplyOptions) -> Result<(), ClientError>;
    async fn delete(&self, spec: &Resource, opts: &DeleteOptions) -> Result<(), ClientError>;
}
