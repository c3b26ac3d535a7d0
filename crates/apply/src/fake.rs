//! In-memory `Client` for tests and dry runs without a server.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use keel_core::{doc, Resource, ResourceKey};
use serde_json::Value;

use crate::client::{ApplyOptions, Client, ClientError, DeleteOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Verb {
    Get,
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub verb: Verb,
    pub key: ResourceKey,
}

/// Stores objects by identity and stamps server-owned metadata on writes.
#[derive(Default)]
pub struct FakeClient {
    objects: Mutex<BTreeMap<ResourceKey, Value>>,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<Verb, Vec<ClientError>>>,
    next_rv: Mutex<u64>,
}

impl FakeClient {
    pub fn new() -> Self { Self::default() }

    /// Client pre-populated with `objects`, as if created out of band.
    pub fn with_objects(objects: impl IntoIterator<Item = Resource>) -> Self {
        let fake = Self::new();
        for obj in objects {
            fake.insert(obj);
        }
        fake
    }

    /// Store `obj` directly, without recording a call.
    pub fn insert(&self, obj: Resource) {
        let key = obj.key();
        let stamped = self.stamp(obj.into_value(), None);
        self.objects.lock().unwrap_or_else(|p| p.into_inner()).insert(key, stamped);
    }

    pub fn object(&self, key: &ResourceKey) -> Option<Resource> {
        let objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        objects.get(key).cloned().and_then(|v| Resource::from_value(v).ok())
    }

    pub fn len(&self) -> usize { self.objects.lock().unwrap_or_else(|p| p.into_inner()).len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn calls(&self) -> Vec<Call> { self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone() }

    pub fn count(&self, verb: Verb) -> usize {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).iter().filter(|c| c.verb == verb).count()
    }

    /// The next `verb` call fails with `err`. Queued failures fire in order.
    pub fn fail_next(&self, verb: Verb, err: ClientError) {
        self.failures.lock().unwrap_or_else(|p| p.into_inner()).entry(verb).or_default().push(err);
    }

    fn record(&self, verb: Verb, r: &Resource) -> Result<(), ClientError> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).push(Call { verb, key: r.key() });
        let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        match failures.get_mut(&verb) {
            Some(queue) if !queue.is_empty() => Err(queue.remove(0)),
            _ => Ok(()),
        }
    }

    fn stamp(&self, mut v: Value, prior: Option<&Value>) -> Value {
        let rv = {
            let mut next = self.next_rv.lock().unwrap_or_else(|p| p.into_inner());
            *next += 1;
            *next
        };
        let keep = |field: &str| prior.and_then(|p| doc::get_path(p, &["metadata", field])).cloned();
        let uid = keep("uid").unwrap_or_else(|| Value::String(uuid::Uuid::new_v4().to_string()));
        let created = keep("creationTimestamp").unwrap_or_else(|| Value::String(chrono::Utc::now().to_rfc3339()));
        if let Some(meta) = doc::ensure_map_path(&mut v, &["metadata"]) {
            meta.insert("uid".into(), uid);
            meta.insert("resourceVersion".into(), Value::String(rv.to_string()));
            meta.insert("creationTimestamp".into(), created);
        }
        v
    }
}

/// `prefix` plus a five character random suffix.
fn generated_name(prefix: &str) -> String {
    let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(5).collect();
    format!("{prefix}{suffix}")
}

#[async_trait::async_trait]
impl Client for FakeClient {
    async fn get(&self, spec: &Resource) -> Result<Resource, ClientError> {
        self.record(Verb::Get, spec)?;
        self.object(&spec.key()).ok_or_else(|| ClientError::NotFound(spec.key().to_string()))
    }

    async fn create(&self, obj: &Resource, opts: &ApplyOptions) -> Result<(), ClientError> {
        self.record(Verb::Create, obj)?;
        let mut objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        let mut obj = obj.clone();
        if obj.name().is_empty() && !obj.generate_name().is_empty() {
            loop {
                let name = generated_name(obj.generate_name());
                obj.set_name(&name);
                if !objects.contains_key(&obj.key()) { break; }
            }
        }
        let key = obj.key();
        if objects.contains_key(&key) {
            return Err(ClientError::Conflict(format!("{} already exists", key)));
        }
        if !opts.dry_run {
            let stamped = self.stamp(obj.into_value(), None);
            objects.insert(key, stamped);
        }
        Ok(())
    }

    async fn update(&self, obj: &Resource, opts: &ApplyOptions) -> Result<(), ClientError> {
        self.record(Verb::Update, obj)?;
        let key = obj.key();
        let mut objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        let Some(prior) = objects.get(&key) else {
            return Err(ClientError::NotFound(key.to_string()));
        };
        let sent_rv = doc::get_path(obj.as_value(), &["metadata", "resourceVersion"]);
        let live_rv = doc::get_path(prior, &["metadata", "resourceVersion"]);
        if sent_rv.is_some() && sent_rv != live_rv {
            return Err(ClientError::Conflict(format!("{} was modified", key)));
        }
        if !opts.dry_run {
            let stamped = self.stamp(obj.as_value().clone(), Some(prior));
            objects.insert(key, stamped);
        }
        Ok(())
    }

    async fn delete(&self, spec: &Resource, opts: &DeleteOptions) -> Result<(), ClientError> {
        self.record(Verb::Delete, spec)?;
        let key = spec.key();
        let mut objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        if !objects.contains_key(&key) {
            return Err(ClientError::NotFound(key.to_string()));
        }
        if !opts.dry_run {
            objects.remove(&key);
        }
        Ok(())
    }
}
