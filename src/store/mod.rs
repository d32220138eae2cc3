//! Access to the declarative resource store.
//!
//! Reconcilers never talk to the API server directly: every read and write goes
//! through [`ObjectStore`], which the production wiring backs with either a live
//! [`kube::Api`] or a watch cache, and which tests back with an in-memory map.

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::debug;

mod kubernetes;
pub use kubernetes::{CachedStore, KubeStore};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures reported by a resource store.
///
/// Not-found, conflict and already-exists are distinguished from generic
/// failures so callers can branch on them.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("Kube error: {0}")]
    Kube(#[source] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Unavailable(String),
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound(resp.message.clone()),
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Self::AlreadyExists(resp.message.clone())
            }
            kube::Error::Api(resp) if resp.code == 409 => Self::Conflict(resp.message.clone()),
            _ => Self::Kube(err),
        }
    }
}

impl StoreError {
    pub fn not_found(kind: &str, name: &str) -> Self {
        Self::NotFound(format!("{kind} \"{name}\" not found"))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

pub trait IgnoreNotFound<T> {
    /// Maps a not-found error to `Ok(None)`.
    fn ignore_not_found(self) -> StoreResult<Option<T>>;
}

impl<T> IgnoreNotFound<T> for StoreResult<T> {
    fn ignore_not_found(self) -> StoreResult<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Objects that can be kept in a store.
pub trait StoredObject:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static
{
}

impl<K> StoredObject for K where
    K: Resource<DynamicType = ()>
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static
{
}

/// Result of a delete call that did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deletion {
    /// The object is gone.
    Deleted,
    /// The object still exists, typically held by finalizers.
    Pending,
}

/// Store for one kind of object, addressed by name.
///
/// Namespaced kinds are bound to a namespace when the store is created.
/// `replace` and `replace_status` carry the object's resource version as a
/// precondition and fail with [`StoreError::Conflict`] when it is stale.
#[async_trait]
pub trait ObjectStore<K: StoredObject>: Send + Sync {
    async fn get(&self, name: &str) -> StoreResult<K>;

    async fn list(&self) -> StoreResult<Vec<K>>;

    /// Creates the object. An empty name with `generateName` set lets the
    /// store pick the name.
    async fn create(&self, obj: &K) -> StoreResult<K>;

    async fn replace(&self, obj: &K) -> StoreResult<K>;

    async fn replace_status(&self, obj: &K) -> StoreResult<K>;

    async fn delete(&self, name: &str) -> StoreResult<Deletion>;
}

/// Cached and live access to one kind.
///
/// Reads that may act on stale data use `cached`; read-modify-write cycles and
/// lookups guarding against duplicate creation use `live`.
pub struct Stores<K: StoredObject> {
    pub cached: Arc<dyn ObjectStore<K>>,
    pub live: Arc<dyn ObjectStore<K>>,
}

impl<K: StoredObject> Stores<K> {
    pub fn new(cached: Arc<dyn ObjectStore<K>>, live: Arc<dyn ObjectStore<K>>) -> Self {
        Self { cached, live }
    }

    /// Serves both roles from one store.
    pub fn uncached(store: Arc<dyn ObjectStore<K>>) -> Self {
        Self {
            cached: store.clone(),
            live: store,
        }
    }
}

impl<K: StoredObject> Clone for Stores<K> {
    fn clone(&self) -> Self {
        Self {
            cached: self.cached.clone(),
            live: self.live.clone(),
        }
    }
}

/// Retry schedule for optimistic concurrency conflicts.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub steps: u32,
    pub duration: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl Backoff {
    pub const DEFAULT: Backoff = Backoff {
        steps: 4,
        duration: Duration::from_millis(10),
        factor: 5.0,
        jitter: 0.1,
    };

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..self.jitter);
        delay.mul_f64(1.0 + extra)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Clone, Copy)]
enum Target {
    Object,
    Status,
}

/// Read-modify-write of an object, retried on conflict.
///
/// `converged(current, updated)` is evaluated after applying `mutate` to a copy
/// of the freshly read object. When it holds, nothing is written and the
/// current object is returned, so a concurrent writer that already reached the
/// desired state does not cause further conflicts.
pub async fn try_update<K, F, P>(
    store: &dyn ObjectStore<K>,
    name: &str,
    mutate: F,
    converged: P,
) -> StoreResult<K>
where
    K: StoredObject,
    F: Fn(&mut K),
    P: Fn(&K, &K) -> bool,
{
    update_with_backoff(store, name, Target::Object, &Backoff::DEFAULT, mutate, converged).await
}

/// Like [`try_update`], but writes the status subresource.
pub async fn try_update_status<K, F, P>(
    store: &dyn ObjectStore<K>,
    name: &str,
    mutate: F,
    converged: P,
) -> StoreResult<K>
where
    K: StoredObject,
    F: Fn(&mut K),
    P: Fn(&K, &K) -> bool,
{
    update_with_backoff(store, name, Target::Status, &Backoff::DEFAULT, mutate, converged).await
}

async fn update_with_backoff<K, F, P>(
    store: &dyn ObjectStore<K>,
    name: &str,
    target: Target,
    backoff: &Backoff,
    mutate: F,
    converged: P,
) -> StoreResult<K>
where
    K: StoredObject,
    F: Fn(&mut K),
    P: Fn(&K, &K) -> bool,
{
    let mut delay = backoff.duration;
    let mut step = 1;

    loop {
        let current = store.get(name).await?;
        let mut updated = current.clone();
        mutate(&mut updated);
        if converged(&current, &updated) {
            return Ok(current);
        }

        let result = match target {
            Target::Object => store.replace(&updated).await,
            Target::Status => store.replace_status(&updated).await,
        };

        match result {
            Err(err) if err.is_conflict() && step < backoff.steps => {
                debug!(name, step, "Conflict while updating, retrying");
                tokio::time::sleep(backoff.jittered(delay)).await;
                delay = delay.mul_f64(backoff.factor);
                step += 1;
            }
            result => return result,
        }
    }
}

pub fn has_finalizer(obj: &impl ResourceExt, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Adds `finalizer` to the named object unless it is already present.
pub async fn ensure_finalizer<K: StoredObject>(
    store: &dyn ObjectStore<K>,
    name: &str,
    finalizer: &str,
) -> StoreResult<K> {
    try_update(
        store,
        name,
        |obj| {
            if !has_finalizer(obj, finalizer) {
                obj.finalizers_mut().push(finalizer.to_string());
            }
        },
        |current, _| has_finalizer(current, finalizer),
    )
    .await
}

/// Removes `finalizer` from the named object. An object that is already gone
/// counts as success.
pub async fn remove_finalizer<K: StoredObject>(
    store: &dyn ObjectStore<K>,
    name: &str,
    finalizer: &str,
) -> StoreResult<()> {
    try_update(
        store,
        name,
        |obj| obj.finalizers_mut().retain(|f| f != finalizer),
        |current, _| !has_finalizer(current, finalizer),
    )
    .await
    .ignore_not_found()
    .map(|_| ())
}
