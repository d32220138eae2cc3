use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    runtime::reflector::{ObjectRef, Store},
    ResourceExt,
};
use serde_json::{json, Value};

use super::{Deletion, ObjectStore, StoreError, StoreResult, StoredObject};

/// Store backed by the API server.
#[derive(Clone)]
pub struct KubeStore<K> {
    api: Api<K>,
}

impl<K> KubeStore<K> {
    pub fn new(api: Api<K>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl<K: StoredObject> ObjectStore<K> for KubeStore<K> {
    async fn get(&self, name: &str) -> StoreResult<K> {
        Ok(self.api.get(name).await?)
    }

    async fn list(&self) -> StoreResult<Vec<K>> {
        Ok(self.api.list(&ListParams::default()).await?.items)
    }

    async fn create(&self, obj: &K) -> StoreResult<K> {
        Ok(self.api.create(&PostParams::default(), obj).await?)
    }

    async fn replace(&self, obj: &K) -> StoreResult<K> {
        Ok(self
            .api
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?)
    }

    async fn replace_status(&self, obj: &K) -> StoreResult<K> {
        // A merge patch carrying the resource version fails with 409 on a stale read.
        let status = serde_json::to_value(obj)?
            .get("status")
            .cloned()
            .unwrap_or(Value::Null);
        let patch = json!({
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": status,
        });

        Ok(self
            .api
            .patch_status(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn delete(&self, name: &str) -> StoreResult<Deletion> {
        let response = self.api.delete(name, &DeleteParams::default()).await?;
        // The object is returned while finalizers still hold it.
        Ok(if response.is_left() {
            Deletion::Pending
        } else {
            Deletion::Deleted
        })
    }
}

/// Store that serves reads from a watch cache and sends writes to the API
/// server.
///
/// Every read hands out an owned copy, so callers may mutate freely without
/// touching the shared cache.
#[derive(Clone)]
pub struct CachedStore<K: StoredObject> {
    reader: Store<K>,
    live: KubeStore<K>,
}

impl<K: StoredObject> CachedStore<K> {
    pub fn new(reader: Store<K>, api: Api<K>) -> Self {
        Self {
            reader,
            live: KubeStore::new(api),
        }
    }
}

#[async_trait]
impl<K: StoredObject> ObjectStore<K> for CachedStore<K> {
    async fn get(&self, name: &str) -> StoreResult<K> {
        self.reader
            .get(&ObjectRef::new(name))
            .map(|obj| obj.as_ref().clone())
            .ok_or_else(|| StoreError::not_found(&K::kind(&()), name))
    }

    async fn list(&self) -> StoreResult<Vec<K>> {
        Ok(self
            .reader
            .state()
            .into_iter()
            .map(|obj| obj.as_ref().clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> StoreResult<K> {
        self.live.create(obj).await
    }

    async fn replace(&self, obj: &K) -> StoreResult<K> {
        self.live.replace(obj).await
    }

    async fn replace_status(&self, obj: &K) -> StoreResult<K> {
        self.live.replace_status(obj).await
    }

    async fn delete(&self, name: &str) -> StoreResult<Deletion> {
        self.live.delete(name).await
    }
}
