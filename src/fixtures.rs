//! In-memory stand-ins for the stores, member clusters and side channels the
//! reconcilers talk to.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use base64::prelude::*;
use chrono::Utc;
use k8s_openapi::{api::core::v1::ObjectReference, apimachinery::pkg::apis::meta::v1::Time};
use kube::{runtime::events::Event, ResourceExt};
use serde_json::{json, Value};

use crate::api::{
    backup_bucket::BackupBucket,
    deployment_binding::{DeployedResource, DeploymentBinding},
    extension::Extension,
    fleet_member::{FleetMember, FleetMemberSpec, MemberDns, MemberNetworks, MemberProvider},
    registration::{ControllerResource, DeploymentDescriptor, Registration, RegistrationSpec},
};
use crate::controllers::controller::{Context, ReconcileConfig};
use crate::controllers::helm::{ChartRenderer, RenderResult, RenderedChart};
use crate::member::{ArtifactDeployer, MemberClient, MemberClientFactory};
use crate::recorder::EventRecorder;
use crate::runtime::WorkQueue;
use crate::store::{Deletion, ObjectStore, StoreError, StoreResult, Stores, StoredObject};

#[derive(Default)]
struct Counters {
    writes: usize,
    creates: usize,
    pending_conflicts: usize,
    generated: usize,
    version: u64,
}

/// Object store backed by a map, enforcing resource versions the way the API
/// server does.
pub struct MemoryStore<K> {
    objects: Mutex<BTreeMap<String, K>>,
    counters: Mutex<Counters>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            counters: Mutex::new(Counters::default()),
        }
    }
}

fn kind_of<K: StoredObject>() -> String {
    K::kind(&()).to_string()
}

/// Copies the `status` of `from` onto `target`.
fn with_status_of<K: StoredObject>(target: &K, from: &K) -> StoreResult<K> {
    let mut value = serde_json::to_value(target)?;
    let status = serde_json::to_value(from)?.get("status").cloned();
    if let Value::Object(map) = &mut value {
        match status {
            Some(status) => map.insert("status".to_string(), status),
            None => map.remove("status"),
        };
    }
    Ok(serde_json::from_value(value)?)
}

impl<K: StoredObject> MemoryStore<K> {
    fn next_version(&self) -> String {
        let mut counters = self.counters.lock().unwrap();
        counters.version += 1;
        counters.version.to_string()
    }

    fn record_write(&self, created: bool) {
        let mut counters = self.counters.lock().unwrap();
        counters.writes += 1;
        if created {
            counters.creates += 1;
        }
    }

    fn take_conflict(&self) -> bool {
        let mut counters = self.counters.lock().unwrap();
        if counters.pending_conflicts > 0 {
            counters.pending_conflicts -= 1;
            true
        } else {
            false
        }
    }

    /// Seeds an object without counting it as a write.
    pub fn insert(&self, mut obj: K) -> K {
        let name = obj.name_any();
        obj.meta_mut().resource_version = Some(self.next_version());
        obj.meta_mut()
            .uid
            .get_or_insert_with(|| format!("uid-{name}"));
        self.objects.lock().unwrap().insert(name, obj.clone());
        obj
    }

    /// Overwrites an object as is, status included, without counting a write.
    pub fn put(&self, obj: K) -> K {
        self.insert(obj)
    }

    pub fn find(&self, name: &str) -> Option<K> {
        self.objects.lock().unwrap().get(name).cloned()
    }

    pub fn objects(&self) -> Vec<K> {
        self.objects.lock().unwrap().values().cloned().collect()
    }

    pub fn remove(&self, name: &str) -> Option<K> {
        self.objects.lock().unwrap().remove(name)
    }

    pub fn writes(&self) -> usize {
        self.counters.lock().unwrap().writes
    }

    pub fn creates(&self) -> usize {
        self.counters.lock().unwrap().creates
    }

    /// Fails the next `n` updates with a conflict.
    pub fn conflict_next_writes(&self, n: usize) {
        self.counters.lock().unwrap().pending_conflicts = n;
    }

    fn current(&self, obj: &K) -> StoreResult<K> {
        let name = obj.name_any();
        let current = self
            .find(&name)
            .ok_or_else(|| StoreError::not_found(&kind_of::<K>(), &name))?;
        if self.take_conflict() {
            return Err(StoreError::Conflict(format!("{name} was modified")));
        }
        match obj.resource_version() {
            Some(version) if Some(&version) != current.meta().resource_version.as_ref() => Err(
                StoreError::Conflict(format!("{name} has a newer resource version")),
            ),
            _ => Ok(current),
        }
    }

    fn store(&self, mut obj: K) -> K {
        let name = obj.name_any();
        let deleting = obj.meta().deletion_timestamp.is_some();
        obj.meta_mut().resource_version = Some(self.next_version());

        let mut objects = self.objects.lock().unwrap();
        if deleting && obj.finalizers().is_empty() {
            objects.remove(&name);
        } else {
            objects.insert(name, obj.clone());
        }
        obj
    }
}

#[async_trait]
impl<K: StoredObject> ObjectStore<K> for MemoryStore<K> {
    async fn get(&self, name: &str) -> StoreResult<K> {
        self.find(name)
            .ok_or_else(|| StoreError::not_found(&kind_of::<K>(), name))
    }

    async fn list(&self) -> StoreResult<Vec<K>> {
        Ok(self.objects())
    }

    async fn create(&self, obj: &K) -> StoreResult<K> {
        let mut obj = obj.clone();
        if obj.meta().name.as_deref().unwrap_or_default().is_empty() {
            let prefix = obj.meta().generate_name.clone().unwrap_or_default();
            let mut counters = self.counters.lock().unwrap();
            counters.generated += 1;
            obj.meta_mut().name = Some(format!("{prefix}{:05}", counters.generated));
        }

        let name = obj.name_any();
        if self.find(&name).is_some() {
            return Err(StoreError::AlreadyExists(name));
        }
        obj.meta_mut().uid = Some(format!("uid-{name}"));
        obj.meta_mut().creation_timestamp = Some(Time(Utc::now()));
        let created = self.store(obj);
        self.record_write(true);
        Ok(created)
    }

    async fn replace(&self, obj: &K) -> StoreResult<K> {
        let current = self.current(obj)?;
        let mut updated = with_status_of(obj, &current)?;
        updated.meta_mut().deletion_timestamp = current.meta().deletion_timestamp.clone();
        updated.meta_mut().uid = current.meta().uid.clone();
        let stored = self.store(updated);
        self.record_write(false);
        Ok(stored)
    }

    async fn replace_status(&self, obj: &K) -> StoreResult<K> {
        let current = self.current(obj)?;
        let updated = with_status_of(&current, obj)?;
        let stored = self.store(updated);
        self.record_write(false);
        Ok(stored)
    }

    async fn delete(&self, name: &str) -> StoreResult<Deletion> {
        let mut current = self
            .find(name)
            .ok_or_else(|| StoreError::not_found(&kind_of::<K>(), name))?;

        if current.finalizers().is_empty() {
            self.remove(name);
            self.record_write(false);
            return Ok(Deletion::Deleted);
        }

        if current.meta().deletion_timestamp.is_none() {
            current.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
            self.store(current);
            self.record_write(false);
        }
        Ok(Deletion::Pending)
    }
}

/// What a fake member cluster currently holds.
#[derive(Default)]
pub struct MemberState {
    /// Namespace name to labels
    pub namespaces: BTreeMap<String, BTreeMap<String, String>>,
    pub secrets: BTreeMap<(String, String), BTreeMap<String, Vec<u8>>>,
    /// (namespace, name) to (secret name, class)
    pub managed: BTreeMap<(String, String), (String, String)>,
    pub extensions: Vec<Extension>,
    pub objects: BTreeSet<DeployedResource>,
    pending_managed_deletes: u32,
}

#[derive(Default)]
pub struct FakeMemberCluster {
    state: Mutex<MemberState>,
}

impl FakeMemberCluster {
    pub fn state(&self) -> MutexGuard<'_, MemberState> {
        self.state.lock().unwrap()
    }

    pub fn add_extension(&self, extension: Extension) {
        self.state().extensions.push(extension);
    }

    pub fn add_object(&self, resource: DeployedResource) {
        self.state().objects.insert(resource);
    }

    /// Keeps the next `n` managed artifact deletions pending.
    pub fn hold_managed_deletes(&self, n: u32) {
        self.state().pending_managed_deletes = n;
    }
}

fn removed<T>(found: Option<T>, kind: &str, name: &str) -> StoreResult<Deletion> {
    found
        .map(|_| Deletion::Deleted)
        .ok_or_else(|| StoreError::not_found(kind, name))
}

#[async_trait]
impl ArtifactDeployer for FakeMemberCluster {
    async fn put_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> StoreResult<()> {
        self.state()
            .secrets
            .insert((namespace.to_string(), name.to_string()), data);
        Ok(())
    }

    async fn declare_managed_artifact(
        &self,
        namespace: &str,
        name: &str,
        secret_name: &str,
        class: &str,
    ) -> StoreResult<()> {
        self.state().managed.insert(
            (namespace.to_string(), name.to_string()),
            (secret_name.to_string(), class.to_string()),
        );
        Ok(())
    }

    async fn delete_managed_artifact(&self, namespace: &str, name: &str) -> StoreResult<Deletion> {
        let mut state = self.state();
        let key = (namespace.to_string(), name.to_string());
        if state.managed.contains_key(&key) && state.pending_managed_deletes > 0 {
            state.pending_managed_deletes -= 1;
            return Ok(Deletion::Pending);
        }
        removed(state.managed.remove(&key), "ManagedResource", name)
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> StoreResult<Deletion> {
        let key = (namespace.to_string(), name.to_string());
        removed(self.state().secrets.remove(&key), "Secret", name)
    }
}

#[async_trait]
impl MemberClient for FakeMemberCluster {
    async fn apply_namespace(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> StoreResult<()> {
        self.state()
            .namespaces
            .entry(name.to_string())
            .or_default()
            .extend(labels);
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> StoreResult<Deletion> {
        removed(self.state().namespaces.remove(name), "Namespace", name)
    }

    async fn list_extensions(&self) -> StoreResult<Vec<Extension>> {
        Ok(self.state().extensions.clone())
    }

    async fn delete_extension(&self, namespace: &str, name: &str) -> StoreResult<Deletion> {
        let mut state = self.state();
        let position = state
            .extensions
            .iter()
            .position(|e| e.namespace().as_deref() == Some(namespace) && e.name_any() == name);
        removed(
            position.map(|i| state.extensions.remove(i)),
            "Extension",
            name,
        )
    }

    /// Objects are reported pending on the first delete, as if held by a
    /// finalizer, and gone afterwards.
    async fn delete_object(&self, resource: &DeployedResource) -> StoreResult<Deletion> {
        if self.state().objects.remove(resource) {
            Ok(Deletion::Pending)
        } else {
            Err(StoreError::not_found(&resource.kind, &resource.name))
        }
    }
}

/// Hands out fake clusters for the members added to it.
#[derive(Default)]
pub struct FakeMemberFactory {
    clusters: Mutex<BTreeMap<String, Arc<FakeMemberCluster>>>,
}

impl FakeMemberFactory {
    pub fn add(&self, member: &str) -> Arc<FakeMemberCluster> {
        self.clusters
            .lock()
            .unwrap()
            .entry(member.to_string())
            .or_default()
            .clone()
    }

    pub fn cluster(&self, member: &str) -> Arc<FakeMemberCluster> {
        self.clusters
            .lock()
            .unwrap()
            .get(member)
            .cloned()
            .unwrap_or_else(|| panic!("no fake cluster for member {member}"))
    }
}

#[async_trait]
impl MemberClientFactory for FakeMemberFactory {
    async fn client_for(&self, member: &FleetMember) -> StoreResult<Arc<dyn MemberClient>> {
        let name = member.name_any();
        let cluster = self
            .clusters
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .ok_or_else(|| StoreError::not_found("kubeconfig", &name))?;
        Ok(cluster)
    }
}

/// Renders every chart to a single deployment manifest.
#[derive(Default)]
pub struct StaticRenderer {
    renders: Mutex<Vec<(String, String, Value)>>,
}

impl StaticRenderer {
    /// Release, namespace and values of each render call.
    pub fn renders(&self) -> Vec<(String, String, Value)> {
        self.renders.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChartRenderer for StaticRenderer {
    async fn render(
        &self,
        _chart: &[u8],
        release: &str,
        namespace: &str,
        values: &Value,
    ) -> RenderResult<RenderedChart> {
        self.renders.lock().unwrap().push((
            release.to_string(),
            namespace.to_string(),
            values.clone(),
        ));
        Ok(RenderedChart {
            files: BTreeMap::from([(
                "dns/templates/deployment.yaml".to_string(),
                "kind: Deployment".to_string(),
            )]),
        })
    }
}

#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<Event>>,
}

impl RecordingEvents {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.reason.clone())
            .collect()
    }
}

#[async_trait]
impl EventRecorder for RecordingEvents {
    async fn publish(&self, event: Event, _reference: ObjectReference) {
        self.events.lock().unwrap().push(event);
    }
}

/// Everything a reconciler needs, backed by memory.
#[derive(Default)]
pub struct Fixture {
    pub members: Arc<MemoryStore<FleetMember>>,
    pub registrations: Arc<MemoryStore<Registration>>,
    pub bindings: Arc<MemoryStore<DeploymentBinding>>,
    pub backup_buckets: Arc<MemoryStore<BackupBucket>>,
    pub member_clients: Arc<FakeMemberFactory>,
    pub renderer: Arc<StaticRenderer>,
    pub events: Arc<RecordingEvents>,
    pub registration_queue: WorkQueue,
}

impl Fixture {
    pub fn context(&self) -> Arc<Context> {
        Arc::new(Context {
            members: Stores::uncached(self.members.clone()),
            registrations: Stores::uncached(self.registrations.clone()),
            bindings: Stores::uncached(self.bindings.clone()),
            backup_buckets: self.backup_buckets.clone(),
            member_clients: self.member_clients.clone(),
            renderer: self.renderer.clone(),
            recorder: self.events.clone(),
            registration_queue: self.registration_queue.clone(),
            diagnostics: Default::default(),
            config: ReconcileConfig {
                fleet_identity: "fleet-test".to_string(),
                ..Default::default()
            },
        })
    }

    /// Writes across members, registrations and bindings.
    pub fn writes(&self) -> usize {
        self.members.writes() + self.registrations.writes() + self.bindings.writes()
    }
}

pub fn sample_member(name: &str) -> FleetMember {
    FleetMember::new(
        name,
        FleetMemberSpec {
            provider: MemberProvider {
                type_: "aws".to_string(),
                region: "eu-west-1".to_string(),
            },
            dns: MemberDns {
                ingress_domain: format!("ingress.{name}.example.com"),
            },
            networks: MemberNetworks {
                nodes: None,
                pods: "100.96.0.0/11".to_string(),
                services: "100.64.0.0/13".to_string(),
            },
            ..Default::default()
        },
    )
}

/// A helm registration serving `types` as extension types.
pub fn helm_registration(name: &str, types: &[&str]) -> Registration {
    let resources = types
        .iter()
        .map(|type_| ControllerResource {
            kind: "Extension".to_string(),
            type_: type_.to_string(),
            global_enabled: None,
        })
        .collect();

    Registration::new(
        name,
        RegistrationSpec {
            resources: Some(resources),
            deployment: Some(DeploymentDescriptor {
                type_: "helm".to_string(),
                provider_config: Some(json!({
                    "chart": BASE64_STANDARD.encode(b"chart-archive"),
                    "values": {"replicas": 1},
                })),
            }),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let store = MemoryStore::default();
        let stale = store.insert(sample_member("m1"));
        let members: &dyn ObjectStore<FleetMember> = &store;

        members.replace(&stale).await.unwrap();
        let err = members.replace(&stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn generated_names_use_prefix() {
        let store: MemoryStore<FleetMember> = MemoryStore::default();
        let mut member = sample_member("");
        member.metadata.name = None;
        member.metadata.generate_name = Some("m-".to_string());

        let created = store.create(&member).await.unwrap();
        assert!(created.name_any().starts_with("m-"));
        assert_eq!(store.creates(), 1);
    }
}
