use std::{sync::Arc, time::Duration};

use chrono::Utc;
use kube::runtime::events::{Event, EventType};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::api::{
    backup_bucket::BackupBucket,
    deployment_binding::DeploymentBinding,
    fleet_member::{FleetMember, TAINT_INVISIBLE, TAINT_PROTECTED},
    registration::Registration,
};
use crate::controller::Diagnostics;
use crate::member::MemberClientFactory;
use crate::recorder::EventRecorder;
use crate::runtime::WorkQueue;
use crate::store::{ObjectStore, Stores};

use super::{helm::ChartRenderer, BackupWaitError, BackupWaitResult};

/// Held on members and registrations while bindings may still need them.
pub static REGISTRATION_FINALIZER: &str = "core.fleet.dev/registration";
/// Held on bindings until their artifacts are removed from the member.
pub static BINDING_FINALIZER: &str = "core.fleet.dev/deployment-binding";
/// Deployer class set on managed artifacts.
pub static MANAGED_RESOURCE_CLASS: &str = "seed";

pub static ROLE_LABEL: &str = "fleet.dev/role";
pub static ROLE_EXTENSION: &str = "extension";
pub static REGISTRATION_LABEL: &str = "fleet.dev/registration";

const HASH_LENGTH: usize = 16;

/// Settings the reconcilers read at runtime.
#[derive(Clone, Debug)]
pub struct ReconcileConfig {
    pub fleet_identity: String,
    pub artifact_namespace: String,
    pub member_resync: Duration,
    pub backup_poll_interval: Duration,
    pub backup_timeout: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            fleet_identity: String::new(),
            artifact_namespace: "fleet-system".to_string(),
            member_resync: Duration::from_secs(30),
            backup_poll_interval: Duration::from_secs(5),
            backup_timeout: Duration::from_secs(30),
        }
    }
}

// Context for the reconcilers
#[derive(Clone)]
pub struct Context {
    pub members: Stores<FleetMember>,
    pub registrations: Stores<Registration>,
    pub bindings: Stores<DeploymentBinding>,
    pub backup_buckets: Arc<dyn ObjectStore<BackupBucket>>,
    /// Sessions against member clusters
    pub member_clients: Arc<dyn MemberClientFactory>,
    pub renderer: Arc<dyn ChartRenderer>,
    pub recorder: Arc<dyn EventRecorder>,
    /// Registration keys, fed by member reconciliation
    pub registration_queue: WorkQueue,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    pub config: ReconcileConfig,
}

impl Context {
    pub(crate) async fn touch(&self) {
        self.diagnostics.write().await.last_event = Utc::now();
    }

    pub(crate) async fn publish<K: Resource<DynamicType = ()>>(
        &self,
        obj: &K,
        reason: &str,
        action: &str,
        note: String,
    ) {
        self.recorder
            .publish(
                Event {
                    type_: EventType::Normal,
                    reason: reason.into(),
                    note: Some(note),
                    action: action.into(),
                    secondary: None,
                },
                obj.object_ref(&()),
            )
            .await;
    }
}

fn canonical(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, canonical(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonical).collect()),
        other => other,
    }
}

/// Content hash of a spec.
///
/// The value is serialized to compact JSON with object keys sorted at every
/// level, hashed with SHA-256 and the first 16 hex characters are kept.
pub fn spec_hash<T: Serialize>(spec: &T) -> serde_json::Result<String> {
    let value = canonical(serde_json::to_value(spec)?);
    let digest = Sha256::digest(serde_json::to_vec(&value)?);
    let mut hash = hex::encode(digest);
    hash.truncate(HASH_LENGTH);
    Ok(hash)
}

/// Waits until the backup bucket of `member` is gone.
///
/// The bucket is polled every `backup_poll_interval`. After `backup_timeout`
/// the wait fails with the last error the bucket reported, if any.
pub async fn wait_until_backup_bucket_deleted(
    ctx: &Context,
    member: &FleetMember,
) -> BackupWaitResult<()> {
    let name = member.backup_bucket_name();
    let mut last_error: Option<String> = None;

    let poll = async {
        loop {
            match ctx.backup_buckets.get(&name).await {
                Err(err) if err.is_not_found() => return Ok(()),
                Err(err) => return Err(BackupWaitError::Lookup(err)),
                Ok(bucket) => {
                    if let Some(description) = bucket.last_error() {
                        error!(bucket = %name, "Backup bucket did not get deleted yet, last error is: {description}");
                        last_error = Some(description.to_string());
                    }
                    info!(bucket = %name, "Waiting for backup bucket to be deleted");
                }
            }
            tokio::time::sleep(ctx.config.backup_poll_interval).await;
        }
    };

    let outcome = tokio::time::timeout(ctx.config.backup_timeout, poll).await;
    match outcome {
        Ok(result) => result,
        Err(_) => Err(BackupWaitError::Timeout {
            name,
            timeout: ctx.config.backup_timeout,
            message: last_error.unwrap_or_else(|| "backup bucket is still present".to_string()),
        }),
    }
}

/// Standard values every rendered chart receives.
pub fn member_values(fleet_identity: &str, member: &FleetMember) -> Value {
    let volume_providers = member
        .spec
        .volume
        .as_ref()
        .map(|volume| volume.providers.clone())
        .unwrap_or_default();
    let volume_provider = volume_providers
        .first()
        .map(|provider| provider.name.clone())
        .unwrap_or_default();

    json!({
        "fleet": {
            "identity": fleet_identity,
            "member": {
                "identity": member.name_any(),
                "provider": member.spec.provider.type_,
                "region": member.spec.provider.region,
                "ingressDomain": member.spec.dns.ingress_domain,
                "blockCIDRs": member.spec.block_cidrs,
                "volumeProvider": volume_provider,
                "volumeProviders": volume_providers,
                "protected": member.has_taint(TAINT_PROTECTED),
                "visible": !member.has_taint(TAINT_INVISIBLE),
                "taints": member.spec.taints,
                "networks": member.spec.networks,
            }
        }
    })
}

/// Deep merge of `overlay` into `base`. Nested objects are merged key by key,
/// any other value in `overlay` replaces the one in `base`.
pub fn merge_values(base: Map<String, Value>, overlay: Value) -> Value {
    let mut merged = Value::Object(base);
    merge_into(&mut merged, overlay);
    merged
}

fn merge_into(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::backup_bucket::{BackupBucketSpec, BackupBucketStatus, LastError};
    use crate::api::fleet_member::{MemberTaint, MemberVolume, VolumeProvider};
    use crate::fixtures::{sample_member, Fixture};

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        let member = sample_member("m1");
        let first = spec_hash(&member.spec).unwrap();
        assert_eq!(first.len(), 16);
        assert_eq!(first, spec_hash(&member.spec.clone()).unwrap());

        let mut changed = member.spec.clone();
        changed.provider.region = "eu-west-2".into();
        assert_ne!(first, spec_hash(&changed).unwrap());
    }

    #[test]
    fn hash_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": true, "x": [1, 2]}});
        let b = json!({"a": {"x": [1, 2], "y": true}, "b": 1});
        assert_eq!(spec_hash(&a).unwrap(), spec_hash(&b).unwrap());
    }

    #[test]
    fn injected_values_describe_member() {
        let mut member = sample_member("m1");
        member.spec.taints = Some(vec![MemberTaint {
            key: TAINT_INVISIBLE.into(),
            value: None,
        }]);
        member.spec.volume = Some(MemberVolume {
            providers: vec![
                VolumeProvider {
                    purpose: "etcd-main".into(),
                    name: "fast".into(),
                },
                VolumeProvider {
                    purpose: "default".into(),
                    name: "standard".into(),
                },
            ],
        });

        let values = member_values("fleet-uid", &member);
        let m = &values["fleet"]["member"];
        assert_eq!(values["fleet"]["identity"], "fleet-uid");
        assert_eq!(m["identity"], "m1");
        assert_eq!(m["provider"], "aws");
        assert_eq!(m["volumeProvider"], "fast");
        assert_eq!(m["volumeProviders"].as_array().unwrap().len(), 2);
        assert_eq!(m["protected"], false);
        assert_eq!(m["visible"], false);
        assert_eq!(m["networks"]["pods"], "100.96.0.0/11");
    }

    #[test]
    fn injected_values_win_on_conflicts() {
        let authored = json!({
            "replicas": 2,
            "fleet": {"identity": "spoofed", "extra": "kept"}
        });
        let Value::Object(authored) = authored else {
            unreachable!()
        };

        let merged = merge_values(authored, json!({"fleet": {"identity": "real"}}));
        assert_eq!(merged["replicas"], 2);
        assert_eq!(merged["fleet"]["identity"], "real");
        assert_eq!(merged["fleet"]["extra"], "kept");
    }

    fn bucket(name: &str, last_error: Option<&str>) -> BackupBucket {
        let mut bucket = BackupBucket::new(
            name,
            BackupBucketSpec {
                provider: "aws".into(),
                member_name: None,
            },
        );
        bucket.status = Some(BackupBucketStatus {
            last_error: last_error.map(|description| LastError {
                description: description.into(),
            }),
        });
        bucket
    }

    #[tokio::test]
    async fn backup_wait_returns_when_bucket_is_gone() {
        let fixture = Fixture::default();
        let ctx = fixture.context();
        let mut member = sample_member("m1");
        member.metadata.uid = Some("uid-m1".into());

        wait_until_backup_bucket_deleted(&ctx, &member).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn backup_wait_times_out_with_last_error() {
        let fixture = Fixture::default();
        let ctx = fixture.context();
        let mut member = sample_member("m1");
        member.metadata.uid = Some("uid-m1".into());
        fixture
            .backup_buckets
            .insert(bucket("uid-m1", Some("bucket is not empty")));

        let err = wait_until_backup_bucket_deleted(&ctx, &member)
            .await
            .unwrap_err();
        match err {
            BackupWaitError::Timeout { name, message, .. } => {
                assert_eq!(name, "uid-m1");
                assert_eq!(message, "bucket is not empty");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backup_wait_follows_deletion() {
        let fixture = Fixture::default();
        let ctx = fixture.context();
        let mut member = sample_member("m1");
        member.metadata.uid = Some("uid-m1".into());
        fixture.backup_buckets.insert(bucket("uid-m1", None));

        let buckets = fixture.backup_buckets.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            buckets.remove("uid-m1");
        });

        wait_until_backup_bucket_deleted(&ctx, &member).await.unwrap();
    }
}
