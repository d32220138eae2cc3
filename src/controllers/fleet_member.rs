use std::sync::Arc;

use kube::ResourceExt;
use tracing::{debug, info, instrument};

use crate::api::fleet_member::FleetMember;
use crate::runtime::Action;
use crate::store::{ensure_finalizer, has_finalizer, remove_finalizer, IgnoreNotFound};
use crate::telemetry;

use super::controller::{wait_until_backup_bucket_deleted, Context, REGISTRATION_FINALIZER};
use super::{MemberSyncError, MemberSyncResult};

/// Reconciles one fleet member.
///
/// Every pass requeues all registrations, since a member's liveness affects
/// the binding set of each of them. A live member gets the registration
/// finalizer and is resynced periodically. A deleting member is released only
/// after its backup bucket is gone and no deployment binding references it.
#[instrument(skip_all, fields(trace_id = display(telemetry::get_trace_id()), name = %name), err)]
pub async fn reconcile(name: String, ctx: Arc<Context>) -> MemberSyncResult<Action> {
    ctx.touch().await;

    let Some(member) = ctx
        .members
        .cached
        .get(&name)
        .await
        .ignore_not_found()
        .map_err(MemberSyncError::Lookup)?
    else {
        debug!("Fleet member is gone");
        return Ok(Action::await_change());
    };

    enqueue_registrations(&ctx).await?;

    if !member.is_deleting() {
        ensure_finalizer(ctx.members.live.as_ref(), &name, REGISTRATION_FINALIZER)
            .await
            .map_err(MemberSyncError::Finalizer)?;
        return Ok(Action::requeue(ctx.config.member_resync));
    }

    if !has_finalizer(&member, REGISTRATION_FINALIZER) {
        return Ok(Action::await_change());
    }

    release(&member, &ctx).await?;
    Ok(Action::await_change())
}

async fn enqueue_registrations(ctx: &Context) -> MemberSyncResult<()> {
    let registrations = ctx
        .registrations
        .cached
        .list()
        .await
        .map_err(MemberSyncError::ListRegistrations)?;

    for registration in &registrations {
        ctx.registration_queue.add(&registration.name_any());
    }
    Ok(())
}

async fn release(member: &FleetMember, ctx: &Context) -> MemberSyncResult<()> {
    let name = member.name_any();

    if member.spec.backup.is_some() {
        wait_until_backup_bucket_deleted(ctx, member).await?;
    }

    let referencing = ctx
        .bindings
        .live
        .list()
        .await
        .map_err(MemberSyncError::ListBindings)?
        .into_iter()
        .filter(|binding| binding.spec.member_ref.name == name)
        .count();

    if referencing > 0 {
        ctx.publish(
            member,
            "ResourceReferenced",
            "Release",
            format!("Cannot remove finalizer of FleetMember {name:?} because {referencing} DeploymentBinding(s) still reference it"),
        )
        .await;
        return Err(MemberSyncError::StillReferenced(name));
    }

    remove_finalizer(ctx.members.live.as_ref(), &name, REGISTRATION_FINALIZER)
        .await
        .map_err(MemberSyncError::Finalizer)?;
    info!("Released fleet member");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::*;
    use crate::api::deployment_binding::{DeploymentBinding, DeploymentBindingSpec, ObjectRef};
    use crate::api::fleet_member::{MemberBackup, SecretRef};
    use crate::fixtures::{helm_registration, sample_member, Fixture};

    fn deleting_member(name: &str) -> FleetMember {
        let mut member = sample_member(name);
        member.metadata.finalizers = Some(vec![REGISTRATION_FINALIZER.to_string()]);
        member.metadata.deletion_timestamp = Some(Time(Utc::now()));
        member
    }

    fn binding_for(member: &str) -> DeploymentBinding {
        DeploymentBinding::new(
            &format!("dns-{member}"),
            DeploymentBindingSpec {
                registration_ref: ObjectRef {
                    name: "dns".into(),
                    resource_version: None,
                },
                member_ref: ObjectRef {
                    name: member.into(),
                    resource_version: None,
                },
            },
        )
    }

    #[tokio::test]
    async fn live_member_gets_finalizer_and_resync() {
        let fixture = Fixture::default();
        fixture.members.insert(sample_member("m1"));
        fixture.registrations.insert(helm_registration("dns", &["dns"]));
        fixture.registrations.insert(helm_registration("backup", &[]));

        let action = reconcile("m1".into(), fixture.context()).await.unwrap();

        assert_eq!(action.requeue_after(), Some(Duration::from_secs(30)));
        let member = fixture.members.find("m1").unwrap();
        assert!(has_finalizer(&member, REGISTRATION_FINALIZER));
        assert_eq!(fixture.registration_queue.len(), 2);
    }

    #[tokio::test]
    async fn missing_member_is_skipped() {
        let fixture = Fixture::default();
        let action = reconcile("gone".into(), fixture.context()).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn referenced_member_is_not_released() {
        let fixture = Fixture::default();
        fixture.members.insert(deleting_member("m1"));
        fixture.bindings.insert(binding_for("m1"));
        fixture.bindings.insert(binding_for("m2"));

        let err = reconcile("m1".into(), fixture.context()).await.unwrap_err();

        assert!(matches!(err, MemberSyncError::StillReferenced(ref name) if name == "m1"));
        let member = fixture.members.find("m1").unwrap();
        assert!(has_finalizer(&member, REGISTRATION_FINALIZER));
        assert_eq!(fixture.events.reasons(), vec!["ResourceReferenced"]);
    }

    #[tokio::test]
    async fn unreferenced_member_is_released() {
        let fixture = Fixture::default();
        fixture.members.insert(deleting_member("m1"));
        fixture.bindings.insert(binding_for("m2"));

        reconcile("m1".into(), fixture.context()).await.unwrap();

        assert!(fixture.members.find("m1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn release_waits_for_backup_bucket() {
        let fixture = Fixture::default();
        let mut member = deleting_member("m1");
        member.spec.backup = Some(MemberBackup {
            provider: "aws".into(),
            region: None,
            secret_ref: SecretRef {
                name: "backup".into(),
                namespace: "garden".into(),
            },
        });
        let member = fixture.members.insert(member);
        fixture.backup_buckets.insert(crate::api::backup_bucket::BackupBucket::new(
            &member.backup_bucket_name(),
            Default::default(),
        ));

        let err = reconcile("m1".into(), fixture.context()).await.unwrap_err();

        assert!(matches!(err, MemberSyncError::Backup(_)));
        assert!(fixture.members.find("m1").is_some());
    }
}
