use std::{collections::BTreeMap, sync::Arc};

use futures::future::join_all;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use crate::api::deployment_binding::{
    DeploymentBinding, DeploymentBindingSpec, ObjectRef, MEMBER_SPEC_HASH_LABEL,
    REGISTRATION_SPEC_HASH_LABEL,
};
use crate::api::{fleet_member::FleetMember, registration::Registration};
use crate::runtime::Action;
use crate::store::{ensure_finalizer, remove_finalizer, try_update, IgnoreNotFound};
use crate::telemetry;

use super::controller::{spec_hash, wait_until_backup_bucket_deleted, Context, REGISTRATION_FINALIZER};
use super::{
    AggregateError, BindingWriteError, MemberBindingError, RegistrationSyncError,
    RegistrationSyncResult,
};

/// Reconciles one registration.
///
/// A live registration is fanned out to one deployment binding per live fleet
/// member. A deleting registration deletes its bindings and keeps its finalizer
/// until none are left.
#[instrument(skip_all, fields(trace_id = display(telemetry::get_trace_id()), name = %name), err)]
pub async fn reconcile(name: String, ctx: Arc<Context>) -> RegistrationSyncResult<Action> {
    ctx.touch().await;

    let Some(registration) = ctx
        .registrations
        .cached
        .get(&name)
        .await
        .ignore_not_found()
        .map_err(RegistrationSyncError::Lookup)?
    else {
        debug!("Registration is gone");
        return Ok(Action::await_change());
    };

    if registration.is_deleting() {
        delete(&registration, &ctx).await?;
    } else {
        sync(registration, &ctx).await?;
    }

    Ok(Action::await_change())
}

async fn sync(registration: Registration, ctx: &Context) -> RegistrationSyncResult<()> {
    let name = registration.name_any();
    let members = ctx
        .members
        .cached
        .list()
        .await
        .map_err(RegistrationSyncError::ListMembers)?;

    let registration = if members.iter().any(|member| !member.is_deleting()) {
        ensure_finalizer(ctx.registrations.live.as_ref(), &name, REGISTRATION_FINALIZER)
            .await
            .map_err(RegistrationSyncError::Finalizer)?
    } else {
        registration
    };

    // Read past the cache so two passes never both create a binding for one member.
    let existing: BTreeMap<String, String> = bindings_of(ctx, &name)
        .await?
        .into_iter()
        .map(|binding| (binding.spec.member_ref.name.clone(), binding.name_any()))
        .collect();

    let registration = &registration;
    let results = join_all(members.iter().map(|member| {
        let existing = existing.get(&member.name_any()).map(String::as_str);
        async move {
            sync_member_binding(ctx, registration, member, existing)
                .await
                .map_err(|source| MemberBindingError {
                    member: member.name_any(),
                    source,
                })
        }
    }))
    .await;

    AggregateError::check(results)?;
    Ok(())
}

async fn bindings_of(ctx: &Context, registration: &str) -> RegistrationSyncResult<Vec<DeploymentBinding>> {
    Ok(ctx
        .bindings
        .live
        .list()
        .await
        .map_err(RegistrationSyncError::ListBindings)?
        .into_iter()
        .filter(|binding| binding.spec.registration_ref.name == registration)
        .collect())
}

async fn sync_member_binding(
    ctx: &Context,
    registration: &Registration,
    member: &FleetMember,
    existing: Option<&str>,
) -> Result<(), BindingWriteError> {
    if member.is_deleting() {
        let Some(binding) = existing else {
            return Ok(());
        };

        if member.spec.backup.is_some() {
            wait_until_backup_bucket_deleted(ctx, member).await?;
        }

        let deleted = ctx
            .bindings
            .live
            .delete(binding)
            .await
            .ignore_not_found()
            .map_err(BindingWriteError::Delete)?;
        if deleted.is_some() {
            ctx.publish(
                registration,
                "BindingDeleted",
                "Delete",
                format!("Deleted DeploymentBinding {binding:?} of deleting FleetMember {:?}", member.name_any()),
            )
            .await;
        }
        return Ok(());
    }

    let member = ensure_finalizer(ctx.members.live.as_ref(), &member.name_any(), REGISTRATION_FINALIZER)
        .await
        .map_err(BindingWriteError::Finalizer)?;

    let labels = BTreeMap::from([
        (MEMBER_SPEC_HASH_LABEL.to_string(), spec_hash(&member.spec)?),
        (REGISTRATION_SPEC_HASH_LABEL.to_string(), spec_hash(&registration.spec)?),
    ]);
    let spec = DeploymentBindingSpec {
        registration_ref: ObjectRef::to(registration),
        member_ref: ObjectRef::to(&member),
    };

    match existing {
        Some(binding) => {
            try_update(
                ctx.bindings.live.as_ref(),
                binding,
                |obj| {
                    obj.labels_mut().extend(labels.clone());
                    obj.spec = spec.clone();
                },
                |current, updated| current.labels() == updated.labels() && current.spec == updated.spec,
            )
            .await
            .map_err(BindingWriteError::Write)?;
        }
        None => {
            let mut binding = DeploymentBinding::new("", spec);
            binding.metadata.name = None;
            binding.metadata.generate_name = Some(format!("{}-", registration.name_any()));
            binding.metadata.labels = Some(labels);

            let created = ctx
                .bindings
                .live
                .create(&binding)
                .await
                .map_err(BindingWriteError::Write)?;
            info!(binding = %created.name_any(), member = %member.name_any(), "Created deployment binding");
            ctx.publish(
                registration,
                "BindingCreated",
                "Create",
                format!("Created DeploymentBinding {:?} for FleetMember {:?}", created.name_any(), member.name_any()),
            )
            .await;
        }
    }

    Ok(())
}

async fn delete(registration: &Registration, ctx: &Context) -> RegistrationSyncResult<()> {
    let name = registration.name_any();
    let bindings = bindings_of(ctx, &name).await?;

    let results = join_all(bindings.iter().map(|binding| async move {
        ctx.bindings
            .live
            .delete(&binding.name_any())
            .await
            .ignore_not_found()
            .map(|_| ())
    }))
    .await;
    AggregateError::check(results).map_err(RegistrationSyncError::Delete)?;

    if !bindings.is_empty() {
        return Err(RegistrationSyncError::DeletionPending(bindings.len()));
    }

    remove_finalizer(ctx.registrations.live.as_ref(), &name, REGISTRATION_FINALIZER)
        .await
        .map_err(RegistrationSyncError::Finalizer)?;
    info!("Registration released");
    Ok(())
}
