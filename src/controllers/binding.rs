use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use async_trait::async_trait;
use futures::future::join_all;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::api::condition::{get_or_init_condition, merge_conditions, Condition, ConditionStatus};
use crate::api::deployment_binding::{
    DeployedResources, DeploymentBinding, CONDITION_INSTALLED, CONDITION_VALID,
};
use crate::api::fleet_member::FleetMember;
use crate::api::registration::{DeploymentKind, Registration};
use crate::member::MemberClient;
use crate::runtime::Action;
use crate::store::{
    ensure_finalizer, has_finalizer, remove_finalizer, try_update_status, Deletion, IgnoreNotFound,
    StoreError,
};
use crate::telemetry;

use super::controller::{
    member_values, merge_values, Context, BINDING_FINALIZER, MANAGED_RESOURCE_CLASS,
    REGISTRATION_LABEL, ROLE_EXTENSION, ROLE_LABEL,
};
use super::{AggregateError, BindingError, BindingResult, CleanupError, CleanupResult, Progress};

/// Deploys bindings of the deployment kinds it declares.
#[async_trait]
pub trait BindingReconciler: Send + Sync {
    fn kinds(&self) -> &[DeploymentKind];

    async fn reconcile(&self, binding: &DeploymentBinding, ctx: &Context) -> BindingResult<()>;

    async fn delete(&self, binding: &DeploymentBinding, ctx: &Context) -> BindingResult<()>;
}

/// Routes each binding to the reconciler handling its registration's
/// deployment kind. Bindings nobody handles are skipped.
#[derive(Clone)]
pub struct BindingDispatcher {
    reconcilers: Vec<Arc<dyn BindingReconciler>>,
}

impl Default for BindingDispatcher {
    fn default() -> Self {
        Self::new(vec![Arc::new(HelmReconciler)])
    }
}

impl BindingDispatcher {
    pub fn new(reconcilers: Vec<Arc<dyn BindingReconciler>>) -> Self {
        Self { reconcilers }
    }

    fn responsible(&self, kind: DeploymentKind) -> Option<&Arc<dyn BindingReconciler>> {
        self.reconcilers.iter().find(|r| r.kinds().contains(&kind))
    }

    #[instrument(skip_all, fields(trace_id = display(telemetry::get_trace_id()), name = %name), err)]
    pub async fn dispatch(&self, name: String, ctx: Arc<Context>) -> BindingResult<Action> {
        ctx.touch().await;

        let Some(binding) = ctx
            .bindings
            .cached
            .get(&name)
            .await
            .ignore_not_found()
            .map_err(BindingError::Lookup)?
        else {
            debug!("Deployment binding is gone");
            return Ok(Action::await_change());
        };

        let registration = ctx
            .registrations
            .cached
            .get(&binding.spec.registration_ref.name)
            .await
            .map_err(BindingError::Registration)?;

        let Some(reconciler) = registration
            .deployment_kind()
            .and_then(|kind| self.responsible(kind))
        else {
            debug!("No reconciler handles this deployment type");
            return Ok(Action::await_change());
        };

        if binding.is_deleting() {
            if has_finalizer(&binding, BINDING_FINALIZER) {
                reconciler.delete(&binding, &ctx).await?;
            }
        } else {
            reconciler.reconcile(&binding, &ctx).await?;
        }

        Ok(Action::await_change())
    }
}

/// `Valid` and `Installed` as they evolve during one pass.
struct BindingConditions {
    valid: Condition,
    installed: Condition,
}

impl BindingConditions {
    fn of(binding: &DeploymentBinding) -> Self {
        Self {
            valid: get_or_init_condition(binding.conditions(), CONDITION_VALID),
            installed: get_or_init_condition(binding.conditions(), CONDITION_INSTALLED),
        }
    }

    fn valid(&mut self, status: ConditionStatus, reason: &str, message: String) {
        self.valid = self.valid.updated(status, reason, message);
    }

    fn installed(&mut self, status: ConditionStatus, reason: &str, message: String) {
        self.installed = self.installed.updated(status, reason, message);
    }

    /// Records a failed lookup of a referenced object on `Valid`.
    fn unresolved(&mut self, kind: &str, reason_prefix: &str, err: &StoreError) {
        if err.is_not_found() {
            self.valid(
                ConditionStatus::False,
                &format!("{reason_prefix}NotFound"),
                format!("Referenced {kind} does not exist: {err}"),
            );
        } else {
            self.valid(
                ConditionStatus::Unknown,
                &format!("{reason_prefix}ReadError"),
                format!("Referenced {kind} cannot be read: {err}"),
            );
        }
    }

    /// Best effort write of both conditions. Other conditions are kept.
    async fn write(&self, ctx: &Context, name: &str, deleting: bool) {
        let updates = [self.valid.clone(), self.installed.clone()];
        let result = try_update_status(
            ctx.bindings.live.as_ref(),
            name,
            |binding| {
                let conditions = merge_conditions(binding.conditions(), updates.clone());
                binding.status.get_or_insert_with(Default::default).conditions = Some(conditions);
            },
            |current, updated| current.conditions() == updated.conditions(),
        )
        .await;

        match result {
            Err(err) if deleting && err.is_not_found() => {}
            Err(err) => warn!(binding = name, "Failed to write binding conditions: {err}"),
            Ok(_) => {}
        }
    }
}

/// Deploys helm charts as managed artifacts on the member.
pub struct HelmReconciler;

#[async_trait]
impl BindingReconciler for HelmReconciler {
    fn kinds(&self) -> &[DeploymentKind] {
        &[DeploymentKind::Helm]
    }

    async fn reconcile(&self, binding: &DeploymentBinding, ctx: &Context) -> BindingResult<()> {
        let mut conditions = BindingConditions::of(binding);
        let result = install(binding, ctx, &mut conditions).await;
        conditions.write(ctx, &binding.name_any(), false).await;
        result
    }

    async fn delete(&self, binding: &DeploymentBinding, ctx: &Context) -> BindingResult<()> {
        let mut conditions = BindingConditions::of(binding);
        let result = match teardown(binding, ctx, &mut conditions).await {
            Ok(Progress::Done) => Ok(()),
            Ok(Progress::Pending(message)) => {
                conditions.installed(ConditionStatus::False, "DeletionPending", message.clone());
                Err(BindingError::DeletionPending(message))
            }
            Err(err @ BindingError::Cleanup(_)) => {
                conditions.installed(
                    ConditionStatus::False,
                    "DeletionFailed",
                    format!("Deletion of old resources failed: {err}"),
                );
                Err(err)
            }
            Err(err) => Err(err),
        };
        conditions.write(ctx, &binding.name_any(), true).await;
        result
    }
}

async fn resolve_member(
    ctx: &Context,
    binding: &DeploymentBinding,
    conditions: &mut BindingConditions,
) -> BindingResult<FleetMember> {
    ctx.members
        .cached
        .get(&binding.spec.member_ref.name)
        .await
        .map_err(|err| {
            conditions.unresolved("FleetMember", "Seed", &err);
            BindingError::Member(err)
        })
}

async fn member_client(
    ctx: &Context,
    member: &FleetMember,
    conditions: &mut BindingConditions,
) -> BindingResult<Arc<dyn MemberClient>> {
    ctx.member_clients
        .client_for(member)
        .await
        .map_err(|err| {
            conditions.unresolved("FleetMember", "Seed", &err);
            BindingError::MemberClient(err)
        })
}

async fn registration_of(
    ctx: &Context,
    binding: &DeploymentBinding,
    conditions: &mut BindingConditions,
) -> BindingResult<Registration> {
    ctx.registrations
        .cached
        .get(&binding.spec.registration_ref.name)
        .await
        .map_err(|err| {
            conditions.unresolved("Registration", "Registration", &err);
            BindingError::Registration(err)
        })
}

async fn install(
    binding: &DeploymentBinding,
    ctx: &Context,
    conditions: &mut BindingConditions,
) -> BindingResult<()> {
    let name = binding.name_any();
    ensure_finalizer(ctx.bindings.live.as_ref(), &name, BINDING_FINALIZER)
        .await
        .map_err(BindingError::Finalizer)?;

    let registration = registration_of(ctx, binding, conditions).await?;
    let member = resolve_member(ctx, binding, conditions).await?;
    let client = member_client(ctx, &member, conditions).await?;

    let (helm, chart) = match registration
        .helm_deployment()
        .and_then(|helm| helm.chart_archive().map(|chart| (helm, chart)))
    {
        Ok(parsed) => parsed,
        Err(err) => {
            conditions.valid(
                ConditionStatus::False,
                "ChartInformationInvalid",
                format!("Chart information could not be parsed: {err}"),
            );
            return Err(err.into());
        }
    };

    let namespace = binding.extension_namespace();
    let labels = BTreeMap::from([
        (ROLE_LABEL.to_string(), ROLE_EXTENSION.to_string()),
        (REGISTRATION_LABEL.to_string(), registration.name_any()),
    ]);
    client
        .apply_namespace(&namespace, labels)
        .await
        .map_err(BindingError::Namespace)?;

    let values = merge_values(
        helm.values.unwrap_or_default(),
        member_values(&ctx.config.fleet_identity, &member),
    );
    let rendered = match ctx
        .renderer
        .render(&chart, &registration.name_any(), &namespace, &values)
        .await
    {
        Ok(rendered) => rendered,
        Err(err) => {
            conditions.valid(
                ConditionStatus::False,
                "ChartCannotBeRendered",
                format!("Chart rendering process failed: {err}"),
            );
            return Err(err.into());
        }
    };
    conditions.valid(
        ConditionStatus::True,
        "RegistrationValid",
        "Chart could be rendered successfully.".to_string(),
    );

    let artifact_namespace = &ctx.config.artifact_namespace;
    let deployed = async {
        client
            .put_secret(artifact_namespace, &name, rendered.secret_data())
            .await?;
        client
            .declare_managed_artifact(artifact_namespace, &name, &name, MANAGED_RESOURCE_CLASS)
            .await
    };
    if let Err(err) = deployed.await {
        conditions.installed(
            ConditionStatus::False,
            "InstallationFailed",
            format!("Creation of ManagedResource {name:?} failed: {err}"),
        );
        return Err(BindingError::Install(err));
    }

    let empty = json!({ "resources": [] });
    if let Err(err) = try_update_status(
        ctx.bindings.live.as_ref(),
        &name,
        |binding| {
            binding.status.get_or_insert_with(Default::default).provider_status = Some(empty.clone());
        },
        |current, updated| current.provider_status() == updated.provider_status(),
    )
    .await
    {
        conditions.installed(
            ConditionStatus::False,
            "InstallationFailed",
            format!("Updating provider status failed: {err}"),
        );
        return Err(BindingError::Status(err));
    }

    conditions.installed(
        ConditionStatus::True,
        "InstallationSuccessful",
        "Installation of new resources succeeded.".to_string(),
    );
    info!(member = %member.name_any(), "Deployed chart");
    Ok(())
}

/// Removes everything the binding put on its member, in order: extensions,
/// managed artifact, artifact secret, legacy resources, namespace. The binding
/// finalizer is dropped last.
async fn teardown(
    binding: &DeploymentBinding,
    ctx: &Context,
    conditions: &mut BindingConditions,
) -> BindingResult<Progress> {
    let name = binding.name_any();
    let member = resolve_member(ctx, binding, conditions).await?;
    let client = member_client(ctx, &member, conditions).await?;
    let registration = registration_of(ctx, binding, conditions).await?;
    let client = client.as_ref();

    if let Progress::Pending(message) = clean_extensions(client, &registration).await? {
        return Ok(Progress::Pending(message));
    }

    let artifact_namespace = &ctx.config.artifact_namespace;
    let deletion = client
        .delete_managed_artifact(artifact_namespace, &name)
        .await
        .ignore_not_found()
        .map_err(CleanupError::ManagedArtifact)?;
    if deletion == Some(Deletion::Pending) {
        return Ok(Progress::Pending(format!(
            "Deletion of managed artifact {name:?} is still pending."
        )));
    }

    if let Err(err) = client
        .delete_secret(artifact_namespace, &name)
        .await
        .ignore_not_found()
    {
        warn!("Failed to delete artifact secret: {err}");
        conditions.installed(
            ConditionStatus::False,
            "DeletionFailed",
            format!("Deletion of secret {name:?} failed: {err}"),
        );
    }

    if let Progress::Pending(message) = clean_legacy_resources(client, binding).await? {
        return Ok(Progress::Pending(message));
    }

    client
        .delete_namespace(&binding.extension_namespace())
        .await
        .ignore_not_found()
        .map_err(CleanupError::Namespace)?;
    conditions.installed(
        ConditionStatus::False,
        "DeletionSuccessful",
        "Deletion of old resources succeeded.".to_string(),
    );

    remove_finalizer(ctx.bindings.live.as_ref(), &name, BINDING_FINALIZER)
        .await
        .map_err(BindingError::Finalizer)?;
    info!("Removed deployment from member");
    Ok(Progress::Done)
}

async fn clean_extensions(
    client: &dyn MemberClient,
    registration: &Registration,
) -> CleanupResult<Progress> {
    let types: BTreeSet<&str> = registration.extension_types().collect();
    let extensions: Vec<_> = client
        .list_extensions()
        .await
        .map_err(CleanupError::ListExtensions)?
        .into_iter()
        .filter(|extension| types.contains(extension.spec.type_.as_str()))
        .collect();

    if extensions.is_empty() {
        return Ok(Progress::Done);
    }

    let results = join_all(extensions.iter().map(|extension| async move {
        client
            .delete_extension(&extension.namespace().unwrap_or_default(), &extension.name_any())
            .await
            .ignore_not_found()
            .map(|_| ())
    }))
    .await;
    AggregateError::check(results).map_err(CleanupError::Extensions)?;

    Ok(Progress::Pending(
        "Deletion of extensions is still pending.".to_string(),
    ))
}

async fn clean_legacy_resources(
    client: &dyn MemberClient,
    binding: &DeploymentBinding,
) -> CleanupResult<Progress> {
    let Some(payload) = binding.provider_status() else {
        return Ok(Progress::Done);
    };
    let deployed: DeployedResources = serde_json::from_value(payload.clone())?;

    let results = join_all(
        deployed
            .resources
            .iter()
            .map(|resource| async move { client.delete_object(resource).await.ignore_not_found() }),
    )
    .await;

    let mut remaining = 0;
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(Some(Deletion::Pending)) => remaining += 1,
            Ok(_) => {}
            Err(err) => errors.push(err),
        }
    }
    if !errors.is_empty() {
        return Err(CleanupError::LegacyResources(AggregateError(errors)));
    }

    if remaining > 0 {
        Ok(Progress::Pending(
            "Deletion of old resources is still pending.".to_string(),
        ))
    } else {
        Ok(Progress::Done)
    }
}
