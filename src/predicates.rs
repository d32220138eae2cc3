use kube::Resource;

use crate::api::deployment_binding::DeploymentBinding;

/// Whether an observed binding needs reconciling.
///
/// New bindings always do. Updates only do when the binding was just marked
/// for deletion or the resource version of the registration or member
/// reference moved.
pub fn binding_changed(old: Option<&DeploymentBinding>, new: &DeploymentBinding) -> bool {
    let Some(old) = old else {
        return true;
    };

    old.meta().deletion_timestamp != new.meta().deletion_timestamp
        || old.spec.registration_ref.resource_version != new.spec.registration_ref.resource_version
        || old.spec.member_ref.resource_version != new.spec.member_ref.resource_version
}

/// Whether a binding targets the given member. No member means all of them.
pub fn targets_member(binding: &DeploymentBinding, member: Option<&str>) -> bool {
    member.map_or(true, |member| binding.spec.member_ref.name == member)
}
