use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::condition::Condition;

pub static MEMBER_SPEC_HASH_LABEL: &str = "member-spec-hash";
pub static REGISTRATION_SPEC_HASH_LABEL: &str = "registration-spec-hash";

pub static CONDITION_VALID: &str = "Valid";
pub static CONDITION_INSTALLED: &str = "Installed";

/// Pairs one registration with one fleet member.
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "DeploymentBinding",
    group = "core.fleet.dev",
    version = "v1alpha1",
    shortname = "db",
    status = "DeploymentBindingStatus",
    printcolumn = r#"{"name":"Registration","type":"string","jsonPath":".spec.registrationRef.name"}"#,
    printcolumn = r#"{"name":"Member","type":"string","jsonPath":".spec.memberRef.name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentBindingSpec {
    pub registration_ref: ObjectRef,
    pub member_ref: ObjectRef,
}

/// Name and observed resource version of a referenced object.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl ObjectRef {
    pub fn to(res: &impl ResourceExt) -> Self {
        Self {
            name: res.name_any(),
            resource_version: res.resource_version(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentBindingStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,

    /// Deployed sub-resources written by earlier versions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<Value>,
}

/// Legacy shape of `status.providerStatus`.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
pub struct DeployedResources {
    #[serde(default)]
    pub resources: Vec<DeployedResource>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct DeployedResource {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for DeployedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.api_version, self.kind, self.namespace, self.name
        )
    }
}

impl DeploymentBinding {
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.as_deref())
            .unwrap_or_default()
    }

    pub fn provider_status(&self) -> Option<&Value> {
        self.status.as_ref().and_then(|s| s.provider_status.as_ref())
    }

    /// Namespace on the member dedicated to this binding's extension.
    pub fn extension_namespace(&self) -> String {
        format!("extension-{}", self.name_any())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::condition::ConditionStatus;
    use serde_json::json;

    #[test]
    fn status_round_trips_wire_names() {
        let status: DeploymentBindingStatus = serde_json::from_value(json!({
            "conditions": [{
                "type": "Valid",
                "status": "True",
                "reason": "RegistrationValid",
                "message": "ok"
            }],
            "providerStatus": {"resources": []}
        }))
        .unwrap();

        let conditions = status.conditions.unwrap();
        assert_eq!(conditions[0].type_, CONDITION_VALID);
        assert_eq!(conditions[0].status, ConditionStatus::True);
        assert_eq!(status.provider_status, Some(json!({"resources": []})));
    }

    #[test]
    fn legacy_resources_parse() {
        let resources: DeployedResources = serde_json::from_value(json!({
            "resources": [
                {"apiVersion": "apps/v1", "kind": "Deployment", "namespace": "garden", "name": "dns"},
                {"apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRole", "name": "dns"}
            ]
        }))
        .unwrap();

        assert_eq!(resources.resources.len(), 2);
        assert_eq!(
            resources.resources[0].to_string(),
            "apps/v1/Deployment/garden/dns"
        );
        assert!(resources.resources[1].namespace.is_empty());
    }

    #[test]
    fn extension_namespace_follows_binding_name() {
        let binding = DeploymentBinding::new("dns-x7k2p", DeploymentBindingSpec::default());
        assert_eq!(binding.extension_namespace(), "extension-dns-x7k2p");
    }
}
