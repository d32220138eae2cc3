use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static TAINT_PROTECTED: &str = "member.fleet.dev/protected";
pub static TAINT_INVISIBLE: &str = "member.fleet.dev/invisible";

/// A cluster that is able to host extension workloads.
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "FleetMember",
    group = "core.fleet.dev",
    version = "v1alpha1",
    shortname = "fm"
)]
#[serde(rename_all = "camelCase")]
pub struct FleetMemberSpec {
    /// Infrastructure the member runs on.
    pub provider: MemberProvider,

    /// DNS settings of the member.
    #[serde(default)]
    pub dns: MemberDns,

    /// Network ranges used inside the member.
    #[serde(default)]
    pub networks: MemberNetworks,

    /// CIDRs that workloads on the member must not reach.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_cidrs: Option<Vec<String>>,

    /// Taints restricting which workloads may be scheduled to the member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taints: Option<Vec<MemberTaint>>,

    /// Backup store of the member. When present, removal waits for the
    /// backup bucket to be torn down.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<MemberBackup>,

    /// Volume providers available on the member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<MemberVolume>,

    /// Secret holding a kubeconfig for the member. Without it the local
    /// cluster is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemberProvider {
    #[serde(rename = "type")]
    pub type_: String,
    pub region: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemberDns {
    pub ingress_domain: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemberNetworks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<String>,
    pub pods: String,
    pub services: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
pub struct MemberTaint {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemberBackup {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub secret_ref: SecretRef,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
pub struct MemberVolume {
    #[serde(default)]
    pub providers: Vec<VolumeProvider>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
pub struct VolumeProvider {
    pub purpose: String,
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
pub struct SecretRef {
    pub name: String,
    pub namespace: String,
}

impl FleetMember {
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_taint(&self, key: &str) -> bool {
        self.spec
            .taints
            .iter()
            .flatten()
            .any(|taint| taint.key == key)
    }

    /// Name of the backup bucket belonging to this member.
    pub fn backup_bucket_name(&self) -> String {
        self.uid().unwrap_or_else(|| self.name_any())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taint_lookup() {
        let mut member = FleetMember::new("m1", FleetMemberSpec::default());
        assert!(!member.has_taint(TAINT_PROTECTED));

        member.spec.taints = Some(vec![MemberTaint {
            key: TAINT_PROTECTED.to_string(),
            value: None,
        }]);
        assert!(member.has_taint(TAINT_PROTECTED));
        assert!(!member.has_taint(TAINT_INVISIBLE));
    }

    #[test]
    fn backup_bucket_is_named_after_uid() {
        let mut member = FleetMember::new("m1", FleetMemberSpec::default());
        assert_eq!(member.backup_bucket_name(), "m1");

        member.metadata.uid = Some("8d3e".to_string());
        assert_eq!(member.backup_bucket_name(), "8d3e");
    }
}
