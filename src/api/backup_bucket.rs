use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Backup storage provisioned for a fleet member. Named after the member's UID.
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "BackupBucket",
    group = "core.fleet.dev",
    version = "v1alpha1",
    status = "BackupBucketStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct BackupBucketSpec {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupBucketStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
pub struct LastError {
    pub description: String,
}

impl BackupBucket {
    pub fn last_error(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.last_error.as_ref())
            .map(|e| e.description.as_str())
    }
}
