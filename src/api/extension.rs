use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Extension resource served by a registered controller on a member.
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "Extension",
    group = "extensions.fleet.dev",
    version = "v1alpha1",
    namespaced
)]
pub struct ExtensionSpec {
    #[serde(rename = "type")]
    pub type_: String,
}
