use base64::prelude::*;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub static EXTENSION_RESOURCE_KIND: &str = "Extension";

/// Declares an extension controller that has to run on every eligible fleet member.
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "Registration",
    group = "core.fleet.dev",
    version = "v1alpha1",
    shortname = "reg"
)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationSpec {
    /// Extension resource kinds and types served by the registered controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<ControllerResource>>,

    /// How the controller is deployed to members.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentDescriptor>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControllerResource {
    pub kind: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_enabled: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentDescriptor {
    #[serde(rename = "type")]
    pub type_: String,

    /// Deployer specific configuration, e.g. a chart with values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<Value>,
}

/// Deployment kinds known to this manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeploymentKind {
    Helm,
}

impl DeploymentKind {
    pub fn from_type(type_: &str) -> Option<Self> {
        match type_ {
            "helm" => Some(Self::Helm),
            _ => None,
        }
    }
}

/// Chart reference and value overrides of a helm deployment.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
pub struct HelmDeployment {
    /// Base64 encoded chart archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Map<String, Value>>,
}

impl HelmDeployment {
    pub fn chart_archive(&self) -> DescriptorResult<Vec<u8>> {
        let chart = self.chart.as_deref().ok_or(DescriptorError::MissingChart)?;
        Ok(BASE64_STANDARD.decode(chart)?)
    }
}

impl Registration {
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn deployment_kind(&self) -> Option<DeploymentKind> {
        self.spec
            .deployment
            .as_ref()
            .and_then(|d| DeploymentKind::from_type(&d.type_))
    }

    /// Parses the deployment provider config as a helm deployment.
    pub fn helm_deployment(&self) -> DescriptorResult<HelmDeployment> {
        let config = self
            .spec
            .deployment
            .as_ref()
            .and_then(|d| d.provider_config.clone())
            .ok_or(DescriptorError::MissingProviderConfig)?;
        Ok(serde_json::from_value(config)?)
    }

    /// Extension types declared by this registration.
    pub fn extension_types(&self) -> impl Iterator<Item = &str> {
        self.spec
            .resources
            .iter()
            .flatten()
            .filter(|r| r.kind == EXTENSION_RESOURCE_KIND)
            .map(|r| r.type_.as_str())
    }
}

pub type DescriptorResult<T> = std::result::Result<T, DescriptorError>;

#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("deployment has no provider config")]
    MissingProviderConfig,

    #[error("deployment has no chart")]
    MissingChart,

    #[error("provider config cannot be decoded: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("chart archive is not valid base64: {0}")]
    Archive(#[from] base64::DecodeError),
}
