//! Access to the resource store of a fleet member.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::{Namespace, Secret},
    ByteString,
};
use kube::{
    api::{
        Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, ObjectMeta,
        Patch, PatchParams,
    },
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::{
    api::{
        deployment_binding::DeployedResource,
        extension::Extension,
        fleet_member::FleetMember,
        managed_resource::{LocalObjectRef, ManagedResource, ManagedResourceSpec},
    },
    store::{Deletion, StoreError, StoreResult},
};

pub static FIELD_MANAGER: &str = "fleet-extension-manager";
pub static KUBECONFIG_KEY: &str = "kubeconfig";

/// Writes rendered artifacts to a member.
///
/// Both writes are create-or-update and may be repeated freely.
#[async_trait]
pub trait ArtifactDeployer: Send + Sync {
    async fn put_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> StoreResult<()>;

    async fn declare_managed_artifact(
        &self,
        namespace: &str,
        name: &str,
        secret_name: &str,
        class: &str,
    ) -> StoreResult<()>;

    async fn delete_managed_artifact(&self, namespace: &str, name: &str)
        -> StoreResult<Deletion>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> StoreResult<Deletion>;
}

/// Session scoped to one member's resource store.
#[async_trait]
pub trait MemberClient: ArtifactDeployer {
    async fn apply_namespace(&self, name: &str, labels: BTreeMap<String, String>)
        -> StoreResult<()>;

    async fn delete_namespace(&self, name: &str) -> StoreResult<Deletion>;

    async fn list_extensions(&self) -> StoreResult<Vec<Extension>>;

    async fn delete_extension(&self, namespace: &str, name: &str) -> StoreResult<Deletion>;

    /// Deletes an object of arbitrary kind.
    async fn delete_object(&self, resource: &DeployedResource) -> StoreResult<Deletion>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait MemberClientFactory: Send + Sync {
    /// Returns a client for `member`. Fails with not-found when the member's
    /// access credentials are absent.
    async fn client_for(&self, member: &FleetMember) -> StoreResult<Arc<dyn MemberClient>>;
}

/// Builds member clients from the kubeconfig secret referenced by each
/// member. Members without a secret reference are served by the local client.
#[derive(Clone)]
pub struct KubeMemberClientFactory {
    client: Client,
}

impl KubeMemberClientFactory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn remote_client(&self, namespace: &str, name: &str) -> StoreResult<Client> {
        let secret = Api::<Secret>::namespaced(self.client.clone(), namespace)
            .get(name)
            .await?;
        let raw = secret
            .data
            .and_then(|mut data| data.remove(KUBECONFIG_KEY))
            .ok_or_else(|| StoreError::not_found("kubeconfig", name))?;

        let yaml = String::from_utf8(raw.0)
            .map_err(|e| StoreError::Unavailable(format!("kubeconfig is not UTF-8: {e}")))?;
        let kubeconfig = Kubeconfig::from_yaml(&yaml)
            .map_err(|e| StoreError::Unavailable(format!("invalid kubeconfig: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to load kubeconfig: {e}")))?;

        Client::try_from(config).map_err(StoreError::Kube)
    }
}

#[async_trait]
impl MemberClientFactory for KubeMemberClientFactory {
    async fn client_for(&self, member: &FleetMember) -> StoreResult<Arc<dyn MemberClient>> {
        let client = match &member.spec.secret_ref {
            Some(secret) => self.remote_client(&secret.namespace, &secret.name).await?,
            None => self.client.clone(),
        };
        Ok(Arc::new(KubeMemberClient { client }))
    }
}

pub struct KubeMemberClient {
    client: Client,
}

impl KubeMemberClient {
    async fn apply<K>(&self, api: Api<K>, obj: &K) -> StoreResult<()>
    where
        K: Resource + Clone + Serialize + DeserializeOwned + std::fmt::Debug,
    {
        let name = obj.meta().name.clone().unwrap_or_default();
        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(obj),
        )
        .await?;
        Ok(())
    }
}

async fn delete<K>(api: Api<K>, name: &str) -> StoreResult<Deletion>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    let response = api.delete(name, &DeleteParams::default()).await?;
    // Finalizers keep the object around; the API returns it instead of a status.
    Ok(if response.is_left() {
        Deletion::Pending
    } else {
        Deletion::Deleted
    })
}

/// Splits `group/version` (or a bare core `version`) into its parts.
pub(crate) fn group_version(api_version: &str) -> (&str, &str) {
    api_version.split_once('/').unwrap_or(("", api_version))
}

#[async_trait]
impl ArtifactDeployer for KubeMemberClient {
    async fn put_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> StoreResult<()> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(
                data.into_iter()
                    .map(|(key, value)| (key, ByteString(value)))
                    .collect(),
            ),
            ..Default::default()
        };
        self.apply(Api::namespaced(self.client.clone(), namespace), &secret)
            .await
    }

    async fn declare_managed_artifact(
        &self,
        namespace: &str,
        name: &str,
        secret_name: &str,
        class: &str,
    ) -> StoreResult<()> {
        let mut artifact = ManagedResource::new(
            name,
            ManagedResourceSpec {
                secret_refs: vec![LocalObjectRef {
                    name: secret_name.to_string(),
                }],
                class: Some(class.to_string()),
            },
        );
        artifact.metadata.namespace = Some(namespace.to_string());
        self.apply(Api::namespaced(self.client.clone(), namespace), &artifact)
            .await
    }

    async fn delete_managed_artifact(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Deletion> {
        delete(
            Api::<ManagedResource>::namespaced(self.client.clone(), namespace),
            name,
        )
        .await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> StoreResult<Deletion> {
        delete(Api::<Secret>::namespaced(self.client.clone(), namespace), name).await
    }
}

#[async_trait]
impl MemberClient for KubeMemberClient {
    async fn apply_namespace(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> StoreResult<()> {
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        };
        self.apply(Api::all(self.client.clone()), &namespace).await
    }

    async fn delete_namespace(&self, name: &str) -> StoreResult<Deletion> {
        delete(Api::<Namespace>::all(self.client.clone()), name).await
    }

    async fn list_extensions(&self) -> StoreResult<Vec<Extension>> {
        Ok(Api::<Extension>::all(self.client.clone())
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn delete_extension(&self, namespace: &str, name: &str) -> StoreResult<Deletion> {
        delete(
            Api::<Extension>::namespaced(self.client.clone(), namespace),
            name,
        )
        .await
    }

    async fn delete_object(&self, resource: &DeployedResource) -> StoreResult<Deletion> {
        let (group, version) = group_version(&resource.api_version);
        let gvk = GroupVersionKind::gvk(group, version, &resource.kind);
        let api_resource = ApiResource::from_gvk(&gvk);
        debug!(%resource, "Deleting legacy resource");

        let api: Api<DynamicObject> = if resource.namespace.is_empty() {
            Api::all_with(self.client.clone(), &api_resource)
        } else {
            Api::namespaced_with(self.client.clone(), &resource.namespace, &api_resource)
        };
        delete(api, &resource.name).await
    }
}
