use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ApiResource;
use kube::ResourceExt;
use serde_json::json;
use tracing::debug;

use crate::resources::sandboxes::Sandbox;
use crate::{Error, Result};

use super::builder::{self, DOCKER_CONFIG_JSON_KEY};
use super::converge::{converge, fetch, ObjectKey, ObjectStore};
use super::sandbox_namespace;

pub const DEFAULT_PULL_SECRET_NAMESPACE: &str = "default";
const DEFAULT_SERVICE_ACCOUNT: &str = "default";

/// Where to find the image pull secret copied into every sandbox
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PullSecretConfig {
    pub name: String,
    pub namespace: String,
}

impl PullSecretConfig {
    /// `None` unless a secret name is configured; the namespace falls back to `default`
    pub fn from_parts(name: Option<String>, namespace: Option<String>) -> Option<Self> {
        let name = name.filter(|n| !n.is_empty())?;
        let namespace = namespace
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_PULL_SECRET_NAMESPACE.into());
        Some(Self { name, namespace })
    }
}

async fn docker_config(store: &dyn ObjectStore, config: &PullSecretConfig) -> Result<Secret> {
    let key = ObjectKey::namespaced(&config.namespace, &config.name);
    fetch::<Secret>(store, &key)
        .await?
        .ok_or_else(|| Error::SecretNotFound(key.to_string()))
}

/// Copy the configured pull secret into the sandbox namespace and let the namespace's default
/// service account pull images with it.
pub async fn reconcile_pull_secret(
    store: &dyn ObjectStore,
    owner: &OwnerReference,
    sandbox: &Sandbox,
    config: &PullSecretConfig,
) -> Result<()> {
    let source = docker_config(store, config).await?;
    let payload = source
        .data
        .and_then(|mut data| data.remove(DOCKER_CONFIG_JSON_KEY))
        .ok_or_else(|| {
            Error::SecretKeyNotFound(
                DOCKER_CONFIG_JSON_KEY.into(),
                format!("{}/{}", config.namespace, config.name),
            )
        })?;

    let outcome = converge(
        store,
        owner,
        builder::pull_secret(sandbox, &config.name, payload),
    )
    .await?;
    debug!("Pull secret {} for {}: {:?}", config.name, sandbox.name_any(), outcome);

    // the default service account is created asynchronously by the namespace's service account controller
    let namespace = sandbox_namespace(&sandbox.name_any());
    let sa_key = ObjectKey::namespaced(&namespace, DEFAULT_SERVICE_ACCOUNT);
    if fetch::<ServiceAccount>(store, &sa_key).await?.is_none() {
        return Err(Error::ServiceAccountNotFound(sa_key.to_string()));
    }

    debug!(
        "Patching ServiceAccount {} to pull with {}",
        sa_key, config.name
    );
    store
        .patch_strategic(
            &ApiResource::erase::<ServiceAccount>(&()),
            &sa_key,
            &json!({ "imagePullSecrets": [{ "name": config.name }] }),
        )
        .await?;
    Ok(())
}
