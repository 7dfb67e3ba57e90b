//! Create-or-update of derived objects against the cluster.
//!
//! Objects travel through [`ObjectStore`] as [`DynamicObject`]s so that one store serves every
//! kind; [`converge`] restores the typed view on either side of the store.

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, ResourceQuota, Secret};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, ApiResource, DynamicObject, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::{Error, Result};

use super::quantity::same_quantity;

/// Location of an object; `namespace` is `None` for cluster scoped kinds
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn of<K: Resource>(obj: &K) -> Result<Self> {
        Ok(Self {
            namespace: obj.meta().namespace.clone(),
            name: obj
                .meta()
                .name
                .clone()
                .ok_or(Error::MissingObjectKey("metadata.name"))?,
        })
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}", namespace, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// The remote object store that sandboxes are reconciled against
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>>;

    async fn create(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        obj: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Full update; `obj` carries the resourceVersion it was derived from
    async fn replace(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        obj: &DynamicObject,
    ) -> Result<DynamicObject>;

    async fn patch_strategic(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject>;
}

/// [`ObjectStore`] backed by the Kubernetes API server
pub struct KubeStore {
    client: Client,
    timeout: Duration,
}

impl KubeStore {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn api(&self, resource: &ApiResource, key: &ObjectKey) -> Api<DynamicObject> {
        match &key.namespace {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, kube::Error>> + Send,
    ) -> Result<T> {
        bounded(self.timeout, call).await
    }
}

/// Run a call to the API server, failing with [`Error::Timeout`] if it takes longer than `timeout`
pub async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, kube::Error>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Error::Timeout(timeout)),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        let api = self.api(resource, key);
        self.bounded(api.get_opt(&key.name)).await
    }

    async fn create(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let api = self.api(resource, key);
        self.bounded(api.create(&PostParams::default(), obj)).await
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let api = self.api(resource, key);
        self.bounded(api.replace(&key.name, &PostParams::default(), obj))
            .await
    }

    async fn patch_strategic(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject> {
        let api = self.api(resource, key);
        self.bounded(api.patch(
            &key.name,
            &PatchParams::default(),
            &Patch::Strategic(patch.clone()),
        ))
        .await
    }
}

pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

pub fn from_dynamic<K: DeserializeOwned>(obj: DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Typed read through an [`ObjectStore`]
pub async fn fetch<K>(store: &dyn ObjectStore, key: &ObjectKey) -> Result<Option<K>>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let resource = ApiResource::erase::<K>(&());
    store
        .get(&resource, key)
        .await?
        .map(from_dynamic)
        .transpose()
}

/// A kind whose desired state can be laid over a live object of the same kind
pub trait Converge:
    Resource<DynamicType = ()> + Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync
{
    /// Overwrite the fields of `self` that are managed from a Sandbox with those of `desired`.
    /// Anything else on the live object, including server-populated metadata, is kept.
    fn overlay(&mut self, desired: Self);
}

fn overlay_labels(live: &mut ObjectMeta, desired: ObjectMeta) {
    if let Some(labels) = desired.labels {
        live.labels.get_or_insert_with(Default::default).extend(labels);
    }
}

impl Converge for Namespace {
    fn overlay(&mut self, desired: Self) {
        overlay_labels(&mut self.metadata, desired.metadata);
    }
}

impl Converge for ResourceQuota {
    fn overlay(&mut self, desired: Self) {
        overlay_labels(&mut self.metadata, desired.metadata);
        let mut spec = desired.spec;
        // keep the server's spelling of limits that already have the desired value
        let hard = spec.as_mut().and_then(|s| s.hard.as_mut());
        let live_hard = self.spec.as_ref().and_then(|s| s.hard.as_ref());
        if let (Some(hard), Some(live_hard)) = (hard, live_hard) {
            for (resource, quantity) in hard.iter_mut() {
                if let Some(live) = live_hard.get(resource) {
                    if same_quantity(quantity, live) {
                        *quantity = live.clone();
                    }
                }
            }
        }
        self.spec = spec;
    }
}

impl Converge for Role {
    fn overlay(&mut self, desired: Self) {
        overlay_labels(&mut self.metadata, desired.metadata);
        self.rules = desired.rules;
    }
}

impl Converge for RoleBinding {
    fn overlay(&mut self, desired: Self) {
        overlay_labels(&mut self.metadata, desired.metadata);
        self.role_ref = desired.role_ref;
        // subjects are replaced, never merged with what was bound before
        self.subjects = desired.subjects;
    }
}

impl Converge for ClusterRole {
    fn overlay(&mut self, desired: Self) {
        overlay_labels(&mut self.metadata, desired.metadata);
        self.rules = desired.rules;
        self.aggregation_rule = desired.aggregation_rule;
    }
}

impl Converge for ClusterRoleBinding {
    fn overlay(&mut self, desired: Self) {
        overlay_labels(&mut self.metadata, desired.metadata);
        self.role_ref = desired.role_ref;
        self.subjects = desired.subjects;
    }
}

impl Converge for Secret {
    fn overlay(&mut self, desired: Self) {
        overlay_labels(&mut self.metadata, desired.metadata);
        self.data = desired.data;
        self.type_ = desired.type_;
    }
}

/// Make `owner` the controlling owner of `obj`, so deleting the owner garbage collects `obj`.
///
/// Fails if `obj` is already controlled by something else.
pub fn set_controller_reference<K: Resource<DynamicType = ()>>(
    obj: &mut K,
    owner: &OwnerReference,
) -> Result<()> {
    let kind = K::kind(&()).to_string();
    let name = obj.name_any();
    let owner_references = obj.meta_mut().owner_references.get_or_insert_with(Vec::new);

    if let Some(other) = owner_references
        .iter()
        .find(|r| r.controller == Some(true) && r.uid != owner.uid)
    {
        return Err(Error::OwnershipConflict {
            kind,
            name,
            owner: format!("{} {}", other.kind, other.name),
        });
    }

    match owner_references.iter_mut().find(|r| r.uid == owner.uid) {
        Some(existing) => *existing = owner.clone(),
        None => owner_references.push(owner.clone()),
    }
    Ok(())
}

/// What [`converge`] had to do to bring an object in line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
}

/// Create `desired` if it doesn't exist, otherwise lay it over the live object and write the
/// result back if that changed anything. Either way `owner` ends up as the controlling owner.
pub async fn converge<K: Converge>(
    store: &dyn ObjectStore,
    owner: &OwnerReference,
    mut desired: K,
) -> Result<Outcome> {
    let resource = ApiResource::erase::<K>(&());
    let key = ObjectKey::of(&desired)?;

    let Some(live) = fetch::<K>(store, &key).await? else {
        set_controller_reference(&mut desired, owner)?;
        debug!("Creating {} {}", resource.kind, key);
        store
            .create(&resource, &key, &to_dynamic(&desired)?)
            .await?;
        return Ok(Outcome::Created);
    };

    let mut updated = live.clone();
    updated.overlay(desired);
    set_controller_reference(&mut updated, owner)?;

    if updated == live {
        debug!("{} {} is up to date", resource.kind, key);
        return Ok(Outcome::Unchanged);
    }

    debug!("Updating {} {}", resource.kind, key);
    store
        .replace(&resource, &key, &to_dynamic(&updated)?)
        .await?;
    Ok(Outcome::Updated)
}
