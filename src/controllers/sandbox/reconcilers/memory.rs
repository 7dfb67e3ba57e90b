//! In-memory [`ObjectStore`] for tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject};
use kube::error::ErrorResponse;
use kube::Resource;
use serde::Serialize;
use serde_json::Value;

use super::converge::{to_dynamic, ObjectKey, ObjectStore};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Get,
    Create,
    Replace,
    Patch,
}

type StoreKey = (String, Option<String>, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<StoreKey, Value>,
    failures: Vec<(String, Operation)>,
    writes: usize,
    next_version: u64,
}

/// Keeps objects as JSON, keyed by kind, namespace and name. Writes bump resourceVersion and
/// a replace with a stale resourceVersion is rejected with a conflict.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn store_key(resource: &ApiResource, key: &ObjectKey) -> StoreKey {
    (resource.kind.clone(), key.namespace.clone(), key.name.clone())
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message,
        reason: reason.into(),
        code,
    }))
}

// Strategic merge as far as the tests need it: lists of named objects merge by name
fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (k, v) in patch {
                if v.is_null() {
                    target.remove(k);
                } else {
                    merge(target.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        (Value::Array(target), Value::Array(patch))
            if patch.iter().all(|p| p.get("name").is_some()) =>
        {
            for p in patch {
                match target.iter_mut().find(|t| t.get("name") == p.get("name")) {
                    Some(existing) => merge(existing, p),
                    None => target.push(p.clone()),
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

impl MemoryStore {
    /// Seed an object as if something outside the operator had created it
    pub fn insert<K: Resource<DynamicType = ()> + Serialize>(&self, obj: &K) {
        let resource = ApiResource::erase::<K>(&());
        let key = ObjectKey::of(obj).unwrap();
        let mut inner = self.inner.lock().unwrap();
        inner.next_version += 1;
        let mut value = serde_json::to_value(to_dynamic(obj).unwrap()).unwrap();
        value["metadata"]["resourceVersion"] = Value::String(inner.next_version.to_string());
        inner.objects.insert(store_key(&resource, &key), value);
    }

    /// Make the next `operation` on `kind` fail with an internal server error
    pub fn fail_next(&self, kind: &str, operation: Operation) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .push((kind.to_string(), operation));
    }

    /// Number of successful create, replace and patch calls so far
    pub fn writes(&self) -> usize {
        self.inner.lock().unwrap().writes
    }

    /// Number of stored objects of `kind`
    pub fn count(&self, kind: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .objects
            .keys()
            .filter(|(k, _, _)| k == kind)
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().objects.len()
    }

    fn check_failure(
        inner: &mut Inner,
        resource: &ApiResource,
        operation: Operation,
    ) -> Result<()> {
        if let Some(position) = inner
            .failures
            .iter()
            .position(|(kind, op)| *kind == resource.kind && *op == operation)
        {
            inner.failures.remove(position);
            return Err(api_error(
                500,
                "InternalError",
                format!("injected {operation:?} failure for {}", resource.kind),
            ));
        }
        Ok(())
    }

    fn write(inner: &mut Inner, key: StoreKey, mut value: Value) -> Result<DynamicObject> {
        inner.next_version += 1;
        inner.writes += 1;
        value["metadata"]["resourceVersion"] = Value::String(inner.next_version.to_string());
        inner.objects.insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, resource: &ApiResource, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_failure(&mut inner, resource, Operation::Get)?;
        inner
            .objects
            .get(&store_key(resource, key))
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(Error::from)
    }

    async fn create(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_failure(&mut inner, resource, Operation::Create)?;
        let store_key = store_key(resource, key);
        if inner.objects.contains_key(&store_key) {
            return Err(api_error(409, "AlreadyExists", format!("{key} already exists")));
        }
        let mut value = serde_json::to_value(obj)?;
        value["metadata"]["uid"] = Value::String(format!("uid-{key}"));
        Self::write(&mut inner, store_key, value)
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_failure(&mut inner, resource, Operation::Replace)?;
        let store_key = store_key(resource, key);
        let Some(live) = inner.objects.get(&store_key) else {
            return Err(api_error(404, "NotFound", format!("{key} not found")));
        };
        if live["metadata"]["resourceVersion"].as_str() != obj.metadata.resource_version.as_deref()
        {
            return Err(api_error(409, "Conflict", format!("{key} has been modified")));
        }
        let value = serde_json::to_value(obj)?;
        Self::write(&mut inner, store_key, value)
    }

    async fn patch_strategic(
        &self,
        resource: &ApiResource,
        key: &ObjectKey,
        patch: &Value,
    ) -> Result<DynamicObject> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_failure(&mut inner, resource, Operation::Patch)?;
        let store_key = store_key(resource, key);
        let Some(mut value) = inner.objects.get(&store_key).cloned() else {
            return Err(api_error(404, "NotFound", format!("{key} not found")));
        };
        merge(&mut value, patch);
        Self::write(&mut inner, store_key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_unions_named_lists() {
        let mut target = json!({
            "metadata": {"name": "default"},
            "imagePullSecrets": [{"name": "a"}]
        });
        merge(
            &mut target,
            &json!({"imagePullSecrets": [{"name": "b"}, {"name": "a"}]}),
        );
        assert_eq!(
            target,
            json!({
                "metadata": {"name": "default"},
                "imagePullSecrets": [{"name": "a"}, {"name": "b"}]
            })
        );
    }
}
