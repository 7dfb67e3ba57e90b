use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::resources::sandboxes::SANDBOX_PREFIX;

pub mod builder;
pub mod converge;
pub mod pull_secret;
mod quantity;

#[cfg(test)]
pub(crate) mod memory;

pub const APP_NAME_LABEL: &str = "app.kubernetes.io/name";
pub const APP_PART_OF_LABEL: &str = "app.kubernetes.io/part-of";
pub const OPERATOR_NAME: &str = "sandbox-operator";

// common_labels are applied to every object derived from a Sandbox; the controller watches its children by them
pub fn common_labels() -> BTreeMap<String, String> {
    BTreeMap::from_iter([
        (APP_NAME_LABEL.into(), OPERATOR_NAME.into()),
        (APP_PART_OF_LABEL.into(), OPERATOR_NAME.into()),
    ])
}

/// The namespace owned by the Sandbox `sandbox`
pub fn sandbox_namespace(sandbox: &str) -> String {
    format!("{SANDBOX_PREFIX}{sandbox}")
}

/// The name of a derived object: the sandbox namespace name followed by `-suffix`
pub fn derived_name(sandbox: &str, suffix: &str) -> String {
    format!("{SANDBOX_PREFIX}{sandbox}-{suffix}")
}

pub fn object_meta(name: impl Into<String>, namespace: Option<String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace,
        labels: Some(common_labels()),
        ..Default::default()
    }
}
