//! Desired state of every object derived from a Sandbox.
//!
//! Everything here is a pure function of the Sandbox; owner references are attached when the
//! objects are converged, and binding subjects are filled in by the reconciler.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Namespace, ResourceQuota, ResourceQuotaSpec, Secret};
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};

use crate::resources::sandboxes::{Sandbox, SandboxSize};
use crate::subjects::RBAC_API_GROUP;

use super::{derived_name, object_meta, sandbox_namespace};

pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
pub const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";

pub const QUOTA_SUFFIX: &str = "resourcequota";
pub const ROLE_SUFFIX: &str = "owner";
pub const ROLE_BINDING_SUFFIX: &str = "owners";
pub const CLUSTER_ROLE_SUFFIX: &str = "admin";
pub const CLUSTER_ROLE_BINDING_SUFFIX: &str = "admins";

pub fn namespace(sandbox: &Sandbox) -> Namespace {
    Namespace {
        metadata: object_meta(sandbox_namespace(&sandbox.name_any()), None),
        ..Default::default()
    }
}

/// Hard limits of a quota tier, in the order requests.cpu, limits.cpu, requests.memory,
/// limits.memory, requests.storage, persistentvolumeclaims
fn quota_limits(size: SandboxSize) -> [(&'static str, &'static str); 6] {
    match size {
        SandboxSize::Small => [
            ("requests.cpu", "0.25"),
            ("limits.cpu", "0.5"),
            ("requests.memory", "250Mi"),
            ("limits.memory", "500Mi"),
            ("requests.storage", "10Gi"),
            ("persistentvolumeclaims", "2"),
        ],
        SandboxSize::Large => [
            ("requests.cpu", "1"),
            ("limits.cpu", "2"),
            ("requests.memory", "2Gi"),
            ("limits.memory", "8Gi"),
            ("requests.storage", "40Gi"),
            ("persistentvolumeclaims", "8"),
        ],
    }
}

pub fn resource_quota(sandbox: &Sandbox) -> ResourceQuota {
    let name = sandbox.name_any();
    let hard = quota_limits(sandbox.spec.size())
        .into_iter()
        .map(|(resource, amount)| (resource.to_string(), Quantity(amount.into())))
        .collect::<BTreeMap<_, _>>();

    ResourceQuota {
        metadata: object_meta(
            derived_name(&name, QUOTA_SUFFIX),
            Some(sandbox_namespace(&name)),
        ),
        spec: Some(ResourceQuotaSpec {
            hard: Some(hard),
            ..Default::default()
        }),
        status: None,
    }
}

fn rule(verbs: &[&str], api_groups: &[&str], resources: &[&str]) -> PolicyRule {
    let strings = |values: &[&str]| Some(values.iter().map(|v| v.to_string()).collect());
    PolicyRule {
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        api_groups: strings(api_groups),
        resources: strings(resources),
        ..Default::default()
    }
}

pub fn role(sandbox: &Sandbox) -> Role {
    let name = sandbox.name_any();
    Role {
        metadata: object_meta(
            derived_name(&name, ROLE_SUFFIX),
            Some(sandbox_namespace(&name)),
        ),
        rules: Some(vec![
            rule(
                &["*"],
                &[""],
                &[
                    "pods",
                    "pods/log",
                    "pods/portforward",
                    "services",
                    "services/finalizers",
                    "endpoints",
                    "persistentvolumeclaims",
                    "events",
                    "configmaps",
                    "replicationcontrollers",
                ],
            ),
            rule(
                &["*"],
                &["apps", "extensions"],
                &["deployments", "daemonsets", "replicasets", "statefulsets"],
            ),
            rule(&["*"], &["autoscaling"], &["horizontalpodautoscalers"]),
            rule(&["*"], &["batch"], &["jobs", "cronjobs"]),
            // owners may further delegate access inside their namespace
            rule(
                &["create", "list", "get"],
                &[RBAC_API_GROUP],
                &["roles", "rolebindings"],
            ),
            rule(&["create"], &[""], &["secrets"]),
        ]),
    }
}

/// Bindings store no subjects rather than an empty list
pub fn binding_subjects(subjects: Vec<Subject>) -> Option<Vec<Subject>> {
    (!subjects.is_empty()).then_some(subjects)
}

pub fn role_binding(sandbox: &Sandbox) -> RoleBinding {
    let name = sandbox.name_any();
    RoleBinding {
        metadata: object_meta(
            derived_name(&name, ROLE_BINDING_SUFFIX),
            Some(sandbox_namespace(&name)),
        ),
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.into(),
            kind: "Role".into(),
            name: derived_name(&name, ROLE_SUFFIX),
        },
        subjects: None,
    }
}

pub fn cluster_role(sandbox: &Sandbox) -> ClusterRole {
    let name = sandbox.name_any();
    let group = Sandbox::group(&()).to_string();
    let plural = Sandbox::plural(&()).to_string();

    // one rule per verb, each limited to this very Sandbox
    let own_sandbox = |verb: &str| PolicyRule {
        verbs: vec![verb.into()],
        api_groups: Some(vec![group.clone()]),
        resources: Some(vec![plural.clone()]),
        resource_names: Some(vec![name.clone()]),
        ..Default::default()
    };

    ClusterRole {
        metadata: object_meta(derived_name(&name, CLUSTER_ROLE_SUFFIX), None),
        rules: Some(vec![own_sandbox("delete"), own_sandbox("patch")]),
        aggregation_rule: None,
    }
}

pub fn cluster_role_binding(sandbox: &Sandbox) -> ClusterRoleBinding {
    let name = sandbox.name_any();
    ClusterRoleBinding {
        metadata: object_meta(derived_name(&name, CLUSTER_ROLE_BINDING_SUFFIX), None),
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.into(),
            kind: "ClusterRole".into(),
            name: derived_name(&name, CLUSTER_ROLE_SUFFIX),
        },
        subjects: None,
    }
}

/// A copy of the configured image pull secret inside the sandbox namespace, under the same name
pub fn pull_secret(sandbox: &Sandbox, secret_name: &str, docker_config: ByteString) -> Secret {
    Secret {
        metadata: object_meta(secret_name, Some(sandbox_namespace(&sandbox.name_any()))),
        data: Some(BTreeMap::from([(
            DOCKER_CONFIG_JSON_KEY.to_string(),
            docker_config,
        )])),
        type_: Some(DOCKER_CONFIG_JSON_TYPE.into()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::sandboxes::SandboxSpec;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    fn sandbox(name: &str, size: &str) -> Sandbox {
        Sandbox::new(
            name,
            SandboxSpec {
                owners: vec![],
                size: size.into(),
            },
        )
    }

    fn hard(quota: &ResourceQuota) -> BTreeMap<String, String> {
        quota
            .spec
            .as_ref()
            .and_then(|s| s.hard.as_ref())
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.0.clone()))
            .collect()
    }

    fn table(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn names_derive_from_the_sandbox_name() {
        let sb = sandbox("test", "");
        assert_eq!(namespace(&sb).metadata.name.unwrap(), "sandbox-test");

        let quota = resource_quota(&sb);
        assert_eq!(quota.metadata.name.unwrap(), "sandbox-test-resourcequota");
        assert_eq!(quota.metadata.namespace.unwrap(), "sandbox-test");

        let role = role(&sb);
        assert_eq!(role.metadata.name.unwrap(), "sandbox-test-owner");
        assert_eq!(role.metadata.namespace.unwrap(), "sandbox-test");

        let rb = role_binding(&sb);
        assert_eq!(rb.metadata.name.unwrap(), "sandbox-test-owners");
        assert_eq!(rb.metadata.namespace.unwrap(), "sandbox-test");

        let cr = cluster_role(&sb);
        assert_eq!(cr.metadata.name.unwrap(), "sandbox-test-admin");
        assert!(cr.metadata.namespace.is_none());

        let crb = cluster_role_binding(&sb);
        assert_eq!(crb.metadata.name.unwrap(), "sandbox-test-admins");
        assert!(crb.metadata.namespace.is_none());
    }

    #[test]
    fn small_quota_is_the_default() {
        let expected = table(&[
            ("requests.cpu", "0.25"),
            ("limits.cpu", "0.5"),
            ("requests.memory", "250Mi"),
            ("limits.memory", "500Mi"),
            ("requests.storage", "10Gi"),
            ("persistentvolumeclaims", "2"),
        ]);
        for size in ["", "small", "medium", "LARGE"] {
            assert_eq!(hard(&resource_quota(&sandbox("test", size))), expected);
        }
    }

    #[test]
    fn large_quota() {
        let expected = table(&[
            ("requests.cpu", "1"),
            ("limits.cpu", "2"),
            ("requests.memory", "2Gi"),
            ("limits.memory", "8Gi"),
            ("requests.storage", "40Gi"),
            ("persistentvolumeclaims", "8"),
        ]);
        assert_eq!(hard(&resource_quota(&sandbox("test", "large"))), expected);
    }

    #[test]
    fn cluster_role_is_limited_to_the_sandbox() {
        let cr = cluster_role(&sandbox("test", ""));
        assert_json_eq!(
            serde_json::to_value(cr.rules).unwrap(),
            json!([
                {
                    "verbs": ["delete"],
                    "apiGroups": ["operators.plex.dev"],
                    "resources": ["sandboxes"],
                    "resourceNames": ["test"]
                },
                {
                    "verbs": ["patch"],
                    "apiGroups": ["operators.plex.dev"],
                    "resources": ["sandboxes"],
                    "resourceNames": ["test"]
                }
            ])
        );
    }

    #[test]
    fn role_grants_namespace_self_service() {
        let rules = role(&sandbox("test", "")).rules.unwrap();
        assert_eq!(rules.len(), 6);

        let rbac = &rules[4];
        assert_eq!(rbac.verbs, vec!["create", "list", "get"]);
        assert_eq!(rbac.api_groups, Some(vec![RBAC_API_GROUP.to_string()]));
        assert_eq!(
            rbac.resources,
            Some(vec!["roles".to_string(), "rolebindings".to_string()])
        );

        let secrets = &rules[5];
        assert_eq!(secrets.verbs, vec!["create"]);
        assert_eq!(secrets.resources, Some(vec!["secrets".to_string()]));

        assert!(rules[..4].iter().all(|r| r.verbs == vec!["*"]));
        assert!(rules[0]
            .resources
            .as_ref()
            .unwrap()
            .contains(&"pods/portforward".to_string()));
    }

    #[test]
    fn bindings_reference_their_sibling_roles() {
        let sb = sandbox("test", "");
        assert_json_eq!(
            serde_json::to_value(role_binding(&sb).role_ref).unwrap(),
            json!({"apiGroup": "rbac.authorization.k8s.io", "kind": "Role", "name": "sandbox-test-owner"})
        );
        assert_json_eq!(
            serde_json::to_value(cluster_role_binding(&sb).role_ref).unwrap(),
            json!({"apiGroup": "rbac.authorization.k8s.io", "kind": "ClusterRole", "name": "sandbox-test-admin"})
        );
        assert!(role_binding(&sb).subjects.is_none());
    }

    #[test]
    fn empty_subjects_are_omitted() {
        assert_eq!(binding_subjects(vec![]), None);
    }

    #[test]
    fn pull_secret_copies_the_payload() {
        let secret = pull_secret(
            &sandbox("test", ""),
            "registry",
            ByteString(b"{\"auths\":{}}".to_vec()),
        );
        assert_eq!(secret.metadata.name.as_deref(), Some("registry"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("sandbox-test"));
        assert_eq!(secret.type_.as_deref(), Some(DOCKER_CONFIG_JSON_TYPE));
        assert_eq!(
            secret.data.unwrap().get(DOCKER_CONFIG_JSON_KEY).unwrap().0,
            b"{\"auths\":{}}".to_vec()
        );
    }
}
