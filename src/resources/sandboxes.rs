use std::borrow::Cow;

use kube::CustomResource;
use schemars::schema::{Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Prefix shared by the namespace and every other object derived from a Sandbox
pub const SANDBOX_PREFIX: &str = "sandbox-";

/// Represents a request for an isolated, quota-bound namespace
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "Sandbox",
    group = "operators.plex.dev",
    version = "v1alpha1",
    schema = "manual",
    printcolumn = r#"{"name":"Size", "type":"string", "jsonPath":".spec.size"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "SandboxStatus", shortname = "sb")]
#[serde(rename_all = "camelCase")]
pub struct SandboxSpec {
    /// Emails or principal names of the users who administer this sandbox. Each owner is bound
    /// to a Role in the sandbox namespace and may delete or patch this Sandbox.
    #[serde(default)]
    pub owners: Vec<String>,
    /// The quota tier of the sandbox namespace, `small` or `large`. Anything other than `large`
    /// is treated as `small`.
    #[serde(default)]
    pub size: String,
}

/// Status of the Sandbox. Currently reserved.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SandboxStatus {}

// Hoisted from the derived implementation so that we can restrict names to those that leave room for the namespace prefix
impl schemars::JsonSchema for Sandbox {
    fn schema_name() -> String {
        "Sandbox".to_owned()
    }
    fn schema_id() -> Cow<'static, str> {
        "sandbox_operator::resources::sandboxes::Sandbox".into()
    }
    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> Schema {
        let mut schema_object = SchemaObject {
            instance_type: Some(schemars::schema::InstanceType::Object.into()),
            metadata: Some(Box::new(schemars::schema::Metadata {
                description: Some(
                    "Sandbox describes an isolated namespace along with the users that own it."
                        .to_owned(),
                ),
                ..Default::default()
            })),
            ..Default::default()
        };
        let object_validation = schema_object.object();

        object_validation.properties.insert(
            "metadata".to_owned(),
            serde_json::from_value(json!({
                "type": "object",
                "properties": {
                    "name": {
                        "type": "string",
                        "minLength": 1,
                        "maxLength": (63 - SANDBOX_PREFIX.len()),
                        "pattern": "^[a-z0-9]([-a-z0-9]*[a-z0-9])?$",
                    }
                }
            }))
            .unwrap(),
        );
        object_validation.required.insert("metadata".to_owned());

        object_validation
            .properties
            .insert("spec".to_owned(), gen.subschema_for::<SandboxSpec>());
        object_validation.required.insert("spec".to_owned());

        object_validation.properties.insert(
            "status".to_owned(),
            gen.subschema_for::<Option<SandboxStatus>>(),
        );
        Schema::Object(schema_object)
    }
}

/// The quota tier requested by a Sandbox
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxSize {
    Small,
    Large,
}

impl SandboxSize {
    /// Only the exact literal `large` selects the large tier.
    pub fn from_spec(size: &str) -> Self {
        if size == "large" {
            SandboxSize::Large
        } else {
            SandboxSize::Small
        }
    }
}

impl SandboxSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxSize::Small => "small",
            SandboxSize::Large => "large",
        }
    }
}

impl SandboxSpec {
    pub fn size(&self) -> SandboxSize {
        SandboxSize::from_spec(&self.size)
    }
}
