use std::sync::Arc;

use k8s_openapi::api::rbac::v1::Subject;
use tracing::{debug, warn};

use crate::{Error, Result};

pub mod directory;

pub use directory::{Directory, DirectoryConfig, GraphDirectory};

pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

pub fn user_subject(name: impl Into<String>) -> Subject {
    Subject {
        api_group: Some(RBAC_API_GROUP.into()),
        kind: "User".into(),
        name: name.into(),
        namespace: None,
    }
}

/// Translates the owners of a Sandbox into the subjects of its role bindings.
///
/// The variant is chosen once at startup and handed to the reconciler; it is never re-read from
/// the environment.
#[derive(Clone)]
pub enum SubjectResolver {
    /// Every owner is used verbatim as a `User` subject and resolution never fails.
    Passthrough,
    /// Owners are looked up in an identity directory and bound by their directory object id.
    Directory(Arc<dyn Directory>),
}

impl SubjectResolver {
    /// Resolve owners to subjects, preserving the order of `owners`.
    ///
    /// For the directory variant an owner with no directory entry is logged and left out,
    /// whereas a failed directory request fails the whole call.
    pub async fn resolve(&self, owners: &[String]) -> Result<Vec<Subject>> {
        match self {
            SubjectResolver::Passthrough => Ok(owners.iter().map(user_subject).collect()),
            SubjectResolver::Directory(directory) => {
                let mut subjects = Vec::with_capacity(owners.len());
                for owner in owners {
                    let found = directory.find_object_id(owner).await.map_err(|e| {
                        Error::SubjectResolution(format!("looking up {owner}: {e}"))
                    })?;
                    match found {
                        Some(object_id) => {
                            debug!("Resolved owner {} to directory object {}", owner, object_id);
                            subjects.push(user_subject(object_id));
                        }
                        None => warn!("{} could not be found in the directory", owner),
                    }
                }
                Ok(subjects)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SubjectResolver::Passthrough => "passthrough",
            SubjectResolver::Directory(_) => "directory",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::directory::MockDirectory;
    use super::*;

    fn owners(owners: &[&str]) -> Vec<String> {
        owners.iter().map(|o| o.to_string()).collect()
    }

    #[tokio::test]
    async fn passthrough_keeps_owners_verbatim_and_in_order() {
        let subjects = SubjectResolver::Passthrough
            .resolve(&owners(&["foo", "bar@example.com"]))
            .await
            .unwrap();

        assert_eq!(
            subjects,
            vec![user_subject("foo"), user_subject("bar@example.com")]
        );
        assert_eq!(subjects[0].kind, "User");
        assert_eq!(subjects[0].api_group.as_deref(), Some(RBAC_API_GROUP));
    }

    #[tokio::test]
    async fn passthrough_of_no_owners_is_empty() {
        let subjects = SubjectResolver::Passthrough.resolve(&[]).await.unwrap();
        assert!(subjects.is_empty());
    }

    #[tokio::test]
    async fn directory_skips_owners_without_an_entry() {
        let mut directory = MockDirectory::new();
        directory
            .expect_find_object_id()
            .times(2)
            .returning(|identifier| match identifier {
                "known@x.com" => Ok(Some("6f1d0c5e-known".to_string())),
                _ => Ok(None),
            });
        let resolver = SubjectResolver::Directory(Arc::new(directory));

        let subjects = resolver
            .resolve(&owners(&["known@x.com", "ghost@x.com"]))
            .await
            .unwrap();

        assert_eq!(subjects, vec![user_subject("6f1d0c5e-known")]);
    }

    #[tokio::test]
    async fn directory_preserves_owner_order() {
        let mut directory = MockDirectory::new();
        directory
            .expect_find_object_id()
            .returning(|identifier| Ok(Some(format!("id-{identifier}"))));
        let resolver = SubjectResolver::Directory(Arc::new(directory));

        let subjects = resolver.resolve(&owners(&["b", "a", "c"])).await.unwrap();

        let names: Vec<&str> = subjects.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["id-b", "id-a", "id-c"]);
    }

    #[tokio::test]
    async fn directory_failure_fails_the_batch() {
        let mut directory = MockDirectory::new();
        directory
            .expect_find_object_id()
            .returning(|_| Err(Error::Timeout(std::time::Duration::from_secs(5))));
        let resolver = SubjectResolver::Directory(Arc::new(directory));

        let result = resolver.resolve(&owners(&["known@x.com"])).await;

        assert!(matches!(result, Err(Error::SubjectResolution(_))));
    }
}
