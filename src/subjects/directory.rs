//! Identity directory lookups backing [`super::SubjectResolver::Directory`].
//!
//! The production directory is Microsoft Entra ID queried through Microsoft Graph with an
//! application (client credentials) token.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Startup connectivity checks must complete within this window.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// tokens are refreshed this long before they actually expire
const TOKEN_EXPIRY_LEEWAY: Duration = Duration::from_secs(60);

/// Lookup of directory users by human-readable identifier
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Directory: Send + Sync {
    /// Find the object id of the first user whose mail address or principal name is exactly
    /// `identifier`. A missing user is `Ok(None)`; only a failed request is an error.
    async fn find_object_id(&self, identifier: &str) -> Result<Option<String>>;
}

/// Connection settings for a Microsoft Graph backed directory
#[derive(Clone, Debug)]
pub struct DirectoryConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub authority_host: String,
    pub graph_endpoint: String,
    pub request_timeout: Duration,
}

impl DirectoryConfig {
    /// Build a config when a tenant is configured. Empty values count as unset, and a tenant
    /// without client credentials is a configuration error.
    pub fn from_parts(
        tenant_id: Option<String>,
        client_id: Option<String>,
        client_secret: Option<String>,
        authority_host: String,
        graph_endpoint: String,
        request_timeout: Duration,
    ) -> Result<Option<Self>> {
        let non_empty = |v: Option<String>| v.filter(|v| !v.is_empty());

        let Some(tenant_id) = non_empty(tenant_id) else {
            return Ok(None);
        };
        let client_id = non_empty(client_id).ok_or_else(|| {
            Error::Config("AZURE_CLIENT_ID must be set when AZURE_TENANT_ID is set".into())
        })?;
        let client_secret = non_empty(client_secret).ok_or_else(|| {
            Error::Config("AZURE_CLIENT_SECRET must be set when AZURE_TENANT_ID is set".into())
        })?;

        Ok(Some(Self {
            tenant_id,
            client_id,
            client_secret,
            authority_host: authority_host.trim_end_matches('/').into(),
            graph_endpoint: graph_endpoint.trim_end_matches('/').into(),
            request_timeout,
        }))
    }

    fn token_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority_host, self.tenant_id)
    }

    fn users_url(&self) -> String {
        format!("{}/v1.0/users", self.graph_endpoint)
    }

    fn scope(&self) -> String {
        format!("{}/.default", self.graph_endpoint)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct UserList {
    #[serde(default)]
    value: Vec<DirectoryUser>,
}

#[derive(Deserialize)]
struct DirectoryUser {
    id: String,
}

struct CachedToken {
    access_token: String,
    refresh_at: Instant,
}

/// Microsoft Graph user directory
pub struct GraphDirectory {
    http_client: reqwest::Client,
    config: DirectoryConfig,
    token: Mutex<Option<CachedToken>>,
}

impl GraphDirectory {
    /// Create the directory client and verify the directory is reachable with the configured
    /// credentials. Fails if the probe does not succeed within [`PROBE_TIMEOUT`].
    pub async fn connect(config: DirectoryConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let directory = Self {
            http_client,
            config,
            token: Mutex::new(None),
        };

        tokio::time::timeout(PROBE_TIMEOUT, directory.probe())
            .await
            .map_err(|_| Error::Timeout(PROBE_TIMEOUT))??;

        info!(
            "Connected to the user directory of tenant {}",
            directory.config.tenant_id
        );
        Ok(directory)
    }

    async fn probe(&self) -> Result<()> {
        let token = self.access_token().await?;
        self.http_client
            .get(self.config.users_url())
            .bearer_auth(token)
            .query(&[("$top", "1"), ("$select", "id")])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.access_token.clone());
            }
        }

        debug!("Requesting a directory access token");
        let requested_at = Instant::now();
        let scope = self.config.scope();
        let response: TokenResponse = self
            .http_client
            .post(self.config.token_url())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let lifetime = Duration::from_secs(response.expires_in).saturating_sub(TOKEN_EXPIRY_LEEWAY);
        *cached = Some(CachedToken {
            access_token: response.access_token.clone(),
            refresh_at: requested_at + lifetime,
        });
        Ok(response.access_token)
    }
}

#[async_trait]
impl Directory for GraphDirectory {
    async fn find_object_id(&self, identifier: &str) -> Result<Option<String>> {
        let token = self.access_token().await?;
        let users: UserList = self
            .http_client
            .get(self.config.users_url())
            .bearer_auth(token)
            .query(&[("$filter", user_filter(identifier).as_str()), ("$select", "id")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(first_object_id(users))
    }
}

/// OData filter matching either the mail address or the principal name exactly
fn user_filter(identifier: &str) -> String {
    let literal = identifier.replace('\'', "''");
    format!("mail eq '{literal}' or userPrincipalName eq '{literal}'")
}

fn first_object_id(users: UserList) -> Option<String> {
    users.value.into_iter().next().map(|user| user.id)
}
