use std::collections::HashMap;
use std::future::Future;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

const METADATA_HOST: &str = "metadata.google.internal";
const SECRET_MANAGER_API: &str = "https://secretmanager.googleapis.com/v1/";

/// Fallback source for values missing from the environment.
///
/// Lookups never fail: an unreachable store reads the same as a missing
/// secret, and the caller decides whether that is fatal.
pub trait SecretStore {
    /// Fetch every id in `secret_ids`. Ids that could not be read are absent
    /// from the result.
    fn access_all(
        &self,
        secret_ids: &[&str],
    ) -> impl Future<Output = HashMap<String, String>> + Send;
}

/// Used when no project is configured.
pub struct NoSecretStore;

impl SecretStore for NoSecretStore {
    async fn access_all(&self, _secret_ids: &[&str]) -> HashMap<String, String> {
        HashMap::new()
    }
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret manager HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{what} returned HTTP {status}")]
    Status { what: &'static str, status: u16 },

    #[error("secret payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("secret payload is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("invalid secret URL: {0}")]
    Url(#[from] url::ParseError),
}

impl SecretError {
    fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct AccessResponse {
    payload: SecretPayload,
}

#[derive(Deserialize)]
struct SecretPayload {
    data: String,
}

/// Google Secret Manager over REST, authenticated with the runtime service
/// account token from the metadata server.
#[derive(Debug, Clone)]
pub struct SecretManager {
    client: reqwest::Client,
    project_id: String,
    metadata_url: Url,
    api_url: Url,
}

impl SecretManager {
    /// `None` unless a project id is present in the environment.
    pub fn from_vars(client: reqwest::Client, vars: &HashMap<String, String>) -> Option<Self> {
        let project_id = ["GOOGLE_CLOUD_PROJECT", "GCP_PROJECT"]
            .iter()
            .filter_map(|k| vars.get(*k))
            .find(|v| !v.trim().is_empty())?
            .trim()
            .to_owned();

        let host = vars
            .get("GCE_METADATA_HOST")
            .filter(|h| !h.is_empty())
            .map(String::as_str)
            .unwrap_or(METADATA_HOST);
        let metadata_url = Url::parse(&format!(
            "http://{host}/computeMetadata/v1/instance/service-accounts/default/token"
        ))
        .ok()?;
        let api_url = Url::parse(SECRET_MANAGER_API).ok()?;

        Some(Self {
            client,
            project_id,
            metadata_url,
            api_url,
        })
    }

    async fn access_token(&self) -> Result<String, SecretError> {
        let resp = self
            .client
            .get(self.metadata_url.clone())
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(SecretError::Status {
                what: "metadata server",
                status: resp.status().as_u16(),
            });
        }
        let token: TokenResponse = resp.json().await?;
        Ok(token.access_token)
    }

    async fn fetch(&self, token: &str, secret_id: &str) -> Result<String, SecretError> {
        let url = self.api_url.join(&format!(
            "projects/{}/secrets/{secret_id}/versions/latest:access",
            self.project_id
        ))?;

        let resp = self.client.get(url).bearer_auth(token).send().await?;
        if !resp.status().is_success() {
            return Err(SecretError::Status {
                what: "secret manager",
                status: resp.status().as_u16(),
            });
        }
        let body: AccessResponse = resp.json().await?;
        let bytes = BASE64.decode(body.payload.data)?;
        Ok(String::from_utf8(bytes)?)
    }
}

impl SecretStore for SecretManager {
    /// One metadata token serves the whole batch.
    async fn access_all(&self, secret_ids: &[&str]) -> HashMap<String, String> {
        let mut found = HashMap::new();
        let token = match self.access_token().await {
            Ok(token) => token,
            Err(error) => {
                warn!(%error, ?secret_ids, "secret manager unavailable, no secrets fetched");
                return found;
            }
        };

        for secret_id in secret_ids {
            match self.fetch(&token, secret_id).await {
                Ok(value) => {
                    found.insert((*secret_id).to_owned(), value);
                }
                Err(error) if error.is_not_found() => {
                    debug!(secret_id, "secret not found");
                }
                Err(error) => {
                    warn!(%error, secret_id, "secret lookup failed");
                }
            }
        }
        found
    }
}
