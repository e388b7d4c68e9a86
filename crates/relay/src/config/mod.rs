use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::secrets::SecretStore;

const DEFAULT_DOMAIN: &str = "logicmonitor.com";
const DEFAULT_SOURCE_NAME: &str = "GCP-VPC-FlowLogs";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} is required but not set")]
    Missing(&'static str),

    #[error("{0} is set but blank")]
    Blank(&'static str),

    #[error("{0} has invalid value: {1}")]
    InvalidNumeric(String, String),

    #[error("portal URL is not valid: {0}")]
    InvalidUrl(String),
}

/// Startup settings for the push listener. Read once.
#[derive(Debug)]
pub struct ServiceConfig {
    pub port: u16,
    pub request_timeout: Duration,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::parse(&env_snapshot())
    }

    fn parse(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Ok(Self {
            port: parse_port(vars, "PORT", 8080)?,
            request_timeout: parse_duration_ms(vars, "FLOWLOG_RELAY_REQUEST_TIMEOUT_MS", 10_000)?,
        })
    }
}

pub fn env_snapshot() -> HashMap<String, String> {
    env::vars().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Webhook,
    IngestApi,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::IngestApi => "ingest_api",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials of the selected backend.
#[derive(Clone, PartialEq)]
pub enum BackendConfig {
    Webhook { bearer_token: String },
    IngestApi { access_id: String, access_key: String },
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Webhook { .. } => BackendKind::Webhook,
            Self::IngestApi { .. } => BackendKind::IngestApi,
        }
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Webhook { .. } => f
                .debug_struct("Webhook")
                .field("bearer_token", &"<redacted>")
                .finish(),
            Self::IngestApi { access_id, .. } => f
                .debug_struct("IngestApi")
                .field("access_id", access_id)
                .field("access_key", &"<redacted>")
                .finish(),
        }
    }
}

/// Where and how one invocation delivers its record.
///
/// Resolved from scratch on every invocation; credentials may rotate
/// between invocations and instances are not guaranteed to be reused.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryTarget {
    /// `https://{portal}.{domain}` unless overridden.
    pub base_url: Url,
    pub source_name: String,
    pub backend: BackendConfig,
}

impl DeliveryTarget {
    pub async fn resolve<S: SecretStore>(
        vars: &HashMap<String, String>,
        secrets: &S,
    ) -> Result<Self, ConfigError> {
        let use_webhook = parse_bool(vars, "USE_WEBHOOK");
        let wanted: &[(&'static str, &'static str)] = if use_webhook {
            &[COMPANY, BEARER_TOKEN]
        } else {
            &[COMPANY, ACCESS_ID, ACCESS_KEY]
        };

        // One round trip to the store for everything the environment lacks.
        let missing: Vec<&str> = wanted
            .iter()
            .filter(|(name, _)| non_blank(vars.get(*name)).is_none())
            .map(|(_, secret_id)| *secret_id)
            .collect();
        let fetched = if missing.is_empty() {
            HashMap::new()
        } else {
            secrets.access_all(&missing).await
        };
        let lookup = Lookup { vars, fetched };

        let company = lookup.require(COMPANY)?;
        let base_url = parse_base_url(vars, &company)?;

        let source_name = match vars.get("WEBHOOK_SOURCE_NAME") {
            None => DEFAULT_SOURCE_NAME.to_owned(),
            Some(s) if s.trim().is_empty() => return Err(ConfigError::Blank("WEBHOOK_SOURCE_NAME")),
            Some(s) => s.trim().to_owned(),
        };

        let backend = if use_webhook {
            BackendConfig::Webhook {
                bearer_token: lookup.require(BEARER_TOKEN)?,
            }
        } else {
            BackendConfig::IngestApi {
                access_id: lookup.require(ACCESS_ID)?,
                access_key: lookup.require(ACCESS_KEY)?,
            }
        };

        Ok(Self {
            base_url,
            source_name,
            backend,
        })
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }
}

/// Variable name and the secret id it falls back to.
const COMPANY: (&str, &str) = ("LM_COMPANY_NAME", "lm-company-name");
const BEARER_TOKEN: (&str, &str) = ("LM_BEARER_TOKEN", "lm-bearer-token");
const ACCESS_ID: (&str, &str) = ("LM_ACCESS_ID", "lm-access-id");
const ACCESS_KEY: (&str, &str) = ("LM_ACCESS_KEY", "lm-access-key");

struct Lookup<'a> {
    vars: &'a HashMap<String, String>,
    fetched: HashMap<String, String>,
}

impl Lookup<'_> {
    /// Environment first, then the fetched secrets. Blank counts as unset.
    fn require(&self, (name, secret_id): (&'static str, &str)) -> Result<String, ConfigError> {
        non_blank(self.vars.get(name))
            .or_else(|| non_blank(self.fetched.get(secret_id)))
            .ok_or(ConfigError::Missing(name))
    }
}

fn non_blank(value: Option<&String>) -> Option<String> {
    value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

fn parse_base_url(vars: &HashMap<String, String>, company: &str) -> Result<Url, ConfigError> {
    let raw = match non_blank(vars.get("LM_BASE_URL")) {
        Some(url) => url,
        None => {
            let domain = non_blank(vars.get("LM_COMPANY_DOMAIN"))
                .unwrap_or_else(|| DEFAULT_DOMAIN.to_owned());
            format!("https://{company}.{domain}")
        }
    };
    match Url::parse(&raw) {
        Ok(url) if !url.cannot_be_a_base() => Ok(url),
        _ => Err(ConfigError::InvalidUrl(raw)),
    }
}

fn parse_bool(vars: &HashMap<String, String>, name: &str) -> bool {
    vars.get(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

fn parse_port(
    vars: &HashMap<String, String>,
    name: &str,
    default: u16,
) -> Result<u16, ConfigError> {
    match vars.get(name) {
        Some(val) => val
            .parse()
            .map_err(|_| ConfigError::InvalidNumeric(name.to_owned(), val.clone())),
        None => Ok(default),
    }
}

fn parse_duration_ms(
    vars: &HashMap<String, String>,
    name: &str,
    default_ms: u64,
) -> Result<Duration, ConfigError> {
    match vars.get(name) {
        Some(val) => {
            let ms: u64 = val
                .parse()
                .ok()
                .filter(|ms| *ms > 0)
                .ok_or_else(|| ConfigError::InvalidNumeric(name.to_owned(), val.clone()))?;
            Ok(Duration::from_millis(ms))
        }
        None => Ok(Duration::from_millis(default_ms)),
    }
}
