mod ingest;
pub mod lmv1;
mod webhook;

use std::fmt;
use std::future::Future;

use reqwest::{Client, RequestBuilder, StatusCode};
use thiserror::Error;
use tracing::debug;

use crate::config::{BackendConfig, BackendKind, DeliveryTarget};
use crate::flow_log::FlowLogRecord;

/// Longest response body excerpt kept in a delivery error.
const BODY_EXCERPT_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Expected to succeed on redelivery.
    Transient,
    /// Redelivery cannot fix it.
    Permanent,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        })
    }
}

#[derive(Debug, Error)]
#[error("{endpoint} delivery failed ({kind}): {reason}")]
pub struct DeliveryError {
    pub kind: FailureKind,
    pub endpoint: BackendKind,
    /// Set when the portal answered.
    pub status: Option<u16>,
    pub reason: String,
}

impl DeliveryError {
    fn permanent(endpoint: BackendKind, reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            endpoint,
            status: None,
            reason: reason.into(),
        }
    }

    fn from_transport(endpoint: BackendKind, err: reqwest::Error) -> Self {
        // A request that could not even be built will not build next time either.
        let kind = if err.is_builder() {
            FailureKind::Permanent
        } else {
            FailureKind::Transient
        };
        let reason = if err.is_timeout() {
            format!("request timed out: {err}")
        } else {
            format!("request failed: {err}")
        };
        Self {
            kind,
            endpoint,
            status: None,
            reason,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub status: u16,
    /// Size of the forwarded request body.
    pub bytes: usize,
    pub endpoint: BackendKind,
}

/// `None` means the portal accepted the record.
pub fn classify_status(status: StatusCode) -> Option<FailureKind> {
    match status.as_u16() {
        200..=299 => None,
        429 | 500 | 502 | 503 | 504 => Some(FailureKind::Transient),
        _ => Some(FailureKind::Permanent),
    }
}

pub trait Deliver {
    fn deliver(
        &self,
        record: &FlowLogRecord,
        target: &DeliveryTarget,
    ) -> impl Future<Output = Result<DeliveryOutcome, DeliveryError>> + Send;
}

/// Delivers over HTTPS to a LogicMonitor portal. The wrapped client carries
/// the request timeout; it holds no per-record state.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
}

/// An outbound request, ready to send.
struct Prepared {
    request: RequestBuilder,
    bytes: usize,
}

impl HttpBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn send(
        &self,
        endpoint: BackendKind,
        prepared: Prepared,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let resp = prepared
            .request
            .send()
            .await
            .map_err(|e| DeliveryError::from_transport(endpoint, e))?;

        let status = resp.status();
        match classify_status(status) {
            None => {
                debug!(%endpoint, status = status.as_u16(), "portal accepted record");
                Ok(DeliveryOutcome {
                    status: status.as_u16(),
                    bytes: prepared.bytes,
                    endpoint,
                })
            }
            Some(kind) => {
                let body = resp.text().await.unwrap_or_default();
                Err(DeliveryError {
                    kind,
                    endpoint,
                    status: Some(status.as_u16()),
                    reason: format!("portal answered {status}: {}", excerpt(&body)),
                })
            }
        }
    }
}

impl Deliver for HttpBackend {
    async fn deliver(
        &self,
        record: &FlowLogRecord,
        target: &DeliveryTarget,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let endpoint = target.kind();
        let prepared = match &target.backend {
            BackendConfig::Webhook { bearer_token } => {
                webhook::prepare(&self.client, record, target, bearer_token)?
            }
            BackendConfig::IngestApi {
                access_id,
                access_key,
            } => ingest::prepare(&self.client, record, target, access_id, access_key)?,
        };
        self.send(endpoint, prepared).await
    }
}

fn excerpt(body: &str) -> &str {
    let body = body.trim();
    if body.len() <= BODY_EXCERPT_LEN {
        return body;
    }
    let mut end = BODY_EXCERPT_LEN;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
