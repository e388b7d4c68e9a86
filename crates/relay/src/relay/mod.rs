use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use crate::backend::{Deliver, DeliveryError, DeliveryOutcome};
use crate::config::{self, ConfigError, DeliveryTarget};
use crate::envelope::{DeliveryEnvelope, EnvelopeError};
use crate::flow_log::{ExtractError, FlowLogRecord};
use crate::reporter::{self, Invocation, Stage};
use crate::secrets::SecretStore;

#[derive(Debug, Error)]
pub enum MalformedPayload {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Fields(#[from] ExtractError),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] MalformedPayload),

    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl RelayError {
    /// Whether the delivery system should redeliver the envelope.
    ///
    /// Configuration errors are retried too: they are deployment defects
    /// that get fixed out of band, and the message is still good.
    pub fn should_redeliver(&self) -> bool {
        match self {
            Self::MalformedPayload(_) => false,
            Self::Configuration(_) => true,
            Self::Delivery(e) => e.is_transient(),
        }
    }
}

type VarsSource = Box<dyn Fn() -> HashMap<String, String> + Send + Sync>;

/// Runs one envelope through decode, extract, resolve and deliver.
///
/// Holds nothing that changes between invocations: configuration is
/// re-read from `vars` for every envelope.
pub struct Relay<D, S> {
    backend: D,
    secrets: S,
    vars: VarsSource,
}

impl<D: Deliver + Sync, S: SecretStore + Sync> Relay<D, S> {
    pub fn new(backend: D, secrets: S) -> Self {
        Self {
            backend,
            secrets,
            vars: Box::new(config::env_snapshot),
        }
    }

    /// Replace where per-invocation configuration is read from.
    pub fn with_vars<F>(mut self, vars: F) -> Self
    where
        F: Fn() -> HashMap<String, String> + Send + Sync + 'static,
    {
        self.vars = Box::new(vars);
        self
    }

    /// Process one push body and emit its completion record.
    pub async fn handle(&self, body: &[u8]) -> Result<DeliveryOutcome, RelayError> {
        let mut inv = Invocation::default();
        let result = self.process(body, &mut inv).await;
        reporter::report(&inv, &result);
        result
    }

    async fn process(
        &self,
        body: &[u8],
        inv: &mut Invocation,
    ) -> Result<DeliveryOutcome, RelayError> {
        inv.enter(Stage::Received);
        let envelope = DeliveryEnvelope::from_push_body(body).map_err(MalformedPayload::from)?;
        inv.message_id = envelope.message_id.clone();
        inv.delivery_attempt = envelope.delivery_attempt;

        inv.enter(Stage::Decoding);
        let entry = envelope.decode().map_err(MalformedPayload::from)?;

        inv.enter(Stage::Extracting);
        let record = FlowLogRecord::from_log_entry(&entry).map_err(MalformedPayload::from)?;
        inv.src_ip = Some(record.connection.src_ip.clone());
        inv.dest_ip = Some(record.connection.dest_ip.clone());
        inv.bytes_sent = Some(record.bytes_sent);

        inv.enter(Stage::Resolving);
        let target = DeliveryTarget::resolve(&(self.vars)(), &self.secrets).await?;
        inv.endpoint = Some(target.kind());
        debug!(endpoint = %target.kind(), url = %target.base_url, "resolved delivery target");

        inv.enter(Stage::Delivering);
        match self.backend.deliver(&record, &target).await {
            Ok(outcome) => {
                inv.enter(Stage::Succeeded);
                Ok(outcome)
            }
            Err(e) => {
                inv.enter(if e.is_transient() {
                    Stage::FailedTransient
                } else {
                    Stage::FailedPermanent
                });
                Err(e.into())
            }
        }
    }
}
