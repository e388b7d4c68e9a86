use std::fmt;

use tracing::{error, info, warn};

use crate::backend::{DeliveryOutcome, FailureKind};
use crate::config::BackendKind;
use crate::relay::RelayError;

/// Per-invocation pipeline states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Decoding,
    Extracting,
    Resolving,
    Delivering,
    Succeeded,
    FailedPermanent,
    FailedTransient,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Decoding => "decoding",
            Self::Extracting => "extracting",
            Self::Resolving => "resolving",
            Self::Delivering => "delivering",
            Self::Succeeded => "succeeded",
            Self::FailedPermanent => "failed_permanent",
            Self::FailedTransient => "failed_transient",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one invocation learned before it finished, for the completion record.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub message_id: Option<String>,
    pub delivery_attempt: Option<u32>,
    pub src_ip: Option<String>,
    pub dest_ip: Option<String>,
    pub bytes_sent: Option<u64>,
    pub endpoint: Option<BackendKind>,
    /// Last stage entered.
    pub stage: Option<Stage>,
}

impl Invocation {
    pub fn enter(&mut self, stage: Stage) {
        self.stage = Some(stage);
    }

    pub fn stage(&self) -> Stage {
        self.stage.unwrap_or(Stage::Received)
    }
}

/// Short label for the completion record's `result` field.
pub fn result_label(result: &Result<DeliveryOutcome, RelayError>) -> &'static str {
    match result {
        Ok(_) => "succeeded",
        Err(RelayError::MalformedPayload(_)) => "malformed",
        Err(RelayError::Configuration(_)) => "config_error",
        Err(RelayError::Delivery(e)) => match e.kind {
            FailureKind::Transient => "failed_transient",
            FailureKind::Permanent => "failed_permanent",
        },
    }
}

/// Emit the single completion record for an invocation.
pub fn report(inv: &Invocation, result: &Result<DeliveryOutcome, RelayError>) {
    let result_label = result_label(result);
    let stage = inv.stage().as_str();
    let message_id = inv.message_id.as_deref().unwrap_or("?");
    let src_ip = inv.src_ip.as_deref().unwrap_or("?");
    let dest_ip = inv.dest_ip.as_deref().unwrap_or("?");
    let endpoint = inv.endpoint.map(|e| e.as_str()).unwrap_or("?");
    let attempt = inv.delivery_attempt.unwrap_or(0);
    let bytes_sent = inv.bytes_sent.unwrap_or(0);

    match result {
        Ok(outcome) => info!(
            result = result_label,
            stage,
            message_id,
            attempt,
            src_ip,
            dest_ip,
            bytes_sent,
            endpoint,
            status = outcome.status,
            forwarded_bytes = outcome.bytes,
            success = true,
            "processed flow log"
        ),
        Err(err @ RelayError::MalformedPayload(_)) => warn!(
            result = result_label,
            stage,
            message_id,
            attempt,
            success = false,
            error = %err,
            "dropping malformed message"
        ),
        Err(err @ RelayError::Configuration(_)) => error!(
            result = result_label,
            stage,
            message_id,
            attempt,
            src_ip,
            dest_ip,
            success = false,
            error = %err,
            "relay is misconfigured; every message will fail until fixed"
        ),
        Err(RelayError::Delivery(err)) => error!(
            result = result_label,
            stage,
            message_id,
            attempt,
            src_ip,
            dest_ip,
            bytes_sent,
            endpoint,
            status = err.status.unwrap_or(0),
            success = false,
            error = %err,
            "{}",
            match err.kind {
                FailureKind::Transient => "delivery failed, leaving it to redelivery",
                FailureKind::Permanent => "delivery rejected, dropping message",
            }
        ),
    }
}
