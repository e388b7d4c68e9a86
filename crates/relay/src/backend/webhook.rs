use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use url::Url;

use super::{DeliveryError, Prepared};
use crate::config::{BackendKind, DeliveryTarget};
use crate::flow_log::FlowLogRecord;

const ENDPOINT: BackendKind = BackendKind::Webhook;

pub(super) fn endpoint_url(base: &Url, source_name: &str) -> Result<Url, DeliveryError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| DeliveryError::permanent(ENDPOINT, format!("{base} cannot be a base URL")))?
        .pop_if_empty()
        .extend(["rest", "api", "v1", "webhook", "ingest", source_name]);
    Ok(url)
}

/// The body is the flow log's `jsonPayload`, untouched; field mapping
/// happens in the portal's webhook log source.
pub(super) fn prepare(
    client: &Client,
    record: &FlowLogRecord,
    target: &DeliveryTarget,
    bearer_token: &str,
) -> Result<Prepared, DeliveryError> {
    let url = endpoint_url(&target.base_url, &target.source_name)?;
    let body = serde_json::to_vec(&record.raw)
        .map_err(|e| DeliveryError::permanent(ENDPOINT, format!("failed to encode record: {e}")))?;
    let bytes = body.len();

    let request = client
        .post(url)
        .bearer_auth(bearer_token)
        .header(CONTENT_TYPE, "application/json")
        .body(body);

    Ok(Prepared { request, bytes })
}
