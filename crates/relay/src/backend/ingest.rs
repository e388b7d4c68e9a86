use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{Map, Value, json};
use url::Url;

use super::{DeliveryError, Prepared, lmv1};
use crate::config::{BackendKind, DeliveryTarget};
use crate::flow_log::FlowLogRecord;

const ENDPOINT: BackendKind = BackendKind::IngestApi;

/// Path that gets signed; the URL itself lives under `/rest`.
const RESOURCE_PATH: &str = "/log/ingest";

pub(super) fn endpoint_url(base: &Url) -> Result<Url, DeliveryError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| DeliveryError::permanent(ENDPOINT, format!("{base} cannot be a base URL")))?
        .pop_if_empty()
        .extend(["rest", "log", "ingest"]);
    Ok(url)
}

/// One Logs Ingest API entry: a summary line, the resource mapping when a
/// VM is known, and the flat flow attributes as metadata.
pub(super) fn entry(record: &FlowLogRecord, source_name: &str) -> Map<String, Value> {
    let mut entry = Map::new();
    entry.insert("msg".into(), record.to_string().into());
    if let Some(host) = record.resource_hostname() {
        entry.insert("_lm.resourceId".into(), json!({ "system.hostname": host }));
    }
    if let Some(ts) = &record.timestamp {
        entry.insert("timestamp".into(), ts.clone().into());
    }
    entry.insert("log_source".into(), source_name.into());
    entry.extend(record.attributes());
    entry
}

pub(super) fn prepare(
    client: &Client,
    record: &FlowLogRecord,
    target: &DeliveryTarget,
    access_id: &str,
    access_key: &str,
) -> Result<Prepared, DeliveryError> {
    let url = endpoint_url(&target.base_url)?;
    let body = serde_json::to_vec(&[entry(record, &target.source_name)])
        .map_err(|e| DeliveryError::permanent(ENDPOINT, format!("failed to encode record: {e}")))?;
    let bytes = body.len();

    let auth = lmv1::authorization(
        access_id,
        access_key,
        "POST",
        lmv1::epoch_millis(),
        &body,
        RESOURCE_PATH,
    );

    let request = client
        .post(url)
        .header(AUTHORIZATION, auth)
        .header(CONTENT_TYPE, "application/json")
        .header("X-Version", "3")
        .body(body);

    Ok(Prepared { request, bytes })
}
