//! LogicMonitor `LMv1` request signing.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// `base64(hex(HMAC-SHA256(key, method + epoch + body + resource_path)))`
pub fn signature(
    access_key: &str,
    method: &str,
    epoch_ms: u128,
    body: &[u8],
    resource_path: &str,
) -> String {
    let mut mac =
        HmacSha256::new_from_slice(access_key.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(method.as_bytes());
    mac.update(epoch_ms.to_string().as_bytes());
    mac.update(body);
    mac.update(resource_path.as_bytes());
    BASE64.encode(hex::encode(mac.finalize().into_bytes()))
}

/// Complete `Authorization` header value.
pub fn authorization(
    access_id: &str,
    access_key: &str,
    method: &str,
    epoch_ms: u128,
    body: &[u8],
    resource_path: &str,
) -> String {
    let sig = signature(access_key, method, epoch_ms, body, resource_path);
    format!("LMv1 {access_id}:{sig}:{epoch_ms}")
}
