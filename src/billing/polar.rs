//! Polar webhook decoding and signature verification.
//!
//! Polar signs deliveries with the Standard Webhooks scheme:
//! - `webhook-id`, `webhook-timestamp`, `webhook-signature` headers
//! - signed content is `"{id}.{timestamp}.{body}"`
//! - HMAC-SHA256 keyed by the UTF-8 bytes of the endpoint secret
//! - signature header is a space-separated list of `v1,<base64>` entries

use super::reconcile::OrderPaid;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Maximum clock skew accepted on `webhook-timestamp` (seconds).
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub const HEADER_ID: &str = "webhook-id";
pub const HEADER_TIMESTAMP: &str = "webhook-timestamp";
pub const HEADER_SIGNATURE: &str = "webhook-signature";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("malformed webhook-timestamp")]
    InvalidTimestamp,
    #[error("webhook-timestamp outside tolerance")]
    StaleTimestamp,
    #[error("no matching signature")]
    Mismatch,
}

/// The signing headers of one delivery.
#[derive(Debug, Clone, Copy)]
pub struct SignedHeaders<'a> {
    pub id: Option<&'a str>,
    pub timestamp: Option<&'a str>,
    pub signature: Option<&'a str>,
}

fn mac_for(secret: &str, id: &str, timestamp: &str, body: &[u8]) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(id.as_bytes());
    mac.update(b".");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    Some(mac)
}

/// Verify a delivery against the endpoint secret at time `now` (epoch seconds).
pub fn verify_signature(
    secret: &str,
    headers: SignedHeaders<'_>,
    body: &[u8],
    now: i64,
) -> Result<(), SignatureError> {
    let id = headers
        .id
        .filter(|v| !v.is_empty())
        .ok_or(SignatureError::MissingHeader(HEADER_ID))?;
    let timestamp = headers
        .timestamp
        .filter(|v| !v.is_empty())
        .ok_or(SignatureError::MissingHeader(HEADER_TIMESTAMP))?;
    let signature = headers
        .signature
        .filter(|v| !v.is_empty())
        .ok_or(SignatureError::MissingHeader(HEADER_SIGNATURE))?;

    let sent_at: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| SignatureError::InvalidTimestamp)?;
    if now.abs_diff(sent_at) > SIGNATURE_TOLERANCE_SECS.unsigned_abs() {
        return Err(SignatureError::StaleTimestamp);
    }

    let mac = mac_for(secret, id, timestamp, body).ok_or(SignatureError::Mismatch)?;
    let matched = signature
        .split_whitespace()
        .filter_map(|entry| entry.strip_prefix("v1,"))
        .filter_map(|encoded| BASE64.decode(encoded).ok())
        .any(|candidate| mac.clone().verify_slice(&candidate).is_ok());

    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

// ── Payloads ─────────────────────────────────────────────────────

/// Envelope of every Polar webhook delivery.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Order object carried by `order.paid`.
#[derive(Debug, Clone, Deserialize)]
pub struct PolarOrder {
    pub id: String,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub customer: Option<PolarCustomer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolarCustomer {
    #[serde(default)]
    pub external_id: Option<String>,
}

impl From<PolarOrder> for OrderPaid {
    fn from(order: PolarOrder) -> Self {
        Self {
            order_id: Some(order.id),
            customer_external_id: order.customer.and_then(|c| c.external_id),
            product_id: order.product_id.unwrap_or_default(),
        }
    }
}

/// A decoded webhook delivery.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    OrderPaid(PolarOrder),
    /// Any event type this service does not act on.
    Other(String),
}

/// Decode a webhook body.
pub fn decode_event(body: &[u8]) -> Result<WebhookEvent, serde_json::Error> {
    let envelope: Envelope = serde_json::from_slice(body)?;
    match envelope.kind.as_str() {
        "order.paid" => Ok(WebhookEvent::OrderPaid(serde_json::from_value(
            envelope.data,
        )?)),
        _ => Ok(WebhookEvent::Other(envelope.kind)),
    }
}

/// Produce a `webhook-signature` value the way Polar does.
#[cfg(test)]
pub(crate) fn sign(secret: &str, id: &str, timestamp: i64, body: &[u8]) -> String {
    let digest = mac_for(secret, id, &timestamp.to_string(), body)
        .unwrap()
        .finalize()
        .into_bytes();
    format!("v1,{}", BASE64.encode(digest))
}
