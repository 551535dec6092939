//! Cryptographic utilities for PayOS signatures.
//!
//! PayOS signs both outbound payment-link requests and inbound webhooks with
//! HMAC-SHA256 over a `key=value&key=value` string, keys sorted alphabetically,
//! using the merchant checksum key.

use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute HMAC-SHA256 and return the hex-encoded result.
///
/// Returns `None` only if the HMAC implementation rejects the key.
#[must_use]
pub fn hmac_sha256_hex(secret: &str, message: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(message.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time string comparison to prevent timing attacks.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Build the canonical `key=value` string PayOS signs, keys sorted.
///
/// Nulls become empty strings, strings are used raw, and nested values are
/// serialized as JSON.
#[must_use]
pub fn canonical_query(fields: &Map<String, Value>) -> String {
    let mut keys: Vec<&String> = fields.keys().collect();
    keys.sort();
    keys.into_iter()
        .map(|key| {
            let value = match &fields[key] {
                Value::Null => String::new(),
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("{key}={value}")
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Sign a set of fields with the checksum key.
#[must_use]
pub fn sign_fields(checksum_key: &str, fields: &Map<String, Value>) -> Option<String> {
    hmac_sha256_hex(checksum_key, &canonical_query(fields))
}

/// Verify a signature over a set of fields.
#[must_use]
pub fn verify_fields(checksum_key: &str, fields: &Map<String, Value>, signature: &str) -> bool {
    sign_fields(checksum_key, fields)
        .is_some_and(|expected| constant_time_eq(&expected, &signature.to_ascii_lowercase()))
}
