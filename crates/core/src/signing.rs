//! Webhook signature primitives.
//!
//! The Booking System signs each delivery with HMAC-SHA256 over
//! `"{timestamp}.{raw body}"` and sends the hex digest as
//! `sha256=<hex>`. Verification compares in constant time and rejects
//! timestamps older than the tolerance window.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Deliveries older than this are rejected (replay window).
pub const DEFAULT_TOLERANCE_MS: i64 = 5 * 60 * 1000;

pub fn sign(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut payload = Vec::with_capacity(timestamp.len() + 1 + body.len());
    payload.extend_from_slice(timestamp.as_bytes());
    payload.push(b'.');
    payload.extend_from_slice(body);
    format!("{SIGNATURE_PREFIX}{}", hmac_hex(secret.as_bytes(), &payload))
}

pub fn verify(secret: &str, timestamp: &str, body: &[u8], provided: &str) -> bool {
    let expected = sign(secret, timestamp, body);
    constant_time_eq(expected.as_bytes(), provided.as_bytes())
}

/// `timestamp` is unix epoch milliseconds as a decimal string. Unparseable
/// or expired timestamps fail; future-dated ones are accepted as-is.
pub fn timestamp_within_tolerance(timestamp: &str, now_ms: i64, tolerance_ms: i64) -> bool {
    let Ok(sent_ms) = timestamp.trim().parse::<i64>() else {
        return false;
    };
    now_ms.saturating_sub(sent_ms) <= tolerance_ms
}

fn hmac_hex(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload);
    encode_hex(mac.finalize().into_bytes().as_slice())
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
