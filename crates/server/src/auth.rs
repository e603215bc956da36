//! Webhook authentication: HMAC signature scheme first, shared-secret
//! header as the alternative, tried based on which header is present.

use axum::http::HeaderMap;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use clinicsync_core::signing;

pub const SIGNATURE_HEADER: &str = "x-clinic-signature";
pub const TIMESTAMP_HEADER: &str = "x-clinic-timestamp";
pub const API_KEY_HEADER: &str = "x-clinic-api-key";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing authentication headers")]
    MissingTimestamp,
    #[error("Timestamp expired or invalid")]
    TimestampExpired,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Invalid API key")]
    InvalidApiKey,
    #[error("No authentication provided")]
    NoAuthentication,
}

pub fn verify_webhook(
    headers: &HeaderMap,
    body: &[u8],
    secret: &SecretString,
    tolerance_ms: i64,
) -> Result<(), AuthError> {
    verify_webhook_at(headers, body, secret, tolerance_ms, Utc::now().timestamp_millis())
}

pub fn verify_webhook_at(
    headers: &HeaderMap,
    body: &[u8],
    secret: &SecretString,
    tolerance_ms: i64,
    now_ms: i64,
) -> Result<(), AuthError> {
    if let Some(signature) = header_str(headers, SIGNATURE_HEADER) {
        let Some(timestamp) = header_str(headers, TIMESTAMP_HEADER) else {
            return Err(AuthError::MissingTimestamp);
        };
        if !signing::timestamp_within_tolerance(timestamp, now_ms, tolerance_ms) {
            return Err(AuthError::TimestampExpired);
        }
        if !signing::verify(secret.expose_secret(), timestamp, body, signature) {
            return Err(AuthError::InvalidSignature);
        }
        return Ok(());
    }

    if let Some(api_key) = header_str(headers, API_KEY_HEADER) {
        if api_key != secret.expose_secret() {
            return Err(AuthError::InvalidApiKey);
        }
        return Ok(());
    }

    Err(AuthError::NoAuthentication)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
