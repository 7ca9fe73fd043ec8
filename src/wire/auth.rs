//! Per-message HMAC authentication.
//!
//! Every inbound message carries `id`, `ts`, `nonce`, `sig`, where
//! `sig = hex(HMAC-SHA256("id|ts|nonce", shared_secret))`. Verification is
//! skipped entirely when no shared secret is configured.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing auth fields (id/ts/nonce/sig)")]
    MissingFields,

    #[error("timestamp outside window: drift {drift_ms}ms")]
    TimestampOutOfWindow { drift_ms: i64 },

    #[error("signature mismatch for id {id}")]
    SignatureMismatch { id: String },
}

/// Hex-encoded HMAC-SHA256 over `"{id}|{ts}|{nonce}"`.
pub fn compute_hmac(id: &str, ts: i64, nonce: &str, secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(format!("{id}|{ts}|{nonce}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify the auth envelope on a raw inbound message.
///
/// `secret` of `None` (or empty) disables verification. `now_ms` is passed
/// in so tests can pin the clock.
pub fn verify_message(
    msg: &Value,
    secret: Option<&str>,
    window_ms: i64,
    now_ms: i64,
) -> Result<(), AuthError> {
    let secret = match secret {
        Some(s) if !s.is_empty() => s,
        _ => return Ok(()),
    };

    let id = msg.get("id").and_then(Value::as_str);
    let ts = msg.get("ts").and_then(Value::as_i64);
    // EAs serialize the nonce as either a bare number or a string.
    let nonce = msg.get("nonce").map(|n| match n {
        Value::String(s) => Some(s.clone()),
        Value::Number(num) => Some(num.to_string()),
        _ => None,
    });
    let sig = msg.get("sig").and_then(Value::as_str);

    let (id, ts, nonce, sig) = match (id, ts, nonce.flatten(), sig) {
        (Some(id), Some(ts), Some(nonce), Some(sig)) => (id, ts, nonce, sig),
        _ => return Err(AuthError::MissingFields),
    };

    let drift_ms = (now_ms - ts).abs();
    if drift_ms > window_ms {
        return Err(AuthError::TimestampOutOfWindow { drift_ms });
    }

    let expected = compute_hmac(id, ts, &nonce, secret);
    if expected != sig {
        return Err(AuthError::SignatureMismatch { id: id.to_string() });
    }

    Ok(())
}
