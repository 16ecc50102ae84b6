//! Billing webhook signature verification.

use crate::error::{SiteError, SiteResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Verify a webhook signature header against the raw request body.
///
/// Header format: `t=<unix timestamp>,v1=<hex hmac>[,v1=<hex hmac>...]`, where
/// the HMAC-SHA256 is computed over `"<timestamp>.<payload>"`. Timestamps
/// further than `tolerance_secs` from `now` are rejected to limit replays.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: i64,
    tolerance_secs: i64,
) -> SiteResult<()> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| SiteError::Signature("signature header has no timestamp".to_string()))?;
    if signatures.is_empty() {
        return Err(SiteError::Signature("signature header has no v1 signature".to_string()));
    }

    let signed_at: i64 = timestamp
        .parse()
        .map_err(|_| SiteError::Signature("malformed signature timestamp".to_string()))?;
    if (now - signed_at).abs() > tolerance_secs {
        return Err(SiteError::Signature("signature timestamp outside tolerance".to_string()));
    }

    let expected = compute_signature(payload, secret, timestamp)?;

    let matched = signatures
        .iter()
        .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));

    if matched {
        Ok(())
    } else {
        Err(SiteError::Signature("signature mismatch".to_string()))
    }
}

/// Build a valid signature header for a payload (used by tests and local tooling).
pub fn signature_header(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let timestamp = timestamp.to_string();
    let signature = compute_signature(payload, secret, &timestamp).unwrap_or_default();
    format!("t={},v1={}", timestamp, signature)
}

fn compute_signature(payload: &[u8], secret: &str, timestamp: &str) -> SiteResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| SiteError::Signature("invalid webhook secret".to_string()))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);

    Ok(hex::encode(mac.finalize().into_bytes()))
}
