//! Webhook signature verification.
//!
//! GitHub signs every delivery with an HMAC-SHA256 of the raw request body,
//! keyed by the shared webhook secret, and sends it as
//! `X-Hub-Signature-256: sha256=<hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Header carrying the delivery signature.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

/// Result of checking a delivery signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Valid,
    Invalid,
}

impl Verification {
    pub fn is_valid(self) -> bool {
        matches!(self, Verification::Valid)
    }
}

/// Check `signature` against the HMAC of `payload` under `secret`.
///
/// Missing, malformed or non-matching signatures are all `Invalid`, and so is
/// an empty secret: a misconfigured deployment must not accept anything.
pub fn verify_signature(secret: &str, payload: &[u8], signature: Option<&str>) -> Verification {
    let Some(signature) = signature else {
        return Verification::Invalid;
    };

    if secret.is_empty() {
        return Verification::Invalid;
    }

    let Some(signature_hex) = signature.trim().strip_prefix(SIGNATURE_PREFIX) else {
        return Verification::Invalid;
    };

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return Verification::Invalid,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return Verification::Invalid,
    };

    mac.update(payload);

    // Constant-time comparison
    if mac.verify_slice(&signature_bytes).is_ok() {
        Verification::Valid
    } else {
        Verification::Invalid
    }
}

/// Compute the `X-Hub-Signature-256` header value for `payload`.
pub fn sign_payload(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take a key of any size");
    mac.update(payload);
    format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    )
}
