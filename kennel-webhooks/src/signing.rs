//! HMAC-SHA256 signatures over canonical JSON, hex encoded.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::{canonical_bytes, WebhookError, WebhookResult};

type HmacSha256 = Hmac<Sha256>;

/// Value of the `X-Signature-Alg` header
pub const SIGNATURE_ALGORITHM: &str = "hmac-sha256";

/// Value of the `X-Signature-Version` header
pub const SIGNATURE_VERSION: &str = "v1";

/// Lower-case hex HMAC-SHA256 of the canonical form of `payload`
pub fn sign(secret: &str, payload: &Value) -> WebhookResult<String> {
    sign_bytes(secret, &canonical_bytes(payload))
}

/// Lower-case hex HMAC-SHA256 of `body`
pub fn sign_bytes(secret: &str, body: &[u8]) -> WebhookResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| WebhookError::Signing(e.to_string()))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of `signature` against `payload` signed with `secret`
pub fn verify(secret: &str, payload: &Value, signature: &str) -> bool {
    verify_bytes(secret, &canonical_bytes(payload), signature)
}

/// True when any of `secrets` produced `signature`, for zero-downtime rotation
pub fn verify_any<S: AsRef<str>>(secrets: &[S], payload: &Value, signature: &str) -> bool {
    let body = canonical_bytes(payload);
    secrets
        .iter()
        .any(|secret| verify_bytes(secret.as_ref(), &body, signature))
}

fn verify_bytes(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
