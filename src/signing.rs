//! HMAC-SHA256 signatures over raw request bodies.
//!
//! Signatures are always computed over the exact bytes put on the wire.
//! Re-serializing a parsed body can reorder keys or change whitespace, which
//! breaks verification on the receiving side.

use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Header carrying the hex-encoded signature.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

type HmacSha256 = Hmac<Sha256>;

fn mac_for(secret: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length; this cannot fail.
    HmacSha256::new_from_slice(secret).expect("hmac key of any length")
}

/// Sign `raw_body` with `secret`, returning lowercase hex.
pub fn sign(raw_body: &[u8], secret: &[u8]) -> String {
    let mut mac = mac_for(secret);
    mac.update(raw_body);
    hex::encode(mac.finalize().into_bytes())
}

/// Check `signature_hex` against `raw_body`.
///
/// Comparison is constant-time. A signature that is not valid hex is
/// rejected rather than treated as an error.
pub fn verify(raw_body: &[u8], signature_hex: &str, secret: &[u8]) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };

    let mut mac = mac_for(secret);
    mac.update(raw_body);
    mac.verify_slice(&signature).is_ok()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("missing x-webhook-signature header")]
    MissingSignature,

    #[error("signature does not match body")]
    InvalidSignature,
}

/// Verify an incoming webhook request in one call.
///
/// Intended for receivers: pass the request headers as `(name, value)`
/// pairs and the body bytes exactly as read from the socket.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    raw_body: &[u8],
    secret: &[u8],
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let signature = headers
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(SIGNATURE_HEADER))
        .map(|(_, value)| value)
        .ok_or(VerificationError::MissingSignature)?;

    if verify(raw_body, signature, secret) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}
