use base64::{Engine as _, engine::general_purpose};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Raw HMAC-SHA256 of `parts` concatenated in order, keyed by `secret`.
pub fn hmac_sha256(secret: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;

    for part in parts {
        mac.update(part);
    }

    Ok(mac.finalize().into_bytes().to_vec())
}

/// HMAC-SHA256 encoded as standard (padded) base64.
pub fn hmac_sha256_base64(secret: &[u8], parts: &[&[u8]]) -> Result<String, anyhow::Error> {
    Ok(general_purpose::STANDARD.encode(hmac_sha256(secret, parts)?))
}

/// HMAC-SHA256 encoded as lowercase hex.
pub fn hmac_sha256_hex(secret: &[u8], parts: &[&[u8]]) -> Result<String, anyhow::Error> {
    Ok(hex::encode(hmac_sha256(secret, parts)?))
}

/// Lowercase hex SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Constant-time equality for signature strings.
pub fn constant_time_eq(expected: &str, provided: &str) -> bool {
    let expected_bytes = expected.as_bytes();
    let provided_bytes = provided.as_bytes();

    if expected_bytes.len() != provided_bytes.len() {
        return false;
    }

    expected_bytes.ct_eq(provided_bytes).into()
}
