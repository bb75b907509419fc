//! `Authorization: Basic` header parsing.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::AuthFailure;

/// Credentials carried by a Basic header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub system_key: String,
    pub system_secret: String,
}

/// Decodes `Basic base64(key:secret)`.
pub fn parse_basic_header(header: &str) -> Result<BasicCredentials, AuthFailure> {
    let encoded = header
        .strip_prefix("Basic ")
        .ok_or_else(|| AuthFailure::MalformedHeader("expected Basic scheme".to_string()))?;

    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthFailure::MalformedHeader("invalid base64".to_string()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| AuthFailure::MalformedHeader("credentials are not UTF-8".to_string()))?;

    let (key, secret) = decoded
        .split_once(':')
        .ok_or_else(|| AuthFailure::MalformedHeader("missing ':' separator".to_string()))?;
    if key.is_empty() {
        return Err(AuthFailure::MalformedHeader("empty system key".to_string()));
    }

    Ok(BasicCredentials {
        system_key: key.to_string(),
        system_secret: secret.to_string(),
    })
}
