//! Bearer token payload extraction.
//!
//! Tokens are expected to be compact JWS strings (`header.payload.signature`).
//! Only the payload segment is decoded. The signature, `exp` and `nbf` are
//! NOT checked: the token must have been validated by an upstream
//! authentication layer before it reaches this crate.

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};

use crate::errors::DecodeError;

/// base64url with optional padding.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decode the payload segment of a compact token into text.
///
/// Returns `Ok(None)` when no token (or an empty one) is supplied.
/// Standard base64 characters (`+`, `/`) are accepted alongside the url-safe
/// alphabet, since some issuers emit them.
///
/// # Errors
/// - [`DecodeError::MalformedToken`] if the token has fewer than two segments
/// - [`DecodeError::InvalidBase64`] if the payload segment is not base64
/// - [`DecodeError::InvalidUtf8`] if the decoded bytes are not UTF-8
pub fn decode_payload(token: Option<&str>) -> Result<Option<String>, DecodeError> {
    let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
        return Ok(None);
    };

    let mut segments = token.split('.');
    let (Some(_header), Some(payload)) = (segments.next(), segments.next()) else {
        return Err(DecodeError::MalformedToken);
    };

    let normalized: String = payload
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();

    let bytes = PAYLOAD_ENGINE
        .decode(normalized.as_bytes())
        .map_err(|e| DecodeError::InvalidBase64(e.to_string()))?;

    String::from_utf8(bytes)
        .map(Some)
        .map_err(|_| DecodeError::InvalidUtf8)
}

/// Build an unsigned compact token around `payload`.
///
/// Intended for tests and local tooling; the signature segment is empty.
#[must_use]
pub fn encode_unsigned(payload: &str) -> String {
    let header = PAYLOAD_ENGINE.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let body = PAYLOAD_ENGINE.encode(payload.as_bytes());
    format!("{header}.{body}.")
}
