//! Bearer token wire format.
//!
//! A token is `base64(payload) "." base64(signature)` where `payload` is the
//! JSON text `{"accountId":"…","iat":…}` and `iat` is the issue time in
//! milliseconds since the Unix epoch.  The signature covers the base64 text
//! of the payload segment, not the decoded JSON (see [`super::signature`]).

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sentinel token presented on behalf of callers without credentials.
pub const ANONYMOUS: &str = "ANONYMOUS";

/// Claims carried in the token payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "accountId")]
    pub account_id: String,
    pub iat: i64,
}

/// A token split into its verifiable parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedToken {
    /// The raw (still base64-encoded) payload segment; this is what was signed.
    pub payload_segment: String,
    /// The decoded payload JSON text.
    #[cfg_attr(not(test), allow(dead_code))]
    pub payload_text: String,
    pub signature: Vec<u8>,
    pub claims: Claims,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(&'static str),
}

/// Parse a bearer token into payload, signature and claims.
pub fn decode(token: &str) -> Result<DecodedToken, TokenError> {
    let mut parts = token.split('.');
    let (payload_segment, signature_segment) = match (parts.next(), parts.next(), parts.next()) {
        (Some(p), Some(s), None) if !p.is_empty() && !s.is_empty() => (p, s),
        _ => return Err(TokenError::Malformed("expected two dot-separated parts")),
    };

    let payload_bytes = STANDARD
        .decode(payload_segment)
        .map_err(|_| TokenError::Malformed("payload is not base64"))?;
    let signature = STANDARD
        .decode(signature_segment)
        .map_err(|_| TokenError::Malformed("signature is not base64"))?;

    let payload_text =
        String::from_utf8(payload_bytes).map_err(|_| TokenError::Malformed("payload is not UTF-8"))?;
    let claims: Claims = serde_json::from_str(&payload_text)
        .map_err(|_| TokenError::Malformed("payload is missing accountId or iat"))?;

    if claims.account_id.is_empty() {
        return Err(TokenError::Malformed("empty accountId"));
    }

    Ok(DecodedToken {
        payload_segment: payload_segment.to_owned(),
        payload_text,
        signature,
        claims,
    })
}

/// Canonical payload text for `identity` issued at `issued_at_millis`.
pub fn payload_text(identity: &str, issued_at_millis: i64) -> String {
    let claims = Claims {
        account_id: identity.to_owned(),
        iat: issued_at_millis,
    };
    // A struct of a string and an integer always serialises.
    serde_json::to_string(&claims).unwrap_or_default()
}

/// The base64 payload segment that a client signs before building a token.
pub fn payload_segment(identity: &str, issued_at_millis: i64) -> String {
    STANDARD.encode(payload_text(identity, issued_at_millis))
}

/// Build a token from its claims and a signature over [`payload_segment`].
///
/// Clients mint tokens; the gateway only needs this to produce fixtures.
#[cfg_attr(not(test), allow(dead_code))]
pub fn encode(identity: &str, issued_at_millis: i64, signature: &[u8]) -> String {
    format!(
        "{}.{}",
        payload_segment(identity, issued_at_millis),
        STANDARD.encode(signature)
    )
}
