//! Detached Ed25519 signature verification of token payloads.
//!
//! Wallet signers do not sign the payload directly: the message is
//! `sha256(payload_segment)`, where `payload_segment` is the base64 text that
//! forms the first part of the token.  The digest is then verified against
//! every access key the account currently has registered with the authority.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

const ED25519_PREFIX: &str = "ed25519:";

/// An access key registered to an account, in the authority's
/// `ed25519:<base58>` text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(VerifyingKey);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyParseError {
    #[error("unsupported key type in {0:?}")]
    UnsupportedCurve(String),
    #[error("invalid base58 key data")]
    Encoding,
    #[error("key is not a valid ed25519 point")]
    InvalidPoint,
}

impl FromStr for PublicKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let data = s
            .strip_prefix(ED25519_PREFIX)
            .ok_or_else(|| KeyParseError::UnsupportedCurve(s.to_owned()))?;
        let bytes = bs58::decode(data)
            .into_vec()
            .map_err(|_| KeyParseError::Encoding)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyParseError::Encoding)?;
        VerifyingKey::from_bytes(&bytes)
            .map(Self)
            .map_err(|_| KeyParseError::InvalidPoint)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ED25519_PREFIX}{}", bs58::encode(self.0.as_bytes()).into_string())
    }
}

/// Digest actually covered by the signature.
pub fn signed_digest(payload_segment: &str) -> [u8; 32] {
    Sha256::digest(payload_segment.as_bytes()).into()
}

/// Return the first key in `candidates` whose signature over
/// `sha256(payload_segment)` validates.
///
/// Each check is independent of the others, so the outcome does not depend on
/// iteration order unless two registered keys both validate the same
/// signature; guarding against such key collisions is left to the
/// authority's key management.
pub fn verify<'a, I>(payload_segment: &str, signature: &[u8], candidates: I) -> Option<PublicKey>
where
    I: IntoIterator<Item = &'a PublicKey>,
{
    let signature: [u8; 64] = signature.try_into().ok()?;
    let signature = Signature::from_bytes(&signature);
    let digest = signed_digest(payload_segment);

    candidates
        .into_iter()
        .find(|key| key.0.verify_strict(&digest, &signature).is_ok())
        .copied()
}

#[cfg(test)]
pub(crate) mod test_keys {
    use ed25519_dalek::{Signer, SigningKey};

    use super::*;

    pub fn signing_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    pub fn public_key(seed: u8) -> PublicKey {
        PublicKey(signing_key(seed).verifying_key())
    }

    /// Sign a payload segment the way a wallet signer does.
    pub fn sign(seed: u8, payload_segment: &str) -> Vec<u8> {
        signing_key(seed)
            .sign(&signed_digest(payload_segment))
            .to_bytes()
            .to_vec()
    }

    /// Build a complete token for `identity`, signed with key `seed`.
    pub fn token(seed: u8, identity: &str, issued_at_millis: i64) -> String {
        let segment = crate::auth::token::payload_segment(identity, issued_at_millis);
        crate::auth::token::encode(identity, issued_at_millis, &sign(seed, &segment))
    }
}
