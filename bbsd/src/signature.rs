//! Webhook signature verification.
//!
//! Deliveries carry `X-Hub-Signature: <algorithm>=<hexdigest>`, an HMAC of
//! the raw body keyed with the endpoint's shared secret.

use bbs_common::ErrorCode;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use thiserror::Error;

pub const SIGNATURE_HEADER: &str = "x-hub-signature";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature verification is enabled but no X-Hub-Signature header was sent")]
    Missing,

    #[error("signature header is not of the form <algorithm>=<hexdigest>")]
    Malformed,

    #[error("unsupported signature algorithm '{0}'")]
    UnsupportedAlgorithm(String),

    #[error("signature digest is not valid hex")]
    InvalidHex,

    #[error("signature does not match the request body")]
    Mismatch,

    #[error("signature verification is enabled but no shared secret is configured")]
    NoSecret,
}

impl SignatureError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Missing => ErrorCode::WebhookMissingSignature,
            Self::Malformed | Self::InvalidHex => ErrorCode::WebhookMalformedSignature,
            Self::UnsupportedAlgorithm(_) => ErrorCode::WebhookUnsupportedAlgorithm,
            Self::Mismatch => ErrorCode::WebhookSignatureMismatch,
            Self::NoSecret => ErrorCode::WebhookNoSecret,
        }
    }

    /// Authentication failures are rejected with 403, encoding problems with 400.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Self::Missing | Self::Mismatch | Self::NoSecret)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl std::str::FromStr for SignatureAlgorithm {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            other => Err(SignatureError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl std::fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sha1 => write!(f, "sha1"),
            Self::Sha256 => write!(f, "sha256"),
            Self::Sha384 => write!(f, "sha384"),
            Self::Sha512 => write!(f, "sha512"),
        }
    }
}

/// Parse `<algorithm>=<hexdigest>` into an algorithm and raw digest bytes.
pub fn parse_header(header: &str) -> Result<(SignatureAlgorithm, Vec<u8>), SignatureError> {
    let (algorithm, digest) = header
        .trim()
        .split_once('=')
        .ok_or(SignatureError::Malformed)?;
    if algorithm.is_empty() || digest.is_empty() {
        return Err(SignatureError::Malformed);
    }
    let algorithm = algorithm.parse::<SignatureAlgorithm>()?;
    let digest = hex::decode(digest.trim()).map_err(|_| SignatureError::InvalidHex)?;
    Ok((algorithm, digest))
}

/// Verify a delivery's signature header against `secret`.
///
/// The digest comparison is constant-time.
pub fn verify(
    header: Option<&str>,
    secret: Option<&str>,
    body: &[u8],
) -> Result<SignatureAlgorithm, SignatureError> {
    let secret = secret.filter(|s| !s.is_empty()).ok_or(SignatureError::NoSecret)?;
    let header = header
        .filter(|h| !h.trim().is_empty())
        .ok_or(SignatureError::Missing)?;
    let (algorithm, expected) = parse_header(header)?;

    let secret = secret.as_bytes();
    let matches = match algorithm {
        SignatureAlgorithm::Sha1 => digest_matches::<Hmac<Sha1>>(secret, body, &expected),
        SignatureAlgorithm::Sha256 => digest_matches::<Hmac<Sha256>>(secret, body, &expected),
        SignatureAlgorithm::Sha384 => digest_matches::<Hmac<Sha384>>(secret, body, &expected),
        SignatureAlgorithm::Sha512 => digest_matches::<Hmac<Sha512>>(secret, body, &expected),
    };
    if matches {
        Ok(algorithm)
    } else {
        Err(SignatureError::Mismatch)
    }
}

fn digest_matches<M: Mac + KeyInit>(secret: &[u8], body: &[u8], expected: &[u8]) -> bool {
    match <M as Mac>::new_from_slice(secret) {
        Ok(mut mac) => {
            mac.update(body);
            mac.verify_slice(expected).is_ok()
        }
        Err(_) => false,
    }
}

/// Compute a signature header value, as a host would send it.
#[cfg(test)]
pub(crate) fn sign(algorithm: SignatureAlgorithm, secret: &str, body: &[u8]) -> String {
    fn digest<M: Mac + KeyInit>(secret: &[u8], body: &[u8]) -> Vec<u8> {
        let mut mac = <M as Mac>::new_from_slice(secret).unwrap();
        mac.update(body);
        mac.finalize().into_bytes().to_vec()
    }
    let secret = secret.as_bytes();
    let bytes = match algorithm {
        SignatureAlgorithm::Sha1 => digest::<Hmac<Sha1>>(secret, body),
        SignatureAlgorithm::Sha256 => digest::<Hmac<Sha256>>(secret, body),
        SignatureAlgorithm::Sha384 => digest::<Hmac<Sha384>>(secret, body),
        SignatureAlgorithm::Sha512 => digest::<Hmac<Sha512>>(secret, body),
    };
    format!("{algorithm}={}", hex::encode(bytes))
}
