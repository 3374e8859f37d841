//! Signed endpoint configuration (`config.zt`).
//!
//! Every deployment bundle carries a token binding the endpoint to the
//! gateway: the DoT address, the proxy address, the expected TLS server
//! name, the endpoint's role and authoritative domains, and an expiry.
//! The token is the JSON payload plus a detached RSA-SHA256 signature by
//! the CA private key, framed as
//!
//! ```text
//! base64url(payload_json) "." base64url(signature)
//! ```
//!
//! so the verifier can recover payload and signature independently. The
//! endpoint verifies against the CA certificate's public key (bundled in
//! the same archive) before opening any sockets; corruption, a signature
//! mismatch, or an expired payload all fail hard.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use x509_parser::prelude::*;

pub use ztp_pki::EndpointRole;

/// Signed-configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Token framing or base64 is broken.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// The signature does not verify against the CA public key.
    #[error("signature verification failed")]
    BadSignature,

    /// The payload has expired.
    #[error("configuration expired at {0}")]
    Expired(DateTime<Utc>),

    /// Key or certificate material could not be used.
    #[error("key material error: {0}")]
    Key(String),

    /// Payload JSON error.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Result type for token operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// The configuration payload carried by `config.zt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigPayload {
    /// DoT address of the gateway (`host:port`).
    pub server: String,
    /// Transport proxy address of the gateway (`host:port`).
    pub proxy: String,
    /// TLS server name the endpoint must expect from the gateway.
    pub server_name: String,
    /// The endpoint's role.
    #[serde(rename = "type")]
    pub role: EndpointRole,
    /// Authoritative domains (empty for clients).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,
    /// Hard expiry of this configuration.
    pub expires: DateTime<Utc>,
}

/// Sign a payload with the CA private key, producing a token.
pub fn sign(payload: &ConfigPayload, ca_key_pem: &str) -> Result<String> {
    let payload_json = serde_json::to_vec(payload)?;

    let key = RsaPrivateKey::from_pkcs8_pem(ca_key_pem)
        .map_err(|e| ConfigError::Key(format!("failed to parse CA key: {e}")))?;
    let signing_key = SigningKey::<Sha256>::new(key);
    let signature = signing_key
        .try_sign(&payload_json)
        .map_err(|e| ConfigError::Key(format!("signing failed: {e}")))?;

    Ok(format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(&payload_json),
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}

/// Verify a token against the CA certificate and return its payload.
///
/// `now` is passed in so callers (and tests) control the clock.
pub fn verify(token: &str, ca_cert_pem: &str, now: DateTime<Utc>) -> Result<ConfigPayload> {
    let (payload_b64, sig_b64) = token
        .trim()
        .split_once('.')
        .ok_or_else(|| ConfigError::Malformed("expected <payload>.<signature>".into()))?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|e| ConfigError::Malformed(format!("payload base64: {e}")))?;
    let sig_bytes = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|e| ConfigError::Malformed(format!("signature base64: {e}")))?;

    let ca_der = ztp_pki::parse_pem(ca_cert_pem)
        .map_err(|e| ConfigError::Key(format!("failed to parse CA certificate: {e}")))?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_der)
        .map_err(|e| ConfigError::Key(format!("failed to parse CA certificate: {e}")))?;
    let public_key = RsaPublicKey::from_public_key_der(ca_cert.public_key().raw)
        .map_err(|e| ConfigError::Key(format!("failed to decode CA public key: {e}")))?;

    let signature = Signature::try_from(sig_bytes.as_slice())
        .map_err(|e| ConfigError::Malformed(format!("signature encoding: {e}")))?;
    VerifyingKey::<Sha256>::new(public_key)
        .verify(&payload, &signature)
        .map_err(|_| ConfigError::BadSignature)?;

    let config: ConfigPayload = serde_json::from_slice(&payload)?;
    if config.expires <= now {
        return Err(ConfigError::Expired(config.expires));
    }

    Ok(config)
}
