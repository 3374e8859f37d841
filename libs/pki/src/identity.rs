//! Endpoint roles and CN-based identity.

use serde::{Deserialize, Serialize};
use x509_parser::prelude::*;

use crate::error::{PkiError, Result};
use crate::parse_pem;

/// Number of hex characters after the role prefix in a CN.
pub const CN_HEX_LEN: usize = 12;

/// The role an endpoint plays in the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    /// Consumes private zones and tunnels to services.
    Client,
    /// Fronts a backend and owns one or more zones.
    Service,
}

impl EndpointRole {
    /// The CN prefix for this role.
    pub fn cn_prefix(self) -> char {
        match self {
            EndpointRole::Client => 'c',
            EndpointRole::Service => 's',
        }
    }

    /// Role name as used in certificate subjects and config payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointRole::Client => "client",
            EndpointRole::Service => "service",
        }
    }

    /// Recover the role from a CN, if it has a valid role prefix.
    pub fn from_cn(cn: &str) -> Option<Self> {
        match cn.chars().next() {
            Some('c') => Some(EndpointRole::Client),
            Some('s') => Some(EndpointRole::Service),
            _ => None,
        }
    }
}

impl std::fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive a fresh CN for an endpoint: role prefix + 12 random hex chars.
pub fn derive_cn(role: EndpointRole) -> String {
    let suffix: [u8; CN_HEX_LEN / 2] = rand::random();
    format!("{}{}", role.cn_prefix(), hex::encode(suffix))
}

/// Check that a string is a well-formed endpoint CN.
pub fn is_valid_cn(cn: &str) -> bool {
    let mut chars = cn.chars();
    matches!(chars.next(), Some('c') | Some('s'))
        && cn.len() == 1 + CN_HEX_LEN
        && chars.all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// Identity extracted from a verified endpoint certificate.
#[derive(Debug, Clone)]
pub struct CertIdentity {
    /// The certificate's Common Name.
    pub cn: String,
    /// Role encoded in the CN prefix.
    pub role: EndpointRole,
}

/// Extract the Common Name from a DER-encoded certificate.
pub fn common_name(cert_der: &[u8]) -> Result<String> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| PkiError::Parse(format!("failed to parse certificate: {e}")))?;

    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
        .ok_or_else(|| PkiError::Parse("certificate has no Common Name".into()));
    cn
}

/// Verify that a certificate was signed by our CA and is within its
/// validity window, returning the identity bound to it.
///
/// Runtime peer verification is done by the TLS stack against the CA root
/// store; this is the out-of-band check used by issuance tests and the
/// bundle self-check.
pub fn verify_issued_cert(cert_der: &[u8], ca_cert_pem: &str) -> Result<CertIdentity> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| PkiError::Parse(format!("failed to parse certificate: {e}")))?;

    let ca_der = parse_pem(ca_cert_pem)?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_der)
        .map_err(|e| PkiError::Parse(format!("failed to parse CA certificate: {e}")))?;

    cert.verify_signature(Some(ca_cert.public_key()))
        .map_err(|_| PkiError::Verification("signature does not chain to the CA".into()))?;

    if !cert.validity().is_valid() {
        return Err(PkiError::Verification(
            "certificate is outside its validity window".into(),
        ));
    }

    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or("");

    if !is_valid_cn(cn) {
        return Err(PkiError::InvalidCommonName(cn.to_string()));
    }

    // Prefix is guaranteed by is_valid_cn.
    let role = EndpointRole::from_cn(cn).expect("validated CN has a role prefix");

    Ok(CertIdentity {
        cn: cn.to_string(),
        role,
    })
}
