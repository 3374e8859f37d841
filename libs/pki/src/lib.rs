//! Certificate authority and endpoint identity material.
//!
//! The gateway is its own CA: a self-signed root generated on first start,
//! a server certificate covering the gateway's external address, and one
//! long-lived leaf per endpoint. A connecting peer is identified solely by
//! the Common Name of its client certificate, so the CN format doubles as
//! the role encoding (`c<hex12>` for clients, `s<hex12>` for services).
//!
//! # Security Model
//!
//! - The CA certificate is the single trust anchor for every mTLS listener;
//!   there are no intermediates.
//! - Endpoint keys are generated gateway-side and leave only inside the
//!   deployment bundle built for that endpoint.
//! - All keys are RSA (4096-bit in production); leaves carry both client
//!   and server EKUs so one identity serves DoT and the tunnel.

mod ca;
mod error;
mod identity;

pub use ca::{CertificateAuthority, IssuedCredentials, ServerCredentials, DEFAULT_KEY_BITS};
pub use error::{PkiError, Result};
pub use identity::{
    common_name, derive_cn, is_valid_cn, verify_issued_cert, CertIdentity, EndpointRole,
    CN_HEX_LEN,
};

/// Parse PEM-encoded data and return the DER bytes of the first block.
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let block = pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::Parse(format!("failed to parse PEM: {e}")))?;
    Ok(block.contents().to_vec())
}
