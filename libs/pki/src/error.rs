use thiserror::Error;

/// PKI errors.
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate generation or signing failed.
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    /// PEM/DER parsing error.
    #[error("parse error: {0}")]
    Parse(String),

    /// A certificate failed verification against the CA.
    #[error("certificate verification failed: {0}")]
    Verification(String),

    /// A CN does not match the `c<hex12>`/`s<hex12>` format.
    #[error("invalid common name: {0:?}")]
    InvalidCommonName(String),

    /// IO error reading or persisting material.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for PKI operations.
pub type Result<T> = std::result::Result<T, PkiError>;
