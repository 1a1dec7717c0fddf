//! Error types for the mTLS proxy

use thiserror::Error;

/// Main error type for proxy and certificate store operations
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed configuration input
    #[error("{0}")]
    Config(String),

    /// The secret source could not deliver a payload
    #[error("Secret fetch failed: {0}")]
    SecretFetch(String),

    /// The secret payload is not the expected JSON document
    #[error("Malformed secret payload: {0}")]
    SecretPayload(#[from] serde_json::Error),

    /// X.509 certificate or private key error
    #[error("Certificate error: {0}")]
    CertificateError(String),

    /// Trust anchor could not be built
    #[error("Trust anchor error: {0}")]
    TrustAnchorError(String),

    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    TlsError(String),

    /// Upstream target is unusable
    #[error("Upstream error: {0}")]
    UpstreamError(String),

    /// Network or I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// URL parsing error
    #[error("URL parse error: {0}")]
    UrlError(#[from] url::ParseError),

    /// Error reported by rustls
    #[error("rustls error: {0}")]
    RustlsError(#[from] rustls::Error),
}

/// Convenience type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a Config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a SecretFetch error with detailed message
    pub fn secret_fetch(msg: impl Into<String>) -> Self {
        Self::SecretFetch(msg.into())
    }

    /// Create a CertificateError with detailed message
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::CertificateError(msg.into())
    }

    /// Create a TlsError with detailed message
    pub fn tls_error(msg: impl Into<String>) -> Self {
        Self::TlsError(msg.into())
    }

    /// Whether this error belongs to the startup configuration class
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::TrustAnchorError(_))
    }
}
