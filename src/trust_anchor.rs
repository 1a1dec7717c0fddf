//! Trust anchor for client certificate verification

use crate::error::{Error, Result};
use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use x509_parser::prelude::*;

/// CA certificates that client certificates must chain to
///
/// Immutable once built; shared read-only by the proxy.
#[derive(Clone, Debug)]
pub struct TrustAnchor {
    /// Root CA certificates (DER encoded)
    certificates: Vec<CertificateDer<'static>>,
    /// The same certificates as a rustls root store
    roots: Arc<RootCertStore>,
}

impl TrustAnchor {
    /// Build a trust anchor from DER encoded CA certificates
    pub fn new(certificates: Vec<CertificateDer<'static>>) -> Result<Self> {
        if certificates.is_empty() {
            return Err(Error::TrustAnchorError(
                "Trust anchor must contain at least one certificate".into(),
            ));
        }

        let mut roots = RootCertStore::empty();
        for (i, cert) in certificates.iter().enumerate() {
            roots.add(cert.clone()).map_err(|e| {
                Error::TrustAnchorError(format!("Certificate {} is not a usable CA: {}", i, e))
            })?;
            debug!("Trusting client CA {}", describe(cert));
        }

        Ok(TrustAnchor {
            certificates,
            roots: Arc::new(roots),
        })
    }

    /// Parse a PEM bundle holding one or more CA certificates
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let certificates = rustls_pemfile::certs(&mut BufReader::new(pem))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::TrustAnchorError(format!("Failed to parse CA PEM: {}", e)))?;

        Self::new(certificates)
    }

    /// Read a PEM bundle from disk
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let pem = std::fs::read(path).map_err(|e| {
            Error::TrustAnchorError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let anchor = Self::from_pem(&pem)?;
        info!(
            "Loaded {} client CA certificate(s) from {}",
            anchor.len(),
            path.display()
        );
        Ok(anchor)
    }

    /// Get the CA certificates
    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certificates
    }

    /// Get the root store used by the client certificate verifier
    pub fn roots(&self) -> Arc<RootCertStore> {
        self.roots.clone()
    }

    /// Number of CA certificates
    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    /// Always false for a constructed anchor
    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }
}

fn describe(cert: &CertificateDer<'_>) -> String {
    match X509Certificate::from_der(cert.as_ref()) {
        Ok((_, parsed)) => parsed.subject().to_string(),
        Err(_) => "<unparseable subject>".to_string(),
    }
}
