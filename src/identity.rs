//! Client identity derived from a verified peer certificate

use crate::error::{Error, Result};
use http::HeaderValue;
use rustls::pki_types::CertificateDer;
use x509_parser::prelude::*;

/// Header carrying the verified client Common Name to the backend
pub const IDENTITY_HEADER: &str = "x-mtls-subject";

/// Identity of an authenticated client, valid for one connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientIdentity {
    common_name: Option<String>,
    subject: String,
    header_value: HeaderValue,
}

impl ClientIdentity {
    /// Derive the identity from the chain rustls verified during the handshake
    ///
    /// Only the first (end-entity) certificate is inspected.
    pub fn from_peer_chain(chain: &[CertificateDer<'_>]) -> Result<Self> {
        let leaf = chain
            .first()
            .ok_or_else(|| Error::certificate("Peer presented no certificate"))?;
        Self::from_certificate(leaf)
    }

    /// Derive the identity from an end-entity certificate
    ///
    /// A subject with several Common Names yields the last one.
    pub fn from_certificate(cert: &CertificateDer<'_>) -> Result<Self> {
        let (_, parsed) = X509Certificate::from_der(cert.as_ref())
            .map_err(|e| Error::certificate(format!("Failed to parse peer certificate: {}", e)))?;

        let common_name = match parsed.subject().iter_common_name().last() {
            Some(attr) => Some(
                attr.as_str()
                    .map_err(|e| Error::certificate(format!("Unreadable Common Name: {}", e)))?
                    .to_string(),
            ),
            None => None,
        };

        let header_value = HeaderValue::from_str(common_name.as_deref().unwrap_or(""))
            .map_err(|_| Error::certificate("Common Name cannot be carried in an HTTP header"))?;

        Ok(ClientIdentity {
            common_name,
            subject: parsed.subject().to_string(),
            header_value,
        })
    }

    /// Get the Common Name, if the certificate has one
    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    /// Get the full subject distinguished name
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Value for [`IDENTITY_HEADER`]; empty when there is no Common Name
    pub fn header_value(&self) -> &HeaderValue {
        &self.header_value
    }
}
