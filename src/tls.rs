//! TLS configuration for client-facing termination and upstream connections

use crate::error::{Error, Result};
use crate::store::CertificateStore;
use crate::trust_anchor::TrustAnchor;
use rustls::crypto::CryptoProvider;
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use tracing::{debug, warn};

/// ALPN protocols offered to clients, most preferred first
pub const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// The crypto provider used for every TLS role in this crate
///
/// Passed explicitly instead of relying on a process-wide default.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Picks the server certificate for each handshake from a [`CertificateStore`]
///
/// Returning `None` makes rustls abort the handshake with an alert, which is
/// what happens until the store has loaded a certificate.
#[derive(Debug)]
pub struct StoreCertResolver {
    store: Arc<CertificateStore>,
}

impl StoreCertResolver {
    /// Create a resolver reading from `store`
    pub fn new(store: Arc<CertificateStore>) -> Self {
        StoreCertResolver { store }
    }
}

impl ResolvesServerCert for StoreCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match self.store.get() {
            Some(material) => Some(material.certified_key()),
            None => {
                warn!(
                    "No server certificate loaded, rejecting handshake for SNI {:?}",
                    client_hello.server_name()
                );
                None
            }
        }
    }
}

/// Build the server configuration for accepting mTLS connections
///
/// TLS 1.2 is the minimum version. Every client must present a certificate
/// chaining to `trust_anchor`; the server certificate is resolved from
/// `store` per handshake.
pub fn build_server_config(
    store: Arc<CertificateStore>,
    trust_anchor: &TrustAnchor,
) -> Result<ServerConfig> {
    let provider = crypto_provider();

    let client_cert_verifier =
        WebPkiClientVerifier::builder_with_provider(trust_anchor.roots(), provider.clone())
            .build()
            .map_err(|e| Error::tls_error(format!("Failed to create client verifier: {}", e)))?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&TLS13, &TLS12])?
        .with_client_cert_verifier(client_cert_verifier)
        .with_cert_resolver(Arc::new(StoreCertResolver::new(store)));
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

    debug!(
        "Server TLS config ready, trusting {} client CA certificate(s)",
        trust_anchor.len()
    );

    Ok(config)
}

/// Build the client configuration for `https://` upstream targets
pub fn build_upstream_client_config() -> Result<ClientConfig> {
    let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&TLS13, &TLS12])?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(config)
}
