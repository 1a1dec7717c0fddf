//! mTLS terminating reverse proxy
//!
//! Terminates TLS with a server certificate that is periodically reloaded
//! from a secret store, requires every client to present a certificate
//! signed by a trusted CA, and forwards requests to a single upstream with
//! the client's Common Name in the `x-mtls-subject` header.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod certificate;
pub mod config;
pub mod error;
pub mod identity;
pub mod proxy;
pub mod source;
pub mod store;
pub mod tls;
pub mod trust_anchor;

#[cfg(test)]
mod fixtures;

pub use certificate::{CertificateMaterial, SecretPayload};
pub use config::{Config, SecretSourceConfig};
pub use error::{Error, Result};
pub use identity::{ClientIdentity, IDENTITY_HEADER};
pub use proxy::{ProxySettings, TerminatingProxy, UpstreamTarget};
pub use source::{FileSecretSource, HttpSecretSource, MemorySecretSource, SecretSource};
pub use store::CertificateStore;
pub use trust_anchor::TrustAnchor;

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// Run the proxy described by `config` until `shutdown` flips to `true`
///
/// The first certificate load is attempted before the listener binds; if it
/// fails the proxy still starts and refuses handshakes until a refresh
/// succeeds. Returns once open connections have drained or the drain timeout
/// has passed.
pub async fn run(config: Config, shutdown: watch::Receiver<bool>) -> Result<()> {
    let store = Arc::new(CertificateStore::new(config.build_secret_source()?));
    let proxy = TerminatingProxy::new(store.clone(), &config.trust_anchor, config.proxy_settings())?;

    info!(
        "Serving certificate for {} from {}",
        config.domain,
        config.secret_id()
    );
    let refresh = store.start(config.cert_interval, shutdown.clone()).await;

    let served = proxy.serve(config.listen_addr(), shutdown).await;
    if served.is_err() {
        refresh.abort();
    } else if let Err(e) = refresh.await {
        error!("Certificate refresh task failed: {}", e);
    }

    served
}
