//! Shared helpers for the integration tests

#![allow(dead_code)]

use mtls_proxy::{
    CertificateStore, MemorySecretSource, ProxySettings, TerminatingProxy, TrustAnchor,
    UpstreamTarget,
};
use rcgen::{
    date_time_ymd, BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const SERVER_NAME: &str = "localhost";
pub const CLIENT_CN: &str = "aCommonName";

/// Certificate authority issuing either server or client leaves
pub struct Authority {
    cert: Certificate,
    pub pem: String,
}

/// A leaf certificate with its key, PEM encoded
pub struct Leaf {
    pub chain_pem: String,
    pub key_pem: String,
    pub leaf_der: Vec<u8>,
}

impl Authority {
    pub fn new(common_name: &str) -> Self {
        let mut params = CertificateParams::new(vec![]);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let cert = Certificate::from_params(params).unwrap();
        let pem = cert.serialize_pem().unwrap();
        Authority { cert, pem }
    }

    pub fn server(&self) -> Leaf {
        let mut params = CertificateParams::new(vec![SERVER_NAME.to_string()]);
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, SERVER_NAME);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        self.sign(params, true)
    }

    pub fn client(&self, common_name: &str) -> Leaf {
        self.sign(client_params(common_name), false)
    }

    pub fn expired_client(&self, common_name: &str) -> Leaf {
        let mut params = client_params(common_name);
        params.not_before = date_time_ymd(2000, 1, 1);
        params.not_after = date_time_ymd(2001, 1, 1);
        self.sign(params, false)
    }

    fn sign(&self, params: CertificateParams, include_ca: bool) -> Leaf {
        let cert = Certificate::from_params(params).unwrap();
        let leaf_pem = cert.serialize_pem_with_signer(&self.cert).unwrap();
        let leaf_der = certs(&leaf_pem).remove(0).as_ref().to_vec();
        let chain_pem = if include_ca {
            format!("{}{}", leaf_pem, self.pem)
        } else {
            leaf_pem
        };

        Leaf {
            chain_pem,
            key_pem: cert.serialize_private_key_pem(),
            leaf_der,
        }
    }
}

fn client_params(common_name: &str) -> CertificateParams {
    let mut params = CertificateParams::new(vec![]);
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, common_name);
    params.distinguished_name.push(DnType::OrganizationName, "Acme Co");
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    params
}

pub fn certs(pem: &str) -> Vec<CertificateDer<'static>> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

fn key(pem: &str) -> PrivateKeyDer<'static> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .unwrap()
        .unwrap()
}

/// JSON payload as stored in the secret store
pub fn payload(server: &Leaf) -> String {
    serde_json::json!({
        "private_key": server.key_pem,
        "fullchain": server.chain_pem,
        "cert": server.chain_pem,
    })
    .to_string()
}

/// Server CA, client CA and the leaves issued from them
pub struct Pki {
    pub server_ca: Authority,
    pub client_ca: Authority,
}

impl Pki {
    pub fn new() -> Self {
        Pki {
            server_ca: Authority::new("Server Root CA"),
            client_ca: Authority::new("Client Root CA"),
        }
    }

    pub fn trust_anchor(&self) -> TrustAnchor {
        TrustAnchor::from_pem(self.client_ca.pem.as_bytes()).unwrap()
    }

    /// An HTTPS client trusting the server CA, optionally presenting `client`
    pub fn http_client(&self, client: Option<&Leaf>, proxy: SocketAddr) -> reqwest::Client {
        let mut roots = RootCertStore::empty();
        for cert in certs(&self.server_ca.pem) {
            roots.add(cert).unwrap();
        }

        let builder = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots);
        let tls = match client {
            Some(leaf) => builder
                .with_client_auth_cert(certs(&leaf.chain_pem), key(&leaf.key_pem))
                .unwrap(),
            None => builder.with_no_client_auth(),
        };

        reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .tls_info(true)
            .resolve(SERVER_NAME, proxy)
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap()
    }
}

/// A proxy running on an ephemeral port
pub struct RunningProxy {
    pub addr: SocketAddr,
    pub store: Arc<CertificateStore>,
    pub source: Arc<MemorySecretSource>,
    shutdown: watch::Sender<bool>,
    server: Option<JoinHandle<mtls_proxy::Result<()>>>,
}

impl RunningProxy {
    pub async fn start(pki: &Pki, target: &str, upstream_timeout: Duration) -> Self {
        let mut settings = ProxySettings::new(UpstreamTarget::parse(target).unwrap());
        settings.upstream_timeout = upstream_timeout;
        Self::start_with_settings(pki, settings).await
    }

    /// Start with a loaded certificate and custom settings
    pub async fn start_with_settings(pki: &Pki, settings: ProxySettings) -> Self {
        let source = Arc::new(MemorySecretSource::new(payload(&pki.server_ca.server())));
        let proxy = Self::launch(pki, settings, source).await;
        proxy.store.load().await.unwrap();
        proxy
    }

    /// Start without loading a certificate
    pub async fn start_with(
        pki: &Pki,
        target: &str,
        upstream_timeout: Duration,
        source: Arc<MemorySecretSource>,
    ) -> Self {
        let mut settings = ProxySettings::new(UpstreamTarget::parse(target).unwrap());
        settings.upstream_timeout = upstream_timeout;
        Self::launch(pki, settings, source).await
    }

    async fn launch(pki: &Pki, settings: ProxySettings, source: Arc<MemorySecretSource>) -> Self {
        let store = Arc::new(CertificateStore::new(source.clone()));
        let proxy = TerminatingProxy::new(store.clone(), &pki.trust_anchor(), settings).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(proxy.serve_listener(listener, shutdown_rx));

        RunningProxy {
            addr,
            store,
            source,
            shutdown,
            server: Some(server),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("https://{}:{}{}", SERVER_NAME, self.addr.port(), path)
    }

    /// Signal shutdown and wait for the proxy to return
    pub async fn shutdown(mut self) -> mtls_proxy::Result<()> {
        self.shutdown.send(true).unwrap();
        let server = self.server.take().unwrap();
        server.await.unwrap()
    }
}

impl Drop for RunningProxy {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
