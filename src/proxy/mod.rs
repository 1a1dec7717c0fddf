//! TLS-terminating reverse proxy
//!
//! Every accepted connection completes an mTLS handshake against the
//! [`CertificateStore`] and [`TrustAnchor`], then each HTTP request on it is
//! forwarded to the upstream with the client identity attached. HTTP/1.1
//! upgrades accepted by the upstream become a raw tunnel between the two
//! connections.

pub mod director;

use crate::error::{Error, Result};
use crate::identity::ClientIdentity;
use crate::store::CertificateStore;
use crate::tls;
use crate::trust_anchor::TrustAnchor;
use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{Request, Response, StatusCode, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

pub use director::UpstreamTarget;

/// Body type of every response the proxy returns
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Default bound on waiting for upstream response headers
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on a client TLS handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time open connections get to finish after shutdown
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables for a [`TerminatingProxy`]
#[derive(Clone, Debug)]
pub struct ProxySettings {
    /// Where requests are forwarded
    pub target: UpstreamTarget,
    /// Time allowed for the upstream to return response headers
    pub upstream_timeout: Duration,
    /// Time allowed for a client to finish the TLS handshake
    pub handshake_timeout: Duration,
    /// Time open connections get to finish in-flight requests on shutdown
    pub drain_timeout: Duration,
}

impl ProxySettings {
    /// Settings for `target` with default timeouts
    pub fn new(target: UpstreamTarget) -> Self {
        ProxySettings {
            target,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// HTTPS listener that requires client certificates and forwards upstream
pub struct TerminatingProxy {
    acceptor: TlsAcceptor,
    forwarder: Arc<Forwarder>,
    handshake_timeout: Duration,
    drain_timeout: Duration,
}

impl TerminatingProxy {
    /// Build the proxy
    ///
    /// The store does not need to hold a certificate yet; handshakes are
    /// refused until it does.
    pub fn new(
        store: Arc<CertificateStore>,
        trust_anchor: &TrustAnchor,
        settings: ProxySettings,
    ) -> Result<Self> {
        let server_config = tls::build_server_config(store, trust_anchor)?;

        Ok(TerminatingProxy {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            forwarder: Arc::new(Forwarder::new(
                settings.target,
                settings.upstream_timeout,
            )?),
            handshake_timeout: settings.handshake_timeout,
            drain_timeout: settings.drain_timeout,
        })
    }

    /// Bind `addr` and serve until `shutdown` flips to `true`
    pub async fn serve(self, addr: SocketAddr, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener, shutdown).await
    }

    /// Serve connections from an already bound listener
    ///
    /// Accept errors are logged and never end the loop. On shutdown the
    /// listener is closed and open connections are asked to finish; any still
    /// running after the drain timeout are aborted.
    pub async fn serve_listener(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(
            "mTLS proxy listening on {}, forwarding to {}",
            listener.local_addr()?,
            self.forwarder.target
        );

        let mut connections = JoinSet::new();
        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(r) => r,
                        Err(e) => {
                            warn!("TCP accept error: {}", e);
                            continue;
                        }
                    };

                    connections.spawn(handle_connection(
                        stream,
                        remote_addr,
                        self.acceptor.clone(),
                        self.forwarder.clone(),
                        self.handshake_timeout,
                        shutdown.clone(),
                    ));
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        info!("mTLS proxy stopped accepting connections");
        self.drain(connections).await;
        Ok(())
    }

    async fn drain(&self, mut connections: JoinSet<()>) {
        if connections.is_empty() {
            return;
        }

        info!("Draining {} open connection(s)", connections.len());
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                "{} connection(s) still open after {:?}, closing them",
                connections.len(),
                self.drain_timeout
            );
            connections.shutdown().await;
        }
    }
}

/// Resolves once `shutdown` is `true` or its sender is gone
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    acceptor: TlsAcceptor,
    forwarder: Arc<Forwarder>,
    handshake_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let tls_stream = match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            debug!("TLS handshake failed from {}: {}", remote_addr, e);
            return;
        }
        Err(_) => {
            debug!("TLS handshake from {} timed out", remote_addr);
            return;
        }
    };

    let identity = match tls_stream.get_ref().1.peer_certificates() {
        Some(chain) => ClientIdentity::from_peer_chain(chain),
        None => Err(Error::certificate("Peer presented no certificate")),
    };
    let identity = match identity {
        Ok(identity) => Arc::new(identity),
        Err(e) => {
            warn!("Closing connection from {}: {}", remote_addr, e);
            return;
        }
    };
    debug!("Accepted {} from {}", identity.subject(), remote_addr);

    let client_ip = remote_addr.ip();
    let service = service_fn(move |req: Request<Incoming>| {
        let forwarder = forwarder.clone();
        let identity = identity.clone();
        async move { Ok::<_, Infallible>(forwarder.forward(req, client_ip, &identity).await) }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(tls_stream), service);
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            served = conn.as_mut() => {
                if let Err(e) = served {
                    debug!("Connection from {} ended with error: {}", remote_addr, e);
                }
                break;
            }
            _ = shutdown_signalled(&mut shutdown), if !draining => {
                debug!("Draining connection from {}", remote_addr);
                conn.as_mut().graceful_shutdown();
                draining = true;
            }
        }
    }
}

/// Sends rewritten requests to the upstream
struct Forwarder {
    client: Client<HttpsConnector<HttpConnector>, Incoming>,
    target: UpstreamTarget,
    timeout: Duration,
}

impl Forwarder {
    fn new(target: UpstreamTarget, timeout: Duration) -> Result<Self> {
        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls::build_upstream_client_config()?)
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Forwarder {
            client,
            target,
            timeout,
        })
    }

    async fn forward(
        &self,
        mut req: Request<Incoming>,
        client_ip: IpAddr,
        identity: &ClientIdentity,
    ) -> Response<ProxyBody> {
        let requested_upgrade = if req.version() == Version::HTTP_11 {
            director::upgrade_protocol(req.headers())
        } else {
            None
        };
        let client_upgrade = requested_upgrade
            .as_ref()
            .map(|_| hyper::upgrade::on(&mut req));

        if let Err(e) = director::prepare_request(&mut req, &self.target, client_ip, identity) {
            warn!("Cannot forward request from {}: {}", client_ip, e);
            return gateway_error(StatusCode::BAD_GATEWAY);
        }

        let method = req.method().clone();
        let uri = req.uri().clone();

        match tokio::time::timeout(self.timeout, self.client.request(req)).await {
            Ok(Ok(resp)) if resp.status() == StatusCode::SWITCHING_PROTOCOLS => {
                match (client_upgrade, requested_upgrade) {
                    (Some(client_upgrade), Some(requested)) => {
                        debug!("{} {} -> switching protocols", method, uri);
                        switch_protocols(resp, client_upgrade, requested, client_ip)
                    }
                    _ => {
                        error!(
                            "Upstream switched protocols for {} {} without an upgrade request",
                            method, uri
                        );
                        gateway_error(StatusCode::BAD_GATEWAY)
                    }
                }
            }
            Ok(Ok(resp)) => {
                debug!("{} {} -> {}", method, uri, resp.status());
                let (mut parts, body) = resp.into_parts();
                director::strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, body.boxed())
            }
            Ok(Err(e)) => {
                error!("Upstream request {} {} failed: {}", method, uri, e);
                gateway_error(StatusCode::BAD_GATEWAY)
            }
            Err(_) => {
                error!(
                    "Upstream request {} {} timed out after {:?}",
                    method, uri, self.timeout
                );
                gateway_error(StatusCode::GATEWAY_TIMEOUT)
            }
        }
    }
}

/// Answer the client with the upstream's 101 and tunnel both upgraded
/// connections once hyper hands them over
fn switch_protocols(
    mut resp: Response<Incoming>,
    client_upgrade: OnUpgrade,
    requested: HeaderValue,
    client_ip: IpAddr,
) -> Response<ProxyBody> {
    let upstream_upgrade = hyper::upgrade::on(&mut resp);
    let (mut parts, _) = resp.into_parts();

    let protocol = parts.headers.get(header::UPGRADE).cloned().unwrap_or(requested);
    director::strip_hop_by_hop(&mut parts.headers);
    parts
        .headers
        .insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    parts.headers.insert(header::UPGRADE, protocol);

    tokio::spawn(async move {
        match tokio::try_join!(client_upgrade, upstream_upgrade) {
            Ok((client, upstream)) => {
                let mut client = TokioIo::new(client);
                let mut upstream = TokioIo::new(upstream);
                match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                    Ok((sent, received)) => debug!(
                        "Tunnel for {} closed ({} bytes up, {} bytes down)",
                        client_ip, sent, received
                    ),
                    Err(e) => debug!("Tunnel for {} ended with error: {}", client_ip, e),
                }
            }
            Err(e) => warn!("Protocol upgrade for {} failed: {}", client_ip, e),
        }
    });

    let body = Empty::<Bytes>::new()
        .map_err(|never: Infallible| -> hyper::Error { match never {} })
        .boxed();
    Response::from_parts(parts, body)
}

fn gateway_error(status: StatusCode) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(status.canonical_reason().unwrap_or("")))
        .map_err(|never: Infallible| -> hyper::Error { match never {} })
        .boxed();
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp
}
