//! Process configuration read from environment variables

use crate::error::{Error, Result};
use crate::proxy::{ProxySettings, UpstreamTarget};
use crate::source::{secret_id_for_domain, FileSecretSource, HttpSecretSource, SecretSource};
use crate::trust_anchor::TrustAnchor;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const DEFAULT_UPSTREAM_TIMEOUT: &str = "30s";
const DEFAULT_HANDSHAKE_TIMEOUT: &str = "10s";
const DEFAULT_DRAIN_TIMEOUT: &str = "30s";
const DEFAULT_SECRET_FETCH_TIMEOUT: &str = "10s";

/// Where the certificate payload is fetched from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SecretSourceConfig {
    /// Secret store reachable over HTTP
    Http {
        /// Base URL; the secret id is appended as a path
        endpoint: Url,
    },
    /// Mounted secret volume
    File {
        /// Directory holding `<domain>/certificate`
        dir: PathBuf,
    },
}

/// Complete, validated configuration for one proxy process
#[derive(Clone, Debug)]
pub struct Config {
    /// Delay between certificate refreshes
    pub cert_interval: Duration,
    /// Address to bind
    pub bind_address: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Upstream every request is forwarded to
    pub target: UpstreamTarget,
    /// Domain whose certificate is served
    pub domain: String,
    /// CAs client certificates must chain to
    pub trust_anchor: TrustAnchor,
    /// Where the certificate payload lives
    pub secret_source: SecretSourceConfig,
    /// Bound on waiting for upstream response headers
    pub upstream_timeout: Duration,
    /// Bound on a client TLS handshake
    pub handshake_timeout: Duration,
    /// Time open connections get to finish after shutdown
    pub drain_timeout: Duration,
    /// Bound on a single secret fetch
    pub secret_fetch_timeout: Duration,
}

impl Config {
    /// Read the configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`
    ///
    /// Required variables are checked in a fixed order and the first problem
    /// is reported. Empty values count as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |key: &str, missing: &str| get(key).ok_or_else(|| Error::config(missing));

        let cert_interval = parse_duration(
            "CERT_INTERVAL",
            &require(
                "CERT_INTERVAL",
                "interval to refresh certificate missing, please provide CERT_INTERVAL",
            )?,
        )?;

        let port = require("PORT", "port is missing, please provide PORT")?;
        let port = match port.parse::<u16>() {
            Ok(p) if p != 0 => p,
            _ => return Err(Error::config(format!("invalid PORT '{}'", port))),
        };

        let target = require(
            "PROXY_TARGET",
            "reverse proxy target is missing, please provide PROXY_TARGET",
        )?;
        let target = UpstreamTarget::parse(&target)
            .map_err(|e| Error::config(format!("invalid PROXY_TARGET '{}': {}", target, e)))?;

        let domain = require(
            "DOMAIN",
            "reverse proxy domain is missing, please provide DOMAIN",
        )?;

        let ca_file = require(
            "CLIENT_CA_FILE",
            "client CA is missing, please provide CLIENT_CA_FILE",
        )?;
        let trust_anchor = TrustAnchor::from_pem_file(&ca_file)?;

        let secret_source = match (get("SECRET_ENDPOINT"), get("SECRET_DIR")) {
            (Some(endpoint), _) => SecretSourceConfig::Http {
                endpoint: Url::parse(&endpoint).map_err(|e| {
                    Error::config(format!("invalid SECRET_ENDPOINT '{}': {}", endpoint, e))
                })?,
            },
            (None, Some(dir)) => SecretSourceConfig::File {
                dir: PathBuf::from(dir),
            },
            (None, None) => {
                return Err(Error::config(
                    "secret source is missing, please provide SECRET_ENDPOINT or SECRET_DIR",
                ))
            }
        };

        let bind_address = match get("BIND_ADDRESS") {
            Some(addr) => addr
                .parse()
                .map_err(|_| Error::config(format!("invalid BIND_ADDRESS '{}'", addr)))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        let optional_duration = |key: &str, default: &str| {
            parse_duration(key, &get(key).unwrap_or_else(|| default.to_string()))
        };

        Ok(Config {
            cert_interval,
            bind_address,
            port,
            target,
            domain,
            trust_anchor,
            secret_source,
            upstream_timeout: optional_duration("UPSTREAM_TIMEOUT", DEFAULT_UPSTREAM_TIMEOUT)?,
            handshake_timeout: optional_duration("HANDSHAKE_TIMEOUT", DEFAULT_HANDSHAKE_TIMEOUT)?,
            drain_timeout: optional_duration("DRAIN_TIMEOUT", DEFAULT_DRAIN_TIMEOUT)?,
            secret_fetch_timeout: optional_duration(
                "SECRET_FETCH_TIMEOUT",
                DEFAULT_SECRET_FETCH_TIMEOUT,
            )?,
        })
    }

    /// Socket address the proxy binds
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Secret id derived from the domain
    pub fn secret_id(&self) -> String {
        secret_id_for_domain(&self.domain)
    }

    /// Build the configured secret source
    pub fn build_secret_source(&self) -> Result<Arc<dyn SecretSource>> {
        let secret_id = self.secret_id();
        Ok(match &self.secret_source {
            SecretSourceConfig::Http { endpoint } => Arc::new(HttpSecretSource::new(
                endpoint,
                &secret_id,
                self.secret_fetch_timeout,
            )?),
            SecretSourceConfig::File { dir } => {
                Arc::new(FileSecretSource::new(dir.clone(), &secret_id))
            }
        })
    }

    /// Proxy tunables derived from this configuration
    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            target: self.target.clone(),
            upstream_timeout: self.upstream_timeout,
            handshake_timeout: self.handshake_timeout,
            drain_timeout: self.drain_timeout,
        }
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    let duration = humantime::parse_duration(value)
        .map_err(|e| Error::config(format!("invalid {} '{}': {}", key, value, e)))?;
    if duration.is_zero() {
        return Err(Error::config(format!("{} must be greater than zero", key)));
    }
    Ok(duration)
}
