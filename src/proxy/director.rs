//! Rewrites client requests for the upstream target

use crate::error::{Error, Result};
use crate::identity::{ClientIdentity, IDENTITY_HEADER};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::{Authority, PathAndQuery, Scheme, Uri};
use http::{Request, Version};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use url::Url;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers meaningful only for a single transport hop
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// The single upstream every request is forwarded to
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    scheme: Scheme,
    authority: Authority,
    path: String,
    query: Option<String>,
}

impl UpstreamTarget {
    /// Parse an absolute `http://` or `https://` URL
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)?;

        let scheme = match url.scheme() {
            "http" => Scheme::HTTP,
            "https" => Scheme::HTTPS,
            other => {
                return Err(Error::UpstreamError(format!(
                    "Unsupported upstream scheme '{}', expected http or https",
                    other
                )))
            }
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::UpstreamError(format!("Upstream URL '{}' has no host", raw)))?;
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let authority = Authority::from_str(&authority)
            .map_err(|e| Error::UpstreamError(format!("Invalid upstream authority: {}", e)))?;

        Ok(UpstreamTarget {
            scheme,
            authority,
            path: url.path().to_string(),
            query: url.query().filter(|q| !q.is_empty()).map(str::to_string),
        })
    }

    /// Get the URI scheme
    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    /// Get the `host[:port]` authority
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Get the base path requests are joined onto
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Get the query merged into every request
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Whether connections to the upstream use TLS
    pub fn is_https(&self) -> bool {
        self.scheme == Scheme::HTTPS
    }

    /// Map a client request URI onto the upstream
    pub fn rewrite_uri(&self, uri: &Uri) -> Result<Uri> {
        let path = join_paths(&self.path, uri.path());
        let path_and_query = match merge_query(self.query(), uri.query()) {
            Some(query) => format!("{}?{}", path, query),
            None => path,
        };
        let path_and_query = PathAndQuery::from_str(&path_and_query)
            .map_err(|e| Error::UpstreamError(format!("Invalid forwarded path: {}", e)))?;

        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| Error::UpstreamError(format!("Invalid forwarded URI: {}", e)))
    }
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority, self.path)?;
        if let Some(query) = &self.query {
            write!(f, "?{}", query)?;
        }
        Ok(())
    }
}

impl fmt::Debug for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UpstreamTarget({})", self)
    }
}

impl FromStr for UpstreamTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Join two paths with exactly one `/` between them
pub fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Combine the target and request queries with `&`
pub fn merge_query(target: Option<&str>, request: Option<&str>) -> Option<String> {
    match (target.filter(|q| !q.is_empty()), request.filter(|q| !q.is_empty())) {
        (Some(t), Some(r)) => Some(format!("{}&{}", t, r)),
        (Some(q), None) | (None, Some(q)) => Some(q.to_string()),
        (None, None) => None,
    }
}

/// Remove hop-by-hop headers, including any listed in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_str(name.trim()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// Protocol requested by an HTTP/1.1 `Connection: upgrade` request
pub fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    if !has_token(headers, header::CONNECTION, "upgrade") {
        return None;
    }
    headers.get(header::UPGRADE).cloned()
}

/// Turn a client request into the request sent upstream
///
/// Any `x-mtls-subject` the client sent is replaced by the identity verified
/// during the handshake. Upgrade requests keep `Connection: upgrade` and
/// their `Upgrade` protocol; `TE: trailers` survives hop-by-hop stripping.
pub fn prepare_request<B>(
    req: &mut Request<B>,
    target: &UpstreamTarget,
    client_ip: IpAddr,
    identity: &ClientIdentity,
) -> Result<()> {
    let upgrade = if req.version() == Version::HTTP_11 {
        upgrade_protocol(req.headers())
    } else {
        None
    };
    let te_trailers = has_token(req.headers(), header::TE, "trailers");

    let uri = target.rewrite_uri(req.uri())?;
    *req.uri_mut() = uri;
    // the upstream pool speaks HTTP/1.1 regardless of the client protocol
    *req.version_mut() = Version::HTTP_11;

    let headers = req.headers_mut();
    strip_hop_by_hop(headers);
    if let Some(protocol) = upgrade {
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(header::UPGRADE, protocol);
    }
    if te_trailers {
        headers.insert(header::TE, HeaderValue::from_static("trailers"));
    }

    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let forwarded_for = if prior.is_empty() {
        client_ip.to_string()
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    };
    let forwarded_for = HeaderValue::from_str(&forwarded_for)
        .map_err(|e| Error::UpstreamError(format!("Invalid X-Forwarded-For: {}", e)))?;
    headers.insert(X_FORWARDED_FOR, forwarded_for);
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));

    let host = HeaderValue::from_str(target.authority.as_str())
        .map_err(|e| Error::UpstreamError(format!("Invalid Host header: {}", e)))?;
    headers.insert(header::HOST, host);

    headers.insert(IDENTITY_HEADER, identity.header_value().clone());

    Ok(())
}
