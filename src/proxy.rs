//! Prefix-gated forwarding service.
//!
//! [`PrefixProxy`] relays every request whose path falls under a configured
//! prefix to a fixed upstream base URL, streaming bodies in both directions.
//! Requests outside the prefix get an empty `404 Not Found`.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use http::header::{HeaderName, CONNECTION, HOST};
use http::{HeaderMap, Request, Response, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use thiserror::Error;
use tower::Service;
use tracing::{error, trace};

/// Headers scoped to a single connection, per RFC 9110 section 7.6.1.
/// They are stripped from both directions of the relay.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

/// Rejected [`PrefixProxy`] configuration.
#[derive(Debug, Error)]
pub enum InvalidProxyConfig {
    #[error("prefix {0:?} must start with '/'")]
    PrefixNotRooted(String),
    #[error("prefix {0:?} must not end with '/'")]
    PrefixTrailingSlash(String),
    #[error("invalid upstream URL: {0}")]
    UpstreamUrl(#[from] http::uri::InvalidUri),
    #[error("upstream URL {0:?} must carry a scheme and an authority")]
    UpstreamNotAbsolute(String),
    #[error("upstream URL scheme {0:?} is not supported, expected http or https")]
    UpstreamScheme(String),
    #[error("upstream URL {0:?} must not carry a query string")]
    UpstreamQuery(String),
    #[error("upstream URL {0:?} must not carry a fragment")]
    UpstreamFragment(String),
}

/// Tuning knobs for the upstream HTTP client.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// TCP connect timeout. `None` waits as long as the OS allows.
    pub connect_timeout: Option<Duration>,
    /// Deadline for the upstream to produce response headers. Exceeding it
    /// yields `504 Gateway Timeout`. `None` (the default) never times out.
    pub upstream_timeout: Option<Duration>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            upstream_timeout: None,
        }
    }
}

/// A forwarding [`Service`] bound to one upstream server.
///
/// Matching requests are relayed with their full original path, so a proxy
/// built with prefix `/vms` and upstream `http://localhost:8080` turns
/// `GET /vms/api/vms` into `GET http://localhost:8080/vms/api/vms`. The
/// upstream sees what the client sent, minus hop-by-hop headers.
///
/// Each request maps to at most one upstream call. A connection failure
/// becomes `502 Bad Gateway` and an exceeded deadline becomes `504
/// Gateway Timeout`. Everything the upstream does answer is relayed
/// as-is, error statuses included.
///
/// # Example
///
/// ```rust
/// use vms_proxy::PrefixProxy;
///
/// let proxy = PrefixProxy::new("/vms", "http://localhost:8080").unwrap();
/// ```
#[derive(Clone)]
pub struct PrefixProxy {
    prefix: String,
    upstream: String,
    upstream_timeout: Option<Duration>,
    client: Client<HttpConnector, Body>,
}

impl std::fmt::Debug for PrefixProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefixProxy")
            .field("prefix", &self.prefix)
            .field("upstream", &self.upstream)
            .field("upstream_timeout", &self.upstream_timeout)
            .finish()
    }
}

impl PrefixProxy {
    /// Creates a proxy with default [`ProxyOptions`].
    ///
    /// The prefix must be rooted (`"/vms"`) and must not end with a slash;
    /// `""` and `"/"` match every path. The upstream must be an absolute
    /// `http` or `https` URL without a query string or fragment.
    pub fn new(prefix: &str, upstream: &str) -> Result<Self, InvalidProxyConfig> {
        Self::with_options(prefix, upstream, ProxyOptions::default())
    }

    /// Creates a proxy with explicit client tuning.
    pub fn with_options(
        prefix: &str,
        upstream: &str,
        options: ProxyOptions,
    ) -> Result<Self, InvalidProxyConfig> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(false);
        connector.set_keepalive(Some(Duration::from_secs(60)));
        connector.set_connect_timeout(options.connect_timeout);
        connector.set_reuse_address(true);

        let client = Client::builder(hyper_util::rt::TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(32)
            .retry_canceled_requests(true)
            .set_host(true)
            .build(connector);

        Self::with_client(prefix, upstream, options, client)
    }

    /// Creates a proxy from a caller-supplied client, for tests or custom
    /// connector stacks.
    pub fn with_client(
        prefix: &str,
        upstream: &str,
        options: ProxyOptions,
        client: Client<HttpConnector, Body>,
    ) -> Result<Self, InvalidProxyConfig> {
        validate_prefix(prefix)?;
        let upstream = validate_upstream(upstream)?;
        Ok(Self {
            prefix: prefix.to_string(),
            upstream,
            upstream_timeout: options.upstream_timeout,
            client,
        })
    }

    /// The path prefix this proxy answers for.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The upstream base URL, normalized without a trailing slash.
    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    /// Whether `path` falls under the configured prefix.
    ///
    /// `/vms` matches `/vms` and `/vms/anything` but not `/vmsearch`.
    pub fn matches(&self, path: &str) -> bool {
        match self.prefix.as_str() {
            "" | "/" => true,
            prefix => {
                path == prefix
                    || path
                        .strip_prefix(prefix)
                        .is_some_and(|rest| rest.starts_with('/'))
            }
        }
    }

    /// Relays one request to the upstream and returns the response.
    ///
    /// Never fails: every error condition maps to a gateway status, which
    /// lets the service slot into axum with `Infallible` as its error type.
    pub async fn forward(&self, req: Request<Body>) -> Response<Body> {
        if !self.matches(req.uri().path()) {
            trace!(
                "Path {} is outside prefix {}, answering 404",
                req.uri().path(),
                self.prefix
            );
            return empty_response(StatusCode::NOT_FOUND);
        }

        let (mut parts, body) = req.into_parts();
        let upstream_uri = format!(
            "{}{}",
            self.upstream,
            parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        );
        trace!(
            "Forwarding request method={} uri={} upstream_uri={}",
            parts.method,
            parts.uri,
            upstream_uri
        );

        strip_hop_by_hop(&mut parts.headers);
        // The client derives Host from the upstream authority.
        parts.headers.remove(HOST);

        let mut builder = Request::builder()
            .method(parts.method)
            .uri(upstream_uri)
            .version(Version::HTTP_11);
        for (name, value) in parts.headers.iter() {
            builder = builder.header(name, value);
        }
        let upstream_req = match builder.body(body) {
            Ok(req) => req,
            Err(err) => {
                error!("Failed to build upstream request err={}", err);
                return gateway_response(
                    StatusCode::BAD_GATEWAY,
                    format!("Failed to build upstream request: {}", err),
                );
            }
        };

        let call = self.client.request(upstream_req);
        let result = match self.upstream_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, call).await {
                Ok(result) => result,
                Err(_) => {
                    error!(
                        "Upstream {} exceeded deadline deadline={:?}",
                        self.upstream, deadline
                    );
                    return gateway_response(
                        StatusCode::GATEWAY_TIMEOUT,
                        format!("Upstream server did not respond within {:?}", deadline),
                    );
                }
            },
            None => call.await,
        };

        match result {
            Ok(res) => {
                trace!(
                    "Received response status={} version={:?}",
                    res.status(),
                    res.version()
                );

                let (mut parts, body) = res.into_parts();
                strip_hop_by_hop(&mut parts.headers);

                let mut response = Response::new(Body::from_stream(body.into_data_stream()));
                *response.status_mut() = parts.status;
                *response.version_mut() = parts.version;
                *response.headers_mut() = parts.headers;
                response
            }
            Err(err) => {
                error!(
                    "Failed to connect to upstream upstream={} err={}",
                    self.upstream, err
                );
                gateway_response(
                    StatusCode::BAD_GATEWAY,
                    format!("Failed to connect to upstream server: {}", err),
                )
            }
        }
    }
}

impl Service<Request<Body>> for PrefixProxy {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let proxy = self.clone();
        Box::pin(async move { Ok(proxy.forward(req).await) })
    }
}

fn validate_prefix(prefix: &str) -> Result<(), InvalidProxyConfig> {
    if prefix.is_empty() || prefix == "/" {
        return Ok(());
    }
    if !prefix.starts_with('/') {
        return Err(InvalidProxyConfig::PrefixNotRooted(prefix.to_string()));
    }
    if prefix.ends_with('/') {
        return Err(InvalidProxyConfig::PrefixTrailingSlash(prefix.to_string()));
    }
    Ok(())
}

fn validate_upstream(upstream: &str) -> Result<String, InvalidProxyConfig> {
    let uri = Uri::from_str(upstream)?;
    let scheme = match uri.scheme_str() {
        Some(scheme) => scheme,
        None => {
            return Err(InvalidProxyConfig::UpstreamNotAbsolute(
                upstream.to_string(),
            ))
        }
    };
    if uri.authority().is_none() {
        return Err(InvalidProxyConfig::UpstreamNotAbsolute(
            upstream.to_string(),
        ));
    }
    if scheme != "http" && scheme != "https" {
        return Err(InvalidProxyConfig::UpstreamScheme(scheme.to_string()));
    }
    if uri.query().is_some() {
        return Err(InvalidProxyConfig::UpstreamQuery(upstream.to_string()));
    }
    // Uri parsing drops the fragment, so it only shows in the raw string.
    if upstream.contains('#') {
        return Err(InvalidProxyConfig::UpstreamFragment(upstream.to_string()));
    }
    Ok(upstream.trim_end_matches('/').to_string())
}

/// Removes hop-by-hop headers: the fixed RFC 9110 set plus anything the
/// `Connection` header nominates.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let mut nominated: Vec<HeaderName> = Vec::new();
    for value in headers.get_all(CONNECTION) {
        let Ok(value) = value.to_str() else { continue };
        for token in value.split(',') {
            if let Ok(name) = HeaderName::from_str(token.trim()) {
                nominated.push(name);
            }
        }
    }
    for name in nominated {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn empty_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

fn gateway_response(status: StatusCode, message: String) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
#[path = "proxy_test.rs"]
mod proxy_test;
