//! Cross-origin resource sharing middleware.
//!
//! [`CorsLayer`] wraps a service so that browser clients on another origin
//! can reach it: every `OPTIONS` request is answered directly as a
//! preflight, without touching the wrapped service, and every other
//! response is annotated with the configured allow headers on the way out.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use http::header::{
    HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
    ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS,
    ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_HEADERS, ORIGIN, VARY,
};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use thiserror::Error;
use tower::{Layer, Service};

const VARY_ORIGIN: &str = "Origin";
const VARY_REQUEST_HEADERS: &str = "Access-Control-Request-Headers";

/// Which `Origin` values are allowed to share responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowOrigin {
    /// Answer `Access-Control-Allow-Origin: *` to everyone.
    Any,
    /// Always answer with this fixed origin.
    Exact(String),
    /// Mirror the request origin back when it appears in the list.
    List(Vec<String>),
}

impl AllowOrigin {
    pub fn any() -> Self {
        Self::Any
    }

    pub fn exact(origin: impl Into<String>) -> Self {
        Self::Exact(origin.into())
    }

    pub fn list<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::List(origins.into_iter().map(Into::into).collect())
    }
}

/// Which request headers a preflight may approve.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AllowedHeaders {
    /// Echo `Access-Control-Request-Headers` back, approving whatever the
    /// browser asked for.
    #[default]
    MirrorRequest,
    /// Approve exactly this fixed set.
    List(Vec<HeaderName>),
}

impl AllowedHeaders {
    pub fn list<I>(headers: I) -> Self
    where
        I: IntoIterator<Item = HeaderName>,
    {
        Self::List(headers.into_iter().collect())
    }
}

/// CORS behavior knobs, resolved once into a policy when the layer is
/// built.
///
/// The defaults mirror the common permissive setup: every origin, the six
/// standard methods, requested headers echoed back, no credentials.
#[derive(Debug, Clone)]
pub struct CorsOptions {
    pub origin: AllowOrigin,
    /// Advertised in `Access-Control-Allow-Methods` on preflights.
    pub methods: Vec<Method>,
    pub allowed_headers: AllowedHeaders,
    /// Advertised in `Access-Control-Expose-Headers` when non-empty.
    pub exposed_headers: Vec<HeaderName>,
    /// Emit `Access-Control-Allow-Credentials: true`. Incompatible with
    /// [`AllowOrigin::Any`].
    pub credentials: bool,
    /// Advertised in `Access-Control-Max-Age` when set.
    pub max_age: Option<Duration>,
    /// Status answered on preflights. Some legacy browsers choke on `204`,
    /// so the default stays `200`.
    pub preflight_status: StatusCode,
}

impl Default for CorsOptions {
    fn default() -> Self {
        Self {
            origin: AllowOrigin::Any,
            methods: vec![
                Method::GET,
                Method::HEAD,
                Method::PUT,
                Method::PATCH,
                Method::POST,
                Method::DELETE,
            ],
            allowed_headers: AllowedHeaders::MirrorRequest,
            exposed_headers: Vec::new(),
            credentials: false,
            max_age: None,
            preflight_status: StatusCode::OK,
        }
    }
}

/// Rejected [`CorsOptions`] combination.
#[derive(Debug, Error)]
pub enum InvalidCorsOptions {
    #[error("allowing any origin together with credentials is forbidden by the CORS protocol")]
    AnyOriginWithCredentials,
    #[error("origin {0:?} is not a valid header value")]
    InvalidOrigin(String),
    #[error("computed response header value is invalid: {0}")]
    Header(#[from] http::header::InvalidHeaderValue),
}

/// Options resolved into precomputed header values.
#[derive(Debug)]
pub(crate) struct CorsPolicy {
    origin: OriginPolicy,
    allow_methods: Option<HeaderValue>,
    allowed_headers: HeadersPolicy,
    exposed_headers: Option<HeaderValue>,
    credentials: bool,
    max_age: Option<HeaderValue>,
    preflight_status: StatusCode,
}

#[derive(Debug)]
enum OriginPolicy {
    Any,
    Exact(HeaderValue),
    List(Vec<String>),
}

#[derive(Debug)]
enum HeadersPolicy {
    Mirror,
    List(Option<HeaderValue>),
}

impl CorsPolicy {
    pub(crate) fn new(options: CorsOptions) -> Result<Self, InvalidCorsOptions> {
        let CorsOptions {
            origin,
            methods,
            allowed_headers,
            exposed_headers,
            credentials,
            max_age,
            preflight_status,
        } = options;

        let origin = match origin {
            AllowOrigin::Any => {
                if credentials {
                    return Err(InvalidCorsOptions::AnyOriginWithCredentials);
                }
                OriginPolicy::Any
            }
            AllowOrigin::Exact(origin) => OriginPolicy::Exact(
                HeaderValue::from_str(&origin)
                    .map_err(|_| InvalidCorsOptions::InvalidOrigin(origin))?,
            ),
            AllowOrigin::List(origins) => OriginPolicy::List(origins),
        };

        let allow_methods = if methods.is_empty() {
            None
        } else {
            let joined = methods
                .iter()
                .map(Method::as_str)
                .collect::<Vec<_>>()
                .join(",");
            Some(HeaderValue::from_str(&joined)?)
        };

        let allowed_headers = match allowed_headers {
            AllowedHeaders::MirrorRequest => HeadersPolicy::Mirror,
            AllowedHeaders::List(names) if names.is_empty() => HeadersPolicy::List(None),
            AllowedHeaders::List(names) => {
                let joined = names
                    .iter()
                    .map(HeaderName::as_str)
                    .collect::<Vec<_>>()
                    .join(",");
                HeadersPolicy::List(Some(HeaderValue::from_str(&joined)?))
            }
        };

        let exposed_headers = if exposed_headers.is_empty() {
            None
        } else {
            let joined = exposed_headers
                .iter()
                .map(HeaderName::as_str)
                .collect::<Vec<_>>()
                .join(",");
            Some(HeaderValue::from_str(&joined)?)
        };

        let max_age = match max_age {
            Some(age) => Some(HeaderValue::from_str(&age.as_secs().to_string())?),
            None => None,
        };

        Ok(Self {
            origin,
            allow_methods,
            allowed_headers,
            exposed_headers,
            credentials,
            max_age,
            preflight_status,
        })
    }

    /// Builds the terminal preflight response for an `OPTIONS` request.
    pub(crate) fn preflight(&self, request_headers: &HeaderMap) -> Response<Body> {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = self.preflight_status;

        let origin = request_headers.get(ORIGIN);
        let headers = response.headers_mut();
        self.apply_origin(origin, headers);
        if self.credentials {
            headers.insert(
                ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
        if let Some(methods) = &self.allow_methods {
            headers.insert(ACCESS_CONTROL_ALLOW_METHODS, methods.clone());
        }
        match &self.allowed_headers {
            HeadersPolicy::Mirror => {
                append_vary(headers, VARY_REQUEST_HEADERS);
                if let Some(requested) = request_headers.get(ACCESS_CONTROL_REQUEST_HEADERS) {
                    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
                }
            }
            HeadersPolicy::List(Some(list)) => {
                headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, list.clone());
            }
            HeadersPolicy::List(None) => {}
        }
        if let Some(exposed) = &self.exposed_headers {
            headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, exposed.clone());
        }
        if let Some(max_age) = &self.max_age {
            headers.insert(ACCESS_CONTROL_MAX_AGE, max_age.clone());
        }

        response
    }

    /// Annotates a non-preflight response on its way back to the client.
    pub(crate) fn decorate(&self, origin: Option<&HeaderValue>, headers: &mut HeaderMap) {
        self.apply_origin(origin, headers);
        if self.credentials {
            headers.insert(
                ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
        if let Some(exposed) = &self.exposed_headers {
            headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, exposed.clone());
        }
    }

    fn apply_origin(&self, origin: Option<&HeaderValue>, headers: &mut HeaderMap) {
        match &self.origin {
            OriginPolicy::Any => {
                headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
            }
            OriginPolicy::Exact(allowed) => {
                append_vary(headers, VARY_ORIGIN);
                headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, allowed.clone());
            }
            OriginPolicy::List(allowed) => {
                // The answer depends on the request origin, so caches must
                // key on it whether or not this one matched.
                append_vary(headers, VARY_ORIGIN);
                let Some(origin) = origin else { return };
                let Ok(value) = origin.to_str() else { return };
                if allowed.iter().any(|entry| entry.eq_ignore_ascii_case(value)) {
                    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
                }
            }
        }
    }
}

/// Merges `entry` into the `Vary` header, deduplicating case-insensitively
/// and preserving whatever the response already varied on.
fn append_vary(headers: &mut HeaderMap, entry: &str) {
    let mut entries: Vec<String> = Vec::new();
    for existing in headers.get_all(VARY) {
        let Ok(existing) = existing.to_str() else { continue };
        for part in existing.split(',') {
            let part = part.trim();
            if !part.is_empty() && !entries.iter().any(|e| e.eq_ignore_ascii_case(part)) {
                entries.push(part.to_string());
            }
        }
    }
    if !entries.iter().any(|e| e.eq_ignore_ascii_case(entry)) {
        entries.push(entry.to_string());
    }
    if let Ok(joined) = HeaderValue::from_str(&entries.join(", ")) {
        headers.insert(VARY, joined);
    }
}

/// A [`Layer`] producing [`Cors`] middleware from validated options.
///
/// # Example
///
/// ```rust
/// use vms_proxy::{AllowOrigin, CorsLayer, CorsOptions};
///
/// let cors = CorsLayer::new(CorsOptions {
///     origin: AllowOrigin::exact("http://localhost:8080"),
///     ..CorsOptions::default()
/// })
/// .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct CorsLayer {
    policy: Arc<CorsPolicy>,
}

impl CorsLayer {
    /// Validates `options` and builds the layer.
    pub fn new(options: CorsOptions) -> Result<Self, InvalidCorsOptions> {
        Ok(Self {
            policy: Arc::new(CorsPolicy::new(options)?),
        })
    }
}

impl<S> Layer<S> for CorsLayer {
    type Service = Cors<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Cors {
            inner,
            policy: Arc::clone(&self.policy),
        }
    }
}

/// Middleware that answers preflights itself and annotates everything
/// else. `OPTIONS` requests never reach the wrapped service.
#[derive(Debug, Clone)]
pub struct Cors<S> {
    inner: S,
    policy: Arc<CorsPolicy>,
}

impl<S> Service<Request<Body>> for Cors<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let policy = Arc::clone(&self.policy);

        if req.method() == Method::OPTIONS {
            let response = policy.preflight(req.headers());
            return Box::pin(async move { Ok(response) });
        }

        let origin = req.headers().get(ORIGIN).cloned();
        let mut inner = self.inner.clone();
        Box::pin(async move {
            let mut response = inner.call(req).await?;
            policy.decorate(origin.as_ref(), response.headers_mut());
            Ok(response)
        })
    }
}

#[cfg(test)]
#[path = "cors_test.rs"]
mod cors_test;
