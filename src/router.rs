use axum::Router;

use crate::config::{ShimConfig, ShimError};
use crate::cors::CorsLayer;
use crate::proxy::PrefixProxy;

/// Enables conversion from a [`PrefixProxy`] into an axum [`Router`].
///
/// The proxy is mounted as the router's fallback service, so it answers
/// every method and path the router has no explicit route for. Prefix
/// matching happens inside the proxy itself, which keeps the original
/// path intact on the upstream call instead of stripping the prefix the
/// way nested routers do.
///
/// # Example
///
/// ```rust
/// use axum::Router;
/// use vms_proxy::PrefixProxy;
///
/// let proxy = PrefixProxy::new("/vms", "http://localhost:8080").unwrap();
/// let app: Router = proxy.into();
/// ```
impl<S> From<PrefixProxy> for Router<S>
where
    S: Send + Sync + Clone + 'static,
{
    fn from(proxy: PrefixProxy) -> Self {
        Router::<S>::new().fallback_service(proxy)
    }
}

/// Builds the complete shim router for `config`: the forwarding proxy
/// wrapped in CORS middleware.
///
/// The CORS layer sits outermost, so preflights are answered for every
/// path, including those the proxy would reject with 404.
pub fn shim_router(config: &ShimConfig) -> Result<Router, ShimError> {
    let proxy = PrefixProxy::with_options(&config.prefix, &config.upstream, config.proxy.clone())?;
    let cors = CorsLayer::new(config.cors.clone())?;
    Ok(Router::from(proxy).layer(cors))
}
