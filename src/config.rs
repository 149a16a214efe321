use std::net::SocketAddr;

use thiserror::Error;

use crate::cors::{AllowOrigin, CorsOptions, InvalidCorsOptions};
use crate::proxy::{InvalidProxyConfig, ProxyOptions};

/// Port the shim listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 3000;

/// Path prefix forwarded to the upstream.
pub const DEFAULT_PREFIX: &str = "/vms";

/// Upstream base URL requests are relayed to.
pub const DEFAULT_UPSTREAM: &str = "http://localhost:8080";

/// Origin allowed by the default CORS policy.
pub const DEFAULT_ALLOW_ORIGIN: &str = "http://localhost:8080";

/// Everything the shim needs to run, resolved before startup.
///
/// The configuration is plain data: build it, hand it to
/// [`shim_router`](crate::shim_router), and it never changes while the
/// server runs.
#[derive(Debug, Clone)]
pub struct ShimConfig {
    /// Local address to bind.
    pub listen_addr: SocketAddr,
    /// Path prefix answered by the proxy.
    pub prefix: String,
    /// Upstream base URL.
    pub upstream: String,
    /// CORS policy applied to every response.
    pub cors: CorsOptions,
    /// Upstream client tuning.
    pub proxy: ProxyOptions,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            prefix: DEFAULT_PREFIX.to_string(),
            upstream: DEFAULT_UPSTREAM.to_string(),
            cors: CorsOptions {
                origin: AllowOrigin::exact(DEFAULT_ALLOW_ORIGIN),
                ..CorsOptions::default()
            },
            proxy: ProxyOptions::default(),
        }
    }
}

/// Configuration rejected while assembling the shim.
#[derive(Debug, Error)]
pub enum ShimError {
    #[error(transparent)]
    Cors(#[from] InvalidCorsOptions),
    #[error(transparent)]
    Proxy(#[from] InvalidProxyConfig),
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
