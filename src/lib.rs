//! A small CORS-enabled reverse proxy for local development.
//!
//! Browser front ends served from one origin often need to talk to a
//! backend listening on another local port, where the browser's
//! same-origin policy gets in the way. This crate puts a shim in front of
//! the backend: it answers CORS preflights itself, annotates every other
//! response with the configured allow headers, and relays requests under
//! a path prefix to the backend unchanged.
//!
//! The building blocks are ordinary tower services, so they compose with
//! any axum application:
//!
//! ```rust
//! use axum::Router;
//! use vms_proxy::{shim_router, ShimConfig};
//!
//! let app: Router = shim_router(&ShimConfig::default()).unwrap();
//! ```
//!
//! [`ShimConfig::default`] reproduces the canonical local setup: listen
//! on `127.0.0.1:3000`, forward `/vms` to `http://localhost:8080`, and
//! allow that same origin in CORS responses. Paths outside the prefix
//! answer `404`, except `OPTIONS`, which the CORS middleware terminates
//! everywhere.

mod config;
mod cors;
mod proxy;
mod router;

pub use config::{
    ShimConfig, ShimError, DEFAULT_ALLOW_ORIGIN, DEFAULT_PORT, DEFAULT_PREFIX, DEFAULT_UPSTREAM,
};
pub use cors::{AllowOrigin, AllowedHeaders, Cors, CorsLayer, CorsOptions, InvalidCorsOptions};
pub use proxy::{InvalidProxyConfig, PrefixProxy, ProxyOptions};
pub use router::shim_router;
