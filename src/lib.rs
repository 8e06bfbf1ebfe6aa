//! Rota Fetch - Resilient HTTP Transport
//!
//! A composable client-side pipeline for high-volume outbound HTTP.
//!
//! ## Features
//!
//! - Pooled base client with cookie persistence and logged redirects
//! - Round-robin egress proxy rotation (HTTP, HTTPS, SOCKS5) with per-proxy clients
//! - Retries with jittered exponential backoff and `Retry-After` support for 429
//! - Bounded concurrency
//! - Cancellation and an overall deadline honored at every wait

pub mod config;
pub mod error;
pub mod models;
pub mod transport;

pub use config::{Config, TransportConfig};
pub use error::{FetchError, ProxyError, Result};
pub use models::{FetchRequest, FetchResponse};
pub use transport::{build, Pipeline, Transport};
