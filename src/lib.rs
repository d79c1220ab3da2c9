//! Sentinel HTTP Library
//!
//! Resilient request-execution core for API clients.
//!
//! # Features
//!
//! - **Circuit Breaker**: CLOSED/OPEN/HALF_OPEN with decayed failure counting and a single probe
//! - **Interceptor Chain**: ordered request/response/error hooks with re-entrant retry
//! - **Retry Policy**: exponential backoff, pluggable retryability, cancellable sleeps
//! - **Credentials**: basic, bearer and OAuth2 grants with single-flight token refresh
//! - **Transport**: reqwest + rustls, swappable behind a trait

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod interceptor;
pub mod request;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))
}
