//! Transport boundary
//!
//! The pipeline never opens sockets itself; it decides whether and when a
//! request reaches a [`Transport`]. Decorators (circuit breaker, interceptor
//! chain) implement the same trait so they compose in either order.

mod http;

pub use self::http::HttpTransport;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::request::{RequestSpec, Response};

/// TLS settings handed to [`Transport::configure_ssl`]
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<rustls::ClientConfig>,
}

impl TlsContext {
    /// Wrap a preconfigured rustls client configuration
    #[must_use]
    pub fn new(config: rustls::ClientConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// The wrapped rustls configuration
    #[must_use]
    pub fn client_config(&self) -> &rustls::ClientConfig {
        &self.config
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("alpn_protocols", &self.config.alpn_protocols.len())
            .finish_non_exhaustive()
    }
}

/// Executes one request attempt
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send the request and wait for the response
    async fn execute(&self, request: &RequestSpec) -> Result<Response>;

    /// Replace the TLS configuration (passthrough for decorators)
    fn configure_ssl(&self, _tls: TlsContext) -> Result<()> {
        Ok(())
    }

    /// Replace the base URL endpoints are resolved against (passthrough for decorators)
    fn set_base_url(&self, _url: &str) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn execute(&self, request: &RequestSpec) -> Result<Response> {
        (**self).execute(request).await
    }

    fn configure_ssl(&self, tls: TlsContext) -> Result<()> {
        (**self).configure_ssl(tls)
    }

    fn set_base_url(&self, url: &str) -> Result<()> {
        (**self).set_base_url(url)
    }
}
