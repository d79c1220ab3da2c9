//! Transport decorated with an ordered interceptor list

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::debug;

use super::{ChainContext, Interceptor};
use crate::request::{RequestSpec, Response};
use crate::transport::{TlsContext, Transport};
use crate::{Error, Result};

/// Default chain-wide retry ceiling
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Runs every call through the interceptor chain before reaching `transport`.
///
/// The interceptor list is fixed at construction and read without locking.
pub struct InterceptingTransport {
    transport: Arc<dyn Transport>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    max_retries: u32,
}

impl InterceptingTransport {
    /// Start building a chain around `transport`
    pub fn builder(transport: Arc<dyn Transport>) -> InterceptingTransportBuilder {
        InterceptingTransportBuilder {
            transport,
            interceptors: Vec::new(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Interceptors in execution order
    #[must_use]
    pub fn interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.interceptors
    }

    /// Chain-wide retry ceiling
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Wrapped transport
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Run one attempt of a logical call.
    ///
    /// `after_response` hooks only run in the outermost frame, so a response
    /// produced by a nested retry passes through them exactly once.
    pub(crate) fn execute_with_retry(
        &self,
        request: RequestSpec,
        retry_count: u32,
    ) -> BoxFuture<'_, Result<Response>> {
        Box::pin(async move {
            let original = request.clone();

            let mut prepared = request;
            for interceptor in &self.interceptors {
                prepared = interceptor.before_request(prepared).await?;
            }

            let outcome = match self.transport.execute(&prepared).await {
                Ok(response) => Ok(response),
                Err(error) => self.handle_error(&original, error, retry_count).await,
            };

            match outcome {
                Ok(response) if retry_count == 0 => self.apply_after_response(&prepared, response).await,
                other => other,
            }
        })
    }

    async fn handle_error(&self, request: &RequestSpec, error: Error, retry_count: u32) -> Result<Response> {
        let ctx = ChainContext::new(self, retry_count, self.max_retries);
        let mut error = error;
        for interceptor in &self.interceptors {
            match interceptor.on_error(request, error, &ctx).await {
                Ok(response) => {
                    debug!(interceptor = interceptor.name(), retry_count, "Interceptor recovered from error");
                    return Ok(response);
                }
                Err(e) => error = e,
            }
        }
        Err(error)
    }

    async fn apply_after_response(&self, request: &RequestSpec, response: Response) -> Result<Response> {
        let mut response = response;
        for interceptor in self.interceptors.iter().rev() {
            response = interceptor.after_response(request, response).await?;
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for InterceptingTransport {
    async fn execute(&self, request: &RequestSpec) -> Result<Response> {
        self.execute_with_retry(request.clone(), 0).await
    }

    fn configure_ssl(&self, tls: TlsContext) -> Result<()> {
        self.transport.configure_ssl(tls)
    }

    fn set_base_url(&self, url: &str) -> Result<()> {
        self.transport.set_base_url(url)
    }
}

/// Builder for [`InterceptingTransport`]
pub struct InterceptingTransportBuilder {
    transport: Arc<dyn Transport>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    max_retries: u32,
}

impl InterceptingTransportBuilder {
    /// Append an interceptor
    #[must_use]
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Append several interceptors
    #[must_use]
    pub fn interceptors(mut self, interceptors: impl IntoIterator<Item = Arc<dyn Interceptor>>) -> Self {
        self.interceptors.extend(interceptors);
        self
    }

    /// Set the chain-wide retry ceiling
    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sort interceptors and freeze the chain
    #[must_use]
    pub fn build(mut self) -> InterceptingTransport {
        // stable: equal orders keep insertion order
        self.interceptors.sort_by_key(|i| i.order());
        InterceptingTransport {
            transport: self.transport,
            interceptors: self.interceptors,
            max_retries: self.max_retries,
        }
    }
}
