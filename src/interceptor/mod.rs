//! Interceptor chain around a transport call.
//!
//! Interceptors are sorted once by [`Interceptor::order`] (ties keep
//! insertion order) and driven like this:
//!
//! ```text
//!  execute(request)
//!       │
//!       ▼
//!  before_request   ascending   (-100 → 0 → 100 → 200)
//!       │
//!       ▼
//!  transport.execute
//!       │
//!   ok ─┴─ err
//!   │       │
//!   │       ▼
//!   │   on_error    ascending, first Ok(..) recovers,
//!   │       │       ctx.retry(..) re-enters with retry_count + 1
//!   ▼       ▼
//!  after_response   descending  (200 → 100 → 0 → -100)
//! ```
//!
//! Suggested order bands: negative for auth and early hooks, `0` default,
//! `100` retry, `200` logging.

mod chain;
mod logging;

pub use chain::{DEFAULT_MAX_RETRIES, InterceptingTransport, InterceptingTransportBuilder};
pub use logging::LoggingInterceptor;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::request::{RequestSpec, Response};
use crate::{Error, Result};

/// Order of the retry interceptor
pub const RETRY_ORDER: i32 = 100;

/// Order of the logging interceptor
pub const LOGGING_ORDER: i32 = 200;

// ============================================================================
// Interceptor capability
// ============================================================================

/// Cross-cutting hook around one transport call
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Sort key; lower runs earlier on the way out
    fn order(&self) -> i32 {
        0
    }

    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Rewrite the request before it is sent
    async fn before_request(&self, request: RequestSpec) -> Result<RequestSpec> {
        Ok(request)
    }

    /// Rewrite the response on its way back to the caller
    async fn after_response(&self, _request: &RequestSpec, response: Response) -> Result<Response> {
        Ok(response)
    }

    /// Handle a failed attempt.
    ///
    /// Return `Ok` to recover, `Err` to pass the (possibly rewritten) error to
    /// the next interceptor. `request` is the attempt's request as the caller
    /// built it, before any `before_request` rewriting.
    async fn on_error(
        &self,
        _request: &RequestSpec,
        error: Error,
        _ctx: &ChainContext<'_>,
    ) -> Result<Response> {
        Err(error)
    }
}

// ============================================================================
// Chain context
// ============================================================================

/// Retry bookkeeping for one attempt of a logical call
pub struct ChainContext<'a> {
    chain: &'a InterceptingTransport,
    retry_count: u32,
    max_retries: u32,
}

impl<'a> ChainContext<'a> {
    pub(crate) fn new(chain: &'a InterceptingTransport, retry_count: u32, max_retries: u32) -> Self {
        Self {
            chain,
            retry_count,
            max_retries,
        }
    }

    /// Retries already made before this attempt
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Chain-wide retry ceiling
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Run the whole chain again with `retry_count + 1`.
    ///
    /// Fails with [`Error::RetryExhausted`] once the ceiling is reached,
    /// whatever the calling interceptor's own limit is.
    pub fn retry(&self, request: RequestSpec) -> BoxFuture<'a, Result<Response>> {
        if self.retry_count >= self.max_retries {
            let max_retries = self.max_retries;
            return Box::pin(async move { Err(Error::RetryExhausted { max_retries }) });
        }
        self.chain.execute_with_retry(request, self.retry_count + 1)
    }
}

impl std::fmt::Debug for ChainContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainContext")
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}
