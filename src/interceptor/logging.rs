//! Request/response logging hooks

use async_trait::async_trait;
use tracing::debug;

use super::{ChainContext, Interceptor, LOGGING_ORDER};
use crate::request::{RequestSpec, Response};
use crate::{Error, Result};

/// Logs each attempt at `debug` level. Header values are never logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingInterceptor;

#[async_trait]
impl Interceptor for LoggingInterceptor {
    fn order(&self) -> i32 {
        LOGGING_ORDER
    }

    fn name(&self) -> &str {
        "logging"
    }

    async fn before_request(&self, request: RequestSpec) -> Result<RequestSpec> {
        debug!(
            target: "sentinel_http::wire",
            method = %request.method(),
            endpoint = request.endpoint(),
            headers = request.headers().len(),
            "sending request"
        );
        Ok(request)
    }

    async fn after_response(&self, request: &RequestSpec, response: Response) -> Result<Response> {
        debug!(
            target: "sentinel_http::wire",
            method = %request.method(),
            endpoint = request.endpoint(),
            status = response.status(),
            bytes = response.body().len(),
            "response received"
        );
        Ok(response)
    }

    async fn on_error(&self, request: &RequestSpec, error: Error, ctx: &ChainContext<'_>) -> Result<Response> {
        debug!(
            target: "sentinel_http::wire",
            method = %request.method(),
            endpoint = request.endpoint(),
            retry_count = ctx.retry_count(),
            err = %error,
            "request error"
        );
        Err(error)
    }
}
