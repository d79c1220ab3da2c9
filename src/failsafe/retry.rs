//! Retry interceptor with exponential backoff

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RetryConfig;
use crate::interceptor::{ChainContext, Interceptor, RETRY_ORDER};
use crate::request::{RequestSpec, Response};
use crate::{Error, Result};

/// Decides whether an error is worth another attempt
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Default retryability rule.
///
/// Retries connection-level failures (no status), 408, 429 and any 5xx.
/// Never retries an open circuit, credential failures or other 4xx.
#[must_use]
pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Transport { status: None, .. } | Error::Io(_) => true,
        Error::Transport {
            status: Some(status),
            ..
        } => matches!(*status, 408 | 429) || *status >= 500,
        _ => false,
    }
}

/// Retries failed attempts through [`ChainContext::retry`].
///
/// The delay before retry `n` (0-based) is
/// `min(initial_delay * backoff_multiplier^n, max_delay)`.
pub struct RetryInterceptor {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    predicate: RetryPredicate,
    cancel: CancellationToken,
}

impl RetryInterceptor {
    /// Start building with the default settings (3 retries, 100ms, 10s cap, x2)
    #[must_use]
    pub fn builder() -> RetryInterceptorBuilder {
        RetryInterceptorBuilder::default()
    }

    /// Build from configuration
    pub fn from_config(config: &RetryConfig) -> Result<Self> {
        let initial_delay_ms = i64::try_from(config.initial_delay.as_millis()).unwrap_or(i64::MAX);
        Self::builder()
            .max_retries(config.max_retries)
            .initial_delay_ms(initial_delay_ms)
            .max_delay(config.max_delay)
            .backoff_multiplier(config.backoff_multiplier)
            .build()
    }

    /// Retry budget of this interceptor
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff before retry number `retry_count` (0-based)
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Token that aborts any pending and future backoff sleep
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl std::fmt::Debug for RetryInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryInterceptor")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Interceptor for RetryInterceptor {
    fn order(&self) -> i32 {
        RETRY_ORDER
    }

    fn name(&self) -> &str {
        "retry"
    }

    async fn on_error(&self, request: &RequestSpec, error: Error, ctx: &ChainContext<'_>) -> Result<Response> {
        let retry_count = ctx.retry_count();

        if !(self.predicate)(&error) {
            debug!(error = %error, "Error is not retryable");
            return Err(error);
        }
        if retry_count >= self.max_retries {
            debug!(retry_count, max_retries = self.max_retries, "Max retries reached");
            return Err(error);
        }

        let delay = self.delay_for(retry_count);
        debug!(
            request = %request,
            retry_count,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Retrying after backoff"
        );

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                debug!(retry_count, "Backoff interrupted");
                return Err(Error::InterruptedDuringBackoff { retry_count });
            }
            () = sleep(delay) => {}
        }

        ctx.retry(request.clone()).await
    }
}

/// Builder for [`RetryInterceptor`]; values are checked in [`build`](Self::build)
pub struct RetryInterceptorBuilder {
    max_retries: i64,
    initial_delay_ms: i64,
    max_delay: Duration,
    backoff_multiplier: f64,
    predicate: RetryPredicate,
    cancel: Option<CancellationToken>,
}

impl Default for RetryInterceptorBuilder {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            predicate: Arc::new(is_retryable),
            cancel: None,
        }
    }
}

impl RetryInterceptorBuilder {
    /// Retries after the first attempt
    #[must_use]
    pub fn max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before the first retry, in milliseconds
    #[must_use]
    pub fn initial_delay_ms(mut self, initial_delay_ms: i64) -> Self {
        self.initial_delay_ms = initial_delay_ms;
        self
    }

    /// Cap on any single delay
    #[must_use]
    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Growth factor per retry
    #[must_use]
    pub fn backoff_multiplier(mut self, backoff_multiplier: f64) -> Self {
        self.backoff_multiplier = backoff_multiplier;
        self
    }

    /// Replace the retryability rule
    #[must_use]
    pub fn predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(predicate);
        self
    }

    /// Share a cancellation token, e.g. one tied to application shutdown
    #[must_use]
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<RetryInterceptor> {
        if self.max_retries < 0 {
            return Err(Error::Config(format!(
                "max_retries must not be negative (got {})",
                self.max_retries
            )));
        }
        let max_retries = u32::try_from(self.max_retries)
            .map_err(|_| Error::Config(format!("max_retries too large (got {})", self.max_retries)))?;
        let initial_delay_ms = u64::try_from(self.initial_delay_ms).map_err(|_| {
            Error::Config(format!(
                "initial_delay_ms must not be negative (got {})",
                self.initial_delay_ms
            ))
        })?;
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::Config(format!(
                "backoff_multiplier must be finite and >= 1.0 (got {})",
                self.backoff_multiplier
            )));
        }

        Ok(RetryInterceptor {
            max_retries,
            initial_delay: Duration::from_millis(initial_delay_ms),
            max_delay: self.max_delay,
            backoff_multiplier: self.backoff_multiplier,
            predicate: self.predicate,
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::interceptor::InterceptingTransport;
    use crate::transport::Transport;

    struct Failing {
        status: Option<u16>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transport for Failing {
        async fn execute(&self, _request: &RequestSpec) -> Result<Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.status {
                Some(status) => Err(Error::http_status(status, "failed")),
                None => Err(Error::connection("refused")),
            }
        }
    }

    #[test]
    fn default_predicate_classification() {
        assert!(is_retryable(&Error::connection("reset")));
        for status in [408, 429, 500, 502, 503, 504, 507] {
            assert!(is_retryable(&Error::http_status(status, "x")), "{status}");
        }
        for status in [400, 401, 403, 404, 409, 422] {
            assert!(!is_retryable(&Error::http_status(status, "x")), "{status}");
        }
        assert!(!is_retryable(&Error::CircuitOpen {
            name: "svc".to_string(),
            retry_in: Duration::from_secs(1),
        }));
        assert!(!is_retryable(&Error::Credential("expired".to_string())));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let retry = RetryInterceptor::builder()
            .initial_delay_ms(100)
            .backoff_multiplier(2.0)
            .max_delay(Duration::from_millis(500))
            .build()
            .unwrap();

        assert_eq!(retry.delay_for(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for(2), Duration::from_millis(400));
        assert_eq!(retry.delay_for(3), Duration::from_millis(500));
        assert_eq!(retry.delay_for(u32::MAX), Duration::from_millis(500));

        let immediate = RetryInterceptor::builder()
            .initial_delay_ms(0)
            .backoff_multiplier(1e300)
            .build()
            .unwrap();
        assert_eq!(immediate.delay_for(5), Duration::ZERO);
    }

    #[test]
    fn invalid_settings_rejected_at_build() {
        assert!(matches!(
            RetryInterceptor::builder().max_retries(-1).build(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RetryInterceptor::builder().initial_delay_ms(-5).build(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RetryInterceptor::builder().backoff_multiplier(0.5).build(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RetryInterceptor::builder().backoff_multiplier(f64::NAN).build(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RetryInterceptor::builder().backoff_multiplier(f64::INFINITY).build(),
            Err(Error::Config(_))
        ));
        assert!(RetryInterceptor::builder().max_retries(0).initial_delay_ms(0).build().is_ok());
    }

    #[test]
    fn from_config_uses_config_values() {
        let config = RetryConfig {
            max_retries: 5,
            ..RetryConfig::default()
        };
        let retry = RetryInterceptor::from_config(&config).unwrap();
        assert_eq!(retry.max_retries(), 5);
        assert_eq!(retry.delay_for(0), Duration::from_millis(100));

        let bad = RetryConfig {
            backoff_multiplier: 0.9,
            ..RetryConfig::default()
        };
        assert!(RetryInterceptor::from_config(&bad).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_makes_max_retries_plus_one_calls() {
        // GIVEN: a transport that always returns 503
        let transport = Arc::new(Failing {
            status: Some(503),
            calls: AtomicU32::new(0),
        });
        let chain = InterceptingTransport::builder(transport.clone())
            .interceptor(Arc::new(RetryInterceptor::builder().max_retries(3).build().unwrap()))
            .max_retries(3)
            .build();

        // WHEN
        let err = chain.execute(&RequestSpec::get("/")).await.unwrap_err();

        // THEN: the original error surfaces after 4 attempts
        assert_eq!(err.status(), Some(503));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_backoff_surfaces_interruption() {
        // GIVEN: a long backoff and a cancelled token
        let retry = RetryInterceptor::builder()
            .initial_delay_ms(60_000)
            .build()
            .unwrap();
        retry.cancellation_token().cancel();
        let transport = Arc::new(Failing {
            status: None,
            calls: AtomicU32::new(0),
        });
        let chain = InterceptingTransport::builder(transport.clone())
            .interceptor(Arc::new(retry))
            .build();

        // WHEN
        let err = chain.execute(&RequestSpec::get("/")).await.unwrap_err();

        // THEN: no retry was issued
        assert!(matches!(err, Error::InterruptedDuringBackoff { retry_count: 0 }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn custom_predicate_can_retry_client_errors() {
        let transport = Arc::new(Failing {
            status: Some(409),
            calls: AtomicU32::new(0),
        });
        let retry = RetryInterceptor::builder()
            .max_retries(1)
            .initial_delay_ms(0)
            .predicate(|e| e.status() == Some(409))
            .build()
            .unwrap();
        let chain = InterceptingTransport::builder(transport.clone())
            .interceptor(Arc::new(retry))
            .build();

        let _ = chain.execute(&RequestSpec::get("/")).await;

        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }
}
