//! Composed request pipeline
//!
//! ```text
//! execute(request)
//!   → credentials.sign          once per logical call
//!   → interceptor chain         before_request / on_error + retry / after_response
//!   → circuit breaker           every attempt, including retries
//!   → transport
//! ```

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::auth::{CredentialProvider, HttpTokenEndpoint, NoAuth};
use crate::config::ClientConfig;
use crate::failsafe::{CircuitBreaker, CircuitBreakerTransport, RetryInterceptor};
use crate::interceptor::{DEFAULT_MAX_RETRIES, InterceptingTransport, Interceptor, LoggingInterceptor};
use crate::request::{RequestSpec, Response};
use crate::Result;
use crate::transport::{HttpTransport, TlsContext, Transport};

/// Single execution entry point shared by all call styles
///
/// ```
/// # tokio_test::block_on(async {
/// use std::sync::Arc;
///
/// use sentinel_http::auth::BearerAuth;
/// use sentinel_http::client::ApiClient;
/// use sentinel_http::request::{RequestSpec, Response, ResponseKind};
/// use sentinel_http::transport::Transport;
///
/// struct Canned;
///
/// #[async_trait::async_trait]
/// impl Transport for Canned {
///     async fn execute(&self, _request: &RequestSpec) -> sentinel_http::Result<Response> {
///         Ok(Response::new(200, ResponseKind::Json, r#"{"ok":true}"#))
///     }
/// }
///
/// let client = ApiClient::builder(Arc::new(Canned))
///     .credentials(Arc::new(BearerAuth::new("token")))
///     .build();
/// let body: serde_json::Value = client.execute_json(RequestSpec::get("/status")).await.unwrap();
/// assert_eq!(body["ok"], true);
/// # });
/// ```
pub struct ApiClient {
    name: String,
    credentials: Arc<dyn CredentialProvider>,
    chain: InterceptingTransport,
    breaker: Option<Arc<CircuitBreaker>>,
    transport: Arc<dyn Transport>,
}

impl ApiClient {
    /// Start building a client around `transport`
    pub fn builder(transport: Arc<dyn Transport>) -> ApiClientBuilder {
        ApiClientBuilder {
            name: "default".to_string(),
            transport,
            credentials: Arc::new(NoAuth),
            breaker: None,
            interceptors: Vec::new(),
            max_retries: None,
            retry_ceiling: 0,
        }
    }

    /// Wire a reqwest-backed client from configuration
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        config.circuit_breaker.validate()?;
        config.retry.validate()?;

        let transport = HttpTransport::new(&config.base_url, config.headers.clone(), config.timeout)?;
        let endpoint = Arc::new(HttpTokenEndpoint::new(config.timeout)?);

        let mut builder = Self::builder(transport)
            .name(&config.name)
            .credentials(config.credentials.build(endpoint))
            .circuit_breaker(Arc::new(CircuitBreaker::new(&config.name, &config.circuit_breaker)))
            .interceptor(Arc::new(LoggingInterceptor));

        if config.retry.enabled {
            let retry = RetryInterceptor::from_config(&config.retry)?;
            builder = builder.retry(Arc::new(retry));
        }

        debug!(
            client = %config.name,
            base_url = %config.base_url,
            credentials = config.credentials.kind(),
            retry = config.retry.enabled,
            circuit_breaker = config.circuit_breaker.enabled,
            "Client configured"
        );
        Ok(builder.build())
    }

    /// Client name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sign and execute one logical request
    #[tracing::instrument(skip_all, fields(client = %self.name, request = %request))]
    pub async fn execute(&self, request: RequestSpec) -> Result<Response> {
        let signed = self.credentials.sign(request).await?;
        self.chain.execute(&signed).await
    }

    /// Execute and decode a JSON body
    pub async fn execute_json<T: DeserializeOwned>(&self, request: RequestSpec) -> Result<T> {
        self.execute(request).await?.json()
    }

    /// Breaker guarding this client, if any
    #[must_use]
    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    /// Credential provider, for token introspection
    #[must_use]
    pub fn credentials(&self) -> &Arc<dyn CredentialProvider> {
        &self.credentials
    }

    /// Liveness probe that bypasses the interceptor chain.
    ///
    /// Counts in breaker metrics but never moves circuit state.
    pub async fn perform_health_check(&self, request: RequestSpec) -> bool {
        let signed = match self.credentials.sign(request).await {
            Ok(signed) => signed,
            Err(e) => {
                debug!(client = %self.name, error = %e, "Health check could not sign request");
                return false;
            }
        };
        match &self.breaker {
            Some(breaker) => breaker.perform_health_check(&signed, self.transport.as_ref()).await,
            None => self.transport.execute(&signed).await.is_ok(),
        }
    }

    /// Pass TLS settings through to the transport
    pub fn configure_ssl(&self, tls: TlsContext) -> Result<()> {
        self.chain.configure_ssl(tls)
    }

    /// Point the transport at another base URL
    pub fn set_base_url(&self, url: &str) -> Result<()> {
        self.chain.set_base_url(url)
    }
}

/// Builder for [`ApiClient`]
pub struct ApiClientBuilder {
    name: String,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    breaker: Option<Arc<CircuitBreaker>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    max_retries: Option<u32>,
    retry_ceiling: u32,
}

impl ApiClientBuilder {
    /// Client name for logs
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Credential provider (default: none)
    #[must_use]
    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Guard every attempt with `breaker`
    #[must_use]
    pub fn circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Add an interceptor
    #[must_use]
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Add a retry interceptor, raising the chain ceiling to its limit
    #[must_use]
    pub fn retry(mut self, retry: Arc<RetryInterceptor>) -> Self {
        self.retry_ceiling = self.retry_ceiling.max(retry.max_retries());
        self.interceptors.push(retry);
        self
    }

    /// Chain-wide retry ceiling.
    ///
    /// Defaults to [`DEFAULT_MAX_RETRIES`], or the largest limit of any
    /// interceptor added through [`Self::retry`] when that is higher.
    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Assemble the pipeline
    #[must_use]
    pub fn build(self) -> ApiClient {
        let guarded: Arc<dyn Transport> = match &self.breaker {
            Some(breaker) => Arc::new(CircuitBreakerTransport::new(
                breaker.clone(),
                self.transport.clone(),
            )),
            None => self.transport.clone(),
        };

        let max_retries = self
            .max_retries
            .unwrap_or_else(|| DEFAULT_MAX_RETRIES.max(self.retry_ceiling));
        let chain = InterceptingTransport::builder(guarded)
            .interceptors(self.interceptors)
            .max_retries(max_retries)
            .build();

        ApiClient {
            name: self.name,
            credentials: self.credentials,
            chain,
            breaker: self.breaker,
            transport: self.transport,
        }
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("name", &self.name)
            .field("interceptors", &self.chain.interceptors().len())
            .field("max_retries", &self.chain.max_retries())
            .field("circuit_breaker", &self.breaker.as_ref().map(|b| b.state()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::Error;
    use crate::auth::BearerAuth;
    use crate::config::{CircuitBreakerConfig, CredentialConfig};
    use crate::failsafe::CircuitState;
    use crate::request::ResponseKind;

    #[derive(Default)]
    struct Echo {
        calls: AtomicU32,
        fail_with: Option<u16>,
    }

    #[async_trait]
    impl Transport for Echo {
        async fn execute(&self, request: &RequestSpec) -> Result<Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(status) = self.fail_with {
                return Err(Error::http_status(status, "failed"));
            }
            let auth = request.header_value("Authorization").unwrap_or("none").to_string();
            Ok(Response::new(200, ResponseKind::Text, auth))
        }
    }

    /// Fails the first call with 503, then succeeds
    #[derive(Default)]
    struct FlakyOnce {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transport for FlakyOnce {
        async fn execute(&self, _request: &RequestSpec) -> Result<Response> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Error::http_status(503, "unavailable"));
            }
            Ok(Response::new(200, ResponseKind::Empty, ""))
        }
    }

    #[tokio::test]
    async fn execute_signs_request() {
        let client = ApiClient::builder(Arc::new(Echo::default()))
            .credentials(Arc::new(BearerAuth::new("tok")))
            .build();

        let response = client.execute(RequestSpec::get("/me")).await.unwrap();

        assert_eq!(response.text(), "Bearer tok");
    }

    #[tokio::test]
    async fn breaker_counts_every_attempt() {
        // GIVEN: a client with one retry over a failing transport
        let transport = Arc::new(Echo {
            fail_with: Some(500),
            ..Echo::default()
        });
        let breaker = Arc::new(CircuitBreaker::new("svc", &CircuitBreakerConfig::default()));
        let retry = RetryInterceptor::builder()
            .max_retries(1)
            .initial_delay_ms(0)
            .build()
            .unwrap();
        let client = ApiClient::builder(transport.clone())
            .circuit_breaker(breaker.clone())
            .interceptor(Arc::new(retry))
            .max_retries(1)
            .build();

        // WHEN
        let err = client.execute(RequestSpec::get("/")).await.unwrap_err();

        // THEN: both attempts went through the breaker
        assert_eq!(err.status(), Some(500));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert_eq!(breaker.metrics().failed_requests, 2);
        assert_eq!(client.circuit_breaker().map(|b| b.state()), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn default_ceiling_lets_added_retry_run() {
        // GIVEN: a transport that fails once, and no explicit chain ceiling
        let transport = Arc::new(FlakyOnce::default());
        let retry = RetryInterceptor::builder()
            .max_retries(3)
            .initial_delay_ms(0)
            .build()
            .unwrap();
        let client = ApiClient::builder(transport.clone())
            .interceptor(Arc::new(retry))
            .build();

        // WHEN
        let response = client.execute(RequestSpec::get("/")).await.unwrap();

        // THEN: the retry recovered the call
        assert_eq!(response.status(), 200);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.chain.max_retries(), DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn retry_raises_default_ceiling() {
        let retry = RetryInterceptor::builder().max_retries(7).build().unwrap();
        let client = ApiClient::builder(Arc::new(Echo::default()))
            .retry(Arc::new(retry))
            .build();
        assert_eq!(client.chain.max_retries(), 7);

        let capped = ApiClient::builder(Arc::new(Echo::default()))
            .retry(Arc::new(RetryInterceptor::builder().max_retries(7).build().unwrap()))
            .max_retries(2)
            .build();
        assert_eq!(capped.chain.max_retries(), 2);
    }

    #[tokio::test]
    async fn health_check_bypasses_chain() {
        let transport = Arc::new(Echo::default());
        let breaker = Arc::new(CircuitBreaker::new("svc", &CircuitBreakerConfig::default()));
        let client = ApiClient::builder(transport.clone())
            .circuit_breaker(breaker.clone())
            .build();

        assert!(client.perform_health_check(RequestSpec::get("/health")).await);
        assert_eq!(breaker.metrics().successful_requests, 1);
    }

    #[test]
    fn from_config_wires_pipeline() {
        let config = ClientConfig {
            name: "billing".to_string(),
            base_url: "http://127.0.0.1:9".to_string(),
            credentials: CredentialConfig::Bearer {
                token: "abc".to_string(),
            },
            ..ClientConfig::default()
        };

        let client = ApiClient::from_config(&config).unwrap();

        assert_eq!(client.name(), "billing");
        assert!(client.circuit_breaker().is_some());
        assert_eq!(client.credentials().access_token().as_deref(), Some("abc"));
    }

    #[test]
    fn from_config_rejects_bad_base_url() {
        let config = ClientConfig {
            base_url: "ftp://example.com".to_string(),
            ..ClientConfig::default()
        };
        assert!(matches!(ApiClient::from_config(&config), Err(Error::Config(_))));
    }
}
