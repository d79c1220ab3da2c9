//! Pipeline integration tests - interceptor ordering, retry, breaker interplay

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use sentinel_http::client::ApiClient;
use sentinel_http::config::{CircuitBreakerConfig, FailurePolicyKind};
use sentinel_http::failsafe::{CircuitBreaker, CircuitState, RetryInterceptor};
use sentinel_http::interceptor::{ChainContext, InterceptingTransport, Interceptor, LoggingInterceptor};
use sentinel_http::request::{RequestSpec, Response, ResponseKind};
use sentinel_http::transport::Transport;
use sentinel_http::{Error, Result};

// ============================================================================
// Test doubles
// ============================================================================

/// Plays back scripted outcomes, then succeeds
struct Scripted {
    outcomes: Mutex<VecDeque<Option<u16>>>,
    calls: AtomicUsize,
}

impl Scripted {
    /// `Some(status)` fails with that status, `None` is a connection failure
    fn new(failures: impl IntoIterator<Item = Option<u16>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(failures.into_iter().collect()),
            calls: AtomicUsize::new(0),
        })
    }

    fn healthy() -> Arc<Self> {
        Self::new(Vec::new())
    }

    fn always(status: u16) -> Arc<Self> {
        Self::new(std::iter::repeat_n(Some(status), 1_000))
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for Scripted {
    async fn execute(&self, request: &RequestSpec) -> Result<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.outcomes.lock().pop_front();
        match next {
            Some(Some(status)) => Err(Error::http_status(status, "scripted failure")),
            Some(None) => Err(Error::connection("connection reset")),
            None => Ok(Response::new(200, ResponseKind::Text, request.endpoint().to_string())),
        }
    }
}

/// Records hook invocations into a shared log
struct Recorder {
    name: &'static str,
    order: i32,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Interceptor for Recorder {
    fn order(&self) -> i32 {
        self.order
    }

    fn name(&self) -> &str {
        self.name
    }

    async fn before_request(&self, request: RequestSpec) -> Result<RequestSpec> {
        self.log.lock().push(format!("before:{}", self.name));
        Ok(request)
    }

    async fn after_response(&self, _request: &RequestSpec, response: Response) -> Result<Response> {
        self.log.lock().push(format!("after:{}", self.name));
        Ok(response)
    }
}

/// Serves a canned body when every attempt failed
struct Fallback;

#[async_trait]
impl Interceptor for Fallback {
    fn order(&self) -> i32 {
        150
    }

    async fn on_error(&self, _request: &RequestSpec, _error: Error, _ctx: &ChainContext<'_>) -> Result<Response> {
        Ok(Response::new(200, ResponseKind::Text, "cached"))
    }
}

/// Upper-cases text bodies on the way back
struct Shout;

#[async_trait]
impl Interceptor for Shout {
    fn order(&self) -> i32 {
        -50
    }

    async fn after_response(&self, _request: &RequestSpec, response: Response) -> Result<Response> {
        let loud = response.text().to_uppercase();
        Ok(response.with_body(loud))
    }
}

/// Adds a header before every attempt
struct Stamp;

#[async_trait]
impl Interceptor for Stamp {
    fn order(&self) -> i32 {
        -100
    }

    async fn before_request(&self, request: RequestSpec) -> Result<RequestSpec> {
        Ok(request.header("X-Stamp", "1"))
    }
}

fn retry(max_retries: i64) -> Arc<RetryInterceptor> {
    Arc::new(
        RetryInterceptor::builder()
            .max_retries(max_retries)
            .initial_delay_ms(100)
            .max_delay(Duration::from_secs(1))
            .build()
            .unwrap(),
    )
}

fn chain(transport: Arc<dyn Transport>, max_retries: i64) -> InterceptingTransport {
    InterceptingTransport::builder(transport)
        .interceptor(Arc::new(LoggingInterceptor))
        .interceptor(retry(max_retries))
        .max_retries(u32::try_from(max_retries).unwrap())
        .build()
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_before_and_after_orders_mirror() {
    // GIVEN: orders [-100, 0, 100] registered shuffled
    let log = Arc::new(Mutex::new(Vec::new()));
    let make = |name: &'static str, order: i32| -> Arc<dyn Interceptor> {
        Arc::new(Recorder {
            name,
            order,
            log: Arc::clone(&log),
        })
    };
    let chain = InterceptingTransport::builder(Scripted::healthy())
        .interceptor(make("B", 0))
        .interceptor(make("C", 100))
        .interceptor(make("A", -100))
        .build();

    // WHEN
    chain.execute(&RequestSpec::get("/")).await.unwrap();

    // THEN
    assert_eq!(
        *log.lock(),
        vec!["before:A", "before:B", "before:C", "after:C", "after:B", "after:A"]
    );
}

#[tokio::test]
async fn test_recovered_value_flows_through_after_response() {
    // GIVEN: a non-retryable failure and a fallback interceptor
    let chain = InterceptingTransport::builder(Scripted::always(404))
        .interceptor(Arc::new(Fallback))
        .interceptor(Arc::new(Shout))
        .build();

    // WHEN
    let response = chain.execute(&RequestSpec::get("/")).await.unwrap();

    // THEN: the recovered body was transformed on the way out
    assert_eq!(response.text(), "CACHED");
}

// ============================================================================
// Retry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_fails_twice_then_succeeds() {
    // GIVEN: maxRetries = 3, two failures scripted
    let transport = Scripted::new([Some(503_u16), None]);
    let chain = chain(transport.clone(), 3);

    // WHEN
    let response = chain.execute(&RequestSpec::get("/orders")).await.unwrap();

    // THEN: 3 transport invocations, final success
    assert_eq!(transport.calls(), 3);
    assert_eq!(response.text(), "/orders");
}

#[tokio::test(start_paused = true)]
async fn test_always_failing_surfaces_original_error() {
    let transport = Scripted::always(502);
    let chain = chain(transport.clone(), 3);

    let err = chain.execute(&RequestSpec::get("/")).await.unwrap_err();

    assert_eq!(transport.calls(), 4);
    assert!(matches!(err, Error::Transport { status: Some(502), .. }));
}

#[tokio::test(start_paused = true)]
async fn test_client_error_not_retried() {
    let transport = Scripted::always(400);
    let chain = chain(transport.clone(), 3);

    let err = chain.execute(&RequestSpec::get("/")).await.unwrap_err();

    assert_eq!(transport.calls(), 1);
    assert_eq!(err.status(), Some(400));
}

#[tokio::test(start_paused = true)]
async fn test_later_interceptor_recovers_after_retries_exhausted() {
    // GIVEN: retry (order 100) ahead of a fallback (order 150) over a dead backend
    let transport = Scripted::always(503);
    let log = Arc::new(Mutex::new(Vec::new()));
    let chain = InterceptingTransport::builder(transport.clone())
        .interceptor(Arc::new(Fallback))
        .interceptor(retry(2))
        .interceptor(Arc::new(Recorder {
            name: "R",
            order: 0,
            log: Arc::clone(&log),
        }))
        .max_retries(2)
        .build();

    // WHEN
    let response = chain.execute(&RequestSpec::get("/")).await.unwrap();

    // THEN: the last failed attempt fell through to the fallback
    assert_eq!(response.text(), "cached");
    assert_eq!(transport.calls(), 3);
    let afters = log.lock().iter().filter(|entry| entry.starts_with("after:")).count();
    assert_eq!(afters, 1);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_delays_are_exponential() {
    // GIVEN: 100ms initial, x2, three failures
    let transport = Scripted::new([Some(500_u16); 3]);
    let chain = chain(transport.clone(), 3);
    let start = tokio::time::Instant::now();

    // WHEN
    chain.execute(&RequestSpec::get("/")).await.unwrap();

    // THEN: slept 100 + 200 + 400 ms
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(700), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(710), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_retry_reapplies_before_request() {
    // GIVEN: a header stamper and one failure
    struct HeaderCheck(AtomicUsize);

    #[async_trait]
    impl Transport for HeaderCheck {
        async fn execute(&self, request: &RequestSpec) -> Result<Response> {
            assert_eq!(request.headers().len(), 1, "header stamped exactly once per attempt");
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Error::http_status(503, "busy"));
            }
            Ok(Response::new(200, ResponseKind::Empty, ""))
        }
    }

    let transport = Arc::new(HeaderCheck(AtomicUsize::new(0)));
    let chain = InterceptingTransport::builder(transport.clone())
        .interceptor(Arc::new(Stamp))
        .interceptor(retry(2))
        .max_retries(2)
        .build();

    // WHEN / THEN
    chain.execute(&RequestSpec::get("/")).await.unwrap();
    assert_eq!(transport.0.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_backoff_is_distinct_error() {
    // GIVEN: a long backoff
    let transport = Scripted::always(503);
    let retry = RetryInterceptor::builder()
        .max_retries(3)
        .initial_delay_ms(60_000)
        .build()
        .unwrap();
    let token = retry.cancellation_token();
    let chain = Arc::new(
        InterceptingTransport::builder(transport.clone())
            .interceptor(Arc::new(retry))
            .build(),
    );

    let call = {
        let chain = Arc::clone(&chain);
        tokio::spawn(async move { chain.execute(&RequestSpec::get("/")).await })
    };
    while transport.calls() == 0 {
        tokio::task::yield_now().await;
    }

    // WHEN: cancelled mid-sleep
    token.cancel();

    // THEN
    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::InterruptedDuringBackoff { retry_count: 0 }));
    assert_eq!(transport.calls(), 1);
}

#[test]
fn test_invalid_retry_settings_fail_at_construction() {
    for builder in [
        RetryInterceptor::builder().max_retries(-1),
        RetryInterceptor::builder().initial_delay_ms(-1),
        RetryInterceptor::builder().backoff_multiplier(0.99),
    ] {
        assert!(matches!(builder.build(), Err(Error::Config(_))));
    }
}

// ============================================================================
// Breaker + retry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_circuit_open_is_never_retried() {
    // GIVEN: a breaker that trips on the first failure, and a generous retry budget
    let transport = Scripted::always(503);
    let breaker = Arc::new(CircuitBreaker::new(
        "orders",
        &CircuitBreakerConfig {
            failure_threshold: 1,
            failure_policy: FailurePolicyKind::AllExceptions,
            ..CircuitBreakerConfig::default()
        },
    ));
    let client = ApiClient::builder(transport.clone())
        .circuit_breaker(Arc::clone(&breaker))
        .interceptor(retry(5))
        .max_retries(5)
        .build();

    // WHEN
    let err = client.execute(RequestSpec::get("/")).await.unwrap_err();

    // THEN: first attempt tripped, the retry was rejected and not retried again
    assert!(err.is_circuit_open());
    assert_eq!(transport.calls(), 1);
    assert_eq!(breaker.state(), CircuitState::Open);
    let m = breaker.metrics();
    assert_eq!((m.failed_requests, m.rejected_requests, m.circuit_trips), (1, 1, 1));
}

#[tokio::test(start_paused = true)]
async fn test_client_recovers_after_reset_timeout() {
    let transport = Scripted::new([Some(500_u16); 2]);
    let breaker = Arc::new(CircuitBreaker::new(
        "billing",
        &CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(10),
            ..CircuitBreakerConfig::default()
        },
    ));
    let client = ApiClient::builder(transport.clone())
        .circuit_breaker(Arc::clone(&breaker))
        .build();

    let _ = client.execute(RequestSpec::get("/")).await;
    let _ = client.execute(RequestSpec::get("/")).await;
    assert!(client.execute(RequestSpec::get("/")).await.unwrap_err().is_circuit_open());

    tokio::time::advance(Duration::from_secs(10)).await;

    assert!(client.execute(RequestSpec::get("/")).await.is_ok());
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(transport.calls(), 3);
}
