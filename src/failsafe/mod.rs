//! Failsafe mechanisms: circuit breaker and retry

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerTransport, CircuitMetrics, CircuitState, FailurePolicy,
    FailurePredicate,
};
pub use retry::{RetryInterceptor, RetryInterceptorBuilder, RetryPredicate, is_retryable};
