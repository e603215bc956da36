//! Retry with jittered exponential backoff and a per-service circuit
//! breaker. Composition is always retry(circuit_breaker(raw call)): the
//! breaker sees every attempt, and a breaker-open error is not retryable, so
//! an open circuit fails fast without consuming the retry budget.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{info, warn};

use clinicsync_core::{ExternalService, SyncError};

#[derive(Clone, Debug)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: u32,
    pub jitter: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            exponential_base: 2,
            jitter: true,
        }
    }
}

impl RetryOptions {
    /// Delay before retrying after the given zero-based attempt:
    /// `min(max_delay, base_delay * base^attempt)`, jittered by a uniform
    /// factor in `[0.5, 1.0]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = self.exponential_base.saturating_pow(attempt);
        let delay_ms = self.base_delay_ms.saturating_mul(u64::from(exponent)).min(self.max_delay_ms);

        let delay_ms = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            (delay_ms as f64 * factor) as u64
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms)
    }
}

/// Run `operation` up to `1 + max_retries` times. Only retryable failures
/// consume the budget; anything else aborts immediately. Exhausting the
/// budget returns the last error.
pub async fn with_retry<T, F, Fut>(
    options: &RetryOptions,
    context: &str,
    mut operation: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(
                        event_name = "resilience.retry.recovered",
                        context,
                        attempt,
                        "operation succeeded after {attempt} retries"
                    );
                }
                return Ok(value);
            }
            Err(error) => {
                if !error.retryable() || attempt >= options.max_retries {
                    return Err(error);
                }

                let delay = options.delay_for_attempt(attempt);
                attempt += 1;
                warn!(
                    event_name = "resilience.retry.scheduled",
                    context,
                    attempt,
                    max_retries = options.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Per-service circuit breaker. State is process-wide and shared by every
/// call to the owning client.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: ExternalService,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(service: ExternalService, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            service,
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn service(&self) -> ExternalService {
        self.service
    }

    pub fn state(&self) -> CircuitState {
        self.lock_inner().state
    }

    /// Runs `operation` unless the circuit is open. While open, calls fail
    /// fast without touching the network; after the cooldown exactly one
    /// half-open probe is let through and its outcome decides the next state.
    pub async fn execute<T, F, Fut>(&self, context: &str, operation: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        self.try_acquire(context)?;

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(error)
            }
        }
    }

    fn try_acquire(&self, context: &str) -> Result<(), SyncError> {
        let mut inner = self.lock_inner();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Err(SyncError::CircuitOpen { service: self.service }),
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .is_some_and(|opened_at| opened_at.elapsed() >= self.cooldown);
                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    info!(
                        event_name = "resilience.breaker.half_open",
                        service = self.service.as_str(),
                        context,
                        "circuit breaker allowing half-open probe"
                    );
                    Ok(())
                } else {
                    Err(SyncError::CircuitOpen { service: self.service })
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock_inner();
        if inner.state == CircuitState::HalfOpen {
            info!(
                event_name = "resilience.breaker.closed",
                service = self.service.as_str(),
                "circuit breaker recovered"
            );
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    fn record_failure(&self) {
        let mut inner = self.lock_inner();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(
                    event_name = "resilience.breaker.reopened",
                    service = self.service.as_str(),
                    "half-open probe failed, circuit breaker reopened"
                );
            }
            _ => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        event_name = "resilience.breaker.opened",
                        service = self.service.as_str(),
                        failures = inner.consecutive_failures,
                        threshold = self.failure_threshold,
                        "circuit breaker tripped open"
                    );
                }
            }
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use clinicsync_core::{ExternalService, SyncError};

    use super::{with_retry, CircuitBreaker, CircuitState, RetryOptions};

    fn retryable_error() -> SyncError {
        SyncError::Network {
            service: ExternalService::Crm,
            status: Some(503),
            message: "service unavailable".to_owned(),
            retryable: true,
        }
    }

    fn terminal_error() -> SyncError {
        SyncError::Network {
            service: ExternalService::Crm,
            status: Some(400),
            message: "bad request".to_owned(),
            retryable: false,
        }
    }

    fn fast_retry() -> RetryOptions {
        RetryOptions { max_retries: 3, base_delay_ms: 1, max_delay_ms: 5, ..RetryOptions::default() }
    }

    #[tokio::test]
    async fn retry_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);

        let result = with_retry(&fast_retry(), "test", || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(retryable_error())
                } else {
                    Ok("recovered")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("recovered"));
        // Two retries were consumed before the third attempt succeeded.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_abort_immediately() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(&fast_retry(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(terminal_error()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_returns_the_last_error() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(&fast_retry(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(retryable_error()) }
        })
        .await;

        assert_eq!(result, Err(retryable_error()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let options = RetryOptions {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 350,
            exponential_base: 2,
            jitter: false,
        };

        assert_eq!(options.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(options.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(options.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(options.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let options = RetryOptions {
            max_retries: 1,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            exponential_base: 2,
            jitter: true,
        };

        for _ in 0..50 {
            let delay = options.delay_for_attempt(0).as_millis() as u64;
            assert!((500..=1000).contains(&delay), "jittered delay {delay} out of range");
        }
    }

    #[tokio::test]
    async fn breaker_opens_at_threshold_and_fails_fast() {
        let breaker =
            CircuitBreaker::new(ExternalService::Crm, 3, Duration::from_secs(60));
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let result: Result<(), _> = breaker
                .execute("test", || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(retryable_error()) }
                })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // While open, the wrapped operation is never invoked.
        let result: Result<(), _> = breaker
            .execute("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert_eq!(result, Err(SyncError::CircuitOpen { service: ExternalService::Crm }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn half_open_probe_closes_on_success() {
        let breaker = CircuitBreaker::new(ExternalService::Crm, 1, Duration::from_millis(0));

        let _: Result<(), _> = breaker.execute("test", || async { Err(retryable_error()) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // Cooldown of zero: the next call is the single half-open probe.
        let result = breaker.execute("test", || async { Ok("ok") }).await;
        assert_eq!(result, Ok("ok"));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(ExternalService::BookingSystem, 1, Duration::from_millis(0));

        let _: Result<(), _> = breaker.execute("test", || async { Err(retryable_error()) }).await;
        let _: Result<(), _> = breaker.execute("test", || async { Err(retryable_error()) }).await;

        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn open_circuit_error_is_not_retryable() {
        let breaker = CircuitBreaker::new(ExternalService::Crm, 1, Duration::from_secs(60));
        let _: Result<(), _> = breaker.execute("test", || async { Err(retryable_error()) }).await;

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_retry(), "test", || {
            breaker.execute("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
        })
        .await;

        assert_eq!(result, Err(SyncError::CircuitOpen { service: ExternalService::Crm }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
