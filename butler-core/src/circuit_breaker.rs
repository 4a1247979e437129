//! Per-provider circuit breaker (`spec.md` §4.1).
//!
//! Grounded on `roster/messenger/tests/test_reliability_circuit_breaker.py`:
//! a closed/open/half-open state machine guarding calls to a single named
//! provider (a channel adapter, an LLM runtime, anything `Error`-fallible).
//! Validation errors never count toward the trip threshold; timeout and
//! target-unavailable errors count only when their config flag is set;
//! every other error kind always counts.

use std::future::Future;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::CircuitBreakerConfig;
use crate::error::{Error, ErrorKind};

/// The three states a breaker can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    half_open_attempts: u32,
    half_open_successes: u32,
    last_error_class: Option<ErrorKind>,
    last_error_message: Option<String>,
}

/// A single provider's breaker. One instance per provider name, typically
/// owned by a registry keyed on provider string (`spec.md` §4.1).
pub struct CircuitBreaker {
    provider: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

/// Status snapshot for operational dashboards (`spec.md` §4.1 `get_status`).
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStatus {
    pub provider: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_error_class: Option<String>,
    pub last_error_message: Option<String>,
    pub config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_attempts: 0,
                half_open_successes: 0,
                last_error_class: None,
                last_error_message: None,
            }),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("circuit breaker mutex poisoned").state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Run `f`, recording the outcome against the breaker's state machine.
    ///
    /// Returns [`Error::CircuitOpen`] without calling `f` at all if the
    /// circuit is open and the recovery timeout has not yet elapsed.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        {
            let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
            if inner.state == CircuitState::Open {
                let opened_at = inner.opened_at.expect("open state always carries opened_at");
                let elapsed = (Utc::now() - opened_at).num_milliseconds() as f64 / 1000.0;
                if elapsed >= self.config.recovery_timeout_seconds {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_attempts = 0;
                    inner.half_open_successes = 0;
                    tracing::info!(provider = %self.provider, "circuit transitioning to half-open");
                } else {
                    return Err(Error::CircuitOpen {
                        provider: self.provider.clone(),
                        opened_at,
                        last_error_class: inner.last_error_class.map(|k| k.to_string()),
                    });
                }
            }

            if inner.state == CircuitState::HalfOpen {
                if inner.half_open_attempts >= self.config.half_open_max_attempts {
                    return Err(Error::CircuitOpen {
                        provider: self.provider.clone(),
                        opened_at: inner.opened_at.unwrap_or_else(Utc::now),
                        last_error_class: inner.last_error_class.map(|k| k.to_string()),
                    });
                }
                inner.half_open_attempts += 1;
            }
        }

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    fn countable(&self, kind: ErrorKind) -> bool {
        if !kind.is_ever_countable() {
            return false;
        }
        match kind {
            ErrorKind::Timeout => self.config.count_timeout_as_failure,
            ErrorKind::TargetUnavailable => self.config.count_target_unavailable_as_failure,
            _ => true,
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_success_threshold {
                    tracing::info!(provider = %self.provider, "circuit closing after half-open successes");
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    inner.half_open_attempts = 0;
                    inner.half_open_successes = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, err: &Error) {
        let kind = err.kind();
        if !self.countable(kind) {
            return;
        }

        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        inner.last_error_class = Some(kind);
        inner.last_error_message = Some(err.to_string());

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(provider = %self.provider, failures = inner.consecutive_failures, "circuit opening");
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Utc::now());
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(provider = %self.provider, "circuit re-opening after half-open failure");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Utc::now());
                inner.half_open_attempts = 0;
                inner.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        CircuitBreakerStatus {
            provider: self.provider.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
            last_error_class: inner.last_error_class.map(|k| k.to_string()),
            last_error_message: inner.last_error_message.clone(),
            config: self.config.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unavailable() -> Error {
        Error::domain(ErrorKind::TargetUnavailable, "service unavailable")
    }

    #[tokio::test]
    async fn initial_state_is_closed() {
        let breaker = CircuitBreaker::new("telegram", CircuitBreakerConfig::default());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn successful_operation_passes_through() {
        let breaker = CircuitBreaker::new("telegram", CircuitBreakerConfig::default());
        let result = breaker.execute(|| async { Ok::<_, Error>("success") }).await;
        assert_eq!(result.unwrap(), "success");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn single_failure_does_not_open_circuit() {
        let config = CircuitBreakerConfig { failure_threshold: 3, ..CircuitBreakerConfig::default() };
        let breaker = CircuitBreaker::new("telegram", config);
        let _ = breaker.execute(|| async { Err::<(), _>(unavailable()) }).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn consecutive_failures_open_circuit() {
        let config = CircuitBreakerConfig { failure_threshold: 3, ..CircuitBreakerConfig::default() };
        let breaker = CircuitBreaker::new("telegram", config);
        for _ in 0..2 {
            let _ = breaker.execute(|| async { Err::<(), _>(unavailable()) }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        let _ = breaker.execute(|| async { Err::<(), _>(unavailable()) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.is_open());
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_executing() {
        let config = CircuitBreakerConfig { failure_threshold: 2, ..CircuitBreakerConfig::default() };
        let breaker = CircuitBreaker::new("telegram", config);
        for _ in 0..2 {
            let _ = breaker.execute(|| async { Err::<(), _>(unavailable()) }).await;
        }
        assert!(breaker.is_open());

        let call_count = std::sync::atomic::AtomicU32::new(0);
        let result = breaker
            .execute(|| {
                call_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err::<(), _>(unavailable()) }
            })
            .await;

        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert_eq!(call_count.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transitions_to_half_open_after_recovery_timeout() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout_seconds: 0.05,
            ..CircuitBreakerConfig::default()
        };
        let breaker = CircuitBreaker::new("telegram", config);
        for _ in 0..2 {
            let _ = breaker.execute(|| async { Err::<(), _>(unavailable()) }).await;
        }
        assert!(breaker.is_open());

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;

        let _ = breaker.execute(|| async { Err::<(), _>(unavailable()) }).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_successes_close_circuit() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout_seconds: 0.05,
            half_open_success_threshold: 2,
            ..CircuitBreakerConfig::default()
        };
        let breaker = CircuitBreaker::new("telegram", config);
        for _ in 0..2 {
            let _ = breaker.execute(|| async { Err::<(), _>(unavailable()) }).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;

        let r1 = breaker.execute(|| async { Ok::<_, Error>(()) }).await;
        assert!(r1.is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let r2 = breaker.execute(|| async { Ok::<_, Error>(()) }).await;
        assert!(r2.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_circuit() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout_seconds: 0.05,
            half_open_max_attempts: 2,
            ..CircuitBreakerConfig::default()
        };
        let breaker = CircuitBreaker::new("telegram", config);
        for _ in 0..2 {
            let _ = breaker.execute(|| async { Err::<(), _>(unavailable()) }).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;

        let _ = breaker.execute(|| async { Err::<(), _>(unavailable()) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn validation_errors_never_count() {
        let config = CircuitBreakerConfig { failure_threshold: 2, ..CircuitBreakerConfig::default() };
        let breaker = CircuitBreaker::new("telegram", config);
        for _ in 0..3 {
            let _ = breaker
                .execute(|| async { Err::<(), _>(Error::domain(ErrorKind::ValidationError, "bad input")) })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn timeout_errors_respect_config_flag() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            count_timeout_as_failure: false,
            ..CircuitBreakerConfig::default()
        };
        let breaker = CircuitBreaker::new("telegram", config);
        for _ in 0..3 {
            let _ = breaker
                .execute(|| async { Err::<(), _>(Error::domain(ErrorKind::Timeout, "timed out")) })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn success_resets_failure_counter_in_closed_state() {
        let config = CircuitBreakerConfig { failure_threshold: 3, ..CircuitBreakerConfig::default() };
        let breaker = CircuitBreaker::new("telegram", config);
        for _ in 0..2 {
            let _ = breaker.execute(|| async { Err::<(), _>(unavailable()) }).await;
        }
        let _ = breaker.execute(|| async { Ok::<_, Error>(()) }).await;
        for _ in 0..2 {
            let _ = breaker.execute(|| async { Err::<(), _>(unavailable()) }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        let _ = breaker.execute(|| async { Err::<(), _>(unavailable()) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn status_reports_error_context_after_failure() {
        let config = CircuitBreakerConfig { failure_threshold: 2, ..CircuitBreakerConfig::default() };
        let breaker = CircuitBreaker::new("telegram", config);
        let _ = breaker.execute(|| async { Err::<(), _>(unavailable()) }).await;
        let status = breaker.status();
        assert_eq!(status.consecutive_failures, 1);
        assert_eq!(status.last_error_class.as_deref(), Some("target_unavailable"));
        assert!(status.last_error_message.unwrap().to_lowercase().contains("unavailable"));
    }
}
