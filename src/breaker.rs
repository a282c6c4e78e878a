//! Circuit breaker: a three-state (CLOSED/OPEN/HALF_OPEN) machine consulted
//! before every protected call and updated on success/failure (spec §4.3).
//! One instance lives on the dispatcher side and one inside every worker
//! (spec §3, §9) — they never share state.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::{ErrorCategory, WorkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub half_open_max_calls: u32,
    pub half_open_successes_to_close: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            cooldown: Duration::from_secs(10),
            half_open_max_calls: 2,
            half_open_successes_to_close: 2,
        }
    }
}

struct Inner {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_permits: u32,
    half_open_successes: u32,
}

/// A circuit breaker guarding a single protected call site. `name` is used
/// only for log attribution (so a dispatcher and each worker can be told
/// apart in logs); `label` drives the rejection message text so callers can
/// tell a worker's breaker apart from the dispatcher's (spec §4.2 requires
/// a worker's rejection to read "Worker circuit breaker is open").
pub struct CircuitBreaker {
    name: String,
    label: &'static str,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

/// What the caller should do, decided by [`CircuitBreaker::before_call`].
pub enum Admission {
    Proceed,
    Reject(WorkError),
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_label(name, "Circuit breaker", config)
    }

    /// A breaker running inside a worker (spec §4.2): rejections read
    /// "Worker circuit breaker is open" instead of the dispatcher's generic
    /// "Circuit breaker is open", so callers can tell the two apart.
    pub fn new_worker(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_label(name, "Worker circuit breaker", config)
    }

    fn with_label(name: impl Into<String>, label: &'static str, config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            name: name.into(),
            label,
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_permits: 0,
                half_open_successes: 0,
            }),
        }
    }

    fn open_message(&self) -> String {
        format!("{} is open", self.label)
    }

    fn trial_limit_message(&self) -> String {
        format!("{} trial limit reached", self.label)
    }

    /// Consult the breaker before attempting a protected call. Must be
    /// paired with exactly one of `on_success`/`on_failure` once the call
    /// completes, unless this returned `Reject`.
    pub fn before_call(&self) -> Admission {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            State::Closed => Admission::Proceed,
            State::Open => {
                let opened_at = inner.opened_at.expect("OPEN implies opened_at is set");
                if opened_at.elapsed() >= self.config.cooldown {
                    inner.state = State::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.half_open_permits = self.config.half_open_max_calls;
                    info!(breaker = %self.name, "circuit breaker entering half-open");
                    if inner.half_open_permits == 0 {
                        warn!(breaker = %self.name, "circuit breaker rejecting call: trial limit reached");
                        return Admission::Reject(WorkError::operational_with_category(
                            self.trial_limit_message(),
                            ErrorCategory::Connection,
                        ));
                    }
                    inner.half_open_permits -= 1;
                    Admission::Proceed
                } else {
                    warn!(breaker = %self.name, "circuit breaker rejecting call: breaker is open");
                    Admission::Reject(WorkError::operational_with_category(
                        self.open_message(),
                        ErrorCategory::Connection,
                    ))
                }
            }
            State::HalfOpen => {
                if inner.half_open_permits == 0 {
                    warn!(breaker = %self.name, "circuit breaker rejecting call: trial limit reached");
                    return Admission::Reject(WorkError::operational_with_category(
                        self.trial_limit_message(),
                        ErrorCategory::Connection,
                    ));
                }
                inner.half_open_permits -= 1;
                Admission::Proceed
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            State::Closed => {
                inner.consecutive_failures = 0;
            }
            State::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_successes_to_close {
                    inner.state = State::Closed;
                    inner.consecutive_failures = 0;
                    info!(breaker = %self.name, "circuit breaker closed after recovery");
                }
            }
            State::Open => {
                // A success observed while OPEN can only happen if a caller
                // raced the cooldown transition; treat it like half-open.
                inner.state = State::HalfOpen;
                inner.half_open_successes = 1;
            }
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            State::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.open(&mut inner);
                }
            }
            State::HalfOpen => {
                self.open(&mut inner);
            }
            State::Open => {}
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = State::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_permits = self.config.half_open_max_calls;
        inner.half_open_successes = 0;
        warn!(breaker = %self.name, "circuit breaker opened");
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        matches!(self.inner.lock().unwrap().state, State::Open)
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        matches!(self.inner.lock().unwrap().state, State::Closed)
    }
}

/// Run `op` under a breaker: checks admission, runs the call on `Proceed`,
/// and reports the outcome back to the breaker. Does not retry; pair with
/// [`crate::retry::retry`] for the combined policy described in spec §4.1.
pub async fn call_with_breaker<T, F, Fut>(
    breaker: &CircuitBreaker,
    op: F,
) -> Result<T, anyhow::Error>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, anyhow::Error>>,
{
    match breaker.before_call() {
        Admission::Reject(err) => Err(anyhow::Error::new(err)),
        Admission::Proceed => match op().await {
            Ok(value) => {
                breaker.on_success();
                Ok(value)
            }
            Err(err) => {
                breaker.on_failure();
                Err(err)
            }
        },
    }
}
