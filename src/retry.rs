//! Retry policy: a stateless executor that runs a thunk under an
//! attempt/backoff loop, consulting a predicate over [`ErrorCategory`] and
//! logging each retry (spec §4.3).

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::{ErrorCategory, wrap};

/// Configuration for [`retry`]. Mirrors spec §4.3's config fields.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
    /// Optional bound on the whole retry loop's wall time (SPEC_FULL §C.2).
    /// When set, the loop is raced against this deadline and a TIMEOUT error
    /// is produced if it elapses first.
    pub deadline: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            jitter: true,
            deadline: None,
        }
    }
}

/// Default predicate: transient-class categories are retried, except the
/// fixed set of operational signals (spec §7), which are always surfaced
/// immediately regardless of the category they happen to carry — a breaker
/// rejection is tagged `Connection` (retryable by category) but must never
/// be retried, so an already-wrapped [`crate::error::WorkError`] is checked
/// for `operational` first rather than re-derived from its message text.
pub fn default_should_retry(err: &anyhow::Error) -> bool {
    if let Some(work_err) = err.downcast_ref::<crate::error::WorkError>() {
        if work_err.operational {
            return false;
        }
        return work_err.category.is_retryable_by_default();
    }
    crate::error::classify(err).is_retryable_by_default()
}

/// Run `op`, retrying on failure per `config` and `should_retry`. `op_name`
/// is used only for log attribution.
///
/// On exhaustion or a non-retryable error, the last error is wrapped and
/// returned. No more than `max_attempts` calls to `op` are ever made
/// (spec §8, property 6).
pub async fn retry<T, F, Fut, P>(
    op_name: &str,
    config: &RetryConfig,
    mut should_retry: P,
    mut op: F,
) -> Result<T, crate::error::WorkError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, anyhow::Error>>,
    P: FnMut(&anyhow::Error) -> bool,
{
    let body = async {
        let mut attempt = 0u32;
        let mut delay = config.initial_delay;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= config.max_attempts || !should_retry(&err) {
                        return Err(wrap(err));
                    }
                    let wait = if config.jitter {
                        let jitter_max_secs = delay.as_secs_f64() * 0.25;
                        let jitter_secs = if jitter_max_secs <= 0.0 {
                            0.0
                        } else {
                            rand::rng().random_range(0.0..=jitter_max_secs)
                        };
                        std::cmp::min(config.max_delay, delay + Duration::from_secs_f64(jitter_secs))
                    } else {
                        std::cmp::min(config.max_delay, delay)
                    };
                    debug!(
                        op_name,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "retrying after failure"
                    );
                    tokio::time::sleep(wait).await;
                    delay = std::cmp::min(
                        config.max_delay,
                        Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_factor),
                    );
                }
            }
        }
    };

    match config.deadline {
        Some(deadline) => match tokio::time::timeout(deadline, body).await {
            Ok(result) => result,
            Err(_) => Err(crate::error::WorkError::with_category(
                format!("operation '{op_name}' timed out"),
                ErrorCategory::Timeout,
            )),
        },
        None => body.await,
    }
}
