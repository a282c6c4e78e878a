//! Cross-module scenario tests backed by the in-memory fake backend in
//! `tests/support/mod.rs` (spec §8, scenarios 1, 3, 4, 5, 6). These don't
//! need a live Postgres server: `Dispatcher::with_backend_factory` drives
//! both the local pool and the worker pools against the same shared
//! in-memory state.

mod support;

use std::sync::Arc;
use std::time::Duration;

use pg_parallel::{CircuitBreakerConfigToml, Config, Dispatcher, ErrorCategory, RetryConfigToml};
use serde_json::json;
use support::{FakeBackendFactory, Scripted};

fn fake_config(max_workers: usize) -> Config {
    let mut config = Config::new("fake://local");
    config.max = 4;
    config.max_workers = max_workers;
    config
}

fn no_retry() -> RetryConfigToml {
    RetryConfigToml {
        max_attempts: 1,
        initial_delay_ms: 1,
        max_delay_ms: 1,
        backoff_factor: 1.0,
        jitter: false,
        deadline_ms: None,
    }
}

// Scenario 1 (spec §8): a plain query against the local pool returns the
// rows the backend produced, converted to value-only form.
#[tokio::test]
async fn scenario1_basic_query_returns_rows() {
    let factory = Arc::new(FakeBackendFactory::new());
    let dispatcher =
        Dispatcher::with_backend_factory(fake_config(0), factory.clone()).unwrap();

    let result = dispatcher.query("SELECT 1 AS value", vec![]).await.unwrap();
    assert_eq!(result, json!([{"value": 1}]));
}

// Scenario 3 (spec §8): `BEGIN; INSERT id=1; INSERT id=1` on a table with a
// unique primary key fails with a wrapped CONSTRAINT error; since neither
// insert was ever committed, `SELECT count(*)` reads back `0` afterward, and
// the worker slot's `busy` flag is `false` regardless of the session body's
// own error.
#[tokio::test]
async fn scenario3_session_transaction_rollback_releases_client() {
    let factory = Arc::new(FakeBackendFactory::new());
    let dispatcher =
        Dispatcher::with_backend_factory(fake_config(1), factory.clone()).unwrap();

    let outcome = dispatcher
        .session(|session| async move {
            session.query("BEGIN", vec![]).await?;
            session
                .query("INSERT INTO accounts(id) VALUES ($1)", vec![json!(1)])
                .await?;
            session
                .query("INSERT INTO accounts(id) VALUES ($1)", vec![json!(1)])
                .await?;
            Ok(())
        })
        .await;

    let err = outcome.expect_err("the duplicate insert must fail the call");
    assert_eq!(err.category, ErrorCategory::Constraint);

    assert_eq!(
        dispatcher.busy_worker_count(),
        0,
        "client must be released back to its worker even though the body errored"
    );
    assert_eq!(
        factory.committed_count(),
        0,
        "neither insert was ever committed"
    );

    let rows = dispatcher
        .query("SELECT COUNT(*) FROM accounts", vec![])
        .await
        .unwrap();
    assert_eq!(rows, json!([{"count": 0}]));
}

// Scenario 4 (spec §8): a transient failure is retried, and the operation
// makes no more than the configured number of attempts.
#[tokio::test]
async fn scenario4_retries_transient_failure_exact_attempt_count() {
    let factory = Arc::new(FakeBackendFactory::new());
    factory.push_scripted(Scripted::Fail {
        code: "ECONNRESET",
        message: "connection reset by peer",
    });
    factory.push_scripted(Scripted::Fail {
        code: "ECONNRESET",
        message: "connection reset by peer",
    });

    let mut config = fake_config(0);
    config.retry = Some(RetryConfigToml {
        max_attempts: 5,
        ..no_retry()
    });
    let dispatcher = Dispatcher::with_backend_factory(config, factory.clone()).unwrap();

    let result = dispatcher.query("SELECT 1 AS value", vec![]).await.unwrap();
    assert_eq!(result, json!([{"value": 1}]));
    assert_eq!(
        factory.call_count(),
        3,
        "two failures plus the succeeding attempt"
    );
}

// Scenario 5 (spec §8): once the breaker is open, a rejected call never
// reaches the backend at all.
#[tokio::test]
async fn scenario5_open_breaker_rejects_without_touching_backend() {
    let factory = Arc::new(FakeBackendFactory::new());
    factory.push_scripted(Scripted::Fail {
        code: "ECONNRESET",
        message: "connection reset by peer",
    });

    let mut config = fake_config(0);
    config.retry = Some(no_retry());
    config.circuit_breaker = Some(CircuitBreakerConfigToml {
        failure_threshold: 1,
        cooldown_ms: 60_000,
        half_open_max_calls: 1,
        half_open_successes_to_close: 1,
    });
    let dispatcher = Dispatcher::with_backend_factory(config, factory.clone()).unwrap();

    dispatcher
        .query("SELECT 1 AS value", vec![])
        .await
        .expect_err("scripted failure should open the breaker");
    assert_eq!(factory.call_count(), 1);

    let err = dispatcher
        .query("SELECT 1 AS value", vec![])
        .await
        .expect_err("breaker should still be open");
    assert!(err.message.contains("Circuit breaker is open"));
    assert_eq!(
        factory.call_count(),
        1,
        "the rejected call must never reach the backend"
    );
}

// Scenario 6 (spec §8): after the cooldown elapses, a trial call through
// the half-open breaker that succeeds closes it again.
#[tokio::test]
async fn scenario6_half_open_recovers_after_cooldown() {
    let factory = Arc::new(FakeBackendFactory::new());
    factory.push_scripted(Scripted::Fail {
        code: "ECONNRESET",
        message: "connection reset by peer",
    });

    let mut config = fake_config(0);
    config.retry = Some(no_retry());
    config.circuit_breaker = Some(CircuitBreakerConfigToml {
        failure_threshold: 1,
        cooldown_ms: 20,
        half_open_max_calls: 1,
        half_open_successes_to_close: 1,
    });
    let dispatcher = Dispatcher::with_backend_factory(config, factory.clone()).unwrap();

    dispatcher
        .query("SELECT 1 AS value", vec![])
        .await
        .expect_err("scripted failure should open the breaker");

    tokio::time::sleep(Duration::from_millis(40)).await;

    let ok = dispatcher.query("SELECT 1 AS value", vec![]).await.unwrap();
    assert_eq!(ok, json!([{"value": 1}]));

    // Breaker closed after the trial success; a further call is not
    // treated as a second trial under a reopened breaker.
    let ok2 = dispatcher.query("SELECT 1 AS value", vec![]).await.unwrap();
    assert_eq!(ok2, json!([{"value": 1}]));
}
