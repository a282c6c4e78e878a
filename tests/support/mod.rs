//! In-memory stand-in for `PgBackendFactory` (SPEC_FULL.md §A.1). Lets the
//! cross-module scenario tests in `scenarios.rs` exercise retry, circuit
//! breaker, and session-affinity semantics without a live Postgres server.
//!
//! A single [`FakeBackendFactory`] is shared between the dispatcher's local
//! pool and every worker's pool (`Dispatcher::with_backend_factory` builds
//! one `Backend` per actor from the same factory), so a row committed
//! through a worker-pinned session is immediately visible to a plain
//! `Dispatcher::query` call against the local backend — spec §8 scenario 3
//! requires exactly that.
//!
//! Inserted rows are only visible to other connections once `COMMIT` runs:
//! each [`FakeConn`] buffers its own uncommitted inserts locally and only
//! folds them into the shared committed set on `COMMIT`. A session that
//! fails mid-transaction and is simply torn down (no explicit `COMMIT`)
//! therefore leaves nothing behind — matching real Postgres and spec §8
//! scenario 3's literal expectation that `count(*)` reads back `0`.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pg_parallel::{Backend, BackendFactory, Conn};
use serde_json::{Value, json};

/// A single rigged outcome for the next query any connection built from the
/// owning factory observes.
pub enum Scripted {
    Fail { code: &'static str, message: &'static str },
}

struct FakeState {
    committed_ids: Mutex<HashSet<i64>>,
    script: Mutex<VecDeque<Scripted>>,
    call_count: AtomicU32,
}

/// Shared handle a test holds onto so it can rig failures and assert call
/// counts after handing the factory to a `Dispatcher`.
#[derive(Clone)]
pub struct FakeBackendFactory {
    state: Arc<FakeState>,
}

impl FakeBackendFactory {
    pub fn new() -> Self {
        FakeBackendFactory {
            state: Arc::new(FakeState {
                committed_ids: Mutex::new(HashSet::new()),
                script: Mutex::new(VecDeque::new()),
                call_count: AtomicU32::new(0),
            }),
        }
    }

    /// Queue `outcome` to be returned (and consumed) by the next query
    /// issued against any connection this factory has built.
    pub fn push_scripted(&self, outcome: Scripted) {
        self.state.script.lock().unwrap().push_back(outcome);
    }

    /// Total number of queries that actually reached a connection —
    /// i.e. that were not rejected by a breaker before ever calling
    /// `Conn::query`.
    pub fn call_count(&self) -> u32 {
        self.state.call_count.load(Ordering::SeqCst)
    }

    pub fn committed_count(&self) -> usize {
        self.state.committed_ids.lock().unwrap().len()
    }
}

impl BackendFactory for FakeBackendFactory {
    fn build(&self, _pool_size: usize) -> Result<Arc<dyn Backend>, anyhow::Error> {
        Ok(Arc::new(FakeBackend {
            state: self.state.clone(),
        }))
    }
}

struct FakeBackend {
    state: Arc<FakeState>,
}

#[async_trait]
impl Backend for FakeBackend {
    async fn get(&self) -> Result<Arc<dyn Conn>, anyhow::Error> {
        Ok(Arc::new(FakeConn {
            state: self.state.clone(),
            pending: Mutex::new(HashSet::new()),
        }))
    }
}

/// One checked-out connection. `pending` holds ids inserted since the last
/// `BEGIN` that have not yet been `COMMIT`ed — it is local to this
/// connection and discarded (never folded into `state.committed_ids`) if
/// the connection is simply dropped, which is what a session that errors
/// out without an explicit `COMMIT`/`ROLLBACK` does.
struct FakeConn {
    state: Arc<FakeState>,
    pending: Mutex<HashSet<i64>>,
}

#[async_trait]
impl Conn for FakeConn {
    async fn query(&self, spec: &pg_parallel::QuerySpec) -> Result<pg_parallel::QueryResult, anyhow::Error> {
        self.state.call_count.fetch_add(1, Ordering::SeqCst);

        if let Some(scripted) = self.state.script.lock().unwrap().pop_front() {
            match scripted {
                Scripted::Fail { code, message } => {
                    return Err(anyhow::Error::new(pg_parallel::SimulatedDbError::new(
                        code, message,
                    )));
                }
            }
        }

        self.interpret(&spec.sql, &spec.params)
    }
}

impl FakeConn {
    fn interpret(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<pg_parallel::QueryResult, anyhow::Error> {
        let trimmed = sql.trim_start().to_ascii_uppercase();

        if trimmed == "SELECT 1 AS VALUE" {
            let mut row = serde_json::Map::new();
            row.insert("value".to_string(), json!(1));
            return Ok(pg_parallel::QueryResult { rows: vec![row] });
        }

        if trimmed == "BEGIN" {
            self.pending.lock().unwrap().clear();
            return Ok(pg_parallel::QueryResult { rows: vec![] });
        }

        if trimmed == "COMMIT" {
            let mut pending = self.pending.lock().unwrap();
            self.state.committed_ids.lock().unwrap().extend(pending.drain());
            return Ok(pg_parallel::QueryResult { rows: vec![] });
        }

        if trimmed == "ROLLBACK" {
            self.pending.lock().unwrap().clear();
            return Ok(pg_parallel::QueryResult { rows: vec![] });
        }

        if trimmed.starts_with("INSERT INTO ACCOUNTS") {
            let id = params
                .first()
                .and_then(Value::as_i64)
                .ok_or_else(|| anyhow::anyhow!("insert requires an integer id parameter"))?;
            let already_visible = self.state.committed_ids.lock().unwrap().contains(&id)
                || self.pending.lock().unwrap().contains(&id);
            if already_visible {
                return Err(anyhow::Error::new(pg_parallel::SimulatedDbError::new(
                    "23505",
                    "duplicate key value violates unique constraint \"accounts_pkey\"",
                )));
            }
            self.pending.lock().unwrap().insert(id);
            return Ok(pg_parallel::QueryResult { rows: vec![] });
        }

        if trimmed.starts_with("SELECT COUNT(*)") {
            let count = self.state.committed_ids.lock().unwrap().len() as i64;
            let mut row = serde_json::Map::new();
            row.insert("count".to_string(), json!(count));
            return Ok(pg_parallel::QueryResult { rows: vec![row] });
        }

        Err(anyhow::anyhow!("fake backend does not understand: {sql}"))
    }
}
