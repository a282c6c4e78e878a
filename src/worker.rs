//! Worker runtime (spec §4.2). One instance runs inside each worker's
//! dedicated OS thread, owning a [`crate::backend::Backend`] sized for that
//! worker, a table of checked-out clients keyed by session id, and a receive
//! loop that dispatches incoming messages under the worker's own
//! retry+breaker.
//!
//! Grounded on `client/src/postgres.rs::batch_processor` (a dedicated loop
//! owning a `Pool`, draining an `mpsc::Receiver`, replying per-request via
//! `oneshot`), scaled up from an in-runtime background task to a dedicated
//! OS thread with its own single-threaded Tokio runtime, since the spec
//! requires worker-pool isolation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::backend::{Backend, BackendFactory, Conn};
use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, call_with_breaker};
use crate::error::{ErrorCategory, WorkError, wrap};
use crate::protocol::{
    self, QueryExecutor, QueryResult, QuerySpec, ReplyEnvelope, RequestId, SessionId,
    WorkerEnvelope, WorkerId, WorkerMessage,
};
use crate::retry::{RetryConfig, retry};

/// Handle owned by the dispatcher for one worker. Sending on `sender`
/// enqueues work on the worker's receive loop; `busy` is read and written
/// only by the dispatcher under its own lock (spec §3's `WorkerSlot`).
pub struct WorkerHandle {
    pub id: WorkerId,
    sender: mpsc::UnboundedSender<Command>,
    pub busy: AtomicBool,
    join: StdMutex<Option<std::thread::JoinHandle<()>>>,
}

enum Command {
    Envelope(WorkerEnvelope),
    Shutdown,
}

impl WorkerHandle {
    pub fn send(&self, envelope: WorkerEnvelope) -> Result<(), WorkError> {
        self.sender
            .send(Command::Envelope(envelope))
            .map_err(|_| WorkError::operational("worker has terminated"))
    }

    /// Request termination and join the worker thread. Idempotent: a
    /// second call observes the channel already closed and returns
    /// immediately.
    pub fn terminate(&self) {
        let _ = self.sender.send(Command::Shutdown);
        if let Some(handle) = self.join.lock().expect("join mutex poisoned").take() {
            let _ = handle.join();
        }
    }
}

/// Spawn a worker on a dedicated OS thread running its own single-threaded
/// Tokio runtime. Reports back through `online_tx` once its backend is built
/// (spec §4.1's "waits for each [worker] to report online").
pub fn spawn_worker(
    id: WorkerId,
    factory: Arc<dyn BackendFactory>,
    pool_size: usize,
    retry_config: RetryConfig,
    breaker_config: CircuitBreakerConfig,
    reply_tx: mpsc::UnboundedSender<ReplyEnvelope>,
    online_tx: oneshot::Sender<Result<(), WorkError>>,
) -> Arc<WorkerHandle> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

    let join = std::thread::Builder::new()
        .name(format!("pg-parallel-worker-{id}"))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = online_tx.send(Err(WorkError::with_category(
                        format!("failed to start worker runtime: {e}"),
                        ErrorCategory::Unknown,
                    )));
                    return;
                }
            };
            runtime.block_on(run_worker(
                id,
                factory,
                pool_size,
                retry_config,
                breaker_config,
                cmd_rx,
                reply_tx,
                online_tx,
            ));
        })
        .expect("failed to spawn worker OS thread");

    Arc::new(WorkerHandle {
        id,
        sender: cmd_tx,
        busy: AtomicBool::new(false),
        join: StdMutex::new(Some(join)),
    })
}

async fn run_worker(
    id: WorkerId,
    factory: Arc<dyn BackendFactory>,
    pool_size: usize,
    retry_config: RetryConfig,
    breaker_config: CircuitBreakerConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    reply_tx: mpsc::UnboundedSender<ReplyEnvelope>,
    online_tx: oneshot::Sender<Result<(), WorkError>>,
) {
    let backend = match factory.build(pool_size) {
        Ok(backend) => backend,
        Err(e) => {
            let _ = online_tx.send(Err(wrap(e)));
            return;
        }
    };

    let mut runtime = WorkerRuntime {
        id,
        backend,
        breaker: CircuitBreaker::new_worker(format!("worker-{id}"), breaker_config),
        retry_config,
        sessions: HashMap::new(),
        reply_tx,
    };

    info!(worker_id = id, "worker online");
    let _ = online_tx.send(Ok(()));

    while let Some(command) = cmd_rx.recv().await {
        match command {
            Command::Shutdown => {
                debug!(worker_id = id, "worker received shutdown");
                break;
            }
            Command::Envelope(envelope) => {
                runtime.handle(envelope).await;
            }
        }
    }
    info!(worker_id = id, "worker terminating");
}

struct WorkerRuntime {
    id: WorkerId,
    backend: Arc<dyn Backend>,
    breaker: CircuitBreaker,
    retry_config: RetryConfig,
    sessions: HashMap<SessionId, Arc<dyn Conn>>,
    reply_tx: mpsc::UnboundedSender<ReplyEnvelope>,
}

impl WorkerRuntime {
    async fn handle(&mut self, envelope: WorkerEnvelope) {
        let request_id = envelope.request_id;
        let result = match envelope.message {
            WorkerMessage::Task { fn_desc, args } => self.handle_task(fn_desc, args).await,
            WorkerMessage::SessionBegin { session_id } => {
                self.handle_session_begin(session_id).await
            }
            WorkerMessage::SessionQuery { session_id, query } => {
                self.handle_session_query(session_id, query).await
            }
            WorkerMessage::SessionEnd { session_id } => self.handle_session_end(session_id),
            WorkerMessage::SessionTask {
                session_id,
                fn_desc,
                args,
            } => self.handle_session_task(session_id, fn_desc, args).await,
        };
        self.reply(request_id, result);
    }

    fn reply(&self, request_id: RequestId, result: Result<Value, WorkError>) {
        let _ = self.reply_tx.send(ReplyEnvelope {
            request_id,
            worker_id: self.id,
            result,
        });
    }

    async fn handle_task(&mut self, fn_desc: protocol::FnDesc, args: Vec<Value>) -> Result<Value, WorkError> {
        let f = match protocol::lookup_task(&fn_desc) {
            Ok(f) => f,
            Err(e) => return Err(e),
        };
        let breaker = &self.breaker;
        let retry_config = &self.retry_config;
        retry(
            "worker_task",
            retry_config,
            crate::retry::default_should_retry,
            move || {
                let f = f.clone();
                let args = args.clone();
                async move { call_with_breaker(breaker, || f(args)).await }
            },
        )
        .await
    }

    async fn handle_session_begin(&mut self, session_id: SessionId) -> Result<Value, WorkError> {
        match self.backend.get().await {
            Ok(conn) => {
                self.sessions.insert(session_id, conn);
                Ok(Value::Null)
            }
            Err(e) => Err(wrap(e)),
        }
    }

    async fn handle_session_query(
        &mut self,
        session_id: SessionId,
        query: QuerySpec,
    ) -> Result<Value, WorkError> {
        let Some(conn) = self.sessions.get(&session_id) else {
            return Err(WorkError::operational(format!(
                "Client {session_id} not found"
            )));
        };
        let breaker = &self.breaker;
        let retry_config = &self.retry_config;
        let outcome = retry(
            "worker_session_query",
            retry_config,
            crate::retry::default_should_retry,
            || {
                let query = query.clone();
                async move { call_with_breaker(breaker, || async { conn.query(&query).await }).await }
            },
        )
        .await;
        outcome.map(query_result_to_value)
    }

    fn handle_session_end(&mut self, session_id: SessionId) -> Result<Value, WorkError> {
        // Release unconditionally: the client is dropped (returned to the
        // pool) whether or not it was present, satisfying "release occurs
        // on every path" even if the session was never begun.
        self.sessions.remove(&session_id);
        Ok(Value::Null)
    }

    async fn handle_session_task(
        &mut self,
        _session_id: SessionId,
        fn_desc: protocol::FnDesc,
        args: Vec<Value>,
    ) -> Result<Value, WorkError> {
        let f = match protocol::lookup_session_task(&fn_desc) {
            Ok(f) => f,
            Err(e) => return Err(e),
        };
        // File/registry-mode sessions are single round trips: the client
        // never needs to be visible to a later `SessionQuery`, so it is
        // held only by the executor handed to the registered function and
        // returned to the pool when that executor is dropped (spec §3:
        // "on removal the client is returned to the pool exactly once").
        let conn = match self.backend.get().await {
            Ok(conn) => conn,
            Err(e) => return Err(wrap(e)),
        };
        let executor: Arc<dyn QueryExecutor> = Arc::new(OwnedConnExecutor { conn });

        let breaker = &self.breaker;
        let retry_config = &self.retry_config;
        retry(
            "worker_session_task",
            retry_config,
            crate::retry::default_should_retry,
            move || {
                let f = f.clone();
                let args = args.clone();
                let executor = executor.clone();
                async move { call_with_breaker(breaker, || f(executor, args)).await }
            },
        )
        .await
    }
}

/// Wraps a single checked-out connection for the lifetime of one
/// file/registry session task. Dropped (returning the connection to the
/// pool) once the task completes, whether it returned, errored, or the
/// retry loop gave up.
struct OwnedConnExecutor {
    conn: Arc<dyn Conn>,
}

#[async_trait]
impl QueryExecutor for OwnedConnExecutor {
    async fn query(&self, spec: QuerySpec) -> Result<QueryResult, anyhow::Error> {
        self.conn.query(&spec).await
    }
}

fn query_result_to_value(result: QueryResult) -> Value {
    Value::Array(result.rows.into_iter().map(Value::Object).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_handle_send_after_terminate_errors() {
        // Construct a minimal handle with a closed channel to exercise the
        // "worker has terminated" operational error path without spinning
        // up a real OS thread.
        let (tx, rx) = mpsc::unbounded_channel::<Command>();
        drop(rx);
        let handle = WorkerHandle {
            id: 0,
            sender: tx,
            busy: AtomicBool::new(false),
            join: StdMutex::new(None),
        };
        let envelope = WorkerEnvelope {
            request_id: uuid::Uuid::new_v4(),
            message: WorkerMessage::SessionEnd {
                session_id: uuid::Uuid::new_v4(),
            },
            clears_busy: true,
        };
        let err = handle.send(envelope).unwrap_err();
        assert!(err.message.contains("terminated"));
    }
}
