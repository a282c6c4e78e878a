//! Dispatcher (spec §4.1): the public facade. Owns the local backend, the
//! worker fleet, the pending-request table, the main-side retry+breaker,
//! and the lifecycle (lazy init, warmup, shutdown).
//!
//! Grounded on `client/src/postgres.rs::create_workload`/
//! `create_atomic_workload` for the pool-build-then-warm shape, and on
//! `client/src/postgres.rs::BatchedPostgresExecutor`/`batch_processor` for
//! the request/reply correlation shape (a background task draining a
//! shared channel, resolving per-request `oneshot` senders) — generalized
//! here to many workers and a pending table keyed by request id instead of
//! one background task serving one connection.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{OnceCell, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, BackendFactory, PgBackendFactory};
use crate::breaker::{CircuitBreaker, call_with_breaker};
use crate::config::Config;
use crate::error::WorkError;
use crate::protocol::{
    FnDesc, QuerySpec, QueryResult, ReplyEnvelope, RequestId, SessionId, WorkerEnvelope, WorkerId,
    WorkerMessage,
};
use crate::retry::{default_should_retry, retry};
use crate::session::{Session, SessionRouter};
use crate::worker::{WorkerHandle, spawn_worker};

struct PendingEntry {
    worker: Arc<WorkerHandle>,
    clears_busy: bool,
    resolver: oneshot::Sender<Result<Value, WorkError>>,
}

struct DispatcherInner {
    config: Config,
    retry_config: crate::retry::RetryConfig,
    breaker: CircuitBreaker,
    local_backend: Arc<dyn Backend>,
    factory: Arc<dyn BackendFactory>,
    workers: StdMutex<Vec<Arc<WorkerHandle>>>,
    pending: Arc<StdMutex<HashMap<RequestId, PendingEntry>>>,
    reply_tx: mpsc::UnboundedSender<ReplyEnvelope>,
    reply_rx: StdMutex<Option<mpsc::UnboundedReceiver<ReplyEnvelope>>>,
    init: OnceCell<Result<(), WorkError>>,
    cursor: AtomicUsize,
    shutdown: std::sync::atomic::AtomicBool,
}

/// The public facade (spec §2 component 5). Cheap to clone — internally an
/// `Arc`, matching the shared-ownership shape a `Session` needs to route
/// queries back through this same dispatcher.
#[derive(Clone)]
pub struct Dispatcher(Arc<DispatcherInner>);

impl Dispatcher {
    /// Builds the local backend against a real Postgres pool (spec §3:
    /// pools are sized at construction); workers are not spawned until the
    /// first `task`, `session`, or explicit `warmup` call (spec §4.1's lazy
    /// init).
    pub fn new(config: Config) -> Result<Self, WorkError> {
        let factory: Arc<dyn BackendFactory> = Arc::new(PgBackendFactory {
            connection_string: config.connection_string.clone(),
        });
        Self::with_backend_factory(config, factory)
    }

    /// Builds the dispatcher against an arbitrary [`BackendFactory`],
    /// letting tests substitute an in-memory backend for both the local
    /// pool and every worker's pool without a live database.
    pub fn with_backend_factory(
        config: Config,
        factory: Arc<dyn BackendFactory>,
    ) -> Result<Self, WorkError> {
        config
            .validate()
            .map_err(|e| WorkError::with_category(e.to_string(), crate::error::ErrorCategory::Syntax))?;

        let (local_size, _worker_size) = config.pool_sizes();
        let local_backend = factory.build(local_size).map_err(crate::error::wrap)?;
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

        Ok(Dispatcher(Arc::new(DispatcherInner {
            retry_config: config.retry_config(),
            breaker: CircuitBreaker::new("dispatcher", config.breaker_config()),
            config,
            local_backend,
            factory,
            workers: StdMutex::new(Vec::new()),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            reply_tx,
            reply_rx: StdMutex::new(Some(reply_rx)),
            init: OnceCell::new(),
            cursor: AtomicUsize::new(0),
            shutdown: std::sync::atomic::AtomicBool::new(false),
        })))
    }

    /// Execute a plain query on the local pool, under the main-side
    /// retry+breaker (spec §4.1's `query` operation).
    pub async fn query(&self, sql: impl Into<String>, params: Vec<Value>) -> Result<Value, WorkError> {
        if self.0.shutdown.load(Ordering::Acquire) {
            return Err(WorkError::operational("instance has been shut down"));
        }
        let spec = QuerySpec::with_params(sql, params);
        let inner = &self.0;
        let outcome = retry(
            "dispatcher_query",
            &inner.retry_config,
            default_should_retry,
            || {
                let spec = spec.clone();
                async move {
                    call_with_breaker(&inner.breaker, || async {
                        let conn = inner.local_backend.get().await?;
                        conn.query(&spec).await
                    })
                    .await
                }
            },
        )
        .await;
        outcome.map(query_result_to_value)
    }

    /// Run a pure CPU task on a worker (spec §4.1's `task` operation).
    pub async fn task(&self, fn_desc: FnDesc, args: Vec<Value>) -> Result<Value, WorkError> {
        self.ensure_ready_for_worker_dispatch().await?;
        let worker = self.0.pick_worker();
        self.0
            .send_and_await(&worker, WorkerMessage::Task { fn_desc, args }, true)
            .await
    }

    /// Run a file/registry-mode session body entirely inside a worker, in a
    /// single round trip (SPEC_FULL §C.1's registry-backed reading of
    /// file-task mode).
    pub async fn session_task(&self, fn_desc: FnDesc, args: Vec<Value>) -> Result<Value, WorkError> {
        self.ensure_ready_for_worker_dispatch().await?;
        let worker = self.0.pick_worker();
        let session_id = Uuid::new_v4();
        self.0
            .send_and_await(
                &worker,
                WorkerMessage::SessionTask {
                    session_id,
                    fn_desc,
                    args,
                },
                true,
            )
            .await
    }

    /// Run a callback-mode session body on the caller's own task (spec
    /// §4.1, §4.5). `body` receives a [`Session`] proxy whose `query` calls
    /// round-trip to the worker holding the checked-out client; the client
    /// is released on every exit path, whether `body` returns, errors,
    /// panics, or is cancelled (its future dropped before completion) —
    /// [`SessionReleaseGuard`] below carries the release past all three.
    pub async fn session<F, Fut, T>(&self, body: F) -> Result<T, WorkError>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = Result<T, WorkError>>,
    {
        self.ensure_ready_for_worker_dispatch().await?;
        let worker = self.0.pick_worker();
        let session_id = Uuid::new_v4();

        if let Err(e) = self
            .0
            .send_and_await(&worker, WorkerMessage::SessionBegin { session_id }, false)
            .await
        {
            worker.busy.store(false, Ordering::Release);
            return Err(e);
        }

        let mut guard = SessionReleaseGuard::new(self.0.clone(), worker.clone(), session_id);

        let released = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let router: Arc<dyn SessionRouter> = self.0.clone();
        let proxy = Session::new(session_id, worker.id, router, released.clone());

        let body_result = body(proxy).await;
        released.store(true, Ordering::Release);

        // The body completed normally (it did not panic and was not
        // cancelled); release through the guard's own disarm-then-run path
        // so a panic/cancellation elsewhere can never double-release.
        // Prefer the body's own error when both failed; surface the
        // release error only if the body otherwise succeeded, since client
        // release could then not be confirmed.
        match guard.release_now().await {
            Ok(()) => body_result,
            Err(release_err) => body_result.and_then(|_| Err(release_err)),
        }
    }

    /// Idempotent: drives worker spawn to completion the first time it is
    /// called; concurrent and later calls await/observe the same result
    /// (spec §5's Warmup guarantee).
    pub async fn warmup(&self) -> Result<(), WorkError> {
        self.0.ensure_init().await
    }

    /// Idempotent. Stops accepting new work, gives in-flight work up to
    /// `shutdown_timeout_ms` (SPEC_FULL §C.3) to drain, then fails any
    /// requests still outstanding, terminates every worker, and closes the
    /// local backend unconditionally.
    pub async fn shutdown(&self) {
        if self.0.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("dispatcher shutting down");

        if let Some(ms) = self.0.config.shutdown_timeout_ms {
            let deadline = tokio::time::sleep(Duration::from_millis(ms));
            tokio::pin!(deadline);
            loop {
                let all_idle = {
                    let workers = self.0.workers.lock().expect("workers mutex poisoned");
                    workers.iter().all(|w| !w.busy.load(Ordering::Acquire))
                };
                if all_idle {
                    break;
                }
                tokio::select! {
                    _ = &mut deadline => break,
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                }
            }
        }

        // Whatever is still outstanding after the grace period (or
        // immediately, if no timeout was configured) would otherwise hang
        // its caller forever once the workers below are torn down and can
        // never reply. Resolve every one of them with a terminal error.
        let stuck = std::mem::take(&mut *self.0.pending.lock().expect("pending mutex poisoned"));
        if !stuck.is_empty() {
            warn!(count = stuck.len(), "shutdown: resolving outstanding requests");
        }
        for (_, entry) in stuck {
            let _ = entry
                .resolver
                .send(Err(WorkError::operational("instance has been shut down")));
        }

        let workers = std::mem::take(&mut *self.0.workers.lock().expect("workers mutex poisoned"));
        for worker in workers {
            worker.terminate();
        }
        self.0.local_backend.close();
    }

    async fn ensure_ready_for_worker_dispatch(&self) -> Result<(), WorkError> {
        if self.0.shutdown.load(Ordering::Acquire) {
            return Err(WorkError::operational("instance has been shut down"));
        }
        if self.0.config.max_workers == 0 {
            return Err(WorkError::operational("no workers available"));
        }
        self.0.ensure_init().await
    }

    /// Number of worker slots currently marked busy. Exposed only for
    /// cross-module tests asserting that a session's client is released
    /// back to its worker on every exit path.
    #[doc(hidden)]
    pub fn busy_worker_count(&self) -> usize {
        self.0
            .workers
            .lock()
            .expect("workers mutex poisoned")
            .iter()
            .filter(|w| w.busy.load(Ordering::Acquire))
            .count()
    }
}

/// Guarantees a checked-out session client is released back to its worker
/// exactly once, no matter how `Dispatcher::session`'s body future exits.
///
/// A plain `if let Err = ... { release }` after `body(proxy).await` only
/// covers the future *returning* — it is skipped entirely if the body
/// panics (unwinding straight past it) or if the enclosing task is
/// cancelled (the `.await` is simply dropped mid-poll, never resuming).
/// Both leave the worker's `busy` flag set and its client checked out
/// forever. Binding this guard before the body runs, and relying on
/// `Drop` to act as the in-process stand-in for `SessionEnd` when the
/// happy path's `disarm` never fires, closes both gaps.
struct SessionReleaseGuard {
    inner: Option<Arc<DispatcherInner>>,
    worker: Arc<WorkerHandle>,
    session_id: SessionId,
}

impl SessionReleaseGuard {
    fn new(inner: Arc<DispatcherInner>, worker: Arc<WorkerHandle>, session_id: SessionId) -> Self {
        SessionReleaseGuard {
            inner: Some(inner),
            worker,
            session_id,
        }
    }

    /// The happy path: disarm the guard and perform the real
    /// request/reply `SessionEnd` round trip so callers can observe its
    /// error, if any.
    async fn release_now(&mut self) -> Result<(), WorkError> {
        let Some(inner) = self.inner.take() else {
            return Ok(());
        };
        match inner
            .send_and_await(
                &self.worker,
                WorkerMessage::SessionEnd {
                    session_id: self.session_id,
                },
                true,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                self.worker.busy.store(false, Ordering::Release);
                Err(e)
            }
        }
    }
}

impl Drop for SessionReleaseGuard {
    fn drop(&mut self) {
        // Only reached if `release_now` never ran: the body panicked or its
        // future was dropped before completing. There is no task context
        // left to `.await` a reply from here, so this is fire-and-forget —
        // it still reaches the worker's receive loop and frees the client,
        // just without the caller ever seeing the outcome.
        if let Some(inner) = self.inner.take() {
            let _ = self.worker.send(WorkerEnvelope {
                request_id: Uuid::new_v4(),
                message: WorkerMessage::SessionEnd {
                    session_id: self.session_id,
                },
                clears_busy: true,
            });
            self.worker.busy.store(false, Ordering::Release);
            drop(inner);
        }
    }
}

impl DispatcherInner {
    async fn ensure_init(&self) -> Result<(), WorkError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Ok(());
        }
        self.init.get_or_init(|| self.spawn_workers()).await.clone()
    }

    async fn spawn_workers(&self) -> Result<(), WorkError> {
        if let Some(reply_rx) = self.reply_rx.lock().expect("reply_rx mutex poisoned").take() {
            tokio::spawn(reply_loop(self.pending.clone(), reply_rx));
        }

        let w = self.config.max_workers;
        if w == 0 {
            return Ok(());
        }
        let (_local_size, worker_size) = self.config.pool_sizes();

        let mut online_rxs = Vec::with_capacity(w);
        let mut handles = Vec::with_capacity(w);
        for id in 0..w as WorkerId {
            let (online_tx, online_rx) = oneshot::channel();
            let handle = spawn_worker(
                id,
                self.factory.clone(),
                worker_size,
                self.retry_config.clone(),
                self.config.breaker_config(),
                self.reply_tx.clone(),
                online_tx,
            );
            handles.push(handle);
            online_rxs.push(online_rx);
        }

        for rx in online_rxs {
            match rx.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(WorkError::operational(
                        "worker terminated before reporting online",
                    ));
                }
            }
        }

        *self.workers.lock().expect("workers mutex poisoned") = handles;
        info!(worker_count = w, "dispatcher workers online");
        Ok(())
    }
}

async fn reply_loop(
    pending: Arc<StdMutex<HashMap<RequestId, PendingEntry>>>,
    mut reply_rx: mpsc::UnboundedReceiver<ReplyEnvelope>,
) {
    while let Some(reply) = reply_rx.recv().await {
        let entry = pending
            .lock()
            .expect("pending mutex poisoned")
            .remove(&reply.request_id);
        match entry {
            Some(entry) => {
                if entry.clears_busy {
                    entry.worker.busy.store(false, Ordering::Release);
                }
                let _ = entry.resolver.send(reply.result);
            }
            None => {
                debug!(request_id = %reply.request_id, "reply for unknown or already-resolved request");
            }
        }
    }
}

impl DispatcherInner {
    fn pick_worker(&self) -> Arc<WorkerHandle> {
        let workers = self.workers.lock().expect("workers mutex poisoned");
        let n = workers.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        for offset in 0..n {
            let idx = (start + offset) % n;
            if !workers[idx].busy.load(Ordering::Acquire) {
                workers[idx].busy.store(true, Ordering::Release);
                return workers[idx].clone();
            }
        }
        // All slots busy: fall through to the cursor slot (spec §4.1,
        // Open Question resolution in DESIGN.md — observed, not hardened
        // into a stronger fairness policy).
        warn!("all worker slots busy, queueing on cursor slot");
        workers[start].busy.store(true, Ordering::Release);
        workers[start].clone()
    }

    async fn send_and_await(
        &self,
        worker: &Arc<WorkerHandle>,
        message: WorkerMessage,
        clears_busy: bool,
    ) -> Result<Value, WorkError> {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending mutex poisoned").insert(
            request_id,
            PendingEntry {
                worker: worker.clone(),
                clears_busy,
                resolver: tx,
            },
        );

        let envelope = WorkerEnvelope {
            request_id,
            message,
            clears_busy,
        };
        if let Err(e) = worker.send(envelope) {
            self.pending.lock().expect("pending mutex poisoned").remove(&request_id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(WorkError::operational("worker dropped the reply channel")),
        }
    }
}

#[async_trait]
impl SessionRouter for DispatcherInner {
    async fn session_query(
        &self,
        session_id: SessionId,
        worker_id: WorkerId,
        query: QuerySpec,
    ) -> Result<QueryResult, WorkError> {
        let worker = {
            let workers = self.workers.lock().expect("workers mutex poisoned");
            workers
                .iter()
                .find(|w| w.id == worker_id)
                .cloned()
                .ok_or_else(|| WorkError::operational(format!("Client {session_id} not found")))?
        };
        let value = self
            .send_and_await(
                &worker,
                WorkerMessage::SessionQuery { session_id, query },
                false,
            )
            .await?;
        Ok(value_to_query_result(value))
    }
}

fn query_result_to_value(result: QueryResult) -> Value {
    Value::Array(result.rows.into_iter().map(Value::Object).collect())
}

fn value_to_query_result(value: Value) -> QueryResult {
    let rows = match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    QueryResult { rows }
}
