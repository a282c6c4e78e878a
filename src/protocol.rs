//! Message codec and task registry (spec §4.6, §9).
//!
//! The transport itself is in-process (`tokio::sync::mpsc`/`oneshot`
//! channels between the dispatcher and each worker's dedicated OS thread),
//! but the message shapes below are kept value-only exactly as the spec
//! requires of a real transport boundary: every payload is a
//! `serde_json::Value`, so nothing that crosses a worker boundary can be a
//! live reference, a function, or a handle.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{LazyLock, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::WorkError;

pub type RequestId = Uuid;
pub type SessionId = Uuid;
pub type WorkerId = u32;

/// A query description: either plain SQL or SQL plus positional parameters,
/// matching spec §4.1's `sql-or-config` shape.
#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub sql: String,
    pub params: Vec<Value>,
}

impl QuerySpec {
    pub fn new(sql: impl Into<String>) -> Self {
        QuerySpec {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<Value>) -> Self {
        QuerySpec {
            sql: sql.into(),
            params,
        }
    }
}

/// The rows returned by a query, already converted to value-only form.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub rows: Vec<serde_json::Map<String, Value>>,
}

/// Portable description of a user callable, reconstructed inside the
/// worker rather than shipped as source (spec §4.2's "Function transport";
/// SPEC_FULL §C.1 resolves both modes through the same process-wide
/// registry).
#[derive(Debug, Clone)]
pub enum FnDesc {
    /// A function registered in-process via [`register_task`] /
    /// [`register_session_task`], looked up by name.
    Inline { registry_key: String },
    /// A named export from a file-task module, addressed by
    /// `"<path>::<export_name>"` — resolved through the same registry.
    File { path: String, export_name: String },
}

impl FnDesc {
    pub fn inline(registry_key: impl Into<String>) -> Self {
        FnDesc::Inline {
            registry_key: registry_key.into(),
        }
    }

    pub fn file(path: impl Into<String>, export_name: impl Into<String>) -> Self {
        FnDesc::File {
            path: path.into(),
            export_name: export_name.into(),
        }
    }

    fn registry_key(&self) -> String {
        match self {
            FnDesc::Inline { registry_key } => registry_key.clone(),
            FnDesc::File { path, export_name } => format!("{path}::{export_name}"),
        }
    }
}

/// Anything a session body can execute queries against. Implemented by the
/// worker-side client wrapper (`crate::worker::OwnedConnExecutor`) so that
/// `protocol.rs` need not depend on `worker.rs`'s pool/breaker types.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn query(&self, spec: QuerySpec) -> Result<QueryResult, anyhow::Error>;
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A registered pure CPU task: `fn(args) -> result`.
pub type TaskFn = dyn Fn(Vec<Value>) -> BoxFuture<Result<Value, anyhow::Error>> + Send + Sync;

/// A registered session body: `fn(query_executor, args) -> result`.
pub type SessionTaskFn = dyn Fn(std::sync::Arc<dyn QueryExecutor>, Vec<Value>) -> BoxFuture<Result<Value, anyhow::Error>>
    + Send
    + Sync;

static TASK_REGISTRY: LazyLock<Mutex<HashMap<String, std::sync::Arc<TaskFn>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

static SESSION_TASK_REGISTRY: LazyLock<Mutex<HashMap<String, std::sync::Arc<SessionTaskFn>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Register a CPU task under `name`, making it callable via
/// `Dispatcher::task(FnDesc::inline(name), args)`.
pub fn register_task<F, Fut>(name: impl Into<String>, f: F)
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, anyhow::Error>> + Send + 'static,
{
    let wrapped: std::sync::Arc<TaskFn> = std::sync::Arc::new(move |args| Box::pin(f(args)));
    TASK_REGISTRY
        .lock()
        .expect("task registry mutex poisoned")
        .insert(name.into(), wrapped);
}

/// Register a session body under `name`, making it callable via
/// `Dispatcher::session(FnDesc::inline(name), args)`.
pub fn register_session_task<F, Fut>(name: impl Into<String>, f: F)
where
    F: Fn(std::sync::Arc<dyn QueryExecutor>, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, anyhow::Error>> + Send + 'static,
{
    let wrapped: std::sync::Arc<SessionTaskFn> =
        std::sync::Arc::new(move |exec, args| Box::pin(f(exec, args)));
    SESSION_TASK_REGISTRY
        .lock()
        .expect("session task registry mutex poisoned")
        .insert(name.into(), wrapped);
}

pub(crate) fn lookup_task(desc: &FnDesc) -> Result<std::sync::Arc<TaskFn>, WorkError> {
    let key = desc.registry_key();
    TASK_REGISTRY
        .lock()
        .expect("task registry mutex poisoned")
        .get(&key)
        .cloned()
        .ok_or_else(|| WorkError::operational(format!("task '{key}' not found or not a function")))
}

pub(crate) fn lookup_session_task(
    desc: &FnDesc,
) -> Result<std::sync::Arc<SessionTaskFn>, WorkError> {
    let key = desc.registry_key();
    SESSION_TASK_REGISTRY
        .lock()
        .expect("session task registry mutex poisoned")
        .get(&key)
        .cloned()
        .ok_or_else(|| WorkError::operational(format!("task '{key}' not found or not a function")))
}

/// Outbound message, dispatcher → worker (spec §4.2's three received message
/// kinds, plus `SessionEnd`/`SessionTask` which realize the two session
/// body modes described in this crate's `DESIGN.md`).
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    /// A pure CPU task: no client involved.
    Task { fn_desc: FnDesc, args: Vec<Value> },
    /// Check out a client and pin it under `session_id`; no body runs in
    /// the worker for this variant (callback-mode sessions run their body
    /// on the caller's task and drive the worker purely with
    /// `SessionQuery`/`SessionEnd`).
    SessionBegin { session_id: SessionId },
    /// Run a query against the client pinned under `session_id`.
    SessionQuery {
        session_id: SessionId,
        query: QuerySpec,
    },
    /// Release the client pinned under `session_id`.
    SessionEnd { session_id: SessionId },
    /// File/registry-mode session body: check out, run the registered
    /// function against the client directly, release, reply with its
    /// result — a single round trip.
    SessionTask {
        session_id: SessionId,
        fn_desc: FnDesc,
        args: Vec<Value>,
    },
}

/// An outbound message tagged with the request id the reply must carry
/// (spec §4.6: "Out: TASK, SESSION_START, SESSION_QUERY") and whether
/// resolving it should clear the owning worker slot's `busy` flag. That
/// flag is dispatcher-side state (spec §3's `WorkerSlot`); the worker
/// itself is not aware of it.
#[derive(Debug, Clone)]
pub struct WorkerEnvelope {
    pub request_id: RequestId,
    pub message: WorkerMessage,
    pub clears_busy: bool,
}

/// Inbound reply, worker → dispatcher (spec §4.6: "In: REPLY
/// {request_id, worker_id, data | error}").
#[derive(Debug, Clone)]
pub struct ReplyEnvelope {
    pub request_id: RequestId,
    pub worker_id: WorkerId,
    pub result: Result<Value, WorkError>,
}
