//! Session proxy (spec §4.5). Handed to a callback-mode `session` body; its
//! only operation is `query`, which tunnels back through the dispatcher to
//! the worker holding this session's checked-out client.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::WorkError;
use crate::protocol::{QuerySpec, QueryResult, SessionId, WorkerId};

/// Implemented by the dispatcher so that `session.rs` need not depend on
/// `dispatcher.rs` (mirrors `protocol::QueryExecutor`'s role for worker-side
/// file tasks, but routes through the pending-request table instead of a
/// directly-held client).
#[async_trait]
pub(crate) trait SessionRouter: Send + Sync {
    async fn session_query(
        &self,
        session_id: SessionId,
        worker_id: WorkerId,
        query: QuerySpec,
    ) -> Result<QueryResult, WorkError>;
}

/// Handed to a callback-mode `session` body (spec §4.1, §4.5, §9). Valid
/// only for the dynamic extent of the enclosing `session` call: once the
/// body returns, the dispatcher marks it released and any further `query`
/// fails with "session has been released" rather than silently racing a
/// client that may already be back in the pool.
pub struct Session {
    session_id: SessionId,
    worker_id: WorkerId,
    router: Arc<dyn SessionRouter>,
    released: Arc<AtomicBool>,
}

impl Session {
    pub(crate) fn new(
        session_id: SessionId,
        worker_id: WorkerId,
        router: Arc<dyn SessionRouter>,
        released: Arc<AtomicBool>,
    ) -> Self {
        Session {
            session_id,
            worker_id,
            router,
            released,
        }
    }

    /// Run a query against the client pinned to this session.
    pub async fn query(
        &self,
        sql: impl Into<String>,
        params: Vec<Value>,
    ) -> Result<Value, WorkError> {
        if self.released.load(Ordering::Acquire) {
            return Err(WorkError::operational("session has been released"));
        }
        let result = self
            .router
            .session_query(
                self.session_id,
                self.worker_id,
                QuerySpec::with_params(sql, params),
            )
            .await?;
        Ok(Value::Array(result.rows.into_iter().map(Value::Object).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingRouter {
        calls: Mutex<Vec<(SessionId, WorkerId, String)>>,
    }

    #[async_trait]
    impl SessionRouter for RecordingRouter {
        async fn session_query(
            &self,
            session_id: SessionId,
            worker_id: WorkerId,
            query: QuerySpec,
        ) -> Result<QueryResult, WorkError> {
            self.calls
                .lock()
                .unwrap()
                .push((session_id, worker_id, query.sql.clone()));
            Ok(QueryResult { rows: vec![] })
        }
    }

    #[tokio::test]
    async fn query_forwards_to_bound_worker() {
        let router = Arc::new(RecordingRouter {
            calls: Mutex::new(Vec::new()),
        });
        let session_id = uuid::Uuid::new_v4();
        let session = Session::new(
            session_id,
            3,
            router.clone(),
            Arc::new(AtomicBool::new(false)),
        );
        session.query("SELECT 1", vec![]).await.unwrap();
        let calls = router.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, session_id);
        assert_eq!(calls[0].1, 3);
        assert_eq!(calls[0].2, "SELECT 1");
    }

    #[tokio::test]
    async fn query_after_release_is_an_operational_error() {
        let router = Arc::new(RecordingRouter {
            calls: Mutex::new(Vec::new()),
        });
        let released = Arc::new(AtomicBool::new(true));
        let session = Session::new(uuid::Uuid::new_v4(), 0, router, released);
        let err = session.query("SELECT 1", vec![]).await.unwrap_err();
        assert!(err.message.contains("released"));
    }
}
