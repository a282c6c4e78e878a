//! A PostgreSQL access layer that multiplexes plain queries, pure CPU
//! tasks, and backend-pinned sessions across a local connection pool and a
//! fleet of worker-owned pools, each worker running on its own OS thread.
//!
//! The [`Dispatcher`] is the entry point: it partitions a total connection
//! budget between itself and its workers, lazily spawns the worker fleet on
//! first use, and applies retry-with-backoff plus a circuit breaker
//! independently on the main side and inside every worker.

mod backend;
mod breaker;
mod config;
mod dispatcher;
mod error;
mod protocol;
mod retry;
mod session;
mod worker;

pub use backend::{Backend, BackendFactory, Conn, PgBackendFactory};
pub use breaker::CircuitBreakerConfig;
pub use config::{Config, CircuitBreakerConfigToml, RetryConfigToml};
pub use dispatcher::Dispatcher;
pub use error::{ErrorCategory, SimulatedDbError, WorkError};
pub use protocol::{FnDesc, QueryExecutor, QueryResult, QuerySpec, register_session_task, register_task};
pub use retry::RetryConfig;
pub use session::Session;
