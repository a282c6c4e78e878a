//! The Postgres client library as an external collaborator (spec §1: "the
//! underlying Postgres client library (provides `Pool`, `Client`, `query`)").
//!
//! [`Backend`]/[`Conn`] formalize that seam so the dispatcher and every
//! worker are driven against a trait instead of `deadpool_postgres::Pool`
//! directly. Production code always goes through [`PgBackendFactory`]; the
//! cross-module tests under `tests/` substitute an in-memory stand-in
//! (SPEC_FULL.md §A) to exercise retry/breaker/session semantics without a
//! live database.

use std::sync::Arc;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use serde_json::Value;
use tokio_postgres::NoTls;

use crate::protocol::{QueryResult, QuerySpec};

/// One checked-out connection (spec GLOSSARY's "Backend connection /
/// client"). Dropping the last handle returns it to whatever produced it.
#[async_trait]
pub trait Conn: Send + Sync {
    async fn query(&self, spec: &QuerySpec) -> Result<QueryResult, anyhow::Error>;
}

/// A bounded reservoir of backend connections (spec GLOSSARY's "Pool").
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self) -> Result<Arc<dyn Conn>, anyhow::Error>;

    /// Best-effort drain/close, called once from `Dispatcher::shutdown`.
    /// No-op by default; [`PgBackend`] overrides it to close the real pool.
    fn close(&self) {}
}

/// Builds a [`Backend`] sized for one actor — the dispatcher's local pool or
/// one worker's pool (spec §4.1's `L`/`P` split). Kept separate from
/// `Backend` itself because the dispatcher needs to build one instance per
/// worker lazily, after construction.
pub trait BackendFactory: Send + Sync {
    fn build(&self, pool_size: usize) -> Result<Arc<dyn Backend>, anyhow::Error>;
}

/// The production factory: wraps a `deadpool_postgres::Pool` built the same
/// way as the teacher's `client/src/postgres.rs::create_pool_manager`.
pub struct PgBackendFactory {
    pub connection_string: String,
}

impl BackendFactory for PgBackendFactory {
    fn build(&self, pool_size: usize) -> Result<Arc<dyn Backend>, anyhow::Error> {
        let pg_config: tokio_postgres::Config = self.connection_string.parse()?;
        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Verified,
        };
        let manager = Manager::from_config(pg_config, NoTls, mgr_config);
        let pool = Pool::builder(manager)
            .max_size(pool_size.max(1))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build connection pool: {e}"))?;
        Ok(Arc::new(PgBackend { pool }))
    }
}

struct PgBackend {
    pool: Pool,
}

#[async_trait]
impl Backend for PgBackend {
    async fn get(&self) -> Result<Arc<dyn Conn>, anyhow::Error> {
        let obj = self.pool.get().await.map_err(anyhow::Error::from)?;
        Ok(Arc::new(PgConn(obj)))
    }

    fn close(&self) {
        self.pool.close();
    }
}

struct PgConn(Object);

#[async_trait]
impl Conn for PgConn {
    async fn query(&self, spec: &QuerySpec) -> Result<QueryResult, anyhow::Error> {
        run_query(&self.0, &spec.sql, &spec.params).await
    }
}

pub(crate) async fn run_query(
    client: &Object,
    sql: &str,
    params: &[Value],
) -> Result<QueryResult, anyhow::Error> {
    let bound: Vec<JsonParam<'_>> = params.iter().map(JsonParam).collect();
    let bound_refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = bound
        .iter()
        .map(|p| p as &(dyn tokio_postgres::types::ToSql + Sync))
        .collect();
    let rows = client.query(sql, &bound_refs).await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        out.push(row_to_json(row)?);
    }
    Ok(QueryResult { rows: out })
}

/// Binds a [`serde_json::Value`] query parameter against whatever concrete
/// Postgres type the server describes for its position, dispatching on
/// `ty` the way `Param` does in the `get-convex-convex-backend` Postgres
/// layer (one `ToSql` impl, one match arm per accepted wire type) rather
/// than relying on `tokio_postgres`'s native (JSON/JSONB-only) `ToSql` for
/// `Value`.
struct JsonParam<'a>(&'a Value);

impl tokio_postgres::types::ToSql for JsonParam<'_> {
    fn to_sql(
        &self,
        ty: &tokio_postgres::types::Type,
        out: &mut bytes::BytesMut,
    ) -> Result<tokio_postgres::types::IsNull, Box<dyn std::error::Error + Sync + Send>> {
        use tokio_postgres::types::Type;
        match self.0 {
            Value::Null => Ok(tokio_postgres::types::IsNull::Yes),
            Value::Bool(b) => b.to_sql(ty, out),
            Value::Number(n) => match *ty {
                Type::INT2 => (n
                    .as_i64()
                    .ok_or("JSON number does not fit in an integer column")? as i16)
                    .to_sql(ty, out),
                Type::INT4 => (n
                    .as_i64()
                    .ok_or("JSON number does not fit in an integer column")? as i32)
                    .to_sql(ty, out),
                Type::INT8 => n
                    .as_i64()
                    .ok_or("JSON number does not fit in an integer column")?
                    .to_sql(ty, out),
                Type::FLOAT4 => (n
                    .as_f64()
                    .ok_or("JSON number is not representable as a float")? as f32)
                    .to_sql(ty, out),
                Type::FLOAT8 => n
                    .as_f64()
                    .ok_or("JSON number is not representable as a float")?
                    .to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::NUMERIC => n.to_string().to_sql(ty, out),
                Type::JSON | Type::JSONB => self.0.to_sql(ty, out),
                _ => Err(format!("cannot bind JSON number parameter to column type {ty}").into()),
            },
            Value::String(s) => match *ty {
                Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
                    s.to_sql(ty, out)
                }
                Type::UUID => uuid::Uuid::parse_str(s)?.to_sql(ty, out),
                Type::JSON | Type::JSONB => self.0.to_sql(ty, out),
                _ => Err(format!("cannot bind JSON string parameter to column type {ty}").into()),
            },
            Value::Array(_) | Value::Object(_) => match *ty {
                Type::JSON | Type::JSONB => self.0.to_sql(ty, out),
                _ => Err(format!(
                    "cannot bind JSON array/object parameter to non-json column type {ty}"
                )
                .into()),
            },
        }
    }

    fn accepts(_ty: &tokio_postgres::types::Type) -> bool {
        true
    }

    tokio_postgres::types::to_sql_checked!();
}

fn row_to_json(
    row: &tokio_postgres::Row,
) -> Result<serde_json::Map<String, Value>, anyhow::Error> {
    use tokio_postgres::types::Type;
    let mut map = serde_json::Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value: Value = match *column.type_() {
            Type::BOOL => row.try_get::<_, Option<bool>>(i)?.map(Value::from).unwrap_or(Value::Null),
            Type::INT2 => row.try_get::<_, Option<i16>>(i)?.map(Value::from).unwrap_or(Value::Null),
            Type::INT4 => row.try_get::<_, Option<i32>>(i)?.map(Value::from).unwrap_or(Value::Null),
            Type::INT8 => row.try_get::<_, Option<i64>>(i)?.map(Value::from).unwrap_or(Value::Null),
            Type::FLOAT4 => row.try_get::<_, Option<f32>>(i)?.map(|v| v as f64).and_then(serde_json::Number::from_f64).map(Value::Number).unwrap_or(Value::Null),
            Type::FLOAT8 => row.try_get::<_, Option<f64>>(i)?.and_then(serde_json::Number::from_f64).map(Value::Number).unwrap_or(Value::Null),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
                row.try_get::<_, Option<String>>(i)?.map(Value::from).unwrap_or(Value::Null)
            }
            Type::UUID => row
                .try_get::<_, Option<uuid::Uuid>>(i)?
                .map(|u| Value::from(u.to_string()))
                .unwrap_or(Value::Null),
            Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(i)?.unwrap_or(Value::Null),
            other => {
                return Err(anyhow::anyhow!(
                    "column '{}' has unsupported type {other} for value-only result conversion",
                    column.name()
                ));
            }
        };
        map.insert(column.name().to_string(), value);
    }
    Ok(map)
}
