//! SQLite Query Executor
//!
//! Implements the `QueryExecutor` port on top of rusqlite. The connection
//! is shared behind a mutex and every statement runs on the blocking pool,
//! so async callers never block a runtime worker.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::domain::{QueryExecutor, Row, SqlValue};
use crate::error::{Error, Result};

/// Prepared statement cache size per connection.
const STATEMENT_CACHE_CAPACITY: usize = 64;

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            SqlValue::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(v) => SqlValue::Integer(v),
            ValueRef::Real(v) => SqlValue::Real(v),
            ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                SqlValue::Text(String::from_utf8_lossy(bytes).into_owned())
            }
        }
    }
}

/// SQLite-backed executor.
#[derive(Clone)]
pub struct SqliteExecutor {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteExecutor {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        info!(path = %path.display(), ?busy_timeout, "Opened SQLite database");
        Ok(Self::from_connection(conn))
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(|e| Error::Internal(format!("SQLite worker failed: {}", e)))?
        .map_err(Error::from)
    }
}

impl std::fmt::Debug for SqliteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteExecutor").finish_non_exhaustive()
    }
}

fn collect_rows(conn: &Connection, sql: &str, params: &[SqlValue]) -> rusqlite::Result<Vec<Row>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let columns = stmt.column_count();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns);
        for i in 0..columns {
            values.push(SqlValue::from(row.get_ref(i)?));
        }
        out.push(Row::new(values));
    }
    Ok(out)
}

#[async_trait]
impl QueryExecutor for SqliteExecutor {
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        debug!(sql, "SQLite query");
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_connection(move |conn| collect_rows(conn, &sql, &params))
            .await
    }

    async fn query_row(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>> {
        debug!(sql, "SQLite single-row query");
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let columns = stmt.column_count();
            stmt.query_row(params_from_iter(params.iter()), |row| {
                (0..columns)
                    .map(|i| row.get_ref(i).map(SqlValue::from))
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map(Row::new)
            })
            .optional()
        })
        .await
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        debug!(sql, "SQLite execute");
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            stmt.execute(params_from_iter(params.iter()))
                .map(|affected| affected as u64)
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.with_connection(|conn| conn.query_row("SELECT 1", [], |_| Ok(())))
            .await
    }
}
