//! Scripted Query Executor
//!
//! In-memory implementation of the `QueryExecutor` port for testing.
//! Responses are registered per statement and parameter list and stay in
//! place until replaced, so repeated queries read the same answer. Every
//! call is counted, and the whole store can be switched offline.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::domain::{QueryExecutor, Row, SqlValue};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ScriptKey {
    sql: String,
    params: Vec<String>,
}

impl ScriptKey {
    fn new(sql: &str, params: &[SqlValue]) -> Self {
        Self {
            sql: sql.to_string(),
            params: params.iter().map(ToString::to_string).collect(),
        }
    }
}

#[derive(Debug, Clone)]
enum Scripted {
    Rows(Vec<Row>),
    Affected(u64),
    Failure(String),
}

/// Scripted executor for tests.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    responses: DashMap<ScriptKey, Scripted>,
    calls: DashMap<ScriptKey, u64>,
    total_calls: AtomicU64,
    offline: AtomicBool,
    latency: parking_lot::RwLock<Option<Duration>>,
}

impl ScriptedExecutor {
    /// Create an executor with nothing scripted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `sql` with `rows`.
    pub fn expect_rows(&self, sql: &str, params: &[SqlValue], rows: Vec<Row>) {
        self.responses
            .insert(ScriptKey::new(sql, params), Scripted::Rows(rows));
    }

    /// Answer a single-row query with `row`.
    pub fn expect_row(&self, sql: &str, params: &[SqlValue], row: Row) {
        self.expect_rows(sql, params, vec![row]);
    }

    /// Answer a single-row query with no row.
    pub fn expect_no_row(&self, sql: &str, params: &[SqlValue]) {
        self.expect_rows(sql, params, Vec::new());
    }

    /// Answer a statement with an affected-row count.
    pub fn expect_affected(&self, sql: &str, params: &[SqlValue], affected: u64) {
        self.responses
            .insert(ScriptKey::new(sql, params), Scripted::Affected(affected));
    }

    /// Fail `sql` with a database error.
    pub fn expect_failure(&self, sql: &str, params: &[SqlValue], message: &str) {
        self.responses.insert(
            ScriptKey::new(sql, params),
            Scripted::Failure(message.to_string()),
        );
    }

    /// Make every call fail (or recover) regardless of script.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Number of calls made with exactly this statement and parameters.
    pub fn calls(&self, sql: &str, params: &[SqlValue]) -> u64 {
        self.calls
            .get(&ScriptKey::new(sql, params))
            .map_or(0, |count| *count)
    }

    /// Number of calls made in total.
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::SeqCst)
    }

    async fn respond(&self, sql: &str, params: &[SqlValue]) -> Result<Scripted> {
        let key = ScriptKey::new(sql, params);
        *self.calls.entry(key.clone()).or_insert(0) += 1;
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        debug!(sql, params = ?key.params, "Scripted query");

        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Database("backing store is offline".to_string()));
        }

        match self.responses.get(&key).map(|r| r.value().clone()) {
            Some(Scripted::Failure(message)) => Err(Error::Database(message)),
            Some(response) => Ok(response),
            None => Err(Error::Database(format!(
                "no scripted response for {} {:?}",
                sql, key.params
            ))),
        }
    }
}

#[async_trait]
impl QueryExecutor for ScriptedExecutor {
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        match self.respond(sql, params).await? {
            Scripted::Rows(rows) => Ok(rows),
            Scripted::Affected(_) => Ok(Vec::new()),
            Scripted::Failure(message) => Err(Error::Database(message)),
        }
    }

    async fn query_row(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        match self.respond(sql, params).await? {
            Scripted::Affected(affected) => Ok(affected),
            Scripted::Rows(rows) => Ok(rows.len() as u64),
            Scripted::Failure(message) => Err(Error::Database(message)),
        }
    }

    async fn ping(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Database("backing store is offline".to_string()));
        }
        Ok(())
    }
}
