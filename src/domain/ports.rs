//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! This module defines the abstraction (port) the cache engine depends on to
//! reach the relational store. Infrastructure adapters implement it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Cache Engine                            │
//! │   Initializer │ Dispatcher (cache-miss fetch)               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ QueryExecutor
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │        SqliteExecutor │ ScriptedExecutor                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;

use crate::error::{Error, Result};

// =============================================================================
// Value Objects
// =============================================================================

/// A single column value passed to or returned from the backing store.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::Text(s.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        SqlValue::Text(s)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl std::fmt::Display for SqlValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Integer(v) => write!(f, "{}", v),
            SqlValue::Real(v) => write!(f, "{}", v),
            SqlValue::Text(s) => write!(f, "'{}'", s),
        }
    }
}

/// One result row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row(Vec<SqlValue>);

impl Row {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self(values)
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Raw value of a column.
    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.0.get(index)
    }

    /// Column as a string. Integer identifiers are rendered in decimal.
    pub fn string(&self, index: usize) -> Result<String> {
        match self.0.get(index) {
            Some(SqlValue::Text(s)) => Ok(s.clone()),
            Some(SqlValue::Integer(v)) => Ok(v.to_string()),
            Some(other) => Err(Error::Decode(format!(
                "column {} is not a string: {}",
                index, other
            ))),
            None => Err(Error::Decode(format!("missing column {}", index))),
        }
    }

    /// Column as an integer.
    pub fn integer(&self, index: usize) -> Result<i64> {
        match self.0.get(index) {
            Some(SqlValue::Integer(v)) => Ok(*v),
            Some(SqlValue::Text(s)) => s.trim().parse().map_err(|_| {
                Error::Decode(format!("column {} is not an integer: '{}'", index, s))
            }),
            Some(other) => Err(Error::Decode(format!(
                "column {} is not an integer: {}",
                index, other
            ))),
            None => Err(Error::Decode(format!("missing column {}", index))),
        }
    }
}

impl From<Vec<SqlValue>> for Row {
    fn from(values: Vec<SqlValue>) -> Self {
        Self(values)
    }
}

// =============================================================================
// Query Executor Port
// =============================================================================

/// Port for the relational store.
///
/// The engine only needs to execute parameterized SQL and read rows back;
/// every failure is reported through [`Error`].
///
/// # Example
///
/// ```ignore
/// struct PostgresExecutor { /* ... */ }
///
/// #[async_trait]
/// impl QueryExecutor for PostgresExecutor {
///     async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
///         // Run the statement and collect rows
///     }
///     // ...
/// }
/// ```
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Run a query returning any number of rows.
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>>;

    /// Run a query returning at most one row. `None` means no row matched.
    async fn query_row(&self, sql: &str, params: &[SqlValue]) -> Result<Option<Row>>;

    /// Run a statement, returning the number of affected rows.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<()>;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_row_string_accessor() {
        let row = Row::new(vec![SqlValue::from("c1"), SqlValue::Integer(7)]);

        assert_eq!(row.len(), 2);
        assert_eq!(row.string(0).unwrap(), "c1");
        assert_eq!(row.string(1).unwrap(), "7");
        assert_matches!(row.string(2), Err(Error::Decode(_)));
    }

    #[test]
    fn test_row_integer_accessor() {
        let row = Row::new(vec![
            SqlValue::Integer(3),
            SqlValue::from(" 12 "),
            SqlValue::from("abc"),
            SqlValue::Null,
        ]);

        assert_eq!(row.integer(0).unwrap(), 3);
        assert_eq!(row.integer(1).unwrap(), 12);
        assert_matches!(row.integer(2), Err(Error::Decode(_)));
        assert_matches!(row.integer(3), Err(Error::Decode(_)));
    }

    #[test]
    fn test_sql_value_display() {
        assert_eq!(SqlValue::Null.to_string(), "NULL");
        assert_eq!(SqlValue::from("u1").to_string(), "'u1'");
        assert_eq!(SqlValue::from(42i64).to_string(), "42");
    }
}
