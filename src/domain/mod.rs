//! Domain Layer
//!
//! This module contains the value types shared by the cache engine and the
//! port through which it reaches the relational store.
//!
//! # Architecture
//!
//! The domain layer is organized into:
//!
//! - **Entity** (`entity.rs`) - Entity kinds, verification claims and slot scopes
//! - **Ports** (`ports.rs`) - Trait abstraction for the backing store
//!
//! # Usage
//!
//! ```ignore
//! use catalog_cache::domain::{EntityKind, QueryExecutor, SqlValue};
//!
//! async fn exists<Q: QueryExecutor>(db: &Q, id: &str) -> Result<bool> {
//!     let row = db
//!         .query_row(r#"SELECT "id" FROM "products" WHERE "id" = $1"#, &[SqlValue::from(id)])
//!         .await?;
//!     Ok(row.is_some())
//! }
//! ```

pub mod entity;
pub mod ports;

// Re-export commonly used types
pub use entity::{Claim, EntityKind, Scope, ScopeKind};
pub use ports::{QueryExecutor, Row, SqlValue};
