//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain port,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                  QueryExecutor (Port)                       │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │        SqliteExecutor │ ScriptedExecutor (tests)           │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use catalog_cache::adapters::SqliteExecutor;
//! use catalog_cache::domain::QueryExecutor;
//!
//! let db = SqliteExecutor::open("catalog.db", Duration::from_secs(5))?;
//! db.ping().await?;
//! ```

mod scripted;
mod sqlite;

pub use scripted::ScriptedExecutor;
pub use sqlite::SqliteExecutor;
