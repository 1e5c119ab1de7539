//! Catalog Cache - Lookup and Slot Allocation Cache
//!
//! An in-process cache in front of a relational catalog (users, categories,
//! subcategories, products). It answers "does this entity exist / does this
//! user hold this role" from memory, filling itself from the database on a
//! miss, and hands out free position ordinals within each catalog scope.
//!
//! # Architecture
//!
//! ```text
//! caller → DispatcherHandle → Dispatcher → EntityStore ⇄ QueryExecutor
//! caller → SlotAllocator → EntityStore (seeded lazily by the Initializer)
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Backing-store adapters implementing the domain port
//! - [`cache`] - Store, allocator, initializer, dispatcher and server
//! - [`domain`] - Entity kinds, scopes and the backing-store port
//! - [`error`] - Error types

pub mod adapters;
pub mod cache;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use cache::{CacheConfig, CacheServer, ResortMode, ServerCell, SlotAllocator};
pub use domain::{Claim, EntityKind, QueryExecutor, Scope};
pub use error::{Error, Result};
