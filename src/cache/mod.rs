//! Catalog Lookup Cache
//!
//! In-process cache in front of the catalog database.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         CacheServer                              │
//! │  ┌──────────────┐                       ┌──────────────────┐    │
//! │  │  Dispatcher  │── verify (miss) ─────▶│  QueryExecutor   │    │
//! │  └──────┬───────┘                       └────────▲─────────┘    │
//! │         │ lookup / fill                          │ seed         │
//! │  ┌──────▼───────┐    read / mutate     ┌─────────┴────────┐     │
//! │  │ EntityStore  │◀─────────────────────│  SlotAllocator   │     │
//! │  │ (one lock)   │                      │  + Initializer   │     │
//! │  └──────────────┘                      └──────────────────┘     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - **EntityStore**: attribute map and slot indices behind one mutex
//! - **SlotAllocator**: free ordinals per scope, seeded lazily
//! - **Initializer**: derives free ordinals from the occupied ones in the DB
//! - **Dispatcher**: request channel answered by one task per request
//! - **CacheServer**: wiring, lifecycle and the one-per-process cell

mod allocator;
mod dispatcher;
mod initializer;
mod metrics;
pub mod queries;
mod server;
mod slots;
mod store;

pub use allocator::{ResortMode, SlotAllocator};
pub use dispatcher::{Command, Dispatcher, DispatcherHandle, Request, Verification, Verifier};
pub use initializer::Initializer;
pub use metrics::{CacheMetrics, CacheStats};
pub use server::{CacheConfig, CacheServer, ServerCell};
pub use slots::{derive_free, SlotTable, SortedIndices, PRODUCT_SLOT_CAPACITY, SLOT_CAPACITY};
pub use store::{EntityStore, ACTIVE, PASSIVE};
