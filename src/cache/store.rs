//! Entity Store
//!
//! The shared in-memory state of the cache: the attribute map answering
//! verification requests and the three slot index structures.
//!
//! # Design
//!
//! - One `parking_lot::Mutex` guards everything; the backing store is the
//!   source of truth and every critical section is pure in-memory work
//! - No eviction: attributes live until deleted or the process exits
//! - No DB I/O may happen while the lock is held

use std::collections::HashMap;

use parking_lot::Mutex;

use super::slots::{SlotTable, SortedIndices};
use crate::domain::EntityKind;

/// Attribute value cached for an existing, live entity.
pub const ACTIVE: &str = "active";

/// Attribute value cached for an entity the backing store does not know.
pub const PASSIVE: &str = "passive";

/// Everything guarded by the store lock.
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    /// kind -> id -> value
    pub(crate) attributes: HashMap<EntityKind, HashMap<String, String>>,
    /// Global category slots
    pub(crate) categories: SlotTable,
    /// category id -> subcategory slots
    pub(crate) subcategories: HashMap<String, SlotTable>,
    /// subcategory id -> product slots
    pub(crate) products: HashMap<String, SortedIndices>,
}

/// Shared cache state behind a single coarse lock.
#[derive(Debug, Default)]
pub struct EntityStore {
    state: Mutex<StoreState>,
}

impl EntityStore {
    /// Create an empty store with every slot scope uninitialized.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the cached attribute of an entity.
    pub fn lookup(&self, kind: EntityKind, id: &str) -> Option<String> {
        let state = self.state.lock();
        state.attributes.get(&kind)?.get(id).cloned()
    }

    /// Cache the attribute of an entity, replacing any previous value.
    pub fn put(&self, kind: EntityKind, id: impl Into<String>, value: impl Into<String>) {
        let mut state = self.state.lock();
        state
            .attributes
            .entry(kind)
            .or_default()
            .insert(id.into(), value.into());
    }

    /// Drop the cached attribute of an entity. Returns true if it was cached.
    pub fn delete(&self, kind: EntityKind, id: &str) -> bool {
        let mut state = self.state.lock();
        state
            .attributes
            .get_mut(&kind)
            .and_then(|ids| ids.remove(id))
            .is_some()
    }

    /// Number of cached attributes of one kind.
    pub fn len(&self, kind: EntityKind) -> usize {
        let state = self.state.lock();
        state.attributes.get(&kind).map_or(0, HashMap::len)
    }

    /// Run a closure with exclusive access to the state.
    ///
    /// The closure must not block or await.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state)
    }
}
