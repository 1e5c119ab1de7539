//! Free-Slot Allocator
//!
//! Answers "which ordinals are free?" per scope and records reservations
//! and releases. An empty scope is indistinguishable from one that was
//! never seeded, so every operation re-runs the initializer when it sees
//! zero free slots.
//!
//! # Product resort
//!
//! The product scope keeps an unordered free set plus an ascending view.
//! With [`ResortMode::Synchronous`] the view is rebuilt inside the same
//! critical section as the mutation. With [`ResortMode::Background`] a
//! tracked task snapshots the set, sorts it outside the lock and installs
//! the result only if the set has not changed since; readers may briefly
//! see the previous order.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use super::initializer::Initializer;
use super::metrics::CacheMetrics;
use super::slots::{SlotTable, SortedIndices, PRODUCT_SLOT_CAPACITY, SLOT_CAPACITY};
use super::store::{EntityStore, StoreState};
use crate::domain::Scope;
use crate::error::{Error, Result};

/// How the ordered product view is rebuilt after a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResortMode {
    /// Rebuild while holding the store lock
    #[default]
    Synchronous,
    /// Rebuild on a background task
    Background,
}

/// Slot allocation over the three scope families.
pub struct SlotAllocator {
    store: Arc<EntityStore>,
    initializer: Initializer,
    metrics: Arc<CacheMetrics>,
    tasks: TaskTracker,
    resort_mode: ResortMode,
}

impl SlotAllocator {
    pub fn new(
        store: Arc<EntityStore>,
        initializer: Initializer,
        metrics: Arc<CacheMetrics>,
        tasks: TaskTracker,
        resort_mode: ResortMode,
    ) -> Self {
        Self {
            store,
            initializer,
            metrics,
            tasks,
            resort_mode,
        }
    }

    /// Free ordinals of `scope`, ascending.
    ///
    /// Fails with [`Error::NotReady`] when the scope is empty and cannot be
    /// initialized. A scope that is still empty after a successful
    /// initialization yields an empty list.
    pub async fn list_free(&self, scope: &Scope) -> Result<Vec<u32>> {
        self.resolve(scope).await?;
        Ok(self.store.with_state(|state| read_free(state, scope)))
    }

    /// Largest free ordinal of `scope`, `None` if the scope has none.
    pub async fn max_free(&self, scope: &Scope) -> Result<Option<u32>> {
        Ok(self.list_free(scope).await?.last().copied())
    }

    /// Mark `ordinal` as taken.
    pub async fn reserve(&self, scope: &Scope, ordinal: u32) -> Result<()> {
        self.update(scope, ordinal, false).await?;
        self.metrics.record_reservation();
        Ok(())
    }

    /// Mark `ordinal` as free again.
    pub async fn release(&self, scope: &Scope, ordinal: u32) -> Result<()> {
        self.update(scope, ordinal, true).await?;
        self.metrics.record_release();
        Ok(())
    }

    /// Seed the subcategory scope of a newly created category.
    ///
    /// Returns false and leaves the scope alone if it already has free slots.
    pub fn create_subcategory_scope(&self, category_id: &str) -> bool {
        let created = self.store.with_state(|state| {
            let populated = state
                .subcategories
                .get(category_id)
                .is_some_and(|table| !table.is_empty());
            if !populated {
                state
                    .subcategories
                    .insert(category_id.to_string(), SlotTable::baseline());
            }
            !populated
        });
        info!(category_id, created, "Subcategory slot scope requested");
        created
    }

    /// Seed the product scope of a newly created subcategory.
    ///
    /// Returns false and leaves the scope alone if it already has free slots.
    pub fn create_product_scope(&self, subcategory_id: &str) -> bool {
        let created = self.store.with_state(|state| {
            let populated = state
                .products
                .get(subcategory_id)
                .is_some_and(|indices| !indices.is_empty());
            if !populated {
                state
                    .products
                    .insert(subcategory_id.to_string(), SortedIndices::baseline());
            }
            !populated
        });
        info!(subcategory_id, created, "Product slot scope requested");
        created
    }

    /// Whether `scope` currently has at least one free slot.
    pub fn has_free(&self, scope: &Scope) -> bool {
        self.store.with_state(|state| match scope {
            Scope::Categories => !state.categories.is_empty(),
            Scope::Subcategories(id) => state
                .subcategories
                .get(id)
                .is_some_and(|table| !table.is_empty()),
            Scope::Products(id) => state
                .products
                .get(id)
                .is_some_and(|indices| !indices.is_empty()),
        })
    }

    async fn resolve(&self, scope: &Scope) -> Result<()> {
        if self.has_free(scope) {
            return Ok(());
        }
        debug!(scope = %scope, "No free slots cached, initializing");
        self.initializer.initialize(scope).await
    }

    async fn update(&self, scope: &Scope, ordinal: u32, free: bool) -> Result<()> {
        let capacity = if scope.is_bounded() {
            SLOT_CAPACITY
        } else {
            PRODUCT_SLOT_CAPACITY
        };
        if ordinal == 0 || ordinal > capacity {
            return Err(Error::SlotOutOfRange { ordinal, capacity });
        }

        self.resolve(scope).await?;

        let mode = self.resort_mode;
        let resort = self.store.with_state(|state| -> Result<bool> {
            match scope {
                Scope::Categories => set_slot(&mut state.categories, ordinal, free),
                Scope::Subcategories(id) => {
                    let table = state.subcategories.entry(id.clone()).or_default();
                    set_slot(table, ordinal, free)
                }
                Scope::Products(id) => {
                    let indices = state.products.entry(id.clone()).or_default();
                    if free {
                        indices.insert(ordinal);
                    } else {
                        indices.remove(ordinal);
                    }
                    match mode {
                        ResortMode::Synchronous => {
                            indices.resort();
                            Ok(false)
                        }
                        ResortMode::Background => Ok(true),
                    }
                }
            }
        })?;
        debug!(scope = %scope, ordinal, free, "Slot updated");

        match scope {
            Scope::Products(id) if resort => self.schedule_resort(id.clone()),
            Scope::Products(_) => self.metrics.record_resort(),
            _ => {}
        }
        Ok(())
    }

    fn schedule_resort(&self, subcategory_id: String) {
        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);

        self.tasks.spawn(async move {
            let Some((mut members, generation)) = store.with_state(|state| {
                state
                    .products
                    .get(&subcategory_id)
                    .map(SortedIndices::snapshot)
            }) else {
                return;
            };

            members.sort_unstable();

            let installed = store.with_state(|state| {
                state
                    .products
                    .get_mut(&subcategory_id)
                    .is_some_and(|indices| indices.install(members, generation))
            });
            if installed {
                metrics.record_resort();
            } else {
                trace!(subcategory_id, "Resort superseded by a newer mutation");
            }
        });
    }
}

impl std::fmt::Debug for SlotAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotAllocator")
            .field("resort_mode", &self.resort_mode)
            .finish_non_exhaustive()
    }
}

fn set_slot(table: &mut SlotTable, ordinal: u32, free: bool) -> Result<bool> {
    if free {
        table.mark_free(ordinal)?;
    } else {
        table.mark_occupied(ordinal)?;
    }
    Ok(false)
}

fn read_free(state: &StoreState, scope: &Scope) -> Vec<u32> {
    match scope {
        Scope::Categories => state.categories.free_slots(),
        Scope::Subcategories(id) => state
            .subcategories
            .get(id)
            .map(SlotTable::free_slots)
            .unwrap_or_default(),
        Scope::Products(id) => state
            .products
            .get(id)
            .map(|indices| indices.ordered().to_vec())
            .unwrap_or_default(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ScriptedExecutor;
    use crate::cache::queries;
    use crate::domain::{Row, ScopeKind, SqlValue};
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn allocator(mode: ResortMode) -> (Arc<ScriptedExecutor>, SlotAllocator) {
        let executor = Arc::new(ScriptedExecutor::new());
        let store = Arc::new(EntityStore::new());
        let metrics = Arc::new(CacheMetrics::new());
        let initializer = Initializer::new(executor.clone(), store.clone(), metrics.clone());
        let allocator = SlotAllocator::new(store, initializer, metrics, TaskTracker::new(), mode);
        (executor, allocator)
    }

    fn ordinals(values: &[i64]) -> Vec<Row> {
        values
            .iter()
            .map(|&v| Row::new(vec![SqlValue::Integer(v)]))
            .collect()
    }

    #[tokio::test]
    async fn test_list_free_initializes_once() {
        let (executor, allocator) = allocator(ResortMode::Synchronous);
        executor.expect_rows(queries::OCCUPIED_CATEGORY_SLOTS, &[], ordinals(&[1, 2, 5, 6]));

        assert_eq!(allocator.list_free(&Scope::categories()).await.unwrap(), vec![3, 4, 7]);
        assert_eq!(allocator.list_free(&Scope::categories()).await.unwrap(), vec![3, 4, 7]);
        assert_eq!(executor.calls(queries::OCCUPIED_CATEGORY_SLOTS, &[]), 1);
    }

    #[tokio::test]
    async fn test_max_free() {
        let (executor, allocator) = allocator(ResortMode::Synchronous);
        executor.expect_rows(queries::OCCUPIED_CATEGORY_SLOTS, &[], ordinals(&[1, 2, 5, 6]));

        assert_eq!(allocator.max_free(&Scope::categories()).await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_not_ready_is_not_cached() {
        let (executor, allocator) = allocator(ResortMode::Synchronous);
        executor.expect_rows(queries::OCCUPIED_CATEGORY_SLOTS, &[], ordinals(&[1, 3]));
        executor.set_offline(true);

        assert_matches!(
            allocator.list_free(&Scope::categories()).await,
            Err(Error::NotReady(ScopeKind::Categories))
        );
        assert_matches!(
            allocator.max_free(&Scope::categories()).await,
            Err(Error::NotReady(ScopeKind::Categories))
        );

        executor.set_offline(false);
        assert_eq!(allocator.list_free(&Scope::categories()).await.unwrap(), vec![2, 4]);
        assert_eq!(executor.calls(queries::OCCUPIED_CATEGORY_SLOTS, &[]), 3);
    }

    #[tokio::test]
    async fn test_reserve_and_release_category() {
        let (executor, allocator) = allocator(ResortMode::Synchronous);
        executor.expect_rows(queries::OCCUPIED_CATEGORY_SLOTS, &[], ordinals(&[1, 3]));
        let scope = Scope::categories();

        allocator.reserve(&scope, 2).await.unwrap();
        assert_eq!(allocator.list_free(&scope).await.unwrap(), vec![4]);

        allocator.release(&scope, 1).await.unwrap();
        assert_eq!(allocator.list_free(&scope).await.unwrap(), vec![1, 4]);
    }

    #[tokio::test]
    async fn test_reserve_last_slot_forces_resync() {
        let (executor, allocator) = allocator(ResortMode::Synchronous);
        executor.expect_rows(queries::OCCUPIED_CATEGORY_SLOTS, &[], ordinals(&[]));
        let scope = Scope::categories();

        assert_eq!(allocator.list_free(&scope).await.unwrap(), vec![1]);
        allocator.reserve(&scope, 1).await.unwrap();

        executor.expect_rows(queries::OCCUPIED_CATEGORY_SLOTS, &[], ordinals(&[1]));
        assert_eq!(allocator.list_free(&scope).await.unwrap(), vec![2]);
        assert_eq!(executor.calls(queries::OCCUPIED_CATEGORY_SLOTS, &[]), 2);
    }

    #[tokio::test]
    async fn test_bounded_scope_rejects_out_of_range() {
        let (_executor, allocator) = allocator(ResortMode::Synchronous);

        assert_matches!(
            allocator.reserve(&Scope::categories(), 0).await,
            Err(Error::SlotOutOfRange { ordinal: 0, .. })
        );
        assert_matches!(
            allocator.release(&Scope::subcategories("c1"), SLOT_CAPACITY + 1).await,
            Err(Error::SlotOutOfRange { ordinal: 255, capacity: 254 })
        );
    }

    #[tokio::test]
    async fn test_product_scope_rejects_out_of_range() {
        let (_executor, allocator) = allocator(ResortMode::Synchronous);
        allocator.create_product_scope("sc1");
        let scope = Scope::products("sc1");

        assert_matches!(
            allocator.release(&scope, PRODUCT_SLOT_CAPACITY + 1).await,
            Err(Error::SlotOutOfRange { capacity: PRODUCT_SLOT_CAPACITY, .. })
        );
        assert_matches!(
            allocator.reserve(&scope, 0).await,
            Err(Error::SlotOutOfRange { ordinal: 0, .. })
        );
        allocator.release(&scope, PRODUCT_SLOT_CAPACITY).await.unwrap();
        assert_eq!(allocator.max_free(&scope).await.unwrap(), Some(PRODUCT_SLOT_CAPACITY));
    }

    #[tokio::test]
    async fn test_huge_store_ordinal_does_not_break_initialization() {
        let (executor, allocator) = allocator(ResortMode::Synchronous);
        executor.expect_rows(
            queries::OCCUPIED_CATEGORY_SLOTS,
            &[],
            ordinals(&[1, 50_000_000, i64::from(u32::MAX)]),
        );
        executor.expect_rows(
            queries::SUBCATEGORY_IDS,
            &[],
            vec![Row::new(vec![SqlValue::from("sc1")])],
        );
        executor.expect_rows(
            queries::OCCUPIED_PRODUCT_SLOTS,
            &[],
            vec![
                Row::new(vec![SqlValue::from("sc1"), SqlValue::Integer(1)]),
                Row::new(vec![SqlValue::from("sc1"), SqlValue::Integer(i64::from(u32::MAX))]),
            ],
        );

        assert_eq!(allocator.list_free(&Scope::categories()).await.unwrap(), vec![2]);
        assert_eq!(allocator.list_free(&Scope::products("sc1")).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_subcategory_scopes_are_independent() {
        let (_executor, allocator) = allocator(ResortMode::Synchronous);
        assert!(allocator.create_subcategory_scope("c1"));
        assert!(allocator.create_subcategory_scope("c2"));

        allocator.release(&Scope::subcategories("c1"), 5).await.unwrap();

        assert_eq!(allocator.list_free(&Scope::subcategories("c1")).await.unwrap(), vec![1, 5]);
        assert_eq!(allocator.list_free(&Scope::subcategories("c2")).await.unwrap(), vec![1]);
        assert_eq!(allocator.max_free(&Scope::subcategories("c1")).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_subcategory_scope_without_children_stays_empty() {
        let (executor, allocator) = allocator(ResortMode::Synchronous);
        executor.expect_rows(queries::OCCUPIED_SUBCATEGORY_SLOTS, &[], vec![]);

        let scope = Scope::subcategories("lonely");
        assert_eq!(allocator.list_free(&scope).await.unwrap(), Vec::<u32>::new());
        assert_eq!(allocator.max_free(&scope).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_create_scope_keeps_existing_reservations() {
        let (_executor, allocator) = allocator(ResortMode::Synchronous);
        let scope = Scope::products("sc1");

        assert!(allocator.create_product_scope("sc1"));
        allocator.release(&scope, 4).await.unwrap();

        assert!(!allocator.create_product_scope("sc1"));
        assert_eq!(allocator.list_free(&scope).await.unwrap(), vec![1, 4]);

        assert!(allocator.create_subcategory_scope("c1"));
        allocator.release(&Scope::subcategories("c1"), 3).await.unwrap();
        assert!(!allocator.create_subcategory_scope("c1"));
        assert_eq!(allocator.list_free(&Scope::subcategories("c1")).await.unwrap(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_product_release_then_reserve_synchronous() {
        let (_executor, allocator) = allocator(ResortMode::Synchronous);
        let scope = Scope::products("sc1");
        allocator.create_product_scope("sc1");
        allocator.release(&scope, 2).await.unwrap();
        assert_eq!(allocator.list_free(&scope).await.unwrap(), vec![1, 2]);

        allocator.release(&scope, 2).await.unwrap();
        allocator.reserve(&scope, 1).await.unwrap();

        assert_eq!(allocator.list_free(&scope).await.unwrap(), vec![2]);
        assert_eq!(allocator.max_free(&scope).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_product_release_then_reserve_background() {
        let (_executor, allocator) = allocator(ResortMode::Background);
        let scope = Scope::products("sc1");
        allocator.create_product_scope("sc1");
        allocator.release(&scope, 2).await.unwrap();
        allocator.release(&scope, 2).await.unwrap();
        allocator.reserve(&scope, 1).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if allocator.list_free(&scope).await.unwrap() == vec![2] {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("background resort did not converge");
    }

    #[tokio::test]
    async fn test_product_scope_initializes_from_store() {
        let (executor, allocator) = allocator(ResortMode::Synchronous);
        executor.expect_rows(
            queries::SUBCATEGORY_IDS,
            &[],
            vec![Row::new(vec![SqlValue::from("sc1")])],
        );
        executor.expect_rows(
            queries::OCCUPIED_PRODUCT_SLOTS,
            &[],
            vec![
                Row::new(vec![SqlValue::from("sc1"), SqlValue::Integer(1)]),
                Row::new(vec![SqlValue::from("sc1"), SqlValue::Integer(3)]),
            ],
        );
        let scope = Scope::products("sc1");

        allocator.reserve(&scope, 2).await.unwrap();
        assert_eq!(allocator.list_free(&scope).await.unwrap(), vec![4]);
    }
}
