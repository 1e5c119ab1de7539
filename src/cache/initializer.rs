//! Lazy Initializer
//!
//! Seeds slot scopes from the backing store on first access.
//!
//! Every initializer performs all of its reads first and applies the result
//! in a single critical section. A failed read leaves every scope exactly
//! as it was and surfaces as [`Error::NotReady`], so the next access retries
//! instead of trusting a false-empty scope.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::metrics::CacheMetrics;
use super::queries;
use super::slots::{SlotTable, SortedIndices};
use super::store::EntityStore;
use crate::domain::{QueryExecutor, Scope, ScopeKind};
use crate::error::{Error, Result};

/// Seeds slot scopes from the backing store.
#[derive(Clone)]
pub struct Initializer {
    executor: Arc<dyn QueryExecutor>,
    store: Arc<EntityStore>,
    metrics: Arc<CacheMetrics>,
}

impl Initializer {
    pub fn new(
        executor: Arc<dyn QueryExecutor>,
        store: Arc<EntityStore>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            executor,
            store,
            metrics,
        }
    }

    /// Initialize the scope family `scope` belongs to.
    pub async fn initialize(&self, scope: &Scope) -> Result<()> {
        match scope.kind() {
            ScopeKind::Categories => self.initialize_categories().await,
            ScopeKind::Subcategories => self.initialize_subcategories().await,
            ScopeKind::Products => self.initialize_products().await,
        }
    }

    /// Seed the global category table.
    #[instrument(skip(self))]
    pub async fn initialize_categories(&self) -> Result<()> {
        let rows = self
            .executor
            .query(queries::OCCUPIED_CATEGORY_SLOTS, &[])
            .await
            .map_err(|e| self.failed(ScopeKind::Categories, e))?;
        let occupied =
            queries::decode_ordinals(&rows).map_err(|e| self.failed(ScopeKind::Categories, e))?;

        let table = SlotTable::from_occupied(&occupied);
        debug!(occupied = occupied.len(), free = table.len(), "Seeding category slots");
        self.store.with_state(|state| state.categories = table);

        self.metrics.record_initialization();
        Ok(())
    }

    /// Seed one table per category that has subcategories.
    ///
    /// Categories without subcategories are left untouched.
    #[instrument(skip(self))]
    pub async fn initialize_subcategories(&self) -> Result<()> {
        let rows = self
            .executor
            .query(queries::OCCUPIED_SUBCATEGORY_SLOTS, &[])
            .await
            .map_err(|e| self.failed(ScopeKind::Subcategories, e))?;
        let groups = queries::decode_grouped_ordinals(&rows)
            .map_err(|e| self.failed(ScopeKind::Subcategories, e))?;

        let tables: Vec<(String, SlotTable)> = groups
            .into_iter()
            .map(|(category_id, occupied)| (category_id, SlotTable::from_occupied(&occupied)))
            .collect();
        debug!(categories = tables.len(), "Seeding subcategory slots");
        self.store.with_state(|state| state.subcategories.extend(tables));

        self.metrics.record_initialization();
        Ok(())
    }

    /// Seed every known subcategory with the baseline, then overwrite the
    /// ones that have products with their derived free set.
    #[instrument(skip(self))]
    pub async fn initialize_products(&self) -> Result<()> {
        let id_rows = self
            .executor
            .query(queries::SUBCATEGORY_IDS, &[])
            .await
            .map_err(|e| self.failed(ScopeKind::Products, e))?;
        let subcategory_ids =
            queries::decode_ids(&id_rows).map_err(|e| self.failed(ScopeKind::Products, e))?;

        let rows = self
            .executor
            .query(queries::OCCUPIED_PRODUCT_SLOTS, &[])
            .await
            .map_err(|e| self.failed(ScopeKind::Products, e))?;
        let groups = queries::decode_grouped_ordinals(&rows)
            .map_err(|e| self.failed(ScopeKind::Products, e))?;

        debug!(
            subcategories = subcategory_ids.len(),
            with_products = groups.len(),
            "Seeding product slots"
        );
        self.store.with_state(|state| {
            for id in subcategory_ids {
                state.products.insert(id, SortedIndices::baseline());
            }
            for (id, occupied) in groups {
                state
                    .products
                    .insert(id, SortedIndices::from_occupied(&occupied));
            }
        });

        self.metrics.record_initialization();
        Ok(())
    }

    /// Initialize all three scope families concurrently.
    ///
    /// Failures are logged; the affected scopes initialize on first access.
    pub async fn warm_up(&self) {
        let (categories, subcategories, products) = tokio::join!(
            self.initialize_categories(),
            self.initialize_subcategories(),
            self.initialize_products(),
        );

        let failed = [categories, subcategories, products]
            .into_iter()
            .filter(Result::is_err)
            .count();
        if failed == 0 {
            info!("Slot cache warmed up");
        } else {
            warn!(failed, "Slot cache warm-up incomplete, scopes will initialize on access");
        }
    }

    fn failed(&self, kind: ScopeKind, error: Error) -> Error {
        warn!(scope = %kind, error = %error, "Failed to initialize slot cache");
        self.metrics.record_initialization_failure();
        Error::NotReady(kind)
    }
}

impl std::fmt::Debug for Initializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Initializer").finish_non_exhaustive()
    }
}
