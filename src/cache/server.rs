//! Cache Server
//!
//! Wires the store, initializer, allocator and dispatcher together and owns
//! the task tracker every background task is spawned on. One server is
//! constructed per process through a [`ServerCell`] and shared as
//! `Arc<CacheServer>`.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use super::allocator::{ResortMode, SlotAllocator};
use super::dispatcher::{self, DispatcherHandle, Verification, Verifier};
use super::initializer::Initializer;
use super::metrics::{CacheMetrics, CacheStats};
use super::store::EntityStore;
use crate::domain::{Claim, EntityKind, QueryExecutor};
use crate::error::Result;

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Request channel capacity
    pub request_buffer: usize,
    /// How the product scope's ordered view is rebuilt
    pub resort_mode: ResortMode,
    /// Seed every slot scope at startup
    pub warm_up: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            request_buffer: 1,
            resort_mode: ResortMode::Synchronous,
            warm_up: true,
        }
    }
}

/// The running cache.
pub struct CacheServer {
    config: CacheConfig,
    executor: Arc<dyn QueryExecutor>,
    store: Arc<EntityStore>,
    metrics: Arc<CacheMetrics>,
    allocator: SlotAllocator,
    dispatcher: DispatcherHandle,
    tasks: TaskTracker,
}

impl CacheServer {
    /// Build the cache and start its dispatcher loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: CacheConfig, executor: Arc<dyn QueryExecutor>) -> Arc<Self> {
        let store = Arc::new(EntityStore::new());
        let metrics = Arc::new(CacheMetrics::new());
        let tasks = TaskTracker::new();

        let initializer = Initializer::new(executor.clone(), store.clone(), metrics.clone());
        let allocator = SlotAllocator::new(
            store.clone(),
            initializer.clone(),
            metrics.clone(),
            tasks.clone(),
            config.resort_mode,
        );
        let verifier = Verifier::new(executor.clone(), store.clone(), metrics.clone(), tasks.clone());
        let (dispatcher, handle) = dispatcher::channel(config.request_buffer, verifier, tasks.clone());

        tasks.spawn(dispatcher.run());
        if config.warm_up {
            tasks.spawn(async move { initializer.warm_up().await });
        }

        info!(
            request_buffer = config.request_buffer,
            resort_mode = ?config.resort_mode,
            warm_up = config.warm_up,
            "Cache server started"
        );

        Arc::new(Self {
            config,
            executor,
            store,
            metrics,
            allocator,
            dispatcher: handle,
            tasks,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Verify an entity and wait for the answer.
    pub async fn verify(&self, kind: EntityKind, id: &str, claim: Claim) -> bool {
        self.dispatcher.verify(kind, id, claim).await
    }

    /// Enqueue a verification and return its pending answer.
    pub async fn submit(&self, kind: EntityKind, id: &str, claim: Claim) -> Verification {
        self.dispatcher.submit(kind, id, claim).await
    }

    /// Drop a cached attribute so the next verification refetches it.
    pub fn delete_cached(&self, kind: EntityKind, id: &str) -> bool {
        let removed = self.store.delete(kind, id);
        debug!(kind = %kind, id, removed, "Cached attribute deleted");
        removed
    }

    pub fn dispatcher(&self) -> DispatcherHandle {
        self.dispatcher.clone()
    }

    pub fn allocator(&self) -> &SlotAllocator {
        &self.allocator
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn stats(&self) -> CacheStats {
        self.metrics.snapshot()
    }

    /// Accepting requests and the backing store answers.
    pub async fn is_ready(&self) -> bool {
        !self.dispatcher.is_closed() && self.executor.ping().await.is_ok()
    }

    /// Stop the dispatcher and wait for every outstanding task.
    pub async fn shutdown(&self) {
        if self.dispatcher.quit().await.is_err() {
            debug!("Dispatcher already stopped");
        }
        self.tasks.close();
        self.tasks.wait().await;
        info!("Cache server stopped");
    }
}

impl std::fmt::Debug for CacheServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheServer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// One-time construction
// =============================================================================

/// Holds the single server of a process. The first caller starts it; every
/// later caller gets the same instance.
#[derive(Debug, Default)]
pub struct ServerCell {
    cell: OnceCell<Arc<CacheServer>>,
}

impl ServerCell {
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    /// Return the server, starting it on first use.
    ///
    /// `config` and `make_executor` are ignored once a server exists.
    pub fn get_or_start<F>(&self, config: CacheConfig, make_executor: F) -> Arc<CacheServer>
    where
        F: FnOnce() -> Arc<dyn QueryExecutor>,
    {
        Arc::clone(
            self.cell
                .get_or_init(|| CacheServer::start(config, make_executor())),
        )
    }

    /// Like [`get_or_start`](Self::get_or_start) with a fallible executor
    /// constructor. A failure leaves the cell empty.
    pub fn get_or_try_start<F>(&self, config: CacheConfig, make_executor: F) -> Result<Arc<CacheServer>>
    where
        F: FnOnce() -> Result<Arc<dyn QueryExecutor>>,
    {
        self.cell
            .get_or_try_init(|| Ok(CacheServer::start(config, make_executor()?)))
            .map(Arc::clone)
    }

    pub fn get(&self) -> Option<Arc<CacheServer>> {
        self.cell.get().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ScriptedExecutor;
    use crate::cache::queries;
    use crate::domain::{Row, Scope, SqlValue};
    use crate::error::Error;

    fn quiet() -> CacheConfig {
        CacheConfig {
            warm_up: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.request_buffer, 1);
        assert_eq!(config.resort_mode, ResortMode::Synchronous);
        assert!(config.warm_up);
    }

    #[tokio::test]
    async fn test_verify_and_delete_cached() {
        let executor = Arc::new(ScriptedExecutor::new());
        let params = [SqlValue::from("p1")];
        let sql = queries::lookup_query(EntityKind::Product);
        executor.expect_row(sql, &params, Row::new(vec![SqlValue::from("p1")]));
        let server = CacheServer::start(quiet(), executor.clone());

        server.store().put(EntityKind::Product, "p1", "passive");
        assert!(!server.verify(EntityKind::Product, "p1", Claim::None).await);

        assert!(server.delete_cached(EntityKind::Product, "p1"));
        assert!(server.verify(EntityKind::Product, "p1", Claim::None).await);
        assert_eq!(executor.calls(sql, &params), 1);

        let stats = server.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_warm_up_seeds_scopes() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.expect_rows(
            queries::OCCUPIED_CATEGORY_SLOTS,
            &[],
            vec![Row::new(vec![SqlValue::Integer(1)])],
        );
        executor.expect_rows(queries::OCCUPIED_SUBCATEGORY_SLOTS, &[], vec![]);
        executor.expect_rows(queries::SUBCATEGORY_IDS, &[], vec![]);
        executor.expect_rows(queries::OCCUPIED_PRODUCT_SLOTS, &[], vec![]);

        let server = CacheServer::start(CacheConfig::default(), executor.clone());
        server.shutdown().await;

        assert!(server.allocator().has_free(&Scope::categories()));
        assert_eq!(executor.calls(queries::OCCUPIED_CATEGORY_SLOTS, &[]), 1);
        assert_eq!(server.stats().initializations, 3);
    }

    #[tokio::test]
    async fn test_readiness_follows_backing_store_and_shutdown() {
        let executor = Arc::new(ScriptedExecutor::new());
        let server = CacheServer::start(quiet(), executor.clone());

        assert!(server.is_ready().await);
        executor.set_offline(true);
        assert!(!server.is_ready().await);
        executor.set_offline(false);

        server.shutdown().await;
        assert!(!server.is_ready().await);
        assert!(!server.verify(EntityKind::Category, "c1", Claim::None).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_server_cell_starts_once() {
        let cell = Arc::new(ServerCell::new());
        let executor = Arc::new(ScriptedExecutor::new());
        let constructed = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cell = cell.clone();
            let executor = executor.clone();
            let constructed = constructed.clone();
            handles.push(tokio::spawn(async move {
                cell.get_or_start(quiet(), move || {
                    constructed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    executor as Arc<dyn QueryExecutor>
                })
            }));
        }

        let servers: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        assert_eq!(constructed.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(servers.iter().all(|s| Arc::ptr_eq(s, &servers[0])));
        assert!(Arc::ptr_eq(&cell.get().unwrap(), &servers[0]));
    }

    #[tokio::test]
    async fn test_server_cell_failed_start_stays_empty() {
        let cell = ServerCell::new();

        let result = cell.get_or_try_start(quiet(), || Err(Error::Config("no database".to_string())));
        assert!(matches!(result, Err(Error::Config(_))));
        assert!(cell.get().is_none());

        let server = cell
            .get_or_try_start(quiet(), || Ok(Arc::new(ScriptedExecutor::new()) as Arc<dyn QueryExecutor>))
            .unwrap();
        assert!(Arc::ptr_eq(&cell.get().unwrap(), &server));
    }
}
