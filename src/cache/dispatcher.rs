//! Request Dispatcher
//!
//! A single loop owns the receiving end of the request channel and spawns
//! one verification task per request, so a slow backing-store round trip or
//! an absent caller never stalls other requests. Each request carries its
//! own oneshot response channel and is answered exactly once.
//!
//! ```text
//! caller ──submit──▶ [mpsc] ──▶ Dispatcher::run ──spawn──▶ Verifier::verify
//!   ▲                                                          │
//!   └──────────────────── oneshot<bool> ◀──────────────────────┘
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, trace, warn};

use super::metrics::CacheMetrics;
use super::queries;
use super::store::{EntityStore, ACTIVE, PASSIVE};
use crate::domain::{Claim, EntityKind, QueryExecutor, SqlValue};
use crate::error::{Error, Result};

// =============================================================================
// Requests
// =============================================================================

/// A verification request.
#[derive(Debug)]
pub struct Request {
    pub kind: EntityKind,
    pub id: String,
    pub claim: Claim,
    respond_to: oneshot::Sender<bool>,
}

/// Control channel message.
#[derive(Debug)]
pub enum Command {
    Verify(Request),
    /// Stop accepting requests. Tasks already dispatched still complete.
    Quit,
}

/// Pending answer to a submitted request.
///
/// Resolves to `false` if the request was dropped without an answer, which
/// happens once the dispatcher has stopped.
#[derive(Debug)]
pub struct Verification {
    rx: oneshot::Receiver<bool>,
}

impl Future for Verification {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|answer| answer.unwrap_or(false))
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable sending side of the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<Command>,
}

impl DispatcherHandle {
    /// Enqueue a request, waiting until the dispatcher accepts it.
    pub async fn submit(&self, kind: EntityKind, id: impl Into<String>, claim: Claim) -> Verification {
        let (respond_to, rx) = oneshot::channel();
        let request = Request {
            kind,
            id: id.into(),
            claim,
            respond_to,
        };
        if self.tx.send(Command::Verify(request)).await.is_err() {
            debug!(kind = %kind, "Dispatcher stopped, request dropped");
        }
        Verification { rx }
    }

    /// Submit a request and wait for its answer.
    pub async fn verify(&self, kind: EntityKind, id: impl Into<String>, claim: Claim) -> bool {
        self.submit(kind, id, claim).await.await
    }

    /// Ask the dispatcher loop to stop.
    pub async fn quit(&self) -> Result<()> {
        self.tx
            .send(Command::Quit)
            .await
            .map_err(|_| Error::Internal("dispatcher already stopped".to_string()))
    }

    /// Whether the dispatcher loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// =============================================================================
// Dispatcher loop
// =============================================================================

/// Receiving side of the request channel.
pub struct Dispatcher {
    rx: mpsc::Receiver<Command>,
    verifier: Arc<Verifier>,
    tasks: TaskTracker,
}

/// Create a dispatcher and its handle. `buffer` is clamped to at least 1.
pub fn channel(buffer: usize, verifier: Verifier, tasks: TaskTracker) -> (Dispatcher, DispatcherHandle) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let dispatcher = Dispatcher {
        rx,
        verifier: Arc::new(verifier),
        tasks,
    };
    (dispatcher, DispatcherHandle { tx })
}

impl Dispatcher {
    /// Run until `Quit` arrives or every handle is dropped.
    pub async fn run(mut self) {
        info!("Dispatcher started");

        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Verify(request) => {
                    let verifier = Arc::clone(&self.verifier);
                    self.tasks.spawn(async move { verifier.handle(request).await });
                }
                Command::Quit => {
                    info!("Dispatcher received quit");
                    break;
                }
            }
        }

        info!("Dispatcher stopped");
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

// =============================================================================
// Verification
// =============================================================================

/// Answers verification requests from the store, falling back to the
/// backing store on a miss.
pub struct Verifier {
    executor: Arc<dyn QueryExecutor>,
    store: Arc<EntityStore>,
    metrics: Arc<CacheMetrics>,
    tasks: TaskTracker,
}

impl Verifier {
    pub fn new(
        executor: Arc<dyn QueryExecutor>,
        store: Arc<EntityStore>,
        metrics: Arc<CacheMetrics>,
        tasks: TaskTracker,
    ) -> Self {
        Self {
            executor,
            store,
            metrics,
            tasks,
        }
    }

    async fn handle(&self, request: Request) {
        let Request {
            kind,
            id,
            claim,
            respond_to,
        } = request;
        let answer = self.verify(kind, &id, &claim).await;
        if respond_to.send(answer).is_err() {
            trace!(kind = %kind, id = %id, "Caller went away before the answer");
        }
    }

    /// Decide one request.
    ///
    /// Roles compare the claimed role against the cached or fetched one and
    /// require a claim. Other kinds are valid when their cached value is
    /// `active`; the claim is ignored.
    #[instrument(skip(self, claim))]
    pub async fn verify(&self, kind: EntityKind, id: &str, claim: &Claim) -> bool {
        let claimed = match (kind.requires_claim(), claim.as_role()) {
            (true, None) => {
                debug!(id, "Role verification without a claimed role");
                self.metrics.record_malformed();
                return false;
            }
            (true, Some(role)) => Some(role),
            (false, _) => None,
        };

        let value = match self.store.lookup(kind, id) {
            Some(value) => {
                debug!(id, "Cache hit");
                self.metrics.record_hit();
                value
            }
            None => {
                debug!(id, "Cache miss");
                self.metrics.record_miss();
                match self.fetch(kind, id).await {
                    Some(value) => {
                        self.fill(kind, id, value.clone());
                        value
                    }
                    None => return false,
                }
            }
        };

        match claimed {
            Some(role) => value == role,
            None => value == ACTIVE,
        }
    }

    /// Look the entity up in the backing store. `None` means nothing may be
    /// cached and the answer is `false`.
    ///
    /// A missing entity is cached as `passive`. If the row is created later,
    /// lookups keep answering `false` until the owner calls
    /// `CacheServer::delete_cached` for it.
    async fn fetch(&self, kind: EntityKind, id: &str) -> Option<String> {
        let params = [SqlValue::from(id)];
        match self.executor.query_row(queries::lookup_query(kind), &params).await {
            Ok(Some(row)) if kind == EntityKind::Role => match row.string(0) {
                Ok(role) => Some(role),
                Err(e) => {
                    warn!(kind = %kind, id, error = %e, "Malformed role row");
                    self.metrics.record_fetch_failure();
                    None
                }
            },
            Ok(Some(_)) => Some(ACTIVE.to_string()),
            Ok(None) if kind == EntityKind::Role => {
                debug!(id, "Unknown user");
                None
            }
            Ok(None) => Some(PASSIVE.to_string()),
            Err(e) => {
                warn!(kind = %kind, id, error = %e, "Backing store lookup failed");
                self.metrics.record_fetch_failure();
                None
            }
        }
    }

    /// Write a fetched value into the store without delaying the answer.
    fn fill(&self, kind: EntityKind, id: &str, value: String) {
        let store = Arc::clone(&self.store);
        let id = id.to_string();
        self.tasks.spawn(async move {
            debug!(kind = %kind, id = %id, value = %value, "Cache fill");
            store.put(kind, id, value);
        });
    }
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ScriptedExecutor;
    use crate::domain::Row;
    use std::time::Duration;

    struct Fixture {
        executor: Arc<ScriptedExecutor>,
        store: Arc<EntityStore>,
        metrics: Arc<CacheMetrics>,
        tasks: TaskTracker,
        handle: DispatcherHandle,
    }

    fn start() -> Fixture {
        let executor = Arc::new(ScriptedExecutor::new());
        let store = Arc::new(EntityStore::new());
        let metrics = Arc::new(CacheMetrics::new());
        let tasks = TaskTracker::new();
        let verifier = Verifier::new(executor.clone(), store.clone(), metrics.clone(), tasks.clone());
        let (dispatcher, handle) = channel(1, verifier, tasks.clone());
        tokio::spawn(dispatcher.run());
        Fixture {
            executor,
            store,
            metrics,
            tasks,
            handle,
        }
    }

    async fn wait_cached(store: &EntityStore, kind: EntityKind, id: &str) -> String {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(value) = store.lookup(kind, id) {
                    return value;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("cache fill did not happen")
    }

    fn exists(id: &str) -> [SqlValue; 1] {
        [SqlValue::from(id)]
    }

    #[tokio::test]
    async fn test_role_fetched_once_then_served_from_cache() {
        let f = start();
        f.executor.expect_row(
            queries::ROLE_BY_USER,
            &exists("u1"),
            Row::new(vec![SqlValue::from("admin")]),
        );

        assert!(f.handle.verify(EntityKind::Role, "u1", Claim::role("admin")).await);
        assert_eq!(wait_cached(&f.store, EntityKind::Role, "u1").await, "admin");

        assert!(!f.handle.verify(EntityKind::Role, "u1", Claim::role("viewer")).await);
        assert!(f.handle.verify(EntityKind::Role, "u1", Claim::role("admin")).await);
        assert_eq!(f.executor.calls(queries::ROLE_BY_USER, &exists("u1")), 1);
    }

    #[tokio::test]
    async fn test_role_without_claim_is_malformed() {
        let f = start();

        assert!(!f.handle.verify(EntityKind::Role, "u1", Claim::None).await);
        assert_eq!(f.executor.total_calls(), 0);
        assert_eq!(f.metrics.snapshot().malformed_requests, 1);
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_cached() {
        let f = start();
        f.executor.expect_no_row(queries::ROLE_BY_USER, &exists("ghost"));

        assert!(!f.handle.verify(EntityKind::Role, "ghost", Claim::role("admin")).await);
        assert!(!f.handle.verify(EntityKind::Role, "ghost", Claim::role("admin")).await);

        assert_eq!(f.executor.calls(queries::ROLE_BY_USER, &exists("ghost")), 2);
        assert_eq!(f.store.lookup(EntityKind::Role, "ghost"), None);
    }

    #[tokio::test]
    async fn test_cached_values_answer_without_store() {
        let f = start();
        f.store.put(EntityKind::Product, "p1", ACTIVE);
        f.store.put(EntityKind::Category, "c9", PASSIVE);

        assert!(f.handle.verify(EntityKind::Product, "p1", Claim::None).await);
        assert!(!f.handle.verify(EntityKind::Category, "c9", Claim::None).await);
        assert_eq!(f.executor.total_calls(), 0);
        assert_eq!(f.metrics.snapshot().hits, 2);
    }

    #[tokio::test]
    async fn test_claim_is_ignored_for_entities() {
        let f = start();
        f.store.put(EntityKind::Subcategory, "sc1", ACTIVE);

        assert!(f.handle.verify(EntityKind::Subcategory, "sc1", Claim::role("anything")).await);
    }

    #[tokio::test]
    async fn test_missing_entity_cached_passive() {
        let f = start();
        let sql = queries::lookup_query(EntityKind::Category);
        f.executor.expect_no_row(sql, &exists("c404"));

        assert!(!f.handle.verify(EntityKind::Category, "c404", Claim::None).await);
        assert_eq!(wait_cached(&f.store, EntityKind::Category, "c404").await, PASSIVE);

        assert!(!f.handle.verify(EntityKind::Category, "c404", Claim::None).await);
        assert_eq!(f.executor.calls(sql, &exists("c404")), 1);
    }

    #[tokio::test]
    async fn test_fetch_error_is_false_and_not_cached() {
        let f = start();
        let sql = queries::lookup_query(EntityKind::Product);
        f.executor.expect_failure(sql, &exists("p1"), "connection reset");

        assert!(!f.handle.verify(EntityKind::Product, "p1", Claim::None).await);

        f.tasks.close();
        f.tasks.wait().await;
        assert_eq!(f.store.lookup(EntityKind::Product, "p1"), None);
        assert_eq!(f.metrics.snapshot().fetch_failures, 1);

        f.executor.expect_row(sql, &exists("p1"), Row::new(vec![SqlValue::from("p1")]));
        assert!(f.handle.verify(EntityKind::Product, "p1", Claim::None).await);
    }

    #[tokio::test]
    async fn test_delete_forces_refetch() {
        let f = start();
        let sql = queries::lookup_query(EntityKind::Product);
        f.executor.expect_row(sql, &exists("p1"), Row::new(vec![SqlValue::from("p1")]));

        assert!(f.handle.verify(EntityKind::Product, "p1", Claim::None).await);
        wait_cached(&f.store, EntityKind::Product, "p1").await;

        assert!(f.store.delete(EntityKind::Product, "p1"));
        f.executor.expect_no_row(sql, &exists("p1"));

        assert!(!f.handle.verify(EntityKind::Product, "p1", Claim::None).await);
        assert_eq!(f.executor.calls(sql, &exists("p1")), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_distinct_ids_fetch_once_each() {
        let f = start();
        let sql = queries::lookup_query(EntityKind::Product);
        f.executor.set_latency(Some(Duration::from_millis(5)));
        let ids: Vec<String> = (0..32).map(|i| format!("p{}", i)).collect();
        for id in &ids {
            f.executor.expect_row(sql, &exists(id), Row::new(vec![SqlValue::from(id.as_str())]));
        }

        let mut pending = Vec::new();
        for id in &ids {
            pending.push(f.handle.submit(EntityKind::Product, id.clone(), Claim::None).await);
        }
        let answers = futures::future::join_all(pending).await;
        assert!(answers.into_iter().all(|answer| answer));

        for id in &ids {
            assert_eq!(wait_cached(&f.store, EntityKind::Product, id).await, ACTIVE);
            assert_eq!(f.executor.calls(sql, &exists(id)), 1);
        }
    }

    #[tokio::test]
    async fn test_quit_stops_accepting() {
        let f = start();
        f.store.put(EntityKind::Product, "p1", ACTIVE);

        f.handle.quit().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !f.handle.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("dispatcher did not stop");

        assert!(!f.handle.verify(EntityKind::Product, "p1", Claim::None).await);
        assert!(f.handle.quit().await.is_err());
    }

    #[test]
    fn test_dropped_request_resolves_false() {
        let (respond_to, rx) = oneshot::channel::<bool>();
        drop(respond_to);
        let verification = Verification { rx };
        assert!(!tokio_test::block_on(verification));
    }
}
