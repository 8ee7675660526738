//! Sync engine: drains the request queue with a single-flight guarantee
//!
//! The engine owns no persisted state of its own; it coordinates the request
//! queue, the conflict resolver and the injected network executor. A sync
//! pass can be triggered three ways: a network-reconnect signal, the
//! periodic background worker, or an explicit call to
//! [`SyncEngine::sync_queued_requests`]. Concurrent triggers coalesce into
//! the running pass.

pub mod conflict;

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::SyncResult;
use crate::events::{EventBus, SyncEvent};
use crate::queue::{DrainOutcome, NetworkExecutor, RequestQueue};
use crate::store::LocalStore;
use conflict::{Conflict, ConflictResolver, ConflictStrategy};

/// Configuration for the background sync worker.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How often the worker attempts a pass while online
    pub sync_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(300),
        }
    }
}

pub struct SyncEngine {
    store: LocalStore,
    queue: RequestQueue,
    resolver: ConflictResolver,
    executor: Arc<dyn NetworkExecutor>,
    events: EventBus,
    config: SyncConfig,
    online: AtomicBool,
    sync_in_progress: AtomicBool,
    notifier: broadcast::Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Releases the single-flight gate even if the drain pass panics.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncEngine {
    pub fn new(
        store: LocalStore,
        executor: Arc<dyn NetworkExecutor>,
        events: EventBus,
    ) -> Arc<Self> {
        Self::with_config(store, executor, events, SyncConfig::default())
    }

    pub fn with_config(
        store: LocalStore,
        executor: Arc<dyn NetworkExecutor>,
        events: EventBus,
        config: SyncConfig,
    ) -> Arc<Self> {
        let (notifier, _) = broadcast::channel(16);
        Arc::new(Self {
            queue: RequestQueue::new(store.clone(), events.clone()),
            resolver: ConflictResolver::new(store.clone(), events.clone()),
            store,
            executor,
            events,
            config,
            online: AtomicBool::new(true),
            sync_in_progress: AtomicBool::new(false),
            notifier,
            worker: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Record a connectivity transition. Going back online wakes the
    /// background worker so queued requests replay promptly.
    pub fn set_network_status(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online == online {
            return;
        }
        tracing::info!("network status changed: online={}", online);
        self.events
            .publish(SyncEvent::NetworkStatusChanged { online });
        if online {
            let _ = self.notifier.send(());
        }
    }

    /// Replay the queued requests once, in enqueue order.
    ///
    /// Returns `{0, 0}` without touching the queue when offline, or when
    /// another pass is already in flight (concurrent calls coalesce).
    pub async fn sync_queued_requests(&self) -> SyncResult<DrainOutcome> {
        if !self.is_online() {
            tracing::debug!("sync pass skipped: offline");
            return Ok(DrainOutcome::default());
        }

        if self
            .sync_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("sync pass already in flight, coalescing");
            return Ok(DrainOutcome::default());
        }
        let _guard = FlightGuard(&self.sync_in_progress);

        let outcome = self.queue.drain(self.executor.as_ref()).await?;

        tracing::info!(
            "sync pass completed: {} synced, {} failed",
            outcome.success,
            outcome.failed
        );
        self.events.publish(SyncEvent::SyncCompleted {
            success: outcome.success,
            failed: outcome.failed,
        });
        Ok(outcome)
    }

    /// Escalate a local/remote divergence to the conflict resolver.
    pub fn handle_sync_conflict(
        &self,
        module: &str,
        key: &str,
        local: &Value,
        remote: &Value,
        strategy: ConflictStrategy,
    ) -> SyncResult<Value> {
        self.resolver
            .handle_sync_conflict(module, key, local, remote, strategy)
    }

    /// Apply a human decision for a pending conflict.
    pub fn resolve_conflict(&self, composite_key: &str, resolved: &Value) -> SyncResult<()> {
        self.resolver.resolve_conflict(composite_key, resolved)
    }

    pub fn pending_conflicts(&self) -> SyncResult<Vec<Conflict>> {
        self.resolver.pending_conflicts()
    }

    /// Spawn the background worker: a pass on every reconnect signal and on
    /// a fixed interval while online. Calling twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }

        let engine = Arc::clone(self);
        let mut wake = self.notifier.subscribe();
        let interval = self.config.sync_interval;

        let handle = tokio::spawn(async move {
            tracing::info!("sync worker started, interval {:?}", interval);
            loop {
                tokio::select! {
                    _ = wake.recv() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
                if !engine.is_online() {
                    continue;
                }
                if let Err(e) = engine.sync_queued_requests().await {
                    tracing::error!("background sync pass failed: {}", e);
                }
            }
        });
        *worker = Some(handle);
    }

    /// Stop the background worker. An in-flight pass is not interrupted
    /// mid-request, only the loop is.
    pub fn shutdown(&self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle.abort();
            tracing::info!("sync worker stopped");
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
