//! Durable FIFO of outbound mutations with bounded retry
//!
//! Requests enqueued while offline are persisted in the `requests` partition
//! and replayed in enqueue order by [`RequestQueue::drain`]. A request that
//! fails [`MAX_RETRIES`] times is moved to the dead-letter partition and
//! announced with a `RequestDropped` event rather than silently deleted.

mod types;

pub use types::{DeadRequest, DrainOutcome, QueuedRequest};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::SyncResult;
use crate::events::{EventBus, SyncEvent};
use crate::store::{now_ms, LocalStore};

/// Retry ceiling per request; no backoff between attempts.
pub const MAX_RETRIES: u32 = 3;

/// The network capability injected into a drain pass. Implementations
/// perform the call and report success (2xx-equivalent) or failure; timeouts
/// are their responsibility, retry accounting is the queue's.
#[async_trait]
pub trait NetworkExecutor: Send + Sync {
    async fn execute(&self, request: &QueuedRequest) -> SyncResult<()>;
}

#[derive(Clone)]
pub struct RequestQueue {
    store: LocalStore,
    events: EventBus,
}

impl RequestQueue {
    pub fn new(store: LocalStore, events: EventBus) -> Self {
        Self { store, events }
    }

    /// Append a request with `retry_count = 0` and publish `RequestQueued`.
    pub fn queue_request(
        &self,
        url: impl Into<String>,
        method: impl Into<String>,
        body: Option<Value>,
        headers: HashMap<String, String>,
        module: &str,
    ) -> SyncResult<QueuedRequest> {
        let request = QueuedRequest {
            id: 0, // assigned by the store
            url: url.into(),
            method: method.into(),
            headers,
            body,
            timestamp: now_ms(),
            retry_count: 0,
            module: module.to_string(),
        };

        let request = self.store.append_request(request)?;
        tracing::debug!(
            "queued request {} ({} {})",
            request.id,
            request.method,
            request.url
        );
        self.events.publish(SyncEvent::RequestQueued {
            request: request.clone(),
        });
        Ok(request)
    }

    /// Replay every currently queued request once, in enqueue order.
    ///
    /// Successes are deleted and counted; failures increment `retry_count`
    /// and stay queued below the ceiling, or move to the dead-letter
    /// partition at it. Requests enqueued mid-drain are left for the next
    /// pass.
    pub async fn drain(&self, executor: &dyn NetworkExecutor) -> SyncResult<DrainOutcome> {
        let pending = self.store.list_requests()?;
        let mut outcome = DrainOutcome::default();

        for mut request in pending {
            match executor.execute(&request).await {
                Ok(()) => {
                    self.store.delete_request(request.id)?;
                    outcome.success += 1;
                    self.events.publish(SyncEvent::RequestSynced { request });
                }
                Err(e) => {
                    outcome.failed += 1;
                    request.retry_count += 1;
                    tracing::warn!(
                        "replay of request {} ({} {}) failed, attempt {}/{}: {}",
                        request.id,
                        request.method,
                        request.url,
                        request.retry_count,
                        MAX_RETRIES,
                        e
                    );

                    if request.retry_count < MAX_RETRIES {
                        self.store.rewrite_request(&request)?;
                    } else {
                        let attempts = request.retry_count;
                        let dead = DeadRequest {
                            request: request.clone(),
                            attempts,
                            dropped_at: now_ms(),
                        };
                        self.store.dead_letter_request(&dead)?;
                        tracing::error!(
                            "request {} ({} {}) exhausted retries, moved to dead letter",
                            request.id,
                            request.method,
                            request.url
                        );
                        self.events
                            .publish(SyncEvent::RequestDropped { request, attempts });
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Pending requests in enqueue order.
    pub fn pending(&self) -> SyncResult<Vec<QueuedRequest>> {
        self.store.list_requests()
    }

    /// Requests that permanently failed, kept for inspection.
    pub fn dead_letters(&self) -> SyncResult<Vec<DeadRequest>> {
        self.store.list_dead_letters()
    }
}
