//! Lifecycle event bus
//!
//! Every state change the engine makes is announced here so the hosting
//! application can react (refresh views, surface conflict banners, show
//! dropped-request warnings). The bus is an explicit instance handed to each
//! component at construction time; subscribers attach through [`EventBus::subscribe`].

use serde_json::Value;
use tokio::sync::broadcast;

use crate::queue::QueuedRequest;
use crate::sync::conflict::Conflict;

/// Notifications published by the engine components.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    DataStored {
        module: String,
        key: String,
        data: Value,
    },
    RequestQueued {
        request: QueuedRequest,
    },
    RequestSynced {
        request: QueuedRequest,
    },
    /// A request exhausted its retries and was moved to the dead-letter
    /// partition instead of being deleted.
    RequestDropped {
        request: QueuedRequest,
        attempts: u32,
    },
    SyncCompleted {
        success: usize,
        failed: usize,
    },
    ConflictDetected {
        conflict: Conflict,
    },
    ConflictResolved {
        key: String,
        resolved: Value,
    },
    NetworkStatusChanged {
        online: bool,
    },
    DataCleared,
}

/// Multi-subscriber notification channel.
///
/// Cloning is cheap; all clones publish into the same channel. Publishing
/// with no subscribers attached is a no-op, not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SyncEvent) {
        // Send only fails when nobody is listening, which is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(SyncEvent::NetworkStatusChanged { online: false });

        match rx.recv().await.unwrap() {
            SyncEvent::NetworkStatusChanged { online } => assert!(!online),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(SyncEvent::DataCleared);
    }

    #[tokio::test]
    async fn test_all_clones_share_the_channel() {
        let bus = EventBus::default();
        let clone = bus.clone();
        let mut rx = bus.subscribe();

        clone.publish(SyncEvent::SyncCompleted {
            success: 2,
            failed: 1,
        });

        match rx.recv().await.unwrap() {
            SyncEvent::SyncCompleted { success, failed } => {
                assert_eq!(success, 2);
                assert_eq!(failed, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
