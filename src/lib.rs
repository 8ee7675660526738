pub mod crypto;
pub mod error;
pub mod events;
pub mod queue;
pub mod store;
pub mod sync;

pub use crypto::PayloadCipher;
pub use error::{SyncError, SyncResult};
pub use events::{EventBus, SyncEvent};
pub use queue::{DeadRequest, DrainOutcome, NetworkExecutor, QueuedRequest, RequestQueue, MAX_RETRIES};
pub use store::{CachedRecord, LocalStore};
pub use sync::conflict::{deep_merge, Conflict, ConflictResolver, ConflictStrategy};
pub use sync::{SyncConfig, SyncEngine};
