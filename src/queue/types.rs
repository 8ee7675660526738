use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// One deferred mutation, recorded while the network was unreachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRequest {
    /// Assigned by the store, monotonically increasing
    pub id: u64,
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<JsonValue>,
    /// Creation time, milliseconds since epoch
    pub timestamp: u64,
    pub retry_count: u32,
    /// Module attribution for statistics
    pub module: String,
}

/// A request that exhausted its retries, kept for inspection instead of
/// being discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadRequest {
    pub request: QueuedRequest,
    pub attempts: u32,
    pub dropped_at: u64,
}

/// Aggregate result of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    pub success: usize,
    pub failed: usize,
}
