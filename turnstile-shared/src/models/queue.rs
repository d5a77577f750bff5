use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::inventory::Selection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueEntryStatus {
    Queued,
    Ready,
    Expired,
    Cancelled,
}

/// Details blob stored alongside an entry in the per-event ordering set.
///
/// There is no stored status: whether an entry is queued or ready is derived
/// from its live rank every time it is read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub queue_id: String,
    pub event_id: String,
    pub selections: Vec<Selection>,
    #[serde(default)]
    pub requester_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    pub claim_token: String,
    pub created_at: DateTime<Utc>,
    /// Score in the ordering set (epoch milliseconds).
    pub enqueued_at_ms: i64,
}
