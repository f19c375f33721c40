//! Queue item contract and lifecycle status.

use serde::{Deserialize, Serialize};

/// Anything the engine can schedule. The payload stays opaque to the
/// engine; it only needs identity and priority.
pub trait WorkItem: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Higher runs sooner. Items of equal priority run in enqueue order.
    fn priority(&self) -> i32 {
        0
    }
}

/// Lifecycle status, also the string key the persistence collaborator
/// stores rows under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
            ItemStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
