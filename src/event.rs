//! Structured events published on every status change and progress update.
//!
//! Observers (status screens, audit logs) subscribe through
//! [`Dispatcher::subscribe`](crate::engine::Dispatcher::subscribe) and only
//! ever see snapshots; they never write back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Progress, WorkItem, WorkItemId};

/// A structured event emitted by the dispatcher or a proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkEvent {
    pub id: WorkItemId,
    pub work_type: String,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: WorkEventKind,
}

impl WorkEvent {
    pub fn new(item: &WorkItem, kind: WorkEventKind) -> Self {
        Self {
            id: item.id,
            work_type: item.work_type.clone(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkEventKind {
    Claimed {
        worker_id: String,
    },
    ProgressUpdated {
        progress: Progress,
    },
    Completed {
        duration_ms: u64,
    },
    Canceled,
    Postponed {
        until: DateTime<Utc>,
    },
    Retrying {
        attempt: u32,
        error: String,
        next_attempt_at: DateTime<Utc>,
    },
    Failed {
        attempt: u32,
        error: String,
    },
    /// Left in progress by a previous run of this worker and put back.
    Reset,
}
