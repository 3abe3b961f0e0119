//! Core data model.
//!
//! A work item is a persisted unit of background work. It has a type (which
//! selects the processor), a schedule (when it becomes eligible), an optional
//! expiration, an opaque payload, and a lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of work tracked by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier. Assigned at creation, never changes.
    pub id: WorkItemId,

    /// Selects the processor (e.g. "DeleteStudy"). Immutable after creation.
    pub work_type: String,

    /// Current lifecycle status.
    pub status: Status,

    /// Not eligible for claim before this instant.
    pub scheduled_time: DateTime<Utc>,

    /// When set and past, the item is no longer claimable even if pending.
    pub expiration_time: Option<DateTime<Utc>>,

    /// Type-specific request data. The queue never interprets it.
    pub payload: serde_json::Value,

    /// Written only by the current claim holder.
    pub progress: Progress,

    /// Failed attempts so far.
    pub retry_count: u32,

    /// Per-item override of the type's retry budget.
    pub max_retries: Option<u32>,

    /// Worker holding the current claim (the lease owner).
    pub claimed_by: Option<String>,

    /// Externally requested cancellation (`CancelPending`).
    pub cancel_requested: bool,

    /// Last error, kept for operators.
    pub failure_description: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Can a worker claim this item at `now`?
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == Status::Pending
            && self.scheduled_time <= now
            && self.expiration_time.is_none_or(|exp| exp > now)
    }
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(pub Uuid);

impl WorkItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        f.pad(&self.0.to_string()[..8])
    }
}

impl Default for WorkItemId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting for its scheduled time and a worker.
    Pending,
    /// Claimed by exactly one worker.
    InProgress,
    /// Held back by an external collaborator. Never claimed, never written
    /// by the dispatcher.
    Postponed,
    /// Done successfully. Terminal.
    Complete,
    /// Retry budget exhausted or fatal error. Terminal.
    Failed,
    /// Canceled on request. Terminal.
    Canceled,
}

impl Status {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, InProgress)       // claim
                | (Pending, Canceled)   // canceled before it ever ran
                | (Pending, Postponed)
                | (Postponed, Pending)
                | (Postponed, Canceled)
                | (InProgress, Complete)
                | (InProgress, Canceled)
                | (InProgress, Pending) // postpone, retry, or startup reset
                | (InProgress, Failed)
        )
    }

    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Complete | Status::Failed | Status::Canceled)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::InProgress => "in_progress",
            Status::Postponed => "postponed",
            Status::Complete => "complete",
            Status::Failed => "failed",
            Status::Canceled => "canceled",
        };
        f.pad(s)
    }
}

impl std::str::FromStr for Status {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "in_progress" => Ok(Status::InProgress),
            "postponed" => Ok(Status::Postponed),
            "complete" => Ok(Status::Complete),
            "failed" => Ok(Status::Failed),
            "canceled" => Ok(Status::Canceled),
            other => Err(crate::error::Error::Other(format!("unknown status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress of an in-progress item, as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Whether an operator may cancel the item right now.
    pub is_cancelable: bool,
    /// Free-form detail, e.g. why the item was postponed.
    #[serde(default)]
    pub status_details: String,
    #[serde(default)]
    pub total_items: u64,
    #[serde(default)]
    pub items_processed: u64,
    #[serde(default)]
    pub items_failed: u64,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            is_cancelable: true,
            status_details: String::new(),
            total_items: 0,
            items_processed: 0,
            items_failed: 0,
        }
    }
}

impl Progress {
    /// Fraction of `total_items` handled, successful or not. 0.0 when unknown.
    pub fn percent_complete(&self) -> f64 {
        if self.total_items == 0 {
            return 0.0;
        }
        (self.items_processed + self.items_failed) as f64 / self.total_items as f64
    }

    /// Fraction of handled sub-items that failed.
    pub fn percent_failed(&self) -> f64 {
        let handled = self.items_processed + self.items_failed;
        if handled == 0 {
            return 0.0;
        }
        self.items_failed as f64 / handled as f64
    }
}

// ---------------------------------------------------------------------------
// Failure type
// ---------------------------------------------------------------------------

/// How a processor-reported failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// Go straight to `Failed`, whatever the retry budget says.
    Fatal,
    /// Retry with backoff until the budget runs out.
    NonFatal,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for creating new work items. Used by enqueuing collaborators.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub(crate) work_type: String,
    pub(crate) payload: serde_json::Value,
    pub(crate) scheduled_time: Option<DateTime<Utc>>,
    pub(crate) expiration_time: Option<DateTime<Utc>>,
    pub(crate) max_retries: Option<u32>,
    pub(crate) progress: Progress,
}

impl NewWorkItem {
    pub fn new(work_type: impl Into<String>) -> Self {
        Self {
            work_type: work_type.into(),
            payload: serde_json::Value::Null,
            scheduled_time: None,
            expiration_time: None,
            max_retries: None,
            progress: Progress::default(),
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Defaults to the enqueue time.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(at);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expiration_time = Some(at);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    /// Materialize a pending item at `now`.
    pub fn into_item(self, now: DateTime<Utc>) -> WorkItem {
        WorkItem {
            id: WorkItemId::new(),
            work_type: self.work_type,
            status: Status::Pending,
            scheduled_time: self.scheduled_time.unwrap_or(now),
            expiration_time: self.expiration_time,
            payload: self.payload,
            progress: self.progress,
            retry_count: 0,
            max_retries: self.max_retries,
            claimed_by: None,
            cancel_requested: false,
            failure_description: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}
