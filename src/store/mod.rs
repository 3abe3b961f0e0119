//! The queue store: the narrow broker interface the dispatcher consumes.
//!
//! A store owns persistence and is the sole arbiter of claims. The core
//! never assumes a claim succeeds after a read; it always goes through
//! [`QueueStore::claim_item`], which must be atomic.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Status, WorkItem, WorkItemId};

/// Filters for operator listings.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub status: Option<Status>,
    pub work_type: Option<String>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persist a freshly created item.
    async fn insert_item(&self, item: &WorkItem) -> Result<()>;

    /// Fetch a snapshot of one item.
    async fn get_item(&self, id: WorkItemId) -> Result<WorkItem>;

    /// Pending, due (`scheduled_time <= now`) and unexpired items of
    /// `work_type`, ascending by `scheduled_time`, ties in insertion order,
    /// at most `max_items`.
    async fn get_pending_items(&self, work_type: &str, max_items: usize) -> Result<Vec<WorkItem>>;

    /// Distinct work types that currently have claimable items, sorted.
    async fn pending_work_types(&self) -> Result<Vec<String>>;

    /// Atomically move `item` from pending to in-progress under `worker_id`.
    ///
    /// Returns `false` if the item is no longer pending (lost race). On
    /// success `item` is refreshed with the claimed state.
    async fn claim_item(&self, item: &mut WorkItem, worker_id: &str) -> Result<bool>;

    /// Persist status and progress written by the claim holder `worker_id`.
    ///
    /// Fails with [`Error::ClaimLost`](crate::error::Error::ClaimLost) if the
    /// stored item is not in progress under that worker. The externally owned
    /// `cancel_requested` flag is never overwritten. Returns the stored item
    /// after the update.
    async fn update_item(&self, item: &WorkItem, worker_id: &str) -> Result<WorkItem>;

    /// Request cancellation. Pending items are canceled outright; in-progress
    /// items get `cancel_requested` set for their processor to observe;
    /// terminal items are returned unchanged.
    async fn request_cancel(&self, id: WorkItemId) -> Result<WorkItem>;

    /// Operator listing, newest schedule first.
    async fn list_items(&self, filter: &ItemFilter) -> Result<Vec<WorkItem>>;

    /// Return items left in progress by `worker_id` (e.g. after a crash) to
    /// pending, or to canceled if a cancel was requested meanwhile.
    async fn reset_in_progress(&self, worker_id: &str) -> Result<Vec<WorkItem>>;
}
