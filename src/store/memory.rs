//! In-process queue store.
//!
//! Used by tests and single-process deployments. A single mutex guards the
//! whole table, which makes `claim_item` trivially atomic; it is never held
//! across an await point.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::{ItemFilter, QueueStore};
use crate::error::{Error, Result};
use crate::model::{Status, WorkItem, WorkItemId};

#[derive(Default)]
struct Inner {
    next_seq: u64,
    /// Insertion sequence -> item. Iteration order is insertion order.
    items: BTreeMap<u64, WorkItem>,
    index: HashMap<WorkItemId, u64>,
}

impl Inner {
    fn get_mut(&mut self, id: WorkItemId) -> Result<&mut WorkItem> {
        let seq = self
            .index
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("work item {id}")))?;
        self.items
            .get_mut(seq)
            .ok_or_else(|| Error::NotFound(format!("work item {id}")))
    }
}

/// A [`QueueStore`] kept entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Other("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn insert_item(&self, item: &WorkItem) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.index.contains_key(&item.id) {
            return Err(Error::Other(format!("duplicate work item id {}", item.id)));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.index.insert(item.id, seq);
        inner.items.insert(seq, item.clone());
        Ok(())
    }

    async fn get_item(&self, id: WorkItemId) -> Result<WorkItem> {
        let mut inner = self.lock()?;
        inner.get_mut(id).map(|item| item.clone())
    }

    async fn get_pending_items(&self, work_type: &str, max_items: usize) -> Result<Vec<WorkItem>> {
        let now = Utc::now();
        let inner = self.lock()?;
        let mut due: Vec<&WorkItem> = inner
            .items
            .values()
            .filter(|item| item.work_type == work_type && item.is_claimable_at(now))
            .collect();
        // Stable sort keeps insertion order among equal schedules.
        due.sort_by_key(|item| item.scheduled_time);
        Ok(due.into_iter().take(max_items).cloned().collect())
    }

    async fn pending_work_types(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        let inner = self.lock()?;
        let types: BTreeSet<String> = inner
            .items
            .values()
            .filter(|item| item.is_claimable_at(now))
            .map(|item| item.work_type.clone())
            .collect();
        Ok(types.into_iter().collect())
    }

    async fn claim_item(&self, item: &mut WorkItem, worker_id: &str) -> Result<bool> {
        let now = Utc::now();
        let mut inner = self.lock()?;
        let stored = inner.get_mut(item.id)?;
        // The candidate may be stale: re-check it is still due, not just pending.
        if !stored.is_claimable_at(now) {
            return Ok(false);
        }
        stored.status = Status::InProgress;
        stored.claimed_by = Some(worker_id.to_string());
        stored.updated_at = now;
        *item = stored.clone();
        Ok(true)
    }

    async fn update_item(&self, item: &WorkItem, worker_id: &str) -> Result<WorkItem> {
        let mut inner = self.lock()?;
        let stored = inner.get_mut(item.id)?;

        if stored.status != Status::InProgress || stored.claimed_by.as_deref() != Some(worker_id) {
            return Err(Error::ClaimLost(item.id));
        }
        if item.status != Status::InProgress && !stored.status.can_transition_to(item.status) {
            return Err(Error::InvalidTransition {
                from: stored.status,
                to: item.status,
            });
        }

        stored.status = item.status;
        stored.scheduled_time = item.scheduled_time;
        stored.expiration_time = item.expiration_time;
        stored.progress = item.progress.clone();
        stored.retry_count = item.retry_count;
        stored.claimed_by = item.claimed_by.clone();
        stored.failure_description = item.failure_description.clone();
        stored.updated_at = item.updated_at;
        stored.completed_at = item.completed_at;
        Ok(stored.clone())
    }

    async fn request_cancel(&self, id: WorkItemId) -> Result<WorkItem> {
        let now = Utc::now();
        let mut inner = self.lock()?;
        let stored = inner.get_mut(id)?;
        match stored.status {
            Status::Pending | Status::Postponed => {
                stored.status = Status::Canceled;
                stored.cancel_requested = true;
                stored.completed_at = Some(now);
                stored.updated_at = now;
            }
            Status::InProgress => {
                stored.cancel_requested = true;
                stored.updated_at = now;
            }
            Status::Complete | Status::Failed | Status::Canceled => {}
        }
        Ok(stored.clone())
    }

    async fn list_items(&self, filter: &ItemFilter) -> Result<Vec<WorkItem>> {
        let inner = self.lock()?;
        let mut items: Vec<WorkItem> = inner
            .items
            .values()
            .filter(|item| filter.status.is_none_or(|s| item.status == s))
            .filter(|item| {
                filter
                    .work_type
                    .as_deref()
                    .is_none_or(|t| item.work_type == t)
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| b.scheduled_time.cmp(&a.scheduled_time));
        if let Some(limit) = filter.limit {
            items.truncate(limit);
        }
        Ok(items)
    }

    async fn reset_in_progress(&self, worker_id: &str) -> Result<Vec<WorkItem>> {
        let now = Utc::now();
        let mut inner = self.lock()?;
        let mut reset = Vec::new();
        for item in inner.items.values_mut() {
            if item.status != Status::InProgress || item.claimed_by.as_deref() != Some(worker_id) {
                continue;
            }
            if item.cancel_requested {
                item.status = Status::Canceled;
                item.completed_at = Some(now);
            } else {
                item.status = Status::Pending;
            }
            item.claimed_by = None;
            item.updated_at = now;
            reset.push(item.clone());
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewWorkItem;
    use chrono::TimeDelta;

    async fn insert(store: &MemoryStore, new: NewWorkItem) -> WorkItem {
        let item = new.into_item(Utc::now());
        store.insert_item(&item).await.unwrap();
        item
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = MemoryStore::new();
        let item = insert(&store, NewWorkItem::new("t")).await;

        let mut first = item.clone();
        let mut second = item.clone();
        assert!(store.claim_item(&mut first, "w1").await.unwrap());
        assert!(!store.claim_item(&mut second, "w2").await.unwrap());
        assert_eq!(first.status, Status::InProgress);
        assert_eq!(first.claimed_by.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn claim_rejects_item_rescheduled_into_the_future() {
        let store = MemoryStore::new();
        let item = insert(&store, NewWorkItem::new("t")).await;
        let mut stale = item.clone();

        let mut other = item.clone();
        assert!(store.claim_item(&mut other, "w2").await.unwrap());
        other.status = Status::Pending;
        other.claimed_by = None;
        other.scheduled_time = Utc::now() + TimeDelta::minutes(10);
        store.update_item(&other, "w2").await.unwrap();

        assert!(!store.claim_item(&mut stale, "w1").await.unwrap());
        assert_eq!(store.get_item(item.id).await.unwrap().status, Status::Pending);
    }

    #[tokio::test]
    async fn update_requires_current_claim() {
        let store = MemoryStore::new();
        let mut item = insert(&store, NewWorkItem::new("t")).await;
        assert!(store.claim_item(&mut item, "w1").await.unwrap());

        let err = store.update_item(&item, "w2").await.unwrap_err();
        assert!(matches!(err, Error::ClaimLost(_)));

        item.progress.items_processed = 4;
        let stored = store.update_item(&item, "w1").await.unwrap();
        assert_eq!(stored.progress.items_processed, 4);
    }

    #[tokio::test]
    async fn update_keeps_external_cancel_flag() {
        let store = MemoryStore::new();
        let mut item = insert(&store, NewWorkItem::new("t")).await;
        store.claim_item(&mut item, "w1").await.unwrap();

        store.request_cancel(item.id).await.unwrap();
        // `item` is a stale copy with cancel_requested = false.
        let stored = store.update_item(&item, "w1").await.unwrap();
        assert!(stored.cancel_requested);
    }

    #[tokio::test]
    async fn cancel_of_pending_item_is_immediate() {
        let store = MemoryStore::new();
        let item = insert(&store, NewWorkItem::new("t")).await;
        let canceled = store.request_cancel(item.id).await.unwrap();
        assert_eq!(canceled.status, Status::Canceled);
        assert!(store.get_pending_items("t", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_only_touches_own_claims() {
        let store = MemoryStore::new();
        let mut mine = insert(&store, NewWorkItem::new("t")).await;
        let mut theirs = insert(&store, NewWorkItem::new("t")).await;
        store.claim_item(&mut mine, "w1").await.unwrap();
        store.claim_item(&mut theirs, "w2").await.unwrap();

        let reset = store.reset_in_progress("w1").await.unwrap();
        assert_eq!(reset.len(), 1);
        assert_eq!(reset[0].id, mine.id);
        assert_eq!(store.get_item(mine.id).await.unwrap().status, Status::Pending);
        assert_eq!(
            store.get_item(theirs.id).await.unwrap().status,
            Status::InProgress
        );
    }

    #[tokio::test]
    async fn future_items_are_not_due() {
        let store = MemoryStore::new();
        insert(
            &store,
            NewWorkItem::new("t").scheduled_at(Utc::now() + TimeDelta::minutes(5)),
        )
        .await;
        assert!(store.get_pending_items("t", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_work_types_lists_only_due_types() {
        let store = MemoryStore::new();
        insert(&store, NewWorkItem::new("b")).await;
        insert(&store, NewWorkItem::new("a")).await;
        insert(&store, NewWorkItem::new("a")).await;
        insert(
            &store,
            NewWorkItem::new("later").scheduled_at(Utc::now() + TimeDelta::minutes(5)),
        )
        .await;
        assert_eq!(
            store.pending_work_types().await.unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
