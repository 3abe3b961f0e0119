//! Producer and operator side of the queue.

use chrono::Utc;
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::info;

use super::Waker;
use crate::error::Result;
use crate::model::{NewWorkItem, WorkItem, WorkItemId};
use crate::store::{ItemFilter, QueueStore};
use crate::telemetry::metrics;

/// Submits, inspects and cancels work items. Never processes them.
#[derive(Clone)]
pub struct Queue {
    store: Arc<dyn QueueStore>,
    waker: Option<Waker>,
}

impl Queue {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store, waker: None }
    }

    /// Wake an in-process dispatcher whenever something is enqueued.
    pub fn with_waker(mut self, waker: Waker) -> Self {
        self.waker = Some(waker);
        self
    }

    /// Persist a new pending item.
    pub async fn enqueue(&self, new: NewWorkItem) -> Result<WorkItem> {
        let item = new.into_item(Utc::now());
        self.store.insert_item(&item).await?;
        metrics::queue_operations().add(1, &[KeyValue::new("operation", "enqueue")]);
        info!(
            id = %item.id,
            work_type = %item.work_type,
            scheduled_time = %item.scheduled_time,
            "work item enqueued"
        );
        if let Some(waker) = &self.waker {
            waker.wake();
        }
        Ok(item)
    }

    pub async fn get(&self, id: WorkItemId) -> Result<WorkItem> {
        self.store.get_item(id).await
    }

    pub async fn list(&self, filter: &ItemFilter) -> Result<Vec<WorkItem>> {
        self.store.list_items(filter).await
    }

    /// Request cancellation. A pending item is canceled at once; a running
    /// one sees `cancel_pending` at its next progress update.
    pub async fn cancel(&self, id: WorkItemId) -> Result<WorkItem> {
        let item = self.store.request_cancel(id).await?;
        metrics::queue_operations().add(1, &[KeyValue::new("operation", "cancel")]);
        info!(%id, status = %item.status, "cancel requested");
        Ok(item)
    }
}
