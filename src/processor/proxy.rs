//! The processor's handle back to the queue.
//!
//! A proxy is bound to one claimed item. Through it the processor reads the
//! request, updates progress, observes externally requested cancel/stop, and
//! reports its single outcome. Every write goes to the store under the claim
//! owner's worker id, so a proxy whose claim was lost cannot clobber the item.

use chrono::Utc;
use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{Span, debug, error, info, warn};

use crate::error::{Error, Result};
use crate::event::{WorkEvent, WorkEventKind};
use crate::model::{FailureType, Progress, WorkItem};
use crate::policy::{self, FailureOutcome, TypeSettings};
use crate::store::QueueStore;
use crate::telemetry::metrics;
use crate::telemetry::work::record_state_transition;

/// Flags an outside actor raises on a running item. Processors only poll.
#[derive(Debug, Default)]
pub struct Signals {
    cancel: AtomicBool,
    stop: AtomicBool,
}

impl Signals {
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// The outcome a processor reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Complete,
    Canceled,
    Postponed,
    /// Failed attempt, rescheduled.
    Retry,
    /// Failed attempt, terminal.
    Failed,
}

impl Outcome {
    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Complete => "complete",
            Outcome::Canceled => "canceled",
            Outcome::Postponed => "postponed",
            Outcome::Retry => "retry",
            Outcome::Failed => "failed",
        }
    }
}

pub struct Proxy {
    item: WorkItem,
    worker_id: String,
    store: Arc<dyn QueueStore>,
    settings: TypeSettings,
    signals: Arc<Signals>,
    events: broadcast::Sender<WorkEvent>,
    outcome: Option<Outcome>,
    started: Instant,
}

impl Proxy {
    /// Bind a proxy to an item already claimed by `worker_id`.
    pub fn new(
        item: WorkItem,
        worker_id: impl Into<String>,
        store: Arc<dyn QueueStore>,
        settings: TypeSettings,
        signals: Arc<Signals>,
        events: broadcast::Sender<WorkEvent>,
    ) -> Self {
        Self {
            item,
            worker_id: worker_id.into(),
            store,
            settings,
            signals,
            events,
            outcome: None,
            started: Instant::now(),
        }
    }

    /// Read-only view of the claimed item.
    pub fn item(&self) -> &WorkItem {
        &self.item
    }

    /// Deserialize the payload into the processor's request type.
    pub fn request<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.item.payload.clone())?)
    }

    /// Progress owned by this claim. Publish changes with `update_progress`.
    pub fn progress_mut(&mut self) -> &mut Progress {
        &mut self.item.progress
    }

    /// Cancellation was requested for this item (`CancelPending`).
    pub fn cancel_pending(&self) -> bool {
        self.item.cancel_requested || self.signals.cancel_requested()
    }

    /// The host wants this item to yield (`StopPending`), e.g. on shutdown.
    pub fn stop_pending(&self) -> bool {
        self.signals.stop_requested()
    }

    /// The outcome reported so far, if any.
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    /// Honor pending cancel or stop requests at a safe point.
    ///
    /// Returns `Ok(true)` when an outcome was recorded (`Canceled` or
    /// `Postponed`) and the processor must return without further work.
    pub async fn checkpoint(&mut self) -> Result<bool> {
        if self.cancel_pending() {
            self.cancel().await?;
            return Ok(true);
        }
        if self.stop_pending() {
            self.postpone().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Persist the current progress snapshot without changing status.
    ///
    /// Also picks up a cancel request recorded in the store by another
    /// process, so `cancel_pending` reflects it afterwards.
    pub async fn update_progress(&mut self) -> Result<()> {
        self.ensure_open("update_progress")?;
        self.item.updated_at = Utc::now();
        let stored = self.store.update_item(&self.item, &self.worker_id).await?;
        if stored.cancel_requested {
            self.signals.request_cancel();
        }
        self.item.cancel_requested = stored.cancel_requested;

        debug!(
            id = %self.item.id,
            processed = self.item.progress.items_processed,
            total = self.item.progress.total_items,
            "progress updated"
        );
        self.publish(WorkEventKind::ProgressUpdated {
            progress: self.item.progress.clone(),
        });
        Ok(())
    }

    /// The work is done.
    pub async fn complete(&mut self) -> Result<()> {
        self.ensure_open("complete")?;
        let mut next = self.item.clone();
        policy::apply_complete(&mut next, Utc::now());
        let duration_ms = self.elapsed_ms();
        self.finish(next, Outcome::Complete, WorkEventKind::Completed { duration_ms })
            .await?;
        info!(id = %self.item.id, work_type = %self.item.work_type, duration_ms, "work item complete");
        Ok(())
    }

    /// Stop for good. Only valid once `cancel_pending` has been observed.
    pub async fn cancel(&mut self) -> Result<()> {
        self.ensure_open("cancel")?;
        if !self.cancel_pending() {
            return Err(Error::CancelNotRequested(self.item.id));
        }
        let mut next = self.item.clone();
        policy::apply_cancel(&mut next, Utc::now());
        self.finish(next, Outcome::Canceled, WorkEventKind::Canceled)
            .await?;
        info!(id = %self.item.id, work_type = %self.item.work_type, "work item canceled");
        Ok(())
    }

    /// Hand the item back for a later claim, after the type's postpone delay.
    pub async fn postpone(&mut self) -> Result<()> {
        self.postpone_for(self.settings.postpone_delay()).await
    }

    /// Hand the item back for a later claim, after `delay`.
    pub async fn postpone_for(&mut self, delay: Duration) -> Result<()> {
        self.ensure_open("postpone")?;
        let mut next = self.item.clone();
        let until = policy::apply_postpone(&mut next, delay, Utc::now());
        self.finish(next, Outcome::Postponed, WorkEventKind::Postponed { until })
            .await?;
        info!(id = %self.item.id, work_type = %self.item.work_type, %until, "work item postponed");
        Ok(())
    }

    /// Report a failed attempt. Non-fatal failures are retried with backoff
    /// until the type's retry budget is spent.
    pub async fn fail(&mut self, reason: impl Into<String>, failure_type: FailureType) -> Result<()> {
        self.ensure_open("fail")?;
        let reason = reason.into();
        let mut next = self.item.clone();
        let decision = policy::apply_failure(&mut next, &self.settings, &reason, failure_type, Utc::now());
        let attempt = next.retry_count;

        match decision {
            FailureOutcome::Retry { next_attempt_at } => {
                self.finish(
                    next,
                    Outcome::Retry,
                    WorkEventKind::Retrying {
                        attempt,
                        error: reason.clone(),
                        next_attempt_at,
                    },
                )
                .await?;
                metrics::work_retries()
                    .add(1, &[KeyValue::new("work_type", self.item.work_type.clone())]);
                warn!(
                    id = %self.item.id,
                    work_type = %self.item.work_type,
                    attempt,
                    %next_attempt_at,
                    error = %reason,
                    "work item failed, retry scheduled"
                );
            }
            FailureOutcome::Failed => {
                self.finish(
                    next,
                    Outcome::Failed,
                    WorkEventKind::Failed {
                        attempt,
                        error: reason.clone(),
                    },
                )
                .await?;
                error!(
                    id = %self.item.id,
                    work_type = %self.item.work_type,
                    attempt,
                    ?failure_type,
                    error = %reason,
                    "work item failed"
                );
            }
        }
        Ok(())
    }

    pub(crate) fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn ensure_open(&self, op: &str) -> Result<()> {
        match self.outcome {
            Some(outcome) => Err(Error::ProtocolViolation(format!(
                "{op} called on work item {} after outcome {outcome:?}",
                self.item.id
            ))),
            None => Ok(()),
        }
    }

    async fn finish(&mut self, next: WorkItem, outcome: Outcome, kind: WorkEventKind) -> Result<()> {
        let from = self.item.status;
        let stored = self.store.update_item(&next, &self.worker_id).await?;
        record_state_transition(&Span::current(), from, stored.status);
        self.item = stored;
        self.outcome = Some(outcome);
        self.publish(kind);
        Ok(())
    }

    fn publish(&self, kind: WorkEventKind) {
        // No subscribers is fine.
        let _ = self.events.send(WorkEvent::new(&self.item, kind));
    }
}
