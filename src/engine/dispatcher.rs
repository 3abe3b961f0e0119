//! Dispatcher: polls for due work, claims it, runs processors on a bounded
//! worker pool and settles whatever outcome they report.

use opentelemetry::KeyValue;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, broadcast};
use tokio::task::JoinError;
use tracing::{Instrument, debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::event::{WorkEvent, WorkEventKind};
use crate::model::{FailureType, Status, WorkItem, WorkItemId};
use crate::processor::{ItemProcessor, Outcome, ProcessorRegistry, Proxy, Signals};
use crate::store::QueueStore;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_work_span};

const EVENT_CAPACITY: usize = 256;

/// Wakes a dispatcher out of its poll sleep. Cheap to clone.
#[derive(Clone, Default)]
pub struct Waker(Arc<Notify>);

impl Waker {
    pub fn wake(&self) {
        self.0.notify_one();
    }
}

/// The dispatch loop. Clones share all state, so a clone can be moved into
/// the task that calls [`run`](Self::run) while the caller keeps a handle
/// for `cancel` and `shutdown`.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn QueueStore>,
    registry: Arc<ProcessorRegistry>,
    config: Arc<QueueConfig>,
    worker_id: String,
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
    waker: Waker,
    permits: Arc<Semaphore>,
    pool_size: u32,
    running: Arc<Mutex<HashMap<WorkItemId, Arc<Signals>>>>,
    events: broadcast::Sender<WorkEvent>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn QueueStore>,
        registry: ProcessorRegistry,
        config: QueueConfig,
        worker_id: impl Into<String>,
    ) -> Result<Self> {
        let max_concurrent = config.dispatcher.max_concurrent.max(1);
        let pool_size = u32::try_from(max_concurrent)
            .ok()
            .filter(|&n| n as usize <= Semaphore::MAX_PERMITS)
            .ok_or_else(|| Error::Config(format!("max_concurrent {max_concurrent} is too large")))?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            store,
            registry: Arc::new(registry),
            config: Arc::new(config),
            worker_id: worker_id.into(),
            shutdown: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
            waker: Waker::default(),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            pool_size,
            running: Arc::new(Mutex::new(HashMap::new())),
            events,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Observe status and progress events for every item this dispatcher runs.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkEvent> {
        self.events.subscribe()
    }

    /// Handle for producers (and the Postgres listener) to cut the poll
    /// sleep short.
    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    pub fn wake(&self) {
        self.waker.wake();
    }

    /// Number of items currently being processed.
    pub fn running_count(&self) -> usize {
        self.running_map().len()
    }

    /// Ask the loop to stop. Running items get `StopPending`; [`run`](Self::run)
    /// returns once they have drained or the shutdown grace has elapsed.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Request cancellation of `id`. Recorded in the store, and signalled
    /// directly if the item is running here.
    pub async fn cancel(&self, id: WorkItemId) -> Result<WorkItem> {
        let item = self.store.request_cancel(id).await?;
        metrics::queue_operations().add(1, &[KeyValue::new("operation", "cancel")]);
        if let Some(signals) = self.running_map().get(&id) {
            signals.request_cancel();
        }
        info!(%id, status = %item.status, "cancel requested");
        Ok(item)
    }

    /// Run until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<()> {
        self.recover().await?;
        info!(
            worker_id = %self.worker_id,
            max_concurrent = self.pool_size,
            "dispatcher started"
        );

        let poll_interval = self.config.dispatcher.poll_interval();
        while !self.stopping.load(Ordering::SeqCst) {
            if let Err(e) = self.poll_once().await {
                error!(error = %e, "poll failed, retrying next interval");
            }

            tokio::select! {
                _ = self.shutdown.notified() => {}
                _ = self.waker.0.notified() => {
                    debug!("woken");
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        info!("dispatcher shutting down");
        self.drain().await;
        Ok(())
    }

    /// One poll cycle: claim as many due items as there are free workers and
    /// hand each to a processor task. Returns the number dispatched.
    pub async fn poll_once(&self) -> Result<usize> {
        let mut dispatched = 0;
        let work_types = self.store.pending_work_types().await?;

        for work_type in work_types {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            let free = self.permits.available_permits();
            if free == 0 {
                break;
            }
            let max_items = free.min(self.config.dispatcher.batch_size.max(1));
            let candidates = self.store.get_pending_items(&work_type, max_items).await?;
            metrics::queue_operations().add(1, &[KeyValue::new("operation", "poll")]);

            for mut item in candidates {
                let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                    return Ok(dispatched);
                };
                metrics::queue_operations().add(1, &[KeyValue::new("operation", "claim")]);
                if !self.store.claim_item(&mut item, &self.worker_id).await? {
                    debug!(id = %item.id, work_type = %item.work_type, "claim lost");
                    metrics::work_claim_lost()
                        .add(1, &[KeyValue::new("work_type", item.work_type.clone())]);
                    continue;
                }
                self.dispatch(item, permit);
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Put back items this worker id left in progress, e.g. after a crash.
    async fn recover(&self) -> Result<()> {
        let reset = self.store.reset_in_progress(&self.worker_id).await?;
        for item in &reset {
            info!(id = %item.id, work_type = %item.work_type, status = %item.status, "reset orphaned work item");
            self.publish(item, WorkEventKind::Reset);
        }
        if !reset.is_empty() {
            warn!(count = reset.len(), "recovered work items from a previous run");
        }
        Ok(())
    }

    fn dispatch(&self, item: WorkItem, permit: OwnedSemaphorePermit) {
        let span = start_work_span(&item.work_type, item.id, item.retry_count + 1);
        record_state_transition(&span, Status::Pending, Status::InProgress);
        metrics::work_claimed().add(1, &[KeyValue::new("work_type", item.work_type.clone())]);
        self.publish(
            &item,
            WorkEventKind::Claimed {
                worker_id: self.worker_id.clone(),
            },
        );

        let this = self.clone();
        tokio::spawn(
            async move {
                this.execute(item).await;
                drop(permit);
                // A worker just freed up.
                this.waker.wake();
            }
            .instrument(span),
        );
    }

    async fn execute(&self, item: WorkItem) {
        let id = item.id;
        let work_type = item.work_type.clone();
        let started = Instant::now();
        let signals = Arc::new(Signals::default());
        // Register before checking `stopping`, so a concurrent drain either
        // sees this entry or we see its flag.
        self.running_map().insert(id, Arc::clone(&signals));
        if self.stopping.load(Ordering::SeqCst) {
            signals.request_stop();
        }

        let proxy = self.proxy(item.clone(), Arc::clone(&signals));
        let outcome = match self.registry.resolve(&item) {
            Ok(processor) => self.run_processor(processor, proxy, &signals).await,
            Err(e) => self.reject(proxy, e).await,
        };

        self.running_map().remove(&id);
        if let Some(outcome) = outcome {
            debug!(%id, outcome = outcome.as_str(), "work item settled");
            metrics::work_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[
                    KeyValue::new("work_type", work_type),
                    KeyValue::new("outcome", outcome.as_str()),
                ],
            );
        }
    }

    /// No processor for this item: fail it without retry.
    async fn reject(&self, mut proxy: Proxy, e: Error) -> Option<Outcome> {
        let work_type = proxy.item().work_type.clone();
        if matches!(e, Error::UnknownItemType(_)) {
            metrics::work_unroutable().add(1, &[KeyValue::new("work_type", work_type.clone())]);
        }
        error!(id = %proxy.item().id, %work_type, error = %e, "cannot create processor");
        self.fail(&mut proxy, e.to_string(), FailureType::Fatal).await
    }

    async fn run_processor(
        &self,
        mut processor: Box<dyn ItemProcessor>,
        mut proxy: Proxy,
        signals: &Arc<Signals>,
    ) -> Option<Outcome> {
        let id = proxy.item().id;
        let mut handle = tokio::spawn(
            async move {
                let result = processor.process(&mut proxy).await;
                (proxy, result)
            }
            .in_current_span(),
        );

        let joined = match self.config.dispatcher.processing_timeout() {
            None => (&mut handle).await,
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(%id, timeout_secs = limit.as_secs(), "processing timeout, requesting stop");
                    signals.request_stop();
                    let grace = self.config.dispatcher.stop_grace();
                    match tokio::time::timeout(grace, &mut handle).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            handle.abort();
                            // Wait for the abort to land so no late write races the failure.
                            let _ = (&mut handle).await;
                            error!(%id, "processor ignored stop request, abandoning");
                            return self.fail_detached(id, signals, "processing timed out").await;
                        }
                    }
                }
            },
        };

        match joined {
            Ok((proxy, result)) => self.settle(proxy, result).await,
            Err(e) => {
                let reason = panic_reason(e);
                error!(%id, error = %reason, "processor panicked");
                self.fail_detached(id, signals, &reason).await
            }
        }
    }

    /// Map what `process()` returned onto the item.
    async fn settle(&self, mut proxy: Proxy, result: Result<()>) -> Option<Outcome> {
        let id = proxy.item().id;
        match (proxy.outcome(), result) {
            (Some(outcome), Ok(())) => Some(outcome),
            (Some(outcome), Err(e)) => {
                warn!(%id, error = %e, outcome = outcome.as_str(), "processor errored after reporting an outcome");
                Some(outcome)
            }
            (None, Err(Error::ClaimLost(_))) => {
                warn!(%id, "claim lost while processing, dropping result");
                None
            }
            (None, Err(e)) => {
                warn!(%id, error = %e, "processor failed");
                self.fail(&mut proxy, e.to_string(), FailureType::NonFatal).await
            }
            (None, Ok(())) => {
                error!(%id, "processor returned without reporting an outcome");
                let reason = Error::ProtocolViolation(
                    "processor returned without reporting an outcome".to_string(),
                );
                self.fail(&mut proxy, reason.to_string(), FailureType::NonFatal).await
            }
        }
    }

    /// Failure path for an item whose proxy was lost with its task.
    async fn fail_detached(&self, id: WorkItemId, signals: &Arc<Signals>, reason: &str) -> Option<Outcome> {
        let item = match self.store.get_item(id).await {
            Ok(item) => item,
            Err(e) => {
                error!(%id, error = %e, "cannot reload work item");
                return None;
            }
        };
        if item.status != Status::InProgress || item.claimed_by.as_deref() != Some(self.worker_id.as_str()) {
            // The task settled the item before it went away.
            return None;
        }
        let mut proxy = self.proxy(item, Arc::clone(signals));
        self.fail(&mut proxy, reason.to_string(), FailureType::NonFatal).await
    }

    async fn fail(&self, proxy: &mut Proxy, reason: String, failure_type: FailureType) -> Option<Outcome> {
        match proxy.fail(reason, failure_type).await {
            Ok(()) => proxy.outcome(),
            Err(e) => {
                error!(id = %proxy.item().id, error = %e, "cannot record failure");
                None
            }
        }
    }

    fn proxy(&self, item: WorkItem, signals: Arc<Signals>) -> Proxy {
        let settings = self.config.settings_for(&item.work_type).clone();
        Proxy::new(
            item,
            self.worker_id.as_str(),
            Arc::clone(&self.store),
            settings,
            signals,
            self.events.clone(),
        )
    }

    /// Raise `StopPending` on everything running and wait for the pool to
    /// empty, bounded by the shutdown grace.
    async fn drain(&self) {
        let running: Vec<Arc<Signals>> = self.running_map().values().cloned().collect();
        for signals in &running {
            signals.request_stop();
        }
        if self.permits.available_permits() == self.pool_size as usize {
            return;
        }

        let grace = self.config.dispatcher.shutdown_grace();
        info!(count = running.len(), grace_secs = grace.as_secs(), "waiting for running items to stop");
        match tokio::time::timeout(grace, self.permits.acquire_many(self.pool_size)).await {
            Ok(Ok(_all)) => info!("all running items stopped"),
            Ok(Err(_)) => {}
            Err(_) => warn!(
                remaining = self.running_count(),
                "shutdown grace elapsed with items still running"
            ),
        }
    }

    fn running_map(&self) -> std::sync::MutexGuard<'_, HashMap<WorkItemId, Arc<Signals>>> {
        // The map holds no invariants a panicking holder could break.
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, item: &WorkItem, kind: WorkEventKind) {
        let _ = self.events.send(WorkEvent::new(item, kind));
    }
}

fn panic_reason(e: JoinError) -> String {
    if !e.is_panic() {
        return format!("processor task ended: {e}");
    }
    let payload: Box<dyn Any + Send> = e.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("processor panicked: {message}")
}
