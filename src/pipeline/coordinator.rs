//! Pipeline coordinator: wires admission, queue, rate limits, and health
//! into ingestion and delivery.
//!
//! Flow for one item:
//! 1. `ingest()` applies the batch's upstream signal, checks the health gate
//! 2. `admit()` computes the key, validates, and admits atomically
//! 3. `next_ready()` claims the best eligible entry and takes its rate slots;
//!    an exhausted brand or category bucket defers the entry and moves on
//! 4. the publisher delivers it, `report_outcome()` settles the entry

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::delivery::{DeliveryOutcome, FailureKind, Publisher};
use crate::error::{
    DatabaseError, DeliveryError, ErrorKind, PipelineError, QueueError, StorageFailure,
};
use crate::health::{Gate, HealthMonitor, HealthSignal};
use crate::ingest::IngestBatch;
use crate::items::{Item, RawItem, Validator, compute_key};
use crate::pipeline::status::{PipelineCounters, PipelineStatus};
use crate::pipeline::types::{Dispatch, DispatchResult, Halt, IngestReport, ReadyItem};
use crate::queue::{Admission, DedupGate, EntryId, PublishQueue, QueueEntry};
use crate::ratelimit::{GLOBAL_BUCKET, RateDecision, RateLimiter, RateStore};
use crate::store::{PruneReport, Store};
use crate::telemetry;

/// Health transitions included in a status snapshot.
const STATUS_EVENTS: usize = 10;

/// Reason recorded when a claimed entry is put back because of a pause.
const PAUSED: &str = "paused";

/// Reason recorded when a claimed entry is put back because a brand or
/// category bucket is exhausted.
const RATE_LIMITED: &str = "rate limited";

/// Shortest deferral for a rate-limited entry, so a zero hint cannot make
/// the same entry eligible again within one `next_ready` call.
const MIN_RATE_DEFERRAL: Duration = Duration::from_millis(100);

/// Outcome of taking the rate slots for one claimed entry.
enum Slots {
    Granted,
    /// The entry was put back for later; try the next candidate.
    Deferred,
    /// Shutdown began while waiting; the entry is left for reconciliation.
    Closed,
}

pub struct Pipeline {
    pub(crate) config: PipelineConfig,
    store: Arc<dyn Store>,
    validator: Validator,
    gate: DedupGate,
    queue: PublishQueue,
    limiter: RateLimiter,
    health: HealthMonitor,
    publisher: Arc<dyn Publisher>,
    pub(crate) counters: PipelineCounters,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn Store>,
        rate_store: Arc<dyn RateStore>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            validator: Validator::new(config.validation.clone()),
            gate: DedupGate::new(Arc::clone(&store)),
            queue: PublishQueue::new(Arc::clone(&store), config.queue.clone(), shutdown.clone()),
            limiter: RateLimiter::new(rate_store, config.rate.clone()),
            health: HealthMonitor::new(Arc::clone(&store), config.health.clone()),
            store,
            publisher,
            counters: PipelineCounters::default(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn queue(&self) -> &PublishQueue {
        &self.queue
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn dedup(&self) -> &DedupGate {
        &self.gate
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // ── Ingestion ───────────────────────────────────────────────────

    /// Admit a batch of candidates. Never fails as a whole: every item is
    /// tallied, and a pause or shutdown stops the batch with `halted` set.
    pub async fn ingest(&self, batch: IngestBatch) -> IngestReport {
        let mut report = IngestReport::new(&batch.source, batch.items.len());
        self.counters.batch(&batch.source);

        if self.is_shutting_down() {
            report.halted = Some(Halt::ShuttingDown);
            return report;
        }

        if let Err(e) = self.health.record(batch.signal.to_health_signal()).await {
            self.note_error(&PipelineError::from_database("record_health", e));
        }

        match self.health.check().await {
            Ok(Gate::Paused { until }) => {
                info!(source = %batch.source, until = %until, "Paused, batch not ingested");
                report.halted = Some(Halt::Paused { until });
                return report;
            }
            Ok(Gate::Open { .. }) => {}
            Err(e) => {
                self.note_error(&PipelineError::from_database("health_check", e));
                report.failed = batch.items.len();
                return report;
            }
        }

        for raw in batch.items {
            if self.is_shutting_down() {
                report.halted = Some(Halt::ShuttingDown);
                break;
            }
            match self.admit(raw).await {
                Ok(_) => report.admitted += 1,
                Err(PipelineError::Duplicate { .. }) => report.duplicates += 1,
                Err(PipelineError::ValidationFailed { .. }) => report.rejected += 1,
                Err(PipelineError::QueueFull { .. }) => report.backpressured += 1,
                Err(PipelineError::ShuttingDown) => {
                    report.halted = Some(Halt::ShuttingDown);
                    break;
                }
                Err(_) => report.failed += 1,
            }
        }

        telemetry::items_ingested("admitted", report.admitted);
        telemetry::items_ingested("duplicate", report.duplicates);
        telemetry::items_ingested("rejected", report.rejected);
        telemetry::items_ingested("backpressured", report.backpressured);
        telemetry::items_ingested("failed", report.failed);
        info!(
            source = %report.source,
            received = report.received,
            admitted = report.admitted,
            duplicates = report.duplicates,
            rejected = report.rejected,
            backpressured = report.backpressured,
            failed = report.failed,
            "Batch ingested"
        );
        report
    }

    /// Key, validate, and atomically admit one candidate.
    pub async fn admit(&self, raw: RawItem) -> Result<EntryId, PipelineError> {
        let result = self.admit_inner(raw).await;
        match &result {
            Ok(_) => self.counters.admitted(),
            Err(e) => self.note_error(e),
        }
        result
    }

    async fn admit_inner(&self, raw: RawItem) -> Result<EntryId, PipelineError> {
        if self.is_shutting_down() {
            return Err(PipelineError::ShuttingDown);
        }

        let key = compute_key(&raw);
        if let Err(reason) = self.validator.validate(&raw) {
            debug!(key = %key, reason = %reason, "Item failed validation");
            return Err(PipelineError::ValidationFailed {
                key: key.to_string(),
                reason,
            });
        }

        let now = Utc::now();
        let placement = self
            .queue
            .placement(raw.priority, raw.not_before.unwrap_or(now), 0);
        let item = Item::from_raw(key, raw, now);

        let admission = self
            .retry_transient("try_admit", || self.gate.try_admit(&item, &placement))
            .await?;
        match admission {
            Admission::Admitted { entry_id, .. } => Ok(entry_id),
            Admission::Duplicate => Err(PipelineError::Duplicate {
                key: item.key.to_string(),
            }),
            Admission::QueueFull => Err(PipelineError::QueueFull {
                capacity: placement.capacity,
            }),
        }
    }

    /// Run `op`, retrying transient store errors with capped exponential
    /// backoff. Shutdown interrupts the wait.
    async fn retry_transient<T, E, F, Fut>(
        &self,
        operation: &str,
        mut op: F,
    ) -> Result<T, PipelineError>
    where
        E: StorageFailure,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let retry = &self.config.retry;
        let mut backoff = ExponentialBackoff {
            current_interval: retry.initial_interval,
            initial_interval: retry.initial_interval,
            max_interval: retry.max_interval,
            multiplier: 2.0,
            max_elapsed_time: Some(retry.max_elapsed),
            ..Default::default()
        };

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    let Some(delay) = backoff.next_backoff() else {
                        return Err(e.into_pipeline(operation));
                    };
                    warn!(operation, error = %e, delay_ms = delay.as_millis() as u64, "Transient store error, retrying");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(PipelineError::ShuttingDown),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e.into_pipeline(operation)),
            }
        }
    }

    // ── Delivery ────────────────────────────────────────────────────

    /// Claim the next deliverable item, holding every rate slot it needs.
    ///
    /// A candidate whose brand or category bucket is exhausted is put back,
    /// scheduled for when a slot frees up, and the next candidate is tried.
    /// A pause noticed after the claim puts the entry back, scheduled for
    /// the end of the pause.
    pub async fn next_ready(&self) -> Result<Dispatch, PipelineError> {
        loop {
            if self.is_shutting_down() {
                return Ok(Dispatch::Closed);
            }
            if let Gate::Paused { until } = self.gate_check().await? {
                return Ok(Dispatch::Paused { until });
            }

            let entry = match self.queue.dequeue().await {
                Ok(Some(entry)) => entry,
                Ok(None) => return Ok(Dispatch::Idle),
                Err(QueueError::Closed) => return Ok(Dispatch::Closed),
                Err(e) => return Err(PipelineError::from_queue("dequeue", e)),
            };

            let item = match self.store.get_item(&entry.item_key).await {
                Ok(Some(item)) => item,
                Ok(None) => {
                    self.settle(&entry, "item missing", None).await?;
                    return Err(PipelineError::Fatal {
                        operation: "load_item".into(),
                        reason: format!("no item stored for {}", entry.item_key),
                    });
                }
                Err(e) => {
                    let at = Utc::now() + self.retry_delay(&entry, None);
                    self.settle(&entry, "item unavailable", Some((at, entry.attempt + 1)))
                        .await?;
                    return Err(PipelineError::from_database("load_item", e));
                }
            };

            match self.take_slots(&entry, &item).await? {
                Slots::Granted => {}
                Slots::Deferred => continue,
                Slots::Closed => return Ok(Dispatch::Closed),
            }

            if let Gate::Paused { until } = self.gate_check().await? {
                // No delivery was attempted, so the follow-up keeps the attempt number.
                self.settle(&entry, PAUSED, Some((until, entry.attempt)))
                    .await?;
                return Ok(Dispatch::Paused { until });
            }

            return Ok(Dispatch::Ready(ReadyItem { entry, item }));
        }
    }

    /// Scoped buckets are only tried, never waited on, so one exhausted brand
    /// or category cannot hold a worker. The global bucket is waited on last.
    async fn take_slots(&self, entry: &QueueEntry, item: &Item) -> Result<Slots, PipelineError> {
        for bucket in self.limiter.buckets_for(item) {
            if bucket == GLOBAL_BUCKET {
                continue;
            }
            match self.limiter.try_acquire(&bucket).await {
                Ok(RateDecision::Granted) => {}
                Ok(RateDecision::Denied { retry_after }) => {
                    debug!(
                        key = %entry.item_key,
                        bucket = %bucket,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "Bucket exhausted, deferring entry"
                    );
                    telemetry::rate_deferred(&bucket);
                    let wait = chrono::Duration::from_std(retry_after.max(MIN_RATE_DEFERRAL))
                        .unwrap_or(chrono::Duration::zero());
                    // Not a delivery attempt, so the follow-up keeps the attempt number.
                    self.settle(entry, RATE_LIMITED, Some((Utc::now() + wait, entry.attempt)))
                        .await?;
                    if self.queue.is_closed() {
                        return Ok(Slots::Closed);
                    }
                    return Ok(Slots::Deferred);
                }
                Err(e) => return self.rate_store_failed(entry, e).await,
            }
        }

        match self.limiter.acquire(GLOBAL_BUCKET, &self.shutdown).await {
            Ok(true) => Ok(Slots::Granted),
            // Left in flight; the next start reconciles it.
            Ok(false) => Ok(Slots::Closed),
            Err(e) => self.rate_store_failed(entry, e).await,
        }
    }

    async fn rate_store_failed(
        &self,
        entry: &QueueEntry,
        e: DatabaseError,
    ) -> Result<Slots, PipelineError> {
        let at = Utc::now() + self.retry_delay(entry, None);
        self.settle(entry, "rate store unavailable", Some((at, entry.attempt + 1)))
            .await?;
        Err(PipelineError::from_database("rate_acquire", e))
    }

    /// Settle a claimed entry. Returns the follow-up entry, if one was
    /// scheduled.
    pub async fn report_outcome(
        &self,
        entry_id: EntryId,
        outcome: DeliveryOutcome,
    ) -> Result<Option<EntryId>, PipelineError> {
        let entry = self
            .queue
            .get(entry_id)
            .await
            .map_err(|e| PipelineError::from_queue("report_outcome", e))?
            .ok_or_else(|| PipelineError::Fatal {
                operation: "report_outcome".into(),
                reason: format!("unknown entry {entry_id}"),
            })?;

        let (kind, reason, retry_after) = match outcome {
            DeliveryOutcome::Delivered => {
                self.queue
                    .mark_done(entry_id)
                    .await
                    .map_err(|e| PipelineError::from_queue("mark_done", e))?;
                self.counters.delivered();
                info!(key = %entry.item_key, entry_id = %entry_id, "Item delivered");
                self.record_health(HealthSignal::Success).await?;
                return Ok(None);
            }
            DeliveryOutcome::Failed {
                kind,
                reason,
                retry_after,
            } => (kind, reason, retry_after),
        };

        self.counters.delivery_failed(kind);
        warn!(
            key = %entry.item_key,
            entry_id = %entry_id,
            attempt = entry.attempt,
            kind = ?kind,
            reason = %reason,
            "Delivery failed"
        );

        match kind {
            FailureKind::Rejected => {
                self.counters.error(ErrorKind::Fatal);
                self.settle(&entry, &reason, None).await
            }
            FailureKind::Transient => {
                self.counters.error(ErrorKind::Transient);
                let at = Utc::now() + self.retry_delay(&entry, retry_after);
                let follow_up = self
                    .settle(&entry, &reason, Some((at, entry.attempt + 1)))
                    .await?;
                self.record_health(HealthSignal::AmbiguousFailure).await?;
                Ok(follow_up)
            }
            FailureKind::Blocked => {
                self.counters.error(ErrorKind::Blocked);
                // The entry is settled even if the pause could not be recorded.
                let recorded = self
                    .record_health(HealthSignal::Blocked {
                        reason: reason.clone(),
                    })
                    .await;
                let until = self.pause_end().await;
                let follow_up = self
                    .settle(&entry, &reason, Some((until, entry.attempt + 1)))
                    .await?;
                recorded?;
                Ok(follow_up)
            }
        }
    }

    /// Claim, publish (bounded by the delivery timeout), and settle one item.
    pub async fn dispatch_once(&self) -> Result<DispatchResult, PipelineError> {
        let ready = match self.next_ready().await? {
            Dispatch::Ready(ready) => ready,
            Dispatch::Idle => return Ok(DispatchResult::Idle),
            Dispatch::Paused { until } => return Ok(DispatchResult::Paused { until }),
            Dispatch::Closed => return Ok(DispatchResult::Closed),
        };

        let timeout = self.config.delivery_timeout;
        let started = Instant::now();
        let outcome =
            match tokio::time::timeout(timeout, self.publisher.publish(&ready.item)).await {
                Ok(result) => DeliveryOutcome::from(result),
                Err(_) => DeliveryOutcome::from(Err(DeliveryError::Timeout {
                    publisher: self.publisher.name().to_string(),
                    timeout,
                })),
            };
        telemetry::publish_duration(started.elapsed().as_secs_f64());

        let entry_id = ready.entry.id;
        let result = match &outcome {
            DeliveryOutcome::Delivered => DispatchResult::Delivered { entry_id },
            DeliveryOutcome::Failed { kind, .. } => DispatchResult::Failed {
                entry_id,
                kind: *kind,
            },
        };
        self.report_outcome(entry_id, outcome).await?;
        Ok(result)
    }

    // ── Maintenance & status ────────────────────────────────────────

    /// Claim an expired pause and forget dedup records past retention.
    pub async fn run_maintenance(&self) -> Result<PruneReport, PipelineError> {
        self.health
            .try_unpause()
            .await
            .map_err(|e| PipelineError::from_database("try_unpause", e))?;

        let retention = chrono::Duration::from_std(self.config.retention).ok();
        let Some(cutoff) = retention.and_then(|r| Utc::now().checked_sub_signed(r)) else {
            return Ok(PruneReport::default());
        };
        let report = self
            .retry_transient("prune", || self.gate.prune(cutoff))
            .await?;
        if report != PruneReport::default() {
            info!(
                dedup_records = report.dedup_records,
                items = report.items,
                entries = report.entries,
                "Pruned records past retention"
            );
        }
        Ok(report)
    }

    pub async fn status(&self) -> Result<PipelineStatus, PipelineError> {
        let db = |op: &'static str| move |e: DatabaseError| PipelineError::from_database(op, e);
        let queue = self
            .queue
            .stats()
            .await
            .map_err(|e| PipelineError::from_queue("queue_stats", e))?;
        let health = self.health.snapshot().await.map_err(db("load_health"))?;
        let last_health_events = self
            .health
            .recent_events(STATUS_EVENTS)
            .await
            .map_err(db("health_events"))?;
        let dedup_records = self.gate.count().await.map_err(db("count_dedup"))?;
        telemetry::queue_depth(&queue);
        telemetry::health_mode(health.mode);

        let shutting_down = self.is_shutting_down();
        Ok(PipelineStatus {
            accepting: !shutting_down && !health.is_paused(),
            shutting_down,
            queue,
            dedup_records,
            health,
            counters: self.counters.snapshot(),
            errors_total: self.counters.error_counts(),
            last_health_events,
        })
    }

    // ── Helpers ─────────────────────────────────────────────────────

    pub(crate) fn note_error(&self, e: &PipelineError) {
        self.counters.error(e.kind());
        match e.kind() {
            ErrorKind::Fatal => error!(error = %e, "Pipeline operation failed"),
            ErrorKind::Transient | ErrorKind::Blocked => warn!(error = %e, "Pipeline operation failed"),
            ErrorKind::Duplicate | ErrorKind::ValidationFailed => {}
        }
    }

    async fn gate_check(&self) -> Result<Gate, PipelineError> {
        self.health
            .check()
            .await
            .map_err(|e| PipelineError::from_database("health_check", e))
    }

    async fn record_health(&self, signal: HealthSignal) -> Result<(), PipelineError> {
        self.health
            .record(signal)
            .await
            .map(|_| ())
            .map_err(|e| PipelineError::from_database("record_health", e))
    }

    /// When the current pause ends, or the shortest pause from now if the
    /// pipeline is not paused or its state cannot be read.
    async fn pause_end(&self) -> DateTime<Utc> {
        let shortest = Utc::now()
            + chrono::Duration::from_std(self.config.health.min_pause)
                .unwrap_or(chrono::Duration::zero());
        match self.health.snapshot().await {
            Ok(state) => state.paused_until.unwrap_or(shortest),
            Err(e) => {
                warn!(error = %e, "Health state unavailable, assuming the shortest pause");
                shortest
            }
        }
    }

    fn retry_delay(&self, entry: &QueueEntry, hint: Option<Duration>) -> chrono::Duration {
        let delay = self
            .queue
            .config()
            .retry_delay(entry.attempt)
            .max(hint.unwrap_or_default());
        chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero())
    }

    /// Move a claimed entry to error and, if `retry` is given and attempts
    /// remain, schedule a follow-up `(at, attempt)`. Both writes are retried
    /// on transient store errors.
    ///
    /// Once the queue is closed a retryable entry is left in flight untouched,
    /// so the next start reconciles it instead of losing it.
    async fn settle(
        &self,
        entry: &QueueEntry,
        reason: &str,
        retry: Option<(DateTime<Utc>, u32)>,
    ) -> Result<Option<EntryId>, PipelineError> {
        if retry.is_some() && self.queue.is_closed() {
            info!(entry_id = %entry.id, "Queue closed, leaving entry for startup reconciliation");
            return Ok(None);
        }

        self.retry_transient("mark_error", || self.queue.mark_error(entry.id, reason))
            .await?;

        let Some((at, attempt)) = retry else {
            return Ok(None);
        };
        if attempt >= self.queue.config().max_attempts {
            warn!(key = %entry.item_key, attempts = attempt, "Giving up on item");
            return Ok(None);
        }

        let scheduled = self
            .retry_transient("enqueue", || {
                self.queue
                    .enqueue(&entry.item_key, entry.priority, at, attempt)
            })
            .await;
        match scheduled {
            Ok(outcome) => {
                if outcome.entry_id().is_none() {
                    warn!(key = %entry.item_key, outcome = ?outcome, "Could not schedule follow-up");
                }
                Ok(outcome.entry_id())
            }
            Err(PipelineError::ShuttingDown) => {
                warn!(
                    key = %entry.item_key,
                    entry_id = %entry.id,
                    attempt,
                    "Queue closed before the follow-up was scheduled"
                );
                Ok(None)
            }
            Err(e) => {
                error!(
                    key = %entry.item_key,
                    entry_id = %entry.id,
                    attempt,
                    error = %e,
                    "Follow-up entry could not be scheduled"
                );
                Err(e)
            }
        }
    }

    pub(crate) fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }
}
