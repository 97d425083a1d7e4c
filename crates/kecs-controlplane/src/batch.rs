//! Batch Updater
//!
//! Coalesces reverse-path storage writes. Updates are keyed by
//! `(kind, ARN)` and the last one wins, so a burst of watch events for one
//! object becomes a single write. A flush runs when the pending map reaches
//! `max_batch_size` or when the oldest entry has waited `max_delay`.
//!
//! Writes never overwrite forward-owned fields: the current record is
//! re-read and only its observed half is replaced.

use crate::config::BatchConfig;
use crate::error::{StorageError, StorageResult};
use crate::storage::{get_optional, modify, Record, RecordKey, RecordStore, SharedStorage};
use crate::types::{Service, Task, TaskSet};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Metrics for the batch updater
#[derive(Clone)]
pub struct BatchMetrics {
    pub flushes: metrics::Counter,
    pub written: metrics::Counter,
    pub write_errors: metrics::Counter,
    pub dropped: metrics::Counter,
    pub batch_size: metrics::Histogram,
    pub flush_duration: metrics::Histogram,
}

impl BatchMetrics {
    pub fn new() -> Self {
        Self {
            flushes: metrics::counter!("kecs_batch_flushes_total"),
            written: metrics::counter!("kecs_batch_records_written_total"),
            write_errors: metrics::counter!("kecs_batch_write_errors_total"),
            dropped: metrics::counter!("kecs_batch_records_dropped_total"),
            batch_size: metrics::histogram!("kecs_batch_size"),
            flush_duration: metrics::histogram!("kecs_batch_flush_duration_seconds"),
        }
    }
}

impl Default for BatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Kind half of a pending key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    Service,
    Task,
    TaskSet,
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpdateKind::Service => "Service",
            UpdateKind::Task => "Task",
            UpdateKind::TaskSet => "TaskSet",
        })
    }
}

/// An observed record waiting to be written
#[derive(Debug, Clone, PartialEq)]
pub enum RecordUpdate {
    Service(Service),
    Task(Task),
    TaskSet(TaskSet),
}

impl RecordUpdate {
    pub fn kind(&self) -> UpdateKind {
        match self {
            RecordUpdate::Service(_) => UpdateKind::Service,
            RecordUpdate::Task(_) => UpdateKind::Task,
            RecordUpdate::TaskSet(_) => UpdateKind::TaskSet,
        }
    }

    pub fn arn(&self) -> &str {
        match self {
            RecordUpdate::Service(s) => &s.service_arn,
            RecordUpdate::Task(t) => &t.task_arn,
            RecordUpdate::TaskSet(ts) => &ts.task_set_arn,
        }
    }
}

/// Records whose observed half the batch updater can overlay
trait ObservedRecord: Record {
    fn absorb(&mut self, observed: &Self);
    fn differs(&self, observed: &Self) -> bool;
}

impl ObservedRecord for Service {
    fn absorb(&mut self, observed: &Self) {
        self.absorb_observed(observed)
    }

    fn differs(&self, observed: &Self) -> bool {
        self.observed_differs(observed)
    }
}

impl ObservedRecord for Task {
    fn absorb(&mut self, observed: &Self) {
        self.absorb_observed(observed)
    }

    fn differs(&self, observed: &Self) -> bool {
        self.observed_differs(observed)
    }
}

impl ObservedRecord for TaskSet {
    fn absorb(&mut self, observed: &Self) {
        self.absorb_observed(observed)
    }

    fn differs(&self, observed: &Self) -> bool {
        self.observed_differs(observed)
    }
}

/// What a single write did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOutcome {
    Created,
    Updated,
    /// The stored observed half already matched
    Unchanged,
}

/// Summary of one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub unchanged: usize,
    pub retried: usize,
    pub dropped: usize,
}

struct PendingEntry {
    update: RecordUpdate,
    /// Failed write attempts so far
    attempts: u32,
}

#[derive(Default)]
struct PendingState {
    entries: HashMap<(UpdateKind, String), PendingEntry>,
    oldest: Option<Instant>,
}

/// Coalescing writer for reverse-path updates
pub struct BatchUpdater {
    storage: SharedStorage,
    config: BatchConfig,
    pending: Mutex<PendingState>,
    notify: Notify,
    flush_lock: tokio::sync::Mutex<()>,
    metrics: BatchMetrics,
}

impl BatchUpdater {
    pub fn new(storage: SharedStorage, config: BatchConfig) -> Self {
        Self {
            storage,
            config,
            pending: Mutex::new(PendingState::default()),
            notify: Notify::new(),
            flush_lock: tokio::sync::Mutex::new(()),
            metrics: BatchMetrics::new(),
        }
    }

    /// Queue an update, replacing any pending one for the same record
    pub fn enqueue(&self, update: RecordUpdate) {
        let key = (update.kind(), update.arn().to_string());
        let (len, first) = {
            let mut pending = self.pending.lock();
            pending.entries.insert(
                key,
                PendingEntry {
                    update,
                    attempts: 0,
                },
            );
            let first = pending.oldest.is_none();
            if first {
                pending.oldest = Some(Instant::now());
            }
            (pending.entries.len(), first)
        };

        // Wake the run loop to arm the deadline, or flush early when full
        if first || len >= self.config.max_batch_size {
            self.notify.notify_one();
        }
    }

    /// Number of records waiting for the next flush
    pub fn pending_len(&self) -> usize {
        self.pending.lock().entries.len()
    }

    fn flush_due(&self) -> bool {
        let pending = self.pending.lock();
        if pending.entries.len() >= self.config.max_batch_size {
            return true;
        }
        pending
            .oldest
            .is_some_and(|oldest| oldest.elapsed() >= self.config.max_delay())
    }

    /// Flush until cancelled, then drain what is left
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            max_batch_size = self.config.max_batch_size,
            max_delay_ms = self.config.max_delay_ms,
            "Starting batch updater"
        );

        loop {
            let deadline = self
                .pending
                .lock()
                .oldest
                .map(|oldest| oldest + self.config.max_delay());

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = async {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {}
            }

            if self.flush_due() {
                self.flush().await;
            }
        }

        self.drain().await;
        info!("Batch updater stopped");
    }

    /// Flush repeatedly until nothing is pending or every entry ran out of attempts
    pub async fn drain(&self) {
        for _ in 0..=self.config.max_attempts {
            if self.pending_len() == 0 {
                return;
            }
            self.flush().await;
        }
        let left = self.pending_len();
        if left > 0 {
            warn!(pending = left, "Batch updater drained with records still pending");
        }
    }

    /// Write every pending update
    ///
    /// The pending map is swapped out first so `enqueue` never waits on
    /// storage. Concurrent flushes are serialized.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> FlushReport {
        let _guard = self.flush_lock.lock().await;

        let batch = {
            let mut pending = self.pending.lock();
            pending.oldest = None;
            std::mem::take(&mut pending.entries)
        };
        if batch.is_empty() {
            return FlushReport::default();
        }

        let started = std::time::Instant::now();
        self.metrics.flushes.increment(1);
        self.metrics.batch_size.record(batch.len() as f64);

        let mut report = FlushReport::default();
        for ((kind, arn), entry) in batch {
            match self.write(&entry.update).await {
                Ok(WriteOutcome::Unchanged) => report.unchanged += 1,
                Ok(outcome) => {
                    debug!(kind = %kind, arn = %arn, ?outcome, "Wrote observed state");
                    self.metrics.written.increment(1);
                    report.written += 1;
                }
                Err(e) => {
                    self.metrics.write_errors.increment(1);
                    let attempts = entry.attempts + 1;
                    if attempts >= self.config.max_attempts {
                        error!(
                            kind = %kind,
                            arn = %arn,
                            attempts,
                            error = %e,
                            "Dropping update after repeated write failures"
                        );
                        self.metrics.dropped.increment(1);
                        report.dropped += 1;
                    } else {
                        warn!(kind = %kind, arn = %arn, attempts, error = %e, "Write failed, will retry");
                        self.requeue((kind, arn), entry.update, attempts);
                        report.retried += 1;
                    }
                }
            }
        }

        self.metrics
            .flush_duration
            .record(started.elapsed().as_secs_f64());
        debug!(?report, "Flush complete");
        report
    }

    /// Put a failed entry back unless a newer update arrived meanwhile
    fn requeue(&self, key: (UpdateKind, String), update: RecordUpdate, attempts: u32) {
        let mut pending = self.pending.lock();
        pending
            .entries
            .entry(key)
            .or_insert(PendingEntry { update, attempts });
        if pending.oldest.is_none() {
            pending.oldest = Some(Instant::now());
        }
    }

    async fn write(&self, update: &RecordUpdate) -> StorageResult<WriteOutcome> {
        match update {
            RecordUpdate::Service(s) => write_observed(self.storage.services(), s).await,
            RecordUpdate::Task(t) => write_observed(self.storage.tasks(), t).await,
            RecordUpdate::TaskSet(ts) => write_observed(self.storage.task_sets(), ts).await,
        }
    }
}

/// Overlay the observed half onto the stored record, creating it if absent
async fn write_observed<R, S>(store: &S, observed: &R) -> StorageResult<WriteOutcome>
where
    R: ObservedRecord,
    S: RecordStore<R> + ?Sized,
{
    let key = RecordKey::arn(observed.arn());
    match get_optional(store, &key).await? {
        None => match store.create(observed.clone()).await {
            Ok(_) => return Ok(WriteOutcome::Created),
            // Created concurrently; fall through to the overlay
            Err(StorageError::Conflict { .. }) => {}
            Err(e) => return Err(e),
        },
        Some(current) if !current.differs(observed) => return Ok(WriteOutcome::Unchanged),
        Some(_) => {}
    }

    modify(store, &key, |current: &mut R| current.absorb(observed)).await?;
    Ok(WriteOutcome::Updated)
}
