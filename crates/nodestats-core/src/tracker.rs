//! Producer-facing job and operation trackers.
//!
//! A start call parks a record in a pending table; the matching finish call
//! takes it out, completes it and appends it to the log stream. Each record
//! reaches the stream at most once. Operations are identified by
//! `(op_id, job_id)`: operation ids are reused across jobs.
//!
//! The pending table follows the stream's retention policy. A size-bounded
//! stream keeps at most `capacity` unfinished records and evicts the oldest
//! start first; a time-bounded stream lets the sweeper age them out by start
//! time; a disabled stream keeps none. Finishing an evicted record is a
//! no-op.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::log_stream::{LogStream, Reconfigured};
use crate::pending::PendingTable;
use crate::queue::{RetentionPolicy, StrategyKind};
use crate::records::{
    JobId, JobRecord, LogEntry, OperationId, OperationKey, OperationRecord, epoch_ms,
};
use crate::sweeper::Sweepable;

/// Stream name used for job records.
pub const JOBS_STREAM: &str = "jobs";
/// Stream name used for operation records.
pub const OPERATIONS_STREAM: &str = "operations";

// =============================================================================
// Shared two-phase bookkeeping
// =============================================================================

#[derive(Debug)]
struct TwoPhase<K, V> {
    log: Arc<LogStream<V>>,
    pending: PendingTable<K, V>,
    /// Bumped on every disable; a start that straddles one is withdrawn.
    epoch: AtomicU64,
    refresh: Mutex<()>,
}

impl<K: Hash + Eq + Clone, V: LogEntry> TwoPhase<K, V> {
    fn new(name: &'static str, policy: RetentionPolicy) -> Self {
        Self {
            log: Arc::new(LogStream::new(name, policy)),
            pending: PendingTable::new(),
            epoch: AtomicU64::new(0),
            refresh: Mutex::new(()),
        }
    }

    fn start(&self, key: K, record: V) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let policy = self.log.policy();
        self.admit(epoch, policy, key, record);
    }

    /// Park `record` under the policy and epoch observed by [`Self::start`].
    fn admit(&self, epoch: u64, policy: RetentionPolicy, key: K, record: V) {
        let ticket = match policy.kind() {
            StrategyKind::Disabled => return,
            StrategyKind::SizeBounded => {
                let ticket = self.pending.insert(key.clone(), record);
                self.pending.truncate_oldest(policy.capacity);
                ticket
            }
            StrategyKind::TimeBounded => self.pending.insert(key.clone(), record),
        };
        if self.epoch.load(Ordering::SeqCst) != epoch {
            // The stream was disabled after the policy check; the clear may
            // already have run.
            self.pending.withdraw(&key, ticket);
        }
    }

    fn finish(&self, key: &K, complete: impl FnOnce(&mut V)) {
        let Some(mut record) = self.pending.take(key) else {
            return;
        };
        complete(&mut record);
        self.log.append(record);
    }

    fn reconfigure(&self, policy: RetentionPolicy) -> Reconfigured {
        let _refresh = self.refresh.lock().unwrap_or_else(|e| e.into_inner());
        let outcome = self.log.reconfigure(policy);
        let stream = self.log.name();
        match policy.kind() {
            StrategyKind::Disabled => {
                self.epoch.fetch_add(1, Ordering::SeqCst);
                let cleared = self.pending.clear();
                if cleared > 0 {
                    debug!(stream, cleared, "Unfinished records dropped");
                }
            }
            StrategyKind::SizeBounded => {
                let evicted = self.pending.truncate_oldest(policy.capacity);
                if evicted > 0 {
                    debug!(stream, evicted, "Unfinished records evicted");
                }
            }
            StrategyKind::TimeBounded => {}
        }
        outcome
    }

    fn sweep(&self, now_ms: i64) -> usize {
        let mut removed = self.log.remove_expired(now_ms);
        let policy = self.log.policy();
        if policy.kind() == StrategyKind::TimeBounded {
            let expiry_ms = i64::try_from(policy.expiry.as_millis()).unwrap_or(i64::MAX);
            let cutoff = now_ms.saturating_sub(expiry_ms);
            let aged = self.pending.retain(|record| record.logged_at_ms() >= cutoff);
            if aged > 0 {
                debug!(stream = self.log.name(), aged, "Unfinished records aged out");
            }
            removed += aged;
        }
        removed
    }
}

// =============================================================================
// JobTracker
// =============================================================================

#[derive(Debug)]
pub struct JobTracker {
    inner: TwoPhase<JobId, JobRecord>,
}

impl JobTracker {
    #[must_use]
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            inner: TwoPhase::new(JOBS_STREAM, policy),
        }
    }

    /// The finished-jobs log.
    #[must_use]
    pub fn log(&self) -> &Arc<LogStream<JobRecord>> {
        &self.inner.log
    }

    /// Register a running job. Ignored while the jobs log is disabled.
    pub fn job_started(&self, id: JobId, statement: impl Into<String>, started_ms: i64) {
        self.inner
            .start(id, JobRecord::started(id, statement, started_ms));
    }

    /// Complete a running job and log it. Unknown or evicted ids are ignored.
    pub fn job_finished(&self, id: JobId, ended_ms: i64, error: Option<String>) {
        self.inner.finish(&id, |job| job.finish(ended_ms, error));
    }

    /// Jobs started but not yet finished.
    #[must_use]
    pub fn active_jobs(&self) -> Vec<JobRecord> {
        self.inner.pending.values()
    }

    /// Apply a new retention policy to the jobs log and its running jobs.
    pub fn reconfigure(&self, policy: RetentionPolicy) -> Reconfigured {
        self.inner.reconfigure(policy)
    }
}

impl Sweepable for JobTracker {
    fn name(&self) -> &str {
        JOBS_STREAM
    }

    fn sweep(&self, now_ms: i64) -> usize {
        self.inner.sweep(now_ms)
    }
}

// =============================================================================
// OperationTracker
// =============================================================================

#[derive(Debug)]
pub struct OperationTracker {
    inner: TwoPhase<OperationKey, OperationRecord>,
}

impl OperationTracker {
    #[must_use]
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            inner: TwoPhase::new(OPERATIONS_STREAM, policy),
        }
    }

    /// The finished-operations log.
    #[must_use]
    pub fn log(&self) -> &Arc<LogStream<OperationRecord>> {
        &self.inner.log
    }

    /// Register a running operation of `job_id`.
    ///
    /// Skipped while the operations log is disabled. Starting the same
    /// `(op_id, job_id)` twice replaces the first record.
    pub fn operation_started(
        &self,
        op_id: OperationId,
        job_id: JobId,
        name: impl Into<String>,
        started_ms: i64,
    ) {
        let key = OperationKey::new(op_id, job_id);
        self.inner
            .start(key, OperationRecord::started(key, name, started_ms));
    }

    /// Complete a running operation and log it, stamped with the current
    /// time. Does nothing when no matching operation is running.
    pub fn operation_finished(
        &self,
        op_id: OperationId,
        job_id: JobId,
        error: Option<String>,
        rows: Option<u64>,
    ) {
        self.operation_finished_at(op_id, job_id, epoch_ms(), error, rows);
    }

    /// [`Self::operation_finished`] with an explicit end time.
    pub fn operation_finished_at(
        &self,
        op_id: OperationId,
        job_id: JobId,
        ended_ms: i64,
        error: Option<String>,
        rows: Option<u64>,
    ) {
        let key = OperationKey::new(op_id, job_id);
        self.inner.finish(&key, |op| op.finish(ended_ms, error, rows));
    }

    /// Operations started but not yet finished.
    #[must_use]
    pub fn pending_operations(&self) -> Vec<OperationRecord> {
        self.inner.pending.values()
    }

    /// Apply a new retention policy to the operations log and its pending
    /// operations.
    pub fn reconfigure(&self, policy: RetentionPolicy) -> Reconfigured {
        self.inner.reconfigure(policy)
    }
}

impl Sweepable for OperationTracker {
    fn name(&self) -> &str {
        OPERATIONS_STREAM
    }

    fn sweep(&self, now_ms: i64) -> usize {
        self.inner.sweep(now_ms)
    }
}
