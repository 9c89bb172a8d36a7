//! A live-reconfigurable retention log for one record type.
//!
//! Producers append through a shared handle to the current
//! [`QueueStrategy`]. The settings-refresh path replaces that handle with a
//! new strategy; readers and producers only ever see a whole instance.
//!
//! # Concurrency
//!
//! - `current` is an `RwLock<Arc<_>>`: readers clone the `Arc` and drop the
//!   lock before touching the strategy, so the lock is held only for a
//!   pointer copy.
//! - Reconfiguration is serialized by `refresh`. The retiring strategy stays
//!   locked until its successor is published, and refuses appends afterwards;
//!   a producer that raced the swap retries against the successor.

use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tracing::{debug, info};

use crate::queue::{Offer, QueueStrategy, RetentionPolicy, Retirement, StrategyKind};
use crate::records::LogEntry;

/// Point-in-time counters for one stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub name: &'static str,
    pub kind: StrategyKind,
    pub policy: RetentionPolicy,
    pub len: usize,
    pub evicted: u64,
}

/// What a call to [`LogStream::reconfigure`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reconfigured {
    /// The policy was already in effect.
    Unchanged,
    /// A new strategy instance was published.
    Replaced {
        from: StrategyKind,
        to: StrategyKind,
        retirement: Retirement,
    },
}

pub struct LogStream<T> {
    name: &'static str,
    current: RwLock<Arc<QueueStrategy<T>>>,
    refresh: Mutex<()>,
}

impl<T> LogStream<T> {
    /// Create a stream named `name` (used in logs) with `policy` applied.
    #[must_use]
    pub fn new(name: &'static str, policy: RetentionPolicy) -> Self {
        Self {
            name,
            current: RwLock::new(Arc::new(QueueStrategy::new(policy))),
            refresh: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The strategy in effect right now.
    #[must_use]
    pub fn strategy(&self) -> Arc<QueueStrategy<T>> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    #[must_use]
    pub fn kind(&self) -> StrategyKind {
        self.strategy().kind()
    }

    /// Last applied policy.
    #[must_use]
    pub fn policy(&self) -> RetentionPolicy {
        self.strategy().policy()
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.kind() != StrategyKind::Disabled
    }

    /// Append a record to the current strategy.
    ///
    /// Disabled streams drop the record. Never blocks on the refresh path
    /// for longer than one migration.
    pub fn append(&self, record: T) {
        let mut record = record;
        loop {
            match self.strategy().offer(record) {
                Offer::Stored | Offer::Dropped => return,
                Offer::Retired(back) => record = back,
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.strategy().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stable copy of the buffered records, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.strategy().snapshot()
    }

    /// Whether `record` is buffered.
    #[must_use]
    pub fn contains(&self, record: &T) -> bool
    where
        T: PartialEq,
    {
        self.strategy().any(|r| r == record)
    }

    /// Whether any buffered record satisfies `pred`.
    pub fn any(&self, pred: impl FnMut(&T) -> bool) -> bool {
        self.strategy().any(pred)
    }

    #[must_use]
    pub fn stats(&self) -> StreamStats {
        let strategy = self.strategy();
        StreamStats {
            name: self.name,
            kind: strategy.kind(),
            policy: strategy.policy(),
            len: strategy.len(),
            evicted: strategy.evicted(),
        }
    }

    /// Apply `policy`, publishing a new strategy if it differs.
    ///
    /// Records survive when the strategy kind stays the same and are
    /// discarded when it changes (including enabling or disabling).
    pub fn reconfigure(&self, policy: RetentionPolicy) -> Reconfigured {
        let _refresh = self.refresh.lock().unwrap_or_else(|e| e.into_inner());
        let old = self.strategy();
        if old.policy() == policy {
            return Reconfigured::Unchanged;
        }

        let from = old.kind();
        let retirement = old.retire_into(policy, |next| {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            *current = Arc::new(next);
        });
        let to = policy.kind();

        info!(
            stream = self.name,
            from = %from,
            to = %to,
            enabled = policy.enabled,
            capacity = policy.capacity,
            expiry_ms = policy.expiry.as_millis() as u64,
            outcome = ?retirement,
            "Log stream reconfigured"
        );

        Reconfigured::Replaced {
            from,
            to,
            retirement,
        }
    }
}

impl<T: LogEntry> LogStream<T> {
    /// Drop aged records from a time-bounded stream.
    pub fn remove_expired(&self, now_ms: i64) -> usize {
        // A swap during the scan only affects the next tick.
        let strategy = self.strategy();
        let removed = strategy.remove_expired(now_ms);
        if removed > 0 {
            debug!(stream = self.name, removed, "Expired log records removed");
        }
        removed
    }
}

impl<T> std::fmt::Debug for LogStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStream")
            .field("name", &self.name)
            .field("strategy", &self.strategy())
            .finish()
    }
}
