//! Retention strategies backing a log stream.
//!
//! A [`QueueStrategy`] is one immutable choice of backing store, built from a
//! [`RetentionPolicy`]:
//!
//! | enabled | expiry | capacity | strategy |
//! |---------|--------|----------|----------|
//! | false   | any    | any      | Disabled |
//! | true    | 0      | 0        | Disabled |
//! | true    | 0      | > 0      | SizeBounded(capacity) |
//! | true    | > 0    | any      | TimeBounded |
//!
//! A strategy is replaced, never reconfigured. The replaced instance is
//! *retired*: it refuses further appends so that producers still holding it
//! retry against its successor.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::evicting_queue::EvictingQueue;
use crate::records::LogEntry;
use crate::sweeper::remove_expired;

/// Which backing-store behavior is in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Appends are dropped.
    Disabled,
    /// Fixed-capacity ring, oldest evicted on overflow.
    SizeBounded,
    /// Unbounded; entries leave only through the expiry sweep.
    TimeBounded,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::SizeBounded => write!(f, "size_bounded"),
            Self::TimeBounded => write!(f, "time_bounded"),
        }
    }
}

/// The settings one log stream is configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub enabled: bool,
    pub capacity: usize,
    pub expiry: Duration,
}

impl RetentionPolicy {
    /// A policy that retains nothing.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            capacity: 0,
            expiry: Duration::ZERO,
        }
    }

    #[must_use]
    pub const fn size_bounded(capacity: usize) -> Self {
        Self {
            enabled: true,
            capacity,
            expiry: Duration::ZERO,
        }
    }

    #[must_use]
    pub const fn time_bounded(expiry: Duration) -> Self {
        Self {
            enabled: true,
            capacity: 0,
            expiry,
        }
    }

    /// Resolve the strategy kind this policy selects.
    #[must_use]
    pub fn kind(&self) -> StrategyKind {
        if !self.enabled {
            StrategyKind::Disabled
        } else if !self.expiry.is_zero() {
            StrategyKind::TimeBounded
        } else if self.capacity > 0 {
            StrategyKind::SizeBounded
        } else {
            StrategyKind::Disabled
        }
    }
}

enum Backing<T> {
    Ring(EvictingQueue<T>),
    Unbounded(VecDeque<T>),
}

impl<T> Backing<T> {
    fn push(&mut self, record: T) {
        match self {
            Self::Ring(ring) => {
                ring.push(record);
            }
            Self::Unbounded(queue) => queue.push_back(record),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Ring(ring) => ring.len(),
            Self::Unbounded(queue) => queue.len(),
        }
    }

    fn drain(&mut self) -> Vec<T> {
        match self {
            Self::Ring(ring) => ring.drain(),
            Self::Unbounded(queue) => queue.drain(..).collect(),
        }
    }

    fn any(&self, mut pred: impl FnMut(&T) -> bool) -> bool {
        match self {
            Self::Ring(ring) => ring.iter().any(|r| pred(r)),
            Self::Unbounded(queue) => queue.iter().any(|r| pred(r)),
        }
    }

    fn cloned(&self) -> Vec<T>
    where
        T: Clone,
    {
        match self {
            Self::Ring(ring) => ring.iter().cloned().collect(),
            Self::Unbounded(queue) => queue.iter().cloned().collect(),
        }
    }

    fn evicted(&self) -> u64 {
        match self {
            Self::Ring(ring) => ring.total_evicted(),
            Self::Unbounded(_) => 0,
        }
    }
}

struct Shelf<T> {
    backing: Backing<T>,
    retired: bool,
}

/// Result of offering a record to a strategy.
#[derive(Debug)]
pub(crate) enum Offer<T> {
    /// Stored (possibly evicting the oldest record).
    Stored,
    /// The strategy is Disabled; the record is dropped.
    Dropped,
    /// The strategy has been replaced; the record is handed back.
    Retired(T),
}

/// One immutable retention strategy instance.
pub struct QueueStrategy<T> {
    policy: RetentionPolicy,
    kind: StrategyKind,
    shelf: Option<Mutex<Shelf<T>>>,
}

impl<T> QueueStrategy<T> {
    /// Build an empty strategy for `policy`.
    #[must_use]
    pub fn new(policy: RetentionPolicy) -> Self {
        Self::with_entries(policy, Vec::new())
    }

    /// Build a strategy for `policy` seeded with `entries` (oldest first).
    fn with_entries(policy: RetentionPolicy, entries: Vec<T>) -> Self {
        let kind = policy.kind();
        let backing = match kind {
            StrategyKind::Disabled => None,
            StrategyKind::SizeBounded => {
                Some(Backing::Ring(EvictingQueue::with_items(policy.capacity, entries)))
            }
            StrategyKind::TimeBounded => Some(Backing::Unbounded(entries.into())),
        };
        Self {
            policy,
            kind,
            shelf: backing.map(|backing| {
                Mutex::new(Shelf {
                    backing,
                    retired: false,
                })
            }),
        }
    }

    fn lock(&self) -> Option<std::sync::MutexGuard<'_, Shelf<T>>> {
        self.shelf
            .as_ref()
            .map(|shelf| shelf.lock().unwrap_or_else(|e| e.into_inner()))
    }

    #[must_use]
    pub fn kind(&self) -> StrategyKind {
        self.kind
    }

    #[must_use]
    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    pub(crate) fn offer(&self, record: T) -> Offer<T> {
        let Some(mut shelf) = self.lock() else {
            return Offer::Dropped;
        };
        if shelf.retired {
            return Offer::Retired(record);
        }
        shelf.backing.push(record);
        Offer::Stored
    }

    /// Number of buffered records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().map_or(0, |shelf| shelf.backing.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records dropped by ring overflow since this instance was built.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.lock().map_or(0, |shelf| shelf.backing.evicted())
    }

    /// Whether any buffered record satisfies `pred`.
    pub fn any(&self, pred: impl FnMut(&T) -> bool) -> bool {
        self.lock().is_some_and(|shelf| shelf.backing.any(pred))
    }

    /// Owned copy of the buffered records, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.lock()
            .map_or_else(Vec::new, |shelf| shelf.backing.cloned())
    }

    /// Build the successor for `policy` and retire `self`.
    ///
    /// Entries move to the successor only when the strategy kind is
    /// unchanged; otherwise they are discarded. `publish` runs while this
    /// instance is still locked, so no producer can store into it between
    /// the migration and the moment the successor becomes visible.
    pub(crate) fn retire_into<F>(&self, policy: RetentionPolicy, publish: F) -> Retirement
    where
        F: FnOnce(QueueStrategy<T>),
    {
        let same_kind = policy.kind() == self.kind;
        let mut guard = self.lock();
        let entries = guard
            .as_mut()
            .map(|shelf| shelf.backing.drain())
            .unwrap_or_default();
        let before = entries.len();

        let successor = if same_kind {
            Self::with_entries(policy, entries)
        } else {
            Self::new(policy)
        };
        let kept = successor.len();
        publish(successor);

        if let Some(shelf) = guard.as_mut() {
            shelf.retired = true;
        }

        if same_kind {
            Retirement::Migrated {
                kept,
                dropped: before - kept,
            }
        } else {
            Retirement::Reset { discarded: before }
        }
    }
}

impl<T: LogEntry> QueueStrategy<T> {
    /// Drop records older than `now_ms - expiry`.
    ///
    /// Only time-bounded strategies age their records; the others return 0.
    pub fn remove_expired(&self, now_ms: i64) -> usize {
        if self.kind != StrategyKind::TimeBounded {
            return 0;
        }
        let expiry_ms = i64::try_from(self.policy.expiry.as_millis()).unwrap_or(i64::MAX);
        match self.lock() {
            Some(mut shelf) => match &mut shelf.backing {
                Backing::Unbounded(queue) => remove_expired(queue, now_ms, expiry_ms),
                Backing::Ring(_) => 0,
            },
            None => 0,
        }
    }
}

impl<T> std::fmt::Debug for QueueStrategy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStrategy")
            .field("kind", &self.kind)
            .field("policy", &self.policy)
            .field("len", &self.len())
            .finish()
    }
}

/// What happened to the buffered records when a strategy was replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Retirement {
    /// Same kind: records moved over; `dropped` fell off a shrunken ring.
    Migrated { kept: usize, dropped: usize },
    /// Kind changed: everything buffered was discarded.
    Reset { discarded: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Entry(i64);

    impl LogEntry for Entry {
        fn logged_at_ms(&self) -> i64 {
            self.0
        }
    }

    #[test]
    fn policy_table_resolves_kinds() {
        let secs = Duration::from_secs;
        let cases = [
            (false, 0, secs(0), StrategyKind::Disabled),
            (false, 100, secs(0), StrategyKind::Disabled),
            (false, 100, secs(10), StrategyKind::Disabled),
            (true, 0, secs(0), StrategyKind::Disabled),
            (true, 100, secs(0), StrategyKind::SizeBounded),
            (true, 0, secs(10), StrategyKind::TimeBounded),
            (true, 100, secs(10), StrategyKind::TimeBounded),
        ];
        for (enabled, capacity, expiry, expected) in cases {
            let policy = RetentionPolicy {
                enabled,
                capacity,
                expiry,
            };
            assert_eq!(policy.kind(), expected, "{policy:?}");
        }
    }

    #[test]
    fn disabled_drops_everything() {
        let q = QueueStrategy::new(RetentionPolicy::size_bounded(0));
        assert!(matches!(q.offer(Entry(1)), Offer::Dropped));
        assert_eq!(q.len(), 0);
        assert!(q.snapshot().is_empty());
    }

    #[test]
    fn size_bounded_evicts_oldest() {
        let q = QueueStrategy::new(RetentionPolicy::size_bounded(2));
        for i in 0..3 {
            assert!(matches!(q.offer(Entry(i)), Offer::Stored));
        }
        assert_eq!(q.snapshot(), vec![Entry(1), Entry(2)]);
        assert_eq!(q.evicted(), 1);
    }

    #[test]
    fn same_kind_retirement_migrates() {
        let q = QueueStrategy::new(RetentionPolicy::size_bounded(3));
        for i in 0..3 {
            q.offer(Entry(i));
        }
        let mut next = None;
        let outcome = q.retire_into(RetentionPolicy::size_bounded(2), |s| next = Some(s));
        let next = next.unwrap();

        assert_eq!(outcome, Retirement::Migrated { kept: 2, dropped: 1 });
        assert_eq!(next.snapshot(), vec![Entry(1), Entry(2)]);
        assert!(matches!(q.offer(Entry(9)), Offer::Retired(Entry(9))));
    }

    #[test]
    fn kind_change_discards() {
        let q = QueueStrategy::new(RetentionPolicy::size_bounded(3));
        q.offer(Entry(1));
        let mut next = None;
        let outcome = q.retire_into(
            RetentionPolicy::time_bounded(Duration::from_secs(1)),
            |s| next = Some(s),
        );
        assert_eq!(outcome, Retirement::Reset { discarded: 1 });
        assert_eq!(next.unwrap().len(), 0);
    }

    #[test]
    fn only_time_bounded_expires() {
        let sized = QueueStrategy::new(RetentionPolicy::size_bounded(5));
        sized.offer(Entry(1));
        assert_eq!(sized.remove_expired(1_000_000), 0);
        assert_eq!(sized.len(), 1);

        let timed = QueueStrategy::new(RetentionPolicy::time_bounded(Duration::from_millis(5000)));
        for ts in [2000, 4000, 7000] {
            timed.offer(Entry(ts));
        }
        assert_eq!(timed.remove_expired(10_000), 2);
        assert_eq!(timed.snapshot(), vec![Entry(7000)]);
    }
}
