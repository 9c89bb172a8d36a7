//! Sharded table of started-but-unfinished records.
//!
//! Every running job and operation sits here between its start and finish
//! call. Producers on different keys hit different shards, so the hot
//! start/finish path rarely contends.
//!
//! # Design
//!
//! Each shard is a `Mutex` over a `HashMap<K, Slot<V>>` padded to 128 bytes to
//! keep neighbouring shard locks off the same cache line. The key hash picks
//! the shard. Every insert draws a ticket from a table-wide counter; a shard
//! also indexes its slots by ticket, so the oldest admission of the whole
//! table is the smallest first ticket over all shards.
//!
//! Lookups are single-shard. Snapshots, eviction and aging walk all shards one
//! at a time and are therefore not a consistent cut across shards.

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Default number of shards. Power of 2.
const DEFAULT_SHARDS: usize = 32;

/// Admission ticket handed out by [`PendingTable::insert`].
pub type Ticket = u64;

struct Slot<V> {
    ticket: Ticket,
    value: V,
}

struct ShardMap<K, V> {
    slots: HashMap<K, Slot<V>>,
    admissions: BTreeMap<Ticket, K>,
}

impl<K: Hash + Eq, V> ShardMap<K, V> {
    fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.slots.remove(key)?;
        self.admissions.remove(&slot.ticket);
        Some(slot.value)
    }

    fn pop_oldest(&mut self) -> Option<V> {
        let (_, key) = self.admissions.pop_first()?;
        self.slots.remove(&key).map(|slot| slot.value)
    }
}

#[repr(align(128))]
struct Shard<K, V> {
    map: Mutex<ShardMap<K, V>>,
}

impl<K, V> Shard<K, V> {
    fn new() -> Self {
        Self {
            map: Mutex::new(ShardMap {
                slots: HashMap::new(),
                admissions: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ShardMap<K, V>> {
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Concurrent map keyed by record identity, oldest admission first.
pub struct PendingTable<K, V> {
    shards: Box<[Shard<K, V>]>,
    next_ticket: AtomicU64,
    len: AtomicUsize,
}

impl<K: Hash + Eq + Clone, V> PendingTable<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// Create with a specific shard count, clamped to `[1, 256]`.
    #[must_use]
    pub fn with_shards(n: usize) -> Self {
        let n = n.clamp(1, 256);
        let shards: Vec<Shard<K, V>> = (0..n).map(|_| Shard::new()).collect();
        Self {
            shards: shards.into_boxed_slice(),
            next_ticket: AtomicU64::new(0),
            len: AtomicUsize::new(0),
        }
    }

    fn shard(&self, key: &K) -> MutexGuard<'_, ShardMap<K, V>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        self.shards[idx].lock()
    }

    /// Insert a record, replacing one with the same key.
    ///
    /// The returned ticket identifies this admission; a replaced record's
    /// ticket is retired with it.
    pub fn insert(&self, key: K, value: V) -> Ticket {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let mut shard = self.shard(&key);
        match shard.slots.insert(key.clone(), Slot { ticket, value }) {
            Some(old) => {
                shard.admissions.remove(&old.ticket);
            }
            None => {
                self.len.fetch_add(1, Ordering::AcqRel);
            }
        }
        shard.admissions.insert(ticket, key);
        ticket
    }

    /// Remove and return the record for `key`.
    pub fn take(&self, key: &K) -> Option<V> {
        let value = self.shard(key).remove(key)?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(value)
    }

    /// Remove the record for `key` only if it is still the admission
    /// identified by `ticket`.
    pub fn withdraw(&self, key: &K, ticket: Ticket) -> Option<V> {
        let mut shard = self.shard(key);
        if shard.slots.get(key).map(|slot| slot.ticket) != Some(ticket) {
            return None;
        }
        let value = shard.remove(key)?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(value)
    }

    /// Total number of records across all shards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict the oldest admissions until at most `capacity` records remain.
    ///
    /// Returns the number of records evicted.
    pub fn truncate_oldest(&self, capacity: usize) -> usize {
        let mut evicted = 0;
        while self.len() > capacity {
            if self.evict_oldest().is_none() {
                break;
            }
            evicted += 1;
        }
        evicted
    }

    fn evict_oldest(&self) -> Option<V> {
        loop {
            let (_, idx) = self
                .shards
                .iter()
                .enumerate()
                .filter_map(|(idx, shard)| {
                    shard
                        .lock()
                        .admissions
                        .first_key_value()
                        .map(|(ticket, _)| (*ticket, idx))
                })
                .min()?;
            // A concurrent take may have emptied the shard since the scan.
            if let Some(value) = self.shards[idx].lock().pop_oldest() {
                self.len.fetch_sub(1, Ordering::AcqRel);
                return Some(value);
            }
        }
    }

    /// Drop every record for which `keep` returns false.
    pub fn retain(&self, mut keep: impl FnMut(&V) -> bool) -> usize {
        let mut removed = 0;
        for shard in &*self.shards {
            let mut guard = shard.lock();
            let stale: Vec<K> = guard
                .slots
                .iter()
                .filter(|(_, slot)| !keep(&slot.value))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &stale {
                guard.remove(key);
            }
            removed += stale.len();
        }
        self.len.fetch_sub(removed, Ordering::AcqRel);
        removed
    }

    /// Clone every record (snapshot, shard by shard).
    #[must_use]
    pub fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        let mut out = Vec::new();
        for shard in &*self.shards {
            let guard = shard.lock();
            out.extend(guard.slots.values().map(|slot| slot.value.clone()));
        }
        out
    }

    /// Drop every record, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        for shard in &*self.shards {
            let mut guard = shard.lock();
            removed += guard.slots.len();
            guard.slots.clear();
            guard.admissions.clear();
        }
        self.len.fetch_sub(removed, Ordering::AcqRel);
        removed
    }
}

impl<K: Hash + Eq + Clone, V> Default for PendingTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> std::fmt::Debug for PendingTable<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTable")
            .field("shards", &self.shards.len())
            .field("len", &self.len.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn insert_take() {
        let table: PendingTable<(u32, u32), &str> = PendingTable::with_shards(4);
        assert!(table.is_empty());
        table.insert((0, 1), "a");
        table.insert((0, 1), "b");
        assert_eq!(table.len(), 1);
        assert_eq!(table.take(&(0, 1)), Some("b"));
        assert_eq!(table.take(&(0, 1)), None);
        assert!(table.is_empty());
    }

    #[test]
    fn composite_keys_do_not_collide() {
        let table: PendingTable<(u32, u32), &str> = PendingTable::new();
        table.insert((0, 1), "job one");
        table.insert((0, 2), "job two");
        assert_eq!(table.take(&(0, 2)), Some("job two"));
        assert_eq!(table.values(), vec!["job one"]);
    }

    #[test]
    fn truncate_evicts_oldest_admissions() {
        let table: PendingTable<u32, u32> = PendingTable::with_shards(8);
        for i in 0..10 {
            table.insert(i, i);
        }
        assert_eq!(table.truncate_oldest(3), 7);
        let mut left = table.values();
        left.sort_unstable();
        assert_eq!(left, vec![7, 8, 9]);
    }

    #[test]
    fn reinsert_refreshes_admission_order() {
        let table: PendingTable<u32, &str> = PendingTable::with_shards(2);
        table.insert(1, "first");
        table.insert(2, "second");
        table.insert(1, "restarted");
        assert_eq!(table.truncate_oldest(1), 1);
        assert_eq!(table.values(), vec!["restarted"]);
    }

    #[test]
    fn withdraw_needs_the_current_ticket() {
        let table: PendingTable<u32, &str> = PendingTable::new();
        let stale = table.insert(5, "old");
        let current = table.insert(5, "new");
        assert_eq!(table.withdraw(&5, stale), None);
        assert_eq!(table.len(), 1);
        assert_eq!(table.withdraw(&5, current), Some("new"));
        assert!(table.is_empty());
    }

    #[test]
    fn retain_drops_rejected_records() {
        let table: PendingTable<u32, u32> = PendingTable::new();
        for i in 0..10 {
            table.insert(i, i * 100);
        }
        assert_eq!(table.retain(|v| *v >= 500), 5);
        assert_eq!(table.len(), 5);
        assert_eq!(table.truncate_oldest(0), 5);
        assert!(table.is_empty());
    }

    #[test]
    fn clear_reports_count() {
        let table: PendingTable<u32, u32> = PendingTable::with_shards(0);
        for i in 0..10 {
            table.insert(i, i);
        }
        assert_eq!(table.clear(), 10);
        assert!(table.is_empty());
    }

    #[test]
    fn concurrent_inserts_and_takes() {
        let table: Arc<PendingTable<u64, u64>> = Arc::new(PendingTable::new());
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let key = t * 1_000 + i;
                        table.insert(key, i);
                        assert_eq!(table.take(&key), Some(i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(table.is_empty());
    }

    #[test]
    fn concurrent_truncation_holds_the_bound() {
        let table: Arc<PendingTable<u64, u64>> = Arc::new(PendingTable::new());
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    for i in 0..1_000 {
                        table.insert(t * 10_000 + i, i);
                        table.truncate_oldest(16);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(table.len() <= 16);
        assert_eq!(table.values().len(), table.len());
    }
}
