//! Fixed-capacity evicting queue backing the size-bounded retention strategy.
//!
//! Keeps a window of the most recent records. When full, a push overwrites
//! the oldest record. No allocations after creation.

// =============================================================================
// EvictingQueue
// =============================================================================

/// A fixed-capacity ring that evicts its oldest item on overflow.
///
/// Iteration yields items from oldest to newest.
pub struct EvictingQueue<T> {
    slots: Vec<Option<T>>,
    head: usize, // next write position
    len: usize,
    evicted: u64,
}

impl<T> EvictingQueue<T> {
    /// Create an empty queue holding at most `capacity` items.
    ///
    /// A zero capacity is raised to one; the retention policy never builds a
    /// size-bounded queue without room.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            head: 0,
            len: 0,
            evicted: 0,
        }
    }

    /// Build a queue of `capacity` from `items` (oldest first).
    ///
    /// When there are more items than room, the oldest ones are evicted,
    /// exactly as if they had been pushed one by one.
    #[must_use]
    pub fn with_items(capacity: usize, items: impl IntoIterator<Item = T>) -> Self {
        let mut queue = Self::new(capacity);
        for item in items {
            queue.push(item);
        }
        queue
    }

    /// Push an item, returning the evicted oldest item when full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let capacity = self.slots.len();
        let previous = self.slots[self.head].replace(item);
        self.head = (self.head + 1) % capacity;
        if self.len < capacity {
            self.len += 1;
            None
        } else {
            self.evicted += 1;
            previous
        }
    }

    fn start(&self) -> usize {
        if self.len < self.slots.len() {
            0
        } else {
            self.head
        }
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let start = self.start();
        let capacity = self.slots.len();
        (0..self.len).filter_map(move |i| self.slots[(start + i) % capacity].as_ref())
    }

    /// Current number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of items.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Items dropped on overflow since creation.
    #[must_use]
    pub fn total_evicted(&self) -> u64 {
        self.evicted
    }

    /// Remove every item, oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        let start = self.start();
        let capacity = self.slots.len();
        let mut out = Vec::with_capacity(self.len);
        for i in 0..self.len {
            if let Some(item) = self.slots[(start + i) % capacity].take() {
                out.push(item);
            }
        }
        self.head = 0;
        self.len = 0;
        out
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for EvictingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictingQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len)
            .field("evicted", &self.evicted)
            .finish()
    }
}
