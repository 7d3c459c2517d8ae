// FIFO plus lookup table keyed by tick, shared by every request/reply protocol.
use hashbrown::HashMap;
use std::collections::VecDeque;

use crate::tick::Tick;

/// Outstanding requests in arrival order, addressable by tick.
///
/// Removal by tick leaves a stale slot in the order queue that is skipped
/// later, so both `insert` and `remove` stay O(1).
#[derive(Debug)]
pub struct TickTable<V> {
    order: VecDeque<Tick>,
    entries: HashMap<Tick, V, ahash::RandomState>,
}

impl<V> Default for TickTable<V> {
    fn default() -> Self {
        Self {
            order: VecDeque::new(),
            entries: HashMap::default(),
        }
    }
}

impl<V> TickTable<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false, leaving the table unchanged, if `tick` is already present.
    pub fn insert(&mut self, tick: Tick, value: V) -> bool {
        if self.entries.contains_key(&tick) {
            return false;
        }
        self.entries.insert(tick, value);
        self.order.push_back(tick);
        true
    }

    pub fn remove(&mut self, tick: Tick) -> Option<V> {
        let value = self.entries.remove(&tick)?;
        if self.order.len() > 2 * self.entries.len() + 16 {
            let entries = &self.entries;
            self.order.retain(|tick| entries.contains_key(tick));
        }
        Some(value)
    }

    pub fn get(&self, tick: Tick) -> Option<&V> {
        self.entries.get(&tick)
    }

    pub fn contains(&self, tick: Tick) -> bool {
        self.entries.contains_key(&tick)
    }

    /// Oldest live entry.
    pub fn front(&mut self) -> Option<(Tick, &V)> {
        while let Some(tick) = self.order.front().copied() {
            if self.entries.contains_key(&tick) {
                return self.entries.get(&tick).map(|value| (tick, value));
            }
            self.order.pop_front();
        }
        None
    }

    pub fn pop_front(&mut self) -> Option<(Tick, V)> {
        while let Some(tick) = self.order.pop_front() {
            if let Some(value) = self.entries.remove(&tick) {
                return Some((tick, value));
            }
        }
        None
    }

    /// Removes everything, oldest first.
    pub fn drain(&mut self) -> Vec<(Tick, V)> {
        let mut drained = Vec::with_capacity(self.entries.len());
        while let Some(entry) = self.pop_front() {
            drained.push(entry);
        }
        self.order.clear();
        drained
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
