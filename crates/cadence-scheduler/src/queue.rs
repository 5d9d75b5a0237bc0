//! Timestamp-ordered event queue.
//!
//! Holds at most one pending [`QueueEntry`] per key, ordered by
//! `(due, sequence)`. Advancing the queue's current point dequeues every entry
//! that has become due and re-enqueues the repeating ones.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};

use cadence_core::{CadenceError, TimeSpan, Timestamp};
use serde::{Deserialize, Serialize};

/// Key equality used for queue lookups.
///
/// Two keys that are `equivalent` must produce the same `key_hash`.
pub trait KeyEquivalence<K: ?Sized>: Send + Sync {
    fn equivalent(&self, a: &K, b: &K) -> bool;
    fn key_hash(&self, key: &K) -> u64;
}

/// `Eq` + `Hash` equality of the key type itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaturalEquality;

impl<K: Eq + Hash + ?Sized> KeyEquivalence<K> for NaturalEquality {
    fn equivalent(&self, a: &K, b: &K) -> bool {
        a == b
    }

    fn key_hash(&self, key: &K) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }
}

/// ASCII case-insensitive equality for string-like keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaseInsensitive;

impl<K: AsRef<str> + ?Sized> KeyEquivalence<K> for CaseInsensitive {
    fn equivalent(&self, a: &K, b: &K) -> bool {
        a.as_ref().eq_ignore_ascii_case(b.as_ref())
    }

    fn key_hash(&self, key: &K) -> u64 {
        let mut hasher = DefaultHasher::new();
        for byte in key.as_ref().bytes() {
            hasher.write_u8(byte.to_ascii_lowercase());
        }
        hasher.finish()
    }
}

/// Remaining dispatches of an entry, counting the pending one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Repetitions {
    Finite(u64),
    Infinite,
}

impl Repetitions {
    /// Whether the entry repeats until removed.
    pub fn is_infinite(&self) -> bool {
        matches!(self, Self::Infinite)
    }

    /// Whether no dispatches remain.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Finite(0))
    }

    /// Remaining dispatches, or `None` when infinite.
    pub fn remaining(&self) -> Option<u64> {
        match self {
            Self::Finite(n) => Some(*n),
            Self::Infinite => None,
        }
    }

    /// Value left after one dispatch.
    pub fn after_dispatch(self) -> Self {
        match self {
            Self::Finite(n) => Self::Finite(n.saturating_sub(1)),
            Self::Infinite => Self::Infinite,
        }
    }
}

/// One pending occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry<K> {
    pub key: K,
    pub due: Timestamp,
    pub interval: TimeSpan,
    pub repetitions: Repetitions,
    /// Insertion order, used to break ties between equal due timestamps.
    pub sequence: u64,
}

/// An entry dequeued by an advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch<K> {
    /// The entry as it was when it became due.
    pub entry: QueueEntry<K>,
    /// Where the entry was re-enqueued, if it repeats.
    pub next_due: Option<Timestamp>,
}

impl<K> Dispatch<K> {
    /// Repetitions left after this dispatch.
    pub fn remaining(&self) -> Repetitions {
        self.entry.repetitions.after_dispatch()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("repetitions must be >= 1")]
    ZeroRepetitions,
    #[error("interval must not be negative (got {0} ticks)")]
    NegativeInterval(i64),
    #[error("current point must not move backwards (delta {0} ticks)")]
    Regression(i64),
}

impl From<QueueError> for CadenceError {
    fn from(err: QueueError) -> Self {
        let name = match err {
            QueueError::ZeroRepetitions => "repetitions",
            QueueError::NegativeInterval(_) => "interval",
            QueueError::Regression(_) => "delta",
        };
        CadenceError::invalid(name, err.to_string())
    }
}

pub(crate) type Slot = (Timestamp, u64);

/// Minimum-due priority queue with one entry per key.
pub struct EventQueue<K, E = NaturalEquality> {
    start_point: Timestamp,
    current_point: Timestamp,
    next_sequence: u64,
    order: BTreeMap<Slot, QueueEntry<K>>,
    index: HashMap<u64, Vec<Slot>>,
    equivalence: E,
}

impl<K: Clone> EventQueue<K, NaturalEquality>
where
    NaturalEquality: KeyEquivalence<K>,
{
    /// Empty queue whose current point starts at `start_point`, comparing keys with `==`.
    pub fn new(start_point: Timestamp) -> Self {
        Self::with_equivalence(start_point, NaturalEquality)
    }
}

impl<K: Clone, E: KeyEquivalence<K>> EventQueue<K, E> {
    /// Empty queue comparing keys with a custom equivalence.
    pub fn with_equivalence(start_point: Timestamp, equivalence: E) -> Self {
        Self {
            start_point,
            current_point: start_point,
            next_sequence: 0,
            order: BTreeMap::new(),
            index: HashMap::new(),
            equivalence,
        }
    }

    /// The point the queue was created at.
    pub fn start_point(&self) -> Timestamp {
        self.start_point
    }

    /// How far the queue has been advanced.
    pub fn current_point(&self) -> Timestamp {
        self.current_point
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Insert or replace the entry for `key`, due at `current_point + delay`.
    pub fn enqueue(
        &mut self,
        key: K,
        delay: TimeSpan,
        interval: TimeSpan,
        repetitions: u64,
    ) -> Result<(), QueueError> {
        self.enqueue_with(key, delay, interval, Repetitions::Finite(repetitions))
    }

    /// Like [`enqueue`](Self::enqueue), but the entry repeats until removed.
    pub fn enqueue_infinite(
        &mut self,
        key: K,
        delay: TimeSpan,
        interval: TimeSpan,
    ) -> Result<(), QueueError> {
        self.enqueue_with(key, delay, interval, Repetitions::Infinite)
    }

    /// Insert or replace the entry for `key` with explicit repetitions.
    ///
    /// Rejects exhausted repetitions and negative intervals.
    pub fn enqueue_with(
        &mut self,
        key: K,
        delay: TimeSpan,
        interval: TimeSpan,
        repetitions: Repetitions,
    ) -> Result<(), QueueError> {
        if repetitions.is_exhausted() {
            return Err(QueueError::ZeroRepetitions);
        }
        if interval.is_negative() {
            return Err(QueueError::NegativeInterval(interval.ticks()));
        }
        self.remove(&key);
        let entry = QueueEntry {
            key,
            due: self.current_point + delay,
            interval,
            repetitions,
            sequence: self.take_sequence(),
        };
        self.insert(entry);
        Ok(())
    }

    /// Move the current point forward by `delta` and dequeue what became due.
    pub fn advance(&mut self, delta: TimeSpan) -> Result<Vec<Dispatch<K>>, QueueError> {
        if delta.is_negative() {
            return Err(QueueError::Regression(delta.ticks()));
        }
        let point = self.current_point + delta;
        Ok(self.drain_until(point))
    }

    /// `count` consecutive advances by `delta`, results concatenated.
    pub fn advance_times(
        &mut self,
        delta: TimeSpan,
        count: usize,
    ) -> Result<Vec<Dispatch<K>>, QueueError> {
        if delta.is_negative() {
            return Err(QueueError::Regression(delta.ticks()));
        }
        let mut dispatched = Vec::new();
        for _ in 0..count {
            let point = self.current_point + delta;
            dispatched.extend(self.drain_until(point));
        }
        Ok(dispatched)
    }

    /// Move the current point to `point`, which must not be in its past.
    pub fn advance_to(&mut self, point: Timestamp) -> Result<Vec<Dispatch<K>>, QueueError> {
        if point < self.current_point {
            return Err(QueueError::Regression((point - self.current_point).ticks()));
        }
        Ok(self.drain_until(point))
    }

    /// Drop the pending entry for `key`. Returns whether one existed.
    pub fn remove(&mut self, key: &K) -> bool {
        match self.locate(key) {
            Some(slot) => self.take(slot).is_some(),
            None => false,
        }
    }

    /// The pending entry for `key`.
    pub fn get(&self, key: &K) -> Option<&QueueEntry<K>> {
        self.locate(key).and_then(|slot| self.order.get(&slot))
    }

    pub fn contains(&self, key: &K) -> bool {
        self.locate(key).is_some()
    }

    /// The entry that will be dequeued next.
    pub fn peek(&self) -> Option<&QueueEntry<K>> {
        self.order.values().next()
    }

    /// Entries in dequeue order.
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry<K>> {
        self.order.values()
    }

    /// Drop every pending entry. The current point is kept.
    pub fn clear(&mut self) {
        self.order.clear();
        self.index.clear();
    }

    fn drain_until(&mut self, point: Timestamp) -> Vec<Dispatch<K>> {
        self.current_point = point;
        let mut dispatched = Vec::new();
        // Re-enqueued entries that would be due again at the same instant wait
        // for the next advance.
        let mut deferred = Vec::new();

        while let Some(slot) = self.first_due(point) {
            let Some(entry) = self.take(slot) else { break };
            let remaining = entry.repetitions.after_dispatch();
            let next_due = (!remaining.is_exhausted()).then(|| entry.due + entry.interval);

            if let Some(due) = next_due {
                let next = QueueEntry {
                    key: entry.key.clone(),
                    due,
                    interval: entry.interval,
                    repetitions: remaining,
                    sequence: self.take_sequence(),
                };
                if due <= entry.due {
                    deferred.push(next);
                } else {
                    self.insert(next);
                }
            }
            dispatched.push(Dispatch { entry, next_due });
        }

        for entry in deferred {
            self.insert(entry);
        }
        dispatched
    }

    fn first_due(&self, point: Timestamp) -> Option<Slot> {
        self.order
            .keys()
            .next()
            .copied()
            .filter(|(due, _)| *due <= point)
    }

    fn take_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    pub(crate) fn insert(&mut self, entry: QueueEntry<K>) {
        let slot = (entry.due, entry.sequence);
        let hash = self.equivalence.key_hash(&entry.key);
        self.index.entry(hash).or_default().push(slot);
        self.order.insert(slot, entry);
    }

    pub(crate) fn locate(&self, key: &K) -> Option<Slot> {
        let hash = self.equivalence.key_hash(key);
        self.index.get(&hash)?.iter().copied().find(|slot| {
            self.order
                .get(slot)
                .is_some_and(|entry| self.equivalence.equivalent(&entry.key, key))
        })
    }

    pub(crate) fn take(&mut self, slot: Slot) -> Option<QueueEntry<K>> {
        let entry = self.order.remove(&slot)?;
        let hash = self.equivalence.key_hash(&entry.key);
        if let Some(bucket) = self.index.get_mut(&hash) {
            bucket.retain(|s| *s != slot);
            if bucket.is_empty() {
                self.index.remove(&hash);
            }
        }
        Some(entry)
    }

    /// Mutable access to fields that do not affect ordering or lookup.
    pub(crate) fn entry_mut(&mut self, slot: Slot) -> Option<&mut QueueEntry<K>> {
        self.order.get_mut(&slot)
    }
}
