//! Event queue whose pending entries can be rescheduled in place.
//!
//! Mutations keep the entry's insertion sequence, so an entry moved onto the
//! same due timestamp as another still breaks the tie by its original order.

use cadence_core::{TimeSpan, Timestamp};

use crate::queue::{
    Dispatch, EventQueue, KeyEquivalence, NaturalEquality, QueueEntry, QueueError, Repetitions,
};

pub struct ReorderableEventQueue<K, E = NaturalEquality> {
    queue: EventQueue<K, E>,
}

impl<K: Clone> ReorderableEventQueue<K, NaturalEquality>
where
    NaturalEquality: KeyEquivalence<K>,
{
    /// Empty queue starting at `start_point`.
    pub fn new(start_point: Timestamp) -> Self {
        Self {
            queue: EventQueue::new(start_point),
        }
    }
}

impl<K: Clone, E: KeyEquivalence<K>> ReorderableEventQueue<K, E> {
    /// Empty queue comparing keys with a custom equivalence.
    pub fn with_equivalence(start_point: Timestamp, equivalence: E) -> Self {
        Self {
            queue: EventQueue::with_equivalence(start_point, equivalence),
        }
    }

    /// Read-only view of the underlying queue.
    pub fn as_queue(&self) -> &EventQueue<K, E> {
        &self.queue
    }

    /// See [`EventQueue::start_point`].
    pub fn start_point(&self) -> Timestamp {
        self.queue.start_point()
    }

    /// See [`EventQueue::current_point`].
    pub fn current_point(&self) -> Timestamp {
        self.queue.current_point()
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// See [`EventQueue::enqueue`].
    pub fn enqueue(
        &mut self,
        key: K,
        delay: TimeSpan,
        interval: TimeSpan,
        repetitions: u64,
    ) -> Result<(), QueueError> {
        self.queue.enqueue(key, delay, interval, repetitions)
    }

    /// See [`EventQueue::enqueue_infinite`].
    pub fn enqueue_infinite(
        &mut self,
        key: K,
        delay: TimeSpan,
        interval: TimeSpan,
    ) -> Result<(), QueueError> {
        self.queue.enqueue_infinite(key, delay, interval)
    }

    /// See [`EventQueue::enqueue_with`].
    pub fn enqueue_with(
        &mut self,
        key: K,
        delay: TimeSpan,
        interval: TimeSpan,
        repetitions: Repetitions,
    ) -> Result<(), QueueError> {
        self.queue.enqueue_with(key, delay, interval, repetitions)
    }

    /// See [`EventQueue::advance`].
    pub fn advance(&mut self, delta: TimeSpan) -> Result<Vec<Dispatch<K>>, QueueError> {
        self.queue.advance(delta)
    }

    /// See [`EventQueue::advance_times`].
    pub fn advance_times(
        &mut self,
        delta: TimeSpan,
        count: usize,
    ) -> Result<Vec<Dispatch<K>>, QueueError> {
        self.queue.advance_times(delta, count)
    }

    /// See [`EventQueue::advance_to`].
    pub fn advance_to(&mut self, point: Timestamp) -> Result<Vec<Dispatch<K>>, QueueError> {
        self.queue.advance_to(point)
    }

    /// Drop the pending entry for `key`. Returns whether one existed.
    pub fn remove(&mut self, key: &K) -> bool {
        self.queue.remove(key)
    }

    /// The pending entry for `key`.
    pub fn get(&self, key: &K) -> Option<&QueueEntry<K>> {
        self.queue.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.queue.contains(key)
    }

    /// The entry that will be dequeued next.
    pub fn peek(&self) -> Option<&QueueEntry<K>> {
        self.queue.peek()
    }

    /// Entries in dequeue order.
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry<K>> {
        self.queue.iter()
    }

    /// Drop every pending entry.
    pub fn clear(&mut self) {
        self.queue.clear()
    }

    /// Shift the pending entry's due timestamp by `delta` (either direction).
    pub fn advance_dequeue_point(&mut self, key: &K, delta: TimeSpan) -> Option<QueueEntry<K>> {
        let slot = self.queue.locate(key)?;
        let mut entry = self.queue.take(slot)?;
        entry.due += delta;
        self.queue.insert(entry.clone());
        Some(entry)
    }

    /// Move the pending entry to an absolute due timestamp.
    pub fn set_dequeue_point(&mut self, key: &K, due: Timestamp) -> Option<QueueEntry<K>> {
        let current = self.queue.get(key)?.due;
        self.advance_dequeue_point(key, due - current)
    }

    /// Lengthen the pending entry's repeat interval.
    pub fn increase_delta(
        &mut self,
        key: &K,
        delta: TimeSpan,
    ) -> Result<Option<QueueEntry<K>>, QueueError> {
        self.adjust_interval(key, |interval| interval + delta)
    }

    /// Shorten the pending entry's repeat interval.
    pub fn decrease_delta(
        &mut self,
        key: &K,
        delta: TimeSpan,
    ) -> Result<Option<QueueEntry<K>>, QueueError> {
        self.adjust_interval(key, |interval| interval - delta)
    }

    /// Replace the pending entry's remaining repetitions. Its due time is unchanged.
    pub fn set_repetitions(
        &mut self,
        key: &K,
        repetitions: Repetitions,
    ) -> Result<Option<QueueEntry<K>>, QueueError> {
        if repetitions.is_exhausted() {
            return Err(QueueError::ZeroRepetitions);
        }
        let Some(slot) = self.queue.locate(key) else {
            return Ok(None);
        };
        Ok(self.queue.entry_mut(slot).map(|entry| {
            entry.repetitions = repetitions;
            entry.clone()
        }))
    }

    fn adjust_interval(
        &mut self,
        key: &K,
        adjust: impl FnOnce(TimeSpan) -> TimeSpan,
    ) -> Result<Option<QueueEntry<K>>, QueueError> {
        let Some(slot) = self.queue.locate(key) else {
            return Ok(None);
        };
        let Some(entry) = self.queue.entry_mut(slot) else {
            return Ok(None);
        };
        let interval = adjust(entry.interval);
        if interval.is_negative() {
            return Err(QueueError::NegativeInterval(interval.ticks()));
        }
        entry.interval = interval;
        Ok(Some(entry.clone()))
    }
}
