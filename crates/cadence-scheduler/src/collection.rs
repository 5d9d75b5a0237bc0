//! Task collection driven by an external tick stream.
//!
//! No queue and no clock loop of its own: every tick is checked against each
//! task's next due timestamp, and due tasks go through the same admission
//! rules as the [`Scheduler`](crate::engine::Scheduler).

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cadence_core::{
    CadenceError, DisposalFailure, Result, SharedClock, TimeSpan, Timestamp, disposal_result,
};
use futures::stream::{self, BoxStream};
use futures::{FutureExt, Stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::admission::{DisposalCause, Lifecycle, TaskSlot};
use crate::invocation::{self, SlotHost, Withdrawn};
use crate::queue::Repetitions;
use crate::task::{ScheduledTask, TaskContext, TaskState};
use crate::timer::Tick;

/// A task plus its cadence within a collection.
pub struct TickTask {
    task: Arc<dyn ScheduledTask>,
    interval: TimeSpan,
    first_due: Option<Timestamp>,
}

impl TickTask {
    /// Due on every tick until given an interval.
    pub fn new(task: Arc<dyn ScheduledTask>) -> Self {
        Self {
            task,
            interval: TimeSpan::ZERO,
            first_due: None,
        }
    }

    /// Repeat interval. Without one the task runs on every tick.
    pub fn every(mut self, interval: TimeSpan) -> Self {
        self.interval = interval;
        self
    }

    /// First tick at or after `at` triggers the task.
    pub fn starting_at(mut self, at: Timestamp) -> Self {
        self.first_due = Some(at);
        self
    }
}

/// Aggregate view of the observed tick stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionStatistics {
    pub first_timestamp: Option<Timestamp>,
    pub last_timestamp: Option<Timestamp>,
    pub event_count: u64,
}

/// Cloneable handle to a tick-driven task collection.
#[derive(Clone)]
pub struct TaskCollection {
    inner: Arc<CollectionInner>,
}

struct CollectionInner {
    id: u64,
    clock: SharedClock,
    shared: Mutex<CollectionShared>,
    unsubscribe: CancellationToken,
    tracker: TaskTracker,
    deferred: Mutex<Vec<DisposalFailure>>,
}

struct CollectionShared {
    disposed: bool,
    tasks: BTreeMap<String, Member>,
    stats: CollectionStatistics,
}

struct Member {
    slot: TaskSlot,
    interval: TimeSpan,
    /// `None` = due on the next tick.
    next: Option<Timestamp>,
}

impl Member {
    fn snapshot(&self, key: &str) -> TaskState {
        TaskState {
            key: key.to_string(),
            next_timestamp: self.next,
            interval: self.interval,
            repetitions: Repetitions::Infinite,
            max_concurrent_invocations: self.slot.max_concurrent(),
            max_enqueued_invocations: self.slot.max_enqueued(),
            is_disposed: self.slot.is_disposed(),
            statistics: self.slot.stats().clone(),
        }
    }
}

impl TaskCollection {
    /// Subscribe `tasks` to `ticks`. All-or-nothing: on a duplicate key or a
    /// negative interval every supplied task is disposed and an error returned.
    /// A stream that has already ended yields an already-disposed collection.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register<S>(clock: SharedClock, ticks: S, tasks: Vec<TickTask>) -> Result<Self>
    where
        S: Stream<Item = Tick> + Send + 'static,
    {
        if let Err(e) = validate(&tasks) {
            let failures: Vec<DisposalFailure> = tasks
                .iter()
                .filter_map(|member| invocation::dispose_task(&member.task).err())
                .collect();
            if !failures.is_empty() {
                let keys: Vec<_> = failures.iter().map(|f| f.key.as_str()).collect();
                tracing::warn!(
                    "⚠️ Rejected collection left {} task(s) failing to dispose: {keys:?}",
                    failures.len()
                );
            }
            return Err(e);
        }

        let members = tasks
            .into_iter()
            .map(|t| {
                let key = t.task.key().to_string();
                let member = Member {
                    slot: TaskSlot::new(t.task),
                    interval: t.interval,
                    next: t.first_due,
                };
                (key, member)
            })
            .collect();

        let collection = Self {
            inner: Arc::new(CollectionInner {
                id: invocation::next_host_id(),
                clock,
                shared: Mutex::new(CollectionShared {
                    disposed: false,
                    tasks: members,
                    stats: CollectionStatistics::default(),
                }),
                unsubscribe: CancellationToken::new(),
                tracker: TaskTracker::new(),
                deferred: Mutex::new(Vec::new()),
            }),
        };

        let mut ticks = ticks.boxed();
        let ticks: BoxStream<'static, Tick> = match ticks.next().now_or_never() {
            Some(None) => {
                tracing::info!("Tick stream already ended; disposing collection");
                if let Err(CadenceError::Disposal(failures)) = collection.begin_dispose() {
                    for failure in failures {
                        collection.inner.record_deferred_failure(failure);
                    }
                }
                return Ok(collection);
            }
            Some(Some(first)) => stream::once(async move { first }).chain(ticks).boxed(),
            None => ticks,
        };

        tracing::info!("📡 Task collection subscribed ({} task(s))", collection.task_keys().len());
        collection
            .inner
            .tracker
            .spawn(subscription(Arc::clone(&collection.inner), ticks));
        Ok(collection)
    }

    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    /// Tick counters observed so far.
    pub fn statistics(&self) -> CollectionStatistics {
        self.inner.lock().stats.clone()
    }

    /// Remove a task; disposal waits for its active invocations.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let withdrawn = {
            let mut shared = self.inner.lock();
            if shared.disposed {
                return Ok(false);
            }
            let Some(member) = shared.tasks.get_mut(key) else {
                return Ok(false);
            };
            if member.slot.lifecycle() != Lifecycle::Active {
                return Ok(false);
            }
            let completions = member.slot.mark_pending_disposal(DisposalCause::Removed);
            member.next = None;
            (Arc::clone(member.slot.task()), completions)
        };
        tracing::info!("🗑️ Task removed from collection: '{key}'");
        disposal_result(invocation::settle(&self.inner, vec![withdrawn]))?;
        Ok(true)
    }

    /// Snapshot of a live task, or `None` if it is unknown or removed.
    pub fn try_get_task_state(&self, key: &str) -> Option<TaskState> {
        let shared = self.inner.lock();
        shared.tasks.get(key).map(|member| member.snapshot(key))
    }

    /// Keys of live tasks, excluding those draining after removal.
    pub fn task_keys(&self) -> Vec<String> {
        let shared = self.inner.lock();
        shared
            .tasks
            .iter()
            .filter(|(_, member)| !member.slot.is_disposed())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Unsubscribe, cancel active invocations and dispose idle tasks.
    pub fn begin_dispose(&self) -> Result<()> {
        let withdrawn: Vec<Withdrawn> = {
            let mut shared = self.inner.lock();
            if shared.disposed {
                return Ok(());
            }
            shared.disposed = true;
            shared
                .tasks
                .values_mut()
                .map(|member| {
                    member.next = None;
                    let completions = member.slot.mark_pending_disposal(DisposalCause::Removed);
                    (Arc::clone(member.slot.task()), completions)
                })
                .collect()
        };
        self.inner.unsubscribe.cancel();
        self.inner.tracker.close();
        tracing::info!("🛑 Task collection disposing ({} task(s))", withdrawn.len());
        disposal_result(invocation::settle(&self.inner, withdrawn))
    }

    /// Dispose and wait for active invocations (skipped from inside one).
    pub async fn dispose(&self) -> Result<()> {
        let mut failures = match self.begin_dispose() {
            Ok(()) => Vec::new(),
            Err(CadenceError::Disposal(failures)) => failures,
            Err(e) => return Err(e),
        };
        if !invocation::inside_host(self.inner.id) {
            self.inner.tracker.wait().await;
        }
        failures.extend(self.inner.take_deferred());
        disposal_result(failures)
    }
}

impl fmt::Debug for TaskCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.lock();
        f.debug_struct("TaskCollection")
            .field("disposed", &shared.disposed)
            .field("tasks", &shared.tasks.len())
            .field("stats", &shared.stats)
            .finish()
    }
}

fn validate(tasks: &[TickTask]) -> Result<()> {
    let mut seen = HashSet::new();
    for member in tasks {
        let key = member.task.key();
        if !seen.insert(key) {
            return Err(CadenceError::DuplicateKey(key.to_string()));
        }
        if member.interval.is_negative() {
            return Err(CadenceError::invalid("interval", format!("negative for '{key}'")));
        }
    }
    Ok(())
}

/// First timestamp strictly after `tick` on the grid `due + k * interval`.
fn next_due(due: Timestamp, interval: TimeSpan, tick: Timestamp) -> Option<Timestamp> {
    if interval.is_zero() {
        return None;
    }
    let steps = (tick - due).ticks().max(0) / interval.ticks() + 1;
    Some(due + interval * steps)
}

impl CollectionInner {
    fn lock(&self) -> MutexGuard<'_, CollectionShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_deferred(&self) -> Vec<DisposalFailure> {
        std::mem::take(&mut *self.deferred.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn on_tick(self: &Arc<Self>, tick: Tick) {
        let mut admitted = Vec::new();
        {
            let mut shared = self.lock();
            if shared.disposed {
                return;
            }
            let stats = &mut shared.stats;
            stats.first_timestamp.get_or_insert(tick.timestamp);
            stats.last_timestamp = Some(tick.timestamp);
            stats.event_count += 1;

            for member in shared.tasks.values_mut() {
                if member.slot.is_disposed() {
                    continue;
                }
                let due = match member.next {
                    None => tick.timestamp,
                    Some(next) if next <= tick.timestamp => next,
                    Some(_) => continue,
                };
                let admission = member.slot.admit(due, tick.timestamp);
                member.next = next_due(due, member.interval, tick.timestamp);
                admitted.push((Arc::clone(member.slot.task()), admission));
            }
        }
        tracing::trace!("Tick #{} admitted {} task(s)", tick.index, admitted.len());

        for (task, admission) in admitted {
            invocation::process(self, &task, admission);
        }
    }
}

impl SlotHost for CollectionInner {
    fn host_id(&self) -> u64 {
        self.id
    }

    fn clock(&self) -> &SharedClock {
        &self.clock
    }

    fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    fn context(self: &Arc<Self>) -> TaskContext {
        TaskContext::Collection(TaskCollection {
            inner: Arc::clone(self),
        })
    }

    fn with_slot<R>(
        &self,
        task: &Arc<dyn ScheduledTask>,
        f: impl FnOnce(&mut TaskSlot) -> R,
    ) -> Option<R> {
        let mut shared = self.lock();
        shared
            .tasks
            .get_mut(task.key())
            .filter(|member| invocation::same_task(member.slot.task(), task))
            .map(|member| f(&mut member.slot))
    }

    fn try_purge(&self, task: &Arc<dyn ScheduledTask>) -> bool {
        let mut shared = self.lock();
        let purge = shared.tasks.get(task.key()).is_some_and(|member| {
            invocation::same_task(member.slot.task(), task)
                && member.slot.is_disposed()
                && member.slot.is_drained()
        });
        if purge {
            shared.tasks.remove(task.key());
        }
        purge
    }

    fn record_deferred_failure(&self, failure: DisposalFailure) {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(failure);
    }
}

async fn subscription(inner: Arc<CollectionInner>, mut ticks: BoxStream<'static, Tick>) {
    loop {
        tokio::select! {
            _ = inner.unsubscribe.cancelled() => break,
            tick = ticks.next() => match tick {
                Some(tick) => inner.on_tick(tick),
                None => {
                    tracing::info!("Tick stream ended; disposing collection");
                    let collection = TaskCollection { inner: Arc::clone(&inner) };
                    if let Err(CadenceError::Disposal(failures)) = collection.begin_dispose() {
                        for failure in failures {
                            inner.record_deferred_failure(failure);
                        }
                    }
                    break;
                }
            },
        }
    }
    tracing::debug!("Task collection unsubscribed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::CancellationReason;
    use crate::testing::{Mode, Recorder, wait_until};
    use crate::timer::{PeriodicTimer, TimerOptions};
    use cadence_core::{ManualClock, MonotonicClock};
    use futures::channel::mpsc;

    fn ts(ticks: i64) -> Timestamp {
        Timestamp::from_ticks(ticks)
    }

    fn tick(index: u64, at: i64) -> Tick {
        Tick {
            index,
            timestamp: ts(at),
            elapsed: TimeSpan::ZERO,
        }
    }

    fn clock() -> SharedClock {
        Arc::new(ManualClock::new(ts(0)))
    }

    #[test]
    fn test_next_due_stays_on_grid() {
        assert_eq!(next_due(ts(10), TimeSpan::from_ticks(10), ts(10)), Some(ts(20)));
        assert_eq!(next_due(ts(20), TimeSpan::from_ticks(10), ts(25)), Some(ts(30)));
        assert_eq!(next_due(ts(20), TimeSpan::from_ticks(10), ts(40)), Some(ts(50)));
        assert_eq!(next_due(ts(20), TimeSpan::ZERO, ts(40)), None);
    }

    #[tokio::test]
    async fn test_duplicate_keys_dispose_every_task() {
        let a = Recorder::new("a");
        let b1 = Recorder::new("b");
        let b2 = Recorder::new("b");
        let (_tx, rx) = mpsc::unbounded::<Tick>();

        let err = TaskCollection::register(
            clock(),
            rx,
            vec![
                TickTask::new(a.clone()),
                TickTask::new(b1.clone()),
                TickTask::new(b2.clone()),
            ],
        )
        .unwrap_err();

        assert!(matches!(err, CadenceError::DuplicateKey(ref key) if key == "b"));
        assert_eq!((a.disposals(), b1.disposals(), b2.disposals()), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_rejected_registration_disposes_all_despite_failures() {
        let stubborn = Recorder::new("stubborn").fail_dispose();
        let negative = Recorder::new("negative");
        let after = Recorder::new("after");
        let (_tx, rx) = mpsc::unbounded::<Tick>();

        let err = TaskCollection::register(
            clock(),
            rx,
            vec![
                TickTask::new(stubborn.clone()),
                TickTask::new(negative.clone()).every(TimeSpan::from_ticks(-1)),
                TickTask::new(after.clone()),
            ],
        )
        .unwrap_err();

        assert!(matches!(err, CadenceError::InvalidArgument { name: "interval", .. }));
        assert_eq!(
            (stubborn.disposals(), negative.disposals(), after.disposals()),
            (1, 1, 1)
        );
    }

    #[tokio::test]
    async fn test_terminated_stream_disposes_immediately() {
        let recorder = Recorder::new("late");
        let collection = TaskCollection::register(
            clock(),
            stream::empty(),
            vec![TickTask::new(recorder.clone())],
        )
        .unwrap();

        assert!(collection.is_disposed());
        assert_eq!(recorder.disposals(), 1);
        assert!(collection.task_keys().is_empty());
        collection.dispose().await.unwrap();
        assert_eq!(recorder.disposals(), 1);
    }

    #[tokio::test]
    async fn test_ticks_drive_due_tasks() {
        let paced = Recorder::new("paced");
        let eager = Recorder::new("eager");
        let (tx, rx) = mpsc::unbounded();
        let collection = TaskCollection::register(
            clock(),
            rx,
            vec![
                TickTask::new(paced.clone())
                    .every(TimeSpan::from_ticks(10))
                    .starting_at(ts(10)),
                TickTask::new(eager.clone()),
            ],
        )
        .unwrap();
        assert_eq!(collection.task_keys(), vec!["eager".to_string(), "paced".to_string()]);

        // One tick at a time so no invocation overlaps the next and gets rejected.
        let paced_after = [0, 1, 2, 2];
        for (index, at) in [5, 10, 25, 26].into_iter().enumerate() {
            tx.unbounded_send(tick(index as u64, at)).unwrap();
            wait_until(|| {
                eager.completions().len() == index + 1
                    && paced.completions().len() == paced_after[index]
            })
            .await;
        }
        assert!(eager.completions().iter().all(|c| c.is_successful()));
        assert!(paced.completions().iter().all(|c| c.is_successful()));

        let originals: Vec<_> = paced
            .invocations()
            .iter()
            .map(|p| (p.original_timestamp.ticks(), p.invocation_timestamp.ticks()))
            .collect();
        assert_eq!(originals, vec![(10, 10), (20, 25)]);
        assert_eq!(
            collection.try_get_task_state("paced").unwrap().next_timestamp,
            Some(ts(30))
        );
        assert_eq!(
            collection.statistics(),
            CollectionStatistics {
                first_timestamp: Some(ts(5)),
                last_timestamp: Some(ts(26)),
                event_count: 4,
            }
        );
        let stats = collection.try_get_task_state("eager").unwrap().statistics;
        assert_eq!(stats.total_invocations, 4);
        assert_eq!(stats.completed_invocations, 4);

        collection.dispose().await.unwrap();
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_overflow_rejected_like_scheduler() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let recorder = Recorder::with_mode("busy", Mode::Gate(Arc::clone(&gate)));
        let (tx, rx) = mpsc::unbounded();
        let collection =
            TaskCollection::register(clock(), rx, vec![TickTask::new(recorder.clone())]).unwrap();

        tx.unbounded_send(tick(0, 1)).unwrap();
        wait_until(|| recorder.invocations().len() == 1).await;
        tx.unbounded_send(tick(1, 2)).unwrap();
        wait_until(|| recorder.completions().len() == 1).await;
        assert_eq!(
            recorder.completions()[0].cancellation,
            Some(CancellationReason::MaxQueueSizeLimit)
        );

        gate.add_permits(1);
        wait_until(|| recorder.completions().len() == 2).await;
        collection.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispose_cancels_active_and_unsubscribes() {
        let recorder = Recorder::with_mode("long", Mode::UntilCancelled);
        let other = Recorder::new("other");
        let (tx, rx) = mpsc::unbounded();
        let collection = TaskCollection::register(
            clock(),
            rx,
            vec![TickTask::new(recorder.clone()), TickTask::new(other.clone())],
        )
        .unwrap();

        tx.unbounded_send(tick(0, 1)).unwrap();
        wait_until(|| recorder.invocations().len() == 1).await;

        collection.dispose().await.unwrap();
        assert_eq!(
            recorder.completions()[0].cancellation,
            Some(CancellationReason::TaskDisposed)
        );
        assert_eq!((recorder.disposals(), other.disposals()), (1, 1));
        assert!(collection.is_disposed());
        assert!(collection.task_keys().is_empty());
        assert!(tx.is_closed());
        assert!(!collection.remove("other").unwrap());
    }

    #[tokio::test]
    async fn test_stream_end_disposes_collection() {
        let recorder = Recorder::new("tail");
        let (tx, rx) = mpsc::unbounded();
        let collection =
            TaskCollection::register(clock(), rx, vec![TickTask::new(recorder.clone())]).unwrap();

        tx.unbounded_send(tick(0, 1)).unwrap();
        drop(tx);
        wait_until(|| recorder.disposals() == 1).await;
        assert!(collection.is_disposed());
        assert_eq!(recorder.invocations().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_and_self_dispose() {
        let idle = Recorder::new("idle").fail_dispose();
        let closer = Recorder::with_mode("closer", Mode::DisposeOwner);
        let (tx, rx) = mpsc::unbounded();
        let collection = TaskCollection::register(
            clock(),
            rx,
            vec![TickTask::new(idle.clone()).starting_at(ts(1_000)), TickTask::new(closer.clone())],
        )
        .unwrap();

        let err = collection.remove("idle").unwrap_err();
        assert_eq!(err.disposal_failures().len(), 1);
        assert_eq!(idle.disposals(), 1);
        assert_eq!(collection.task_keys(), vec!["closer".to_string()]);

        tx.unbounded_send(tick(0, 1)).unwrap();
        wait_until(|| closer.disposals() == 1).await;
        assert!(collection.is_disposed());
        assert!(closer.completions()[0].is_successful());
    }

    #[tokio::test(start_paused = true)]
    async fn test_driven_by_periodic_timer() {
        let clock: SharedClock = Arc::new(MonotonicClock::starting_at(Timestamp::EPOCH));
        let timer = PeriodicTimer::with_options(
            Arc::clone(&clock),
            TimerOptions::new(TimeSpan::from_millis(100)).with_count(3),
        )
        .unwrap();
        let recorder = Recorder::new("heartbeat");
        let collection = TaskCollection::register(
            Arc::clone(&clock),
            timer.subscribe(),
            vec![TickTask::new(recorder.clone()).every(TimeSpan::from_millis(100))],
        )
        .unwrap();

        let run = timer.start_async(TimeSpan::ZERO);
        wait_until(|| recorder.disposals() == 1).await;
        assert!(run.await.unwrap());

        assert_eq!(recorder.invocations().len(), 3);
        assert_eq!(collection.statistics().event_count, 3);
        assert!(collection.is_disposed());
    }
}
