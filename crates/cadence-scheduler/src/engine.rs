//! Scheduler Engine: owns the event queue and the dispatch loop.
//!
//! The loop peeks the earliest entry, waits on the clock (bounded by
//! `max_idle_wait`) and, once something is due, advances the queue to "now"
//! and hands every dequeued invocation to its task's admission state.
//! One mutex guards the queue, the registrations and their statistics; it is
//! never held across an await or while task code runs.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cadence_core::{
    CadenceError, DisposalFailure, Result, SchedulerConfig, SharedClock, TimeSpan, Timestamp,
    disposal_result,
};
use serde::Serialize;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::admission::{DisposalCause, Lifecycle, TaskSlot};
use crate::invocation::{self, SlotHost, Withdrawn};
use crate::queue::Repetitions;
use crate::reorderable::ReorderableEventQueue;
use crate::task::{ScheduledTask, TaskContext, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    /// Accepting registrations; the loop has not started.
    Created,
    Running,
    /// Terminal.
    Disposed,
}

/// Cloneable handle to a scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    clock: SharedClock,
    config: SchedulerConfig,
    shared: Mutex<Shared>,
    wake: Notify,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    deferred: Mutex<Vec<DisposalFailure>>,
}

struct Shared {
    state: SchedulerState,
    queue: ReorderableEventQueue<String>,
    tasks: HashMap<String, Registration>,
}

struct Registration {
    slot: TaskSlot,
    next_timestamp: Option<Timestamp>,
    interval: TimeSpan,
    repetitions: Repetitions,
}

impl Registration {
    fn snapshot(&self, key: &str) -> TaskState {
        TaskState {
            key: key.to_string(),
            next_timestamp: self.next_timestamp,
            interval: self.interval,
            repetitions: self.repetitions,
            max_concurrent_invocations: self.slot.max_concurrent(),
            max_enqueued_invocations: self.slot.max_enqueued(),
            is_disposed: self.slot.is_disposed(),
            statistics: self.slot.stats().clone(),
        }
    }
}

impl Scheduler {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_config(clock, SchedulerConfig::default())
    }

    pub fn with_config(clock: SharedClock, config: SchedulerConfig) -> Self {
        let start = clock.now();
        Self {
            inner: Arc::new(Inner {
                id: invocation::next_host_id(),
                clock,
                config,
                shared: Mutex::new(Shared {
                    state: SchedulerState::Created,
                    queue: ReorderableEventQueue::new(start),
                    tasks: HashMap::new(),
                }),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                deferred: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.lock().state
    }

    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    // ── Lifecycle ──────────────────────────────────────────

    /// Run the dispatch loop on the calling thread until the scheduler is
    /// disposed. Inside a current-thread runtime the loop gets a dedicated
    /// thread, since `block_in_place` is unavailable there.
    pub fn start(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                if let Some(dispatch) = self.begin_running() {
                    tokio::task::block_in_place(|| handle.block_on(dispatch));
                }
            }
            Ok(_) => std::thread::scope(|scope| {
                if scope.spawn(|| self.run_blocking()).join().is_err() {
                    tracing::error!("Scheduler loop thread panicked");
                }
            }),
            Err(_) => self.run_blocking(),
        }
    }

    /// Drive the loop on a fresh current-thread runtime. The state only
    /// moves to `Running` once the runtime exists.
    fn run_blocking(&self) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!("Failed to build scheduler runtime: {e}");
                return;
            }
        };
        if let Some(dispatch) = self.begin_running() {
            runtime.block_on(dispatch);
        }
    }

    /// Spawn the dispatch loop on the current runtime. The handle completes
    /// when the scheduler is disposed (immediately if it was not `Created`).
    pub fn start_async(&self) -> JoinHandle<()> {
        self.start_on(&tokio::runtime::Handle::current())
    }

    pub fn start_on(&self, handle: &tokio::runtime::Handle) -> JoinHandle<()> {
        match self.begin_running() {
            Some(dispatch) => handle.spawn(dispatch),
            None => handle.spawn(async {}),
        }
    }

    fn begin_running(&self) -> Option<impl Future<Output = ()> + Send + 'static> {
        let mut shared = self.inner.lock();
        if shared.state != SchedulerState::Created {
            return None;
        }
        shared.state = SchedulerState::Running;
        Some(dispatch_loop(Arc::clone(&self.inner)))
    }

    // ── Registration ───────────────────────────────────────

    /// Register `task` to run `repetitions` times, first at `next`, then every
    /// `interval`. Returns `Ok(false)` if disposed or the key belongs to a
    /// different task instance; re-registering the same instance reschedules
    /// it and keeps its statistics.
    pub fn schedule(
        &self,
        task: Arc<dyn ScheduledTask>,
        next: Timestamp,
        interval: TimeSpan,
        repetitions: u64,
    ) -> Result<bool> {
        if repetitions == 0 {
            return Err(CadenceError::invalid("repetitions", "must be >= 1"));
        }
        self.register(task, next, interval, Repetitions::Finite(repetitions))
    }

    /// Register `task` to repeat every `interval` (at least one tick) until removed.
    pub fn schedule_infinite(
        &self,
        task: Arc<dyn ScheduledTask>,
        next: Timestamp,
        interval: TimeSpan,
    ) -> Result<bool> {
        self.register(task, next, interval, Repetitions::Infinite)
    }

    fn register(
        &self,
        task: Arc<dyn ScheduledTask>,
        next: Timestamp,
        interval: TimeSpan,
        repetitions: Repetitions,
    ) -> Result<bool> {
        if interval.is_negative() {
            return Err(CadenceError::invalid("interval", "must not be negative"));
        }
        // A zero interval would re-dispatch the same instant forever.
        if repetitions.is_infinite() && interval < TimeSpan::TICK {
            return Err(CadenceError::invalid(
                "interval",
                "infinite schedules need at least one tick",
            ));
        }
        let key = task.key().to_string();
        {
            let mut guard = self.inner.lock();
            let shared = &mut *guard;
            if shared.state == SchedulerState::Disposed {
                return Ok(false);
            }

            let delay = next - shared.queue.current_point();
            match shared.tasks.get_mut(&key) {
                Some(reg) if !invocation::same_task(reg.slot.task(), &task) => {
                    tracing::warn!("⚠️ Key '{key}' already belongs to another task");
                    return Ok(false);
                }
                Some(reg) => {
                    reg.slot.revive();
                    reg.next_timestamp = Some(next);
                    reg.interval = interval;
                    reg.repetitions = repetitions;
                }
                None => {
                    shared.tasks.insert(
                        key.clone(),
                        Registration {
                            slot: TaskSlot::new(task),
                            next_timestamp: Some(next),
                            interval,
                            repetitions,
                        },
                    );
                }
            }
            shared
                .queue
                .enqueue_with(key.clone(), delay, interval, repetitions)?;
        }
        self.inner.wake.notify_one();
        tracing::info!("📅 Task scheduled: '{key}' at {next} (every {interval}, {repetitions:?})");
        Ok(true)
    }

    /// Change the repeat interval of a live registration.
    pub fn set_interval(&self, key: &str, interval: TimeSpan) -> Result<bool> {
        if interval < TimeSpan::TICK {
            return Err(CadenceError::invalid("interval", "must be at least one tick"));
        }
        self.mutate(key, |shared, key| {
            let Some(reg) = live_registration(&mut shared.tasks, key) else {
                return Ok(false);
            };
            let current = reg.interval;
            reg.interval = interval;
            shared.queue.increase_delta(&key.to_string(), interval - current)?;
            Ok(true)
        })
    }

    /// Replace the remaining repetition count of a live registration.
    pub fn set_repetitions(&self, key: &str, repetitions: u64) -> Result<bool> {
        if repetitions == 0 {
            return Err(CadenceError::invalid("repetitions", "must be >= 1"));
        }
        self.update_repetitions(key, Repetitions::Finite(repetitions))
    }

    /// Repeat a live registration forever; its interval must be non-zero.
    pub fn make_infinite(&self, key: &str) -> Result<bool> {
        self.update_repetitions(key, Repetitions::Infinite)
    }

    fn update_repetitions(&self, key: &str, repetitions: Repetitions) -> Result<bool> {
        self.mutate(key, |shared, key| {
            let Some(reg) = live_registration(&mut shared.tasks, key) else {
                return Ok(false);
            };
            if repetitions.is_infinite() && reg.interval < TimeSpan::TICK {
                return Err(CadenceError::invalid(
                    "repetitions",
                    format!("'{key}' has a zero interval and cannot repeat forever"),
                ));
            }
            reg.repetitions = repetitions;
            shared.queue.set_repetitions(&key.to_string(), repetitions)?;
            Ok(true)
        })
    }

    /// Move the next due timestamp of a live registration.
    pub fn set_next_timestamp(&self, key: &str, next: Timestamp) -> Result<bool> {
        let changed = self.mutate(key, |shared, key| {
            let Some(reg) = live_registration(&mut shared.tasks, key) else {
                return Ok(false);
            };
            reg.next_timestamp = Some(next);
            shared.queue.set_dequeue_point(&key.to_string(), next);
            Ok(true)
        })?;
        if changed {
            self.inner.wake.notify_one();
        }
        Ok(changed)
    }

    fn mutate(
        &self,
        key: &str,
        f: impl FnOnce(&mut Shared, &str) -> Result<bool>,
    ) -> Result<bool> {
        let mut shared = self.inner.lock();
        if shared.state == SchedulerState::Disposed {
            return Ok(false);
        }
        f(&mut *shared, key)
    }

    /// Remove a task. Disposal happens now if nothing is in flight, otherwise
    /// once the last active invocation completes.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let withdrawn = {
            let mut guard = self.inner.lock();
            let shared = &mut *guard;
            if shared.state == SchedulerState::Disposed {
                return Ok(false);
            }
            let Some(reg) = shared.tasks.get_mut(key) else {
                return Ok(false);
            };
            if reg.slot.lifecycle() == Lifecycle::PendingDisposal(DisposalCause::Removed) {
                return Ok(false);
            }
            let completions = reg.slot.mark_pending_disposal(DisposalCause::Removed);
            reg.next_timestamp = None;
            shared.queue.remove(&key.to_string());
            (Arc::clone(reg.slot.task()), completions)
        };
        tracing::info!("🗑️ Task removed: '{key}'");
        disposal_result(invocation::settle(&self.inner, vec![withdrawn]))?;
        Ok(true)
    }

    /// Remove every task.
    pub fn clear(&self) -> Result<()> {
        let withdrawn = {
            let mut shared = self.inner.lock();
            if shared.state == SchedulerState::Disposed {
                return Ok(());
            }
            shared.withdraw_all()
        };
        disposal_result(invocation::settle(&self.inner, withdrawn))
    }

    /// Mark the scheduler disposed, cancel active invocations and dispose every
    /// idle task. Safe to call from task hooks; does not wait.
    pub fn begin_dispose(&self) -> Result<()> {
        let withdrawn = {
            let mut shared = self.inner.lock();
            if shared.state == SchedulerState::Disposed {
                return Ok(());
            }
            shared.state = SchedulerState::Disposed;
            shared.withdraw_all()
        };
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.wake.notify_one();
        tracing::info!("🛑 Scheduler disposing ({} task(s))", withdrawn.len());
        disposal_result(invocation::settle(&self.inner, withdrawn))
    }

    /// Dispose and wait for every active invocation to finish. From inside one
    /// of this scheduler's own invocations the wait is skipped.
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

    // ── Snapshots ──────────────────────────────────────────

    pub fn try_get_task_state(&self, key: &str) -> Option<TaskState> {
        let shared = self.inner.lock();
        shared.tasks.get(key).map(|reg| reg.snapshot(key))
    }

    /// Registered keys, including tasks still draining after removal.
    pub fn task_keys(&self) -> Vec<String> {
        let shared = self.inner.lock();
        let mut keys: Vec<_> = shared.tasks.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Disposal failures of tasks that drained after their removal returned.
    pub fn take_deferred_failures(&self) -> Vec<DisposalFailure> {
        self.inner.take_deferred()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.lock();
        f.debug_struct("Scheduler")
            .field("state", &shared.state)
            .field("tasks", &shared.tasks.len())
            .field("current_point", &shared.queue.current_point())
            .finish()
    }
}

fn live_registration<'a>(
    tasks: &'a mut HashMap<String, Registration>,
    key: &str,
) -> Option<&'a mut Registration> {
    tasks.get_mut(key).filter(|reg| !reg.slot.is_disposed())
}

impl Shared {
    fn withdraw_all(&mut self) -> Vec<Withdrawn> {
        self.queue.clear();
        self.tasks
            .values_mut()
            .map(|reg| {
                reg.next_timestamp = None;
                let completions = reg.slot.mark_pending_disposal(DisposalCause::Removed);
                (Arc::clone(reg.slot.task()), completions)
            })
            .collect()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_deferred(&self) -> Vec<DisposalFailure> {
        std::mem::take(&mut *self.deferred.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Advance the queue to `now` and admit everything that became due.
    fn dispatch_due(self: &Arc<Self>, now: Timestamp) {
        let mut admitted = Vec::new();
        {
            let mut guard = self.lock();
            let shared = &mut *guard;
            if shared.state != SchedulerState::Running {
                return;
            }
            let point = now.max(shared.queue.current_point());
            let dispatched = match shared.queue.advance_to(point) {
                Ok(dispatched) => dispatched,
                Err(e) => {
                    tracing::error!("Scheduler queue rejected advance: {e}");
                    return;
                }
            };
            for dispatch in dispatched {
                let Some(reg) = shared.tasks.get_mut(&dispatch.entry.key) else {
                    continue;
                };
                reg.repetitions = dispatch.remaining();
                reg.next_timestamp = dispatch.next_due;
                let admission = reg.slot.admit(dispatch.entry.due, now);
                if dispatch.next_due.is_none() {
                    reg.slot.mark_pending_disposal(DisposalCause::Exhausted);
                }
                tracing::debug!(
                    "⏰ Task '{}' due at {} (next: {:?})",
                    dispatch.entry.key,
                    dispatch.entry.due,
                    dispatch.next_due
                );
                admitted.push((Arc::clone(reg.slot.task()), admission));
            }
        }

        for (task, admission) in admitted {
            invocation::process(self, &task, admission);
            invocation::finalize_if_drained(self, &task);
        }
    }
}

impl SlotHost for Inner {
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
        TaskContext::Scheduler(Scheduler {
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
            .filter(|reg| invocation::same_task(reg.slot.task(), task))
            .map(|reg| f(&mut reg.slot))
    }

    fn try_purge(&self, task: &Arc<dyn ScheduledTask>) -> bool {
        let mut shared = self.lock();
        let key = task.key();
        let purge = shared.tasks.get(key).is_some_and(|reg| {
            invocation::same_task(reg.slot.task(), task)
                && reg.slot.is_disposed()
                && reg.slot.is_drained()
        });
        if purge {
            shared.tasks.remove(key);
            shared.queue.remove(&key.to_string());
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

async fn dispatch_loop(inner: Arc<Inner>) {
    tracing::info!("⏰ Scheduler started");
    let max_idle = inner.config.max_idle_wait().max(TimeSpan::from_millis(1));

    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }
        let now = inner.clock.now();
        let next_due = inner.lock().queue.peek().map(|entry| entry.due);

        if next_due.is_some_and(|due| due <= now) {
            inner.dispatch_due(now);
            tokio::task::yield_now().await;
            continue;
        }

        let wait = next_due.map_or(max_idle, |due| (due - now).min(max_idle));
        let woken = inner.wake.notified();
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = woken => {}
            _ = inner.clock.sleep(wait) => {}
        }
    }

    inner.tracker.wait().await;
    tracing::info!("Scheduler loop stopped");
}
