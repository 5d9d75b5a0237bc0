//! Task abstraction: what the scheduler and the tick collection run.

use std::fmt;

use async_trait::async_trait;
use cadence_core::{Result, TaskFailure, TimeSpan, Timestamp};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::collection::TaskCollection;
use crate::engine::Scheduler;
use crate::queue::Repetitions;
use crate::stats::TaskStatistics;

/// Why an invocation ended without running to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CancellationReason {
    /// The body observed its cancellation token, or the enqueue hook declined.
    CancellationRequested,
    /// The task's wait queue was full.
    MaxQueueSizeLimit,
    /// The task or its owner was removed or disposed.
    TaskDisposed,
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CancellationRequested => write!(f, "cancellation requested"),
            Self::MaxQueueSizeLimit => write!(f, "max queue size limit"),
            Self::TaskDisposed => write!(f, "task disposed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationParams {
    /// Per-task dispatch order, starting at 1.
    pub invocation_id: u64,
    /// When the invocation became due.
    pub original_timestamp: Timestamp,
    /// When the driver observed it.
    pub invocation_timestamp: Timestamp,
}

/// Outcome record passed to [`ScheduledTask::on_completed`].
#[derive(Debug, Clone)]
pub struct CompletionParams {
    pub invocation: InvocationParams,
    pub elapsed: TimeSpan,
    pub failure: Option<TaskFailure>,
    pub cancellation: Option<CancellationReason>,
}

impl CompletionParams {
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_some()
    }

    pub fn is_successful(&self) -> bool {
        !self.is_failed() && !self.is_cancelled()
    }
}

/// Returned from [`ScheduledTask::invoke`] to report cooperative cancellation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, thiserror::Error)]
#[error("invocation cancelled")]
pub struct Cancelled;

/// A unit of scheduled work.
///
/// Hooks may call back into the owning [`Scheduler`] or [`TaskCollection`]
/// through the [`TaskContext`] they receive. `invoke` may run concurrently
/// with itself up to `max_concurrent_invocations` times.
#[async_trait]
pub trait ScheduledTask: Send + Sync + 'static {
    /// Registration key. Must not change while the task is registered.
    fn key(&self) -> &str;

    /// Clamped to at least 1.
    fn max_concurrent_invocations(&self) -> usize {
        1
    }

    /// Wait-queue length; 0 rejects every invocation that cannot start.
    fn max_enqueued_invocations(&self) -> usize {
        0
    }

    /// Run one invocation. Return [`Cancelled`] (or any error after `cancel`
    /// fired) to report a cancellation instead of a failure.
    async fn invoke(
        &self,
        ctx: TaskContext,
        params: InvocationParams,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;

    /// Called when an invocation joins the wait queue at `position`
    /// (0 = next to run). Returning `false` or an error withdraws it.
    fn on_enqueue(
        &self,
        _ctx: &TaskContext,
        _params: &InvocationParams,
        _position: usize,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }

    /// Errors and panics from this hook are discarded.
    fn on_completed(&self, _ctx: &TaskContext, _completion: &CompletionParams) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called at most once per registration, after the last invocation drained.
    fn dispose(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Handle to the owner of a running task.
#[derive(Clone)]
pub enum TaskContext {
    Scheduler(Scheduler),
    Collection(TaskCollection),
}

impl TaskContext {
    pub fn scheduler(&self) -> Option<&Scheduler> {
        match self {
            Self::Scheduler(scheduler) => Some(scheduler),
            Self::Collection(_) => None,
        }
    }

    pub fn collection(&self) -> Option<&TaskCollection> {
        match self {
            Self::Scheduler(_) => None,
            Self::Collection(collection) => Some(collection),
        }
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        match self {
            Self::Scheduler(scheduler) => scheduler.remove(key),
            Self::Collection(collection) => collection.remove(key),
        }
    }

    pub fn try_get_task_state(&self, key: &str) -> Option<TaskState> {
        match self {
            Self::Scheduler(scheduler) => scheduler.try_get_task_state(key),
            Self::Collection(collection) => collection.try_get_task_state(key),
        }
    }

    pub fn begin_dispose(&self) -> Result<()> {
        match self {
            Self::Scheduler(scheduler) => scheduler.begin_dispose(),
            Self::Collection(collection) => collection.begin_dispose(),
        }
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduler(_) => f.write_str("TaskContext::Scheduler"),
            Self::Collection(_) => f.write_str("TaskContext::Collection"),
        }
    }
}

/// Point-in-time view of a registered task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskState {
    pub key: String,
    pub next_timestamp: Option<Timestamp>,
    pub interval: TimeSpan,
    pub repetitions: Repetitions,
    pub max_concurrent_invocations: usize,
    pub max_enqueued_invocations: usize,
    /// Removed or exhausted, waiting for in-flight invocations to drain.
    pub is_disposed: bool,
    pub statistics: TaskStatistics,
}
