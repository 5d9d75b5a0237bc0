//! Running invocations and hooks on behalf of a slot host (the scheduler or a
//! tick collection).
//!
//! Everything here runs without the host's lock held: slot state is only
//! touched through [`SlotHost::with_slot`], and task code is always wrapped so
//! a panic or error ends up in a completion record instead of unwinding into
//! the host.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cadence_core::{DisposalFailure, SharedClock, TaskFailure};
use futures::FutureExt;
use tokio_util::task::TaskTracker;

use crate::admission::{Admission, Launch, Outcome, TaskSlot};
use crate::task::{Cancelled, CompletionParams, ScheduledTask, TaskContext};

tokio::task_local! {
    /// Id of the host whose invocation is running on the current Tokio task.
    static CURRENT_HOST: u64;
}

static NEXT_HOST_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_host_id() -> u64 {
    NEXT_HOST_ID.fetch_add(1, Ordering::Relaxed)
}

/// True when called from inside one of `host_id`'s own invocations or hooks.
pub(crate) fn inside_host(host_id: u64) -> bool {
    CURRENT_HOST.try_with(|id| *id == host_id).unwrap_or(false)
}

/// Compare task identity by data pointer.
pub(crate) fn same_task(a: &Arc<dyn ScheduledTask>, b: &Arc<dyn ScheduledTask>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// A task and the completions of invocations withdrawn from it under the lock.
pub(crate) type Withdrawn = (Arc<dyn ScheduledTask>, Vec<CompletionParams>);

/// Owner of task slots.
pub(crate) trait SlotHost: Send + Sync + Sized + 'static {
    fn host_id(&self) -> u64;

    fn clock(&self) -> &SharedClock;

    fn tracker(&self) -> &TaskTracker;

    fn context(self: &Arc<Self>) -> TaskContext;

    /// Run `f` on `task`'s slot under the host lock, if the slot still
    /// belongs to that task instance.
    fn with_slot<R>(
        &self,
        task: &Arc<dyn ScheduledTask>,
        f: impl FnOnce(&mut TaskSlot) -> R,
    ) -> Option<R>;

    /// Drop the slot if it is pending disposal and drained. Returns whether
    /// the caller now owns the task's disposal.
    fn try_purge(&self, task: &Arc<dyn ScheduledTask>) -> bool;

    /// A disposal that failed after the triggering call had already returned.
    fn record_deferred_failure(&self, failure: DisposalFailure);
}

/// Act on an admission decision made under the host lock.
pub(crate) fn process<H: SlotHost>(host: &Arc<H>, task: &Arc<dyn ScheduledTask>, admission: Admission) {
    match admission {
        Admission::Launch(launch) => launch_invocation(host, task, launch),
        Admission::Enqueued { params, position } => {
            let ctx = host.context();
            let accepted = match catch_unwind(AssertUnwindSafe(|| {
                task.on_enqueue(&ctx, &params, position)
            })) {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(e)) => {
                    tracing::warn!("⚠️ on_enqueue for '{}' failed: {e:#}", task.key());
                    false
                }
                Err(payload) => {
                    let failure = TaskFailure::from_panic(payload);
                    tracing::warn!("⚠️ on_enqueue for '{}' {failure}", task.key());
                    false
                }
            };
            tracing::debug!(
                "Task '{}' invocation #{} enqueued at {position} (accepted: {accepted})",
                task.key(),
                params.invocation_id
            );

            let resolved = host.with_slot(task, |slot| {
                slot.resolve_enqueue(params.invocation_id, accepted)
            });
            if let Some((withdrawn, launches)) = resolved {
                for launch in launches {
                    launch_invocation(host, task, launch);
                }
                if let Some(completion) = withdrawn {
                    complete(host, task, completion);
                }
            }
        }
        Admission::Rejected(completion) => {
            tracing::debug!(
                "Task '{}' invocation #{} rejected: {:?}",
                task.key(),
                completion.invocation.invocation_id,
                completion.cancellation
            );
            complete(host, task, completion);
        }
    }
}

pub(crate) fn launch_invocation<H: SlotHost>(
    host: &Arc<H>,
    task: &Arc<dyn ScheduledTask>,
    launch: Launch,
) {
    let host_id = host.host_id();
    let host = Arc::clone(host);
    let task = Arc::clone(task);
    let tracker = host.tracker().clone();
    tracker.spawn(CURRENT_HOST.scope(host_id, run(host, task, launch)));
}

async fn run<H: SlotHost>(host: Arc<H>, task: Arc<dyn ScheduledTask>, launch: Launch) {
    let Launch { params, cancel } = launch;
    let clock = Arc::clone(host.clock());
    let ctx = host.context();
    let started = clock.now();
    tracing::debug!("▶️ Task '{}' invocation #{} started", task.key(), params.invocation_id);

    let result = AssertUnwindSafe(task.invoke(ctx, params, cancel.clone()))
        .catch_unwind()
        .await;
    let elapsed = clock.now() - started;

    let outcome = match result {
        Ok(Ok(())) => Outcome::Succeeded,
        Ok(Err(e)) if e.downcast_ref::<Cancelled>().is_some() || cancel.is_cancelled() => {
            Outcome::Cancelled
        }
        Ok(Err(e)) => {
            tracing::warn!("❌ Task '{}' invocation #{} failed: {e:#}", task.key(), params.invocation_id);
            Outcome::Failed(e.into())
        }
        Err(payload) => {
            let failure = TaskFailure::from_panic(payload);
            tracing::warn!("❌ Task '{}' invocation #{} {failure}", task.key(), params.invocation_id);
            Outcome::Failed(failure)
        }
    };

    let finished = host.with_slot(&task, |slot| slot.finish(params.invocation_id, elapsed, outcome));
    let Some((completion, launches)) = finished.flatten() else {
        return;
    };
    for launch in launches {
        launch_invocation(&host, &task, launch);
    }
    complete(&host, &task, completion);
}

/// Run the completion hook, then dispose the task if that drained it.
pub(crate) fn complete<H: SlotHost>(
    host: &Arc<H>,
    task: &Arc<dyn ScheduledTask>,
    completion: CompletionParams,
) {
    run_completion_hook(host, task, &completion);
    finalize_if_drained(host, task);
}

/// Run the completion hook and mark it done, without finalizing.
pub(crate) fn run_completion_hook<H: SlotHost>(
    host: &Arc<H>,
    task: &Arc<dyn ScheduledTask>,
    completion: &CompletionParams,
) {
    let ctx = host.context();
    match catch_unwind(AssertUnwindSafe(|| task.on_completed(&ctx, completion))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("on_completed for '{}' failed: {e:#}", task.key()),
        Err(payload) => tracing::debug!(
            "on_completed for '{}' {}",
            task.key(),
            TaskFailure::from_panic(payload)
        ),
    }
    host.with_slot(task, |slot| slot.hook_done());
}

/// Complete withdrawn invocations, then dispose whichever tasks drained.
/// Failures are returned to the caller rather than deferred.
pub(crate) fn settle<H: SlotHost>(host: &Arc<H>, withdrawn: Vec<Withdrawn>) -> Vec<DisposalFailure> {
    let mut failures = Vec::new();
    for (task, completions) in withdrawn {
        for completion in &completions {
            run_completion_hook(host, &task, completion);
        }
        if host.try_purge(&task) {
            if let Err(failure) = dispose_task(&task) {
                failures.push(failure);
            }
        }
    }
    failures
}

pub(crate) fn finalize_if_drained<H: SlotHost>(host: &Arc<H>, task: &Arc<dyn ScheduledTask>) {
    if host.try_purge(task) {
        if let Err(failure) = dispose_task(task) {
            host.record_deferred_failure(failure);
        }
    }
}

/// Call the task's dispose hook, capturing errors and panics.
pub(crate) fn dispose_task(task: &Arc<dyn ScheduledTask>) -> Result<(), DisposalFailure> {
    let failure = match catch_unwind(AssertUnwindSafe(|| task.dispose())) {
        Ok(Ok(())) => {
            tracing::debug!("🗑️ Task '{}' disposed", task.key());
            return Ok(());
        }
        Ok(Err(e)) => TaskFailure::from(e),
        Err(payload) => TaskFailure::from_panic(payload),
    };
    tracing::warn!("⚠️ Task '{}' failed to dispose: {failure}", task.key());
    Err(DisposalFailure {
        key: task.key().to_string(),
        failure,
    })
}
