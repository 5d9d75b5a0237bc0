//! Per-task admission state: decides run now / wait / reject for every due
//! invocation and keeps the task's statistics in step.
//!
//! A slot is only ever touched under its owner's lock. Hooks run outside the
//! lock, so the slot counts them as in flight until the owner reports back.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use cadence_core::{TaskFailure, TimeSpan, Timestamp};
use tokio_util::sync::CancellationToken;

use crate::stats::TaskStatistics;
use crate::task::{CancellationReason, CompletionParams, InvocationParams, ScheduledTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DisposalCause {
    /// Last repetition dispatched; in-flight and waiting work still runs.
    Exhausted,
    /// Removed or owner disposed; running work is cancelled, waiting work dropped.
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Active,
    PendingDisposal(DisposalCause),
}

/// An invocation allowed to start.
pub(crate) struct Launch {
    pub params: InvocationParams,
    pub cancel: CancellationToken,
}

pub(crate) enum Admission {
    Launch(Launch),
    /// Waiting at `position`; the enqueue hook must be consulted.
    Enqueued {
        params: InvocationParams,
        position: usize,
    },
    /// Completed without running.
    Rejected(CompletionParams),
}

pub(crate) enum Outcome {
    Succeeded,
    Failed(TaskFailure),
    Cancelled,
}

struct Running {
    params: InvocationParams,
    /// Cancelled because the task was removed or its owner disposed.
    disposed: bool,
}

struct Waiting {
    params: InvocationParams,
    /// Set once the enqueue hook accepted the invocation.
    approved: bool,
}

pub(crate) struct TaskSlot {
    task: Arc<dyn ScheduledTask>,
    lifecycle: Lifecycle,
    next_invocation_id: u64,
    cancel_root: CancellationToken,
    running: HashMap<u64, Running>,
    waiting: VecDeque<Waiting>,
    pending_hooks: usize,
    stats: TaskStatistics,
}

impl TaskSlot {
    pub(crate) fn new(task: Arc<dyn ScheduledTask>) -> Self {
        Self {
            task,
            lifecycle: Lifecycle::Active,
            next_invocation_id: 1,
            cancel_root: CancellationToken::new(),
            running: HashMap::new(),
            waiting: VecDeque::new(),
            pending_hooks: 0,
            stats: TaskStatistics::default(),
        }
    }

    pub(crate) fn task(&self) -> &Arc<dyn ScheduledTask> {
        &self.task
    }

    pub(crate) fn stats(&self) -> &TaskStatistics {
        &self.stats
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.lifecycle != Lifecycle::Active
    }

    pub(crate) fn max_concurrent(&self) -> usize {
        self.task.max_concurrent_invocations().max(1)
    }

    pub(crate) fn max_enqueued(&self) -> usize {
        self.task.max_enqueued_invocations()
    }

    /// Nothing running, waiting, or inside a hook.
    pub(crate) fn is_drained(&self) -> bool {
        self.running.is_empty() && self.waiting.is_empty() && self.pending_hooks == 0
    }

    /// Admit a newly due invocation.
    pub(crate) fn admit(&mut self, original: Timestamp, now: Timestamp) -> Admission {
        let params = InvocationParams {
            invocation_id: self.next_invocation_id,
            original_timestamp: original,
            invocation_timestamp: now,
        };
        self.next_invocation_id += 1;
        self.stats.record_due(now);

        if self.waiting.is_empty() && self.has_capacity() {
            return Admission::Launch(self.start(params));
        }
        if self.waiting.len() < self.max_enqueued() {
            self.waiting.push_back(Waiting {
                params,
                approved: false,
            });
            self.stats.record_enqueued();
            return Admission::Enqueued {
                params,
                position: self.waiting.len() - 1,
            };
        }
        self.stats.record_skipped();
        Admission::Rejected(self.skipped(params, CancellationReason::MaxQueueSizeLimit))
    }

    /// Apply the enqueue hook's verdict. Returns the withdrawn invocation's
    /// completion (if declined) and whatever can start now.
    pub(crate) fn resolve_enqueue(
        &mut self,
        invocation_id: u64,
        accepted: bool,
    ) -> (Option<CompletionParams>, Vec<Launch>) {
        let Some(index) = self
            .waiting
            .iter()
            .position(|w| w.params.invocation_id == invocation_id)
        else {
            return (None, Vec::new());
        };

        let withdrawn = if accepted {
            self.waiting[index].approved = true;
            None
        } else {
            self.waiting.remove(index).map(|w| {
                self.stats.record_dequeued();
                self.stats.record_skipped();
                self.skipped(w.params, CancellationReason::CancellationRequested)
            })
        };
        (withdrawn, self.promote())
    }

    /// Record a finished body. The completion hook is counted as pending.
    pub(crate) fn finish(
        &mut self,
        invocation_id: u64,
        elapsed: TimeSpan,
        outcome: Outcome,
    ) -> Option<(CompletionParams, Vec<Launch>)> {
        let Running { params: invocation, disposed } = self.running.remove(&invocation_id)?;

        let (failure, cancellation) = match outcome {
            Outcome::Succeeded => (None, None),
            Outcome::Failed(failure) => (Some(failure), None),
            Outcome::Cancelled if disposed => (None, Some(CancellationReason::TaskDisposed)),
            Outcome::Cancelled => (None, Some(CancellationReason::CancellationRequested)),
        };
        self.stats
            .record_finished(elapsed, failure.is_some(), cancellation);
        self.pending_hooks += 1;

        let completion = CompletionParams {
            invocation,
            elapsed,
            failure,
            cancellation,
        };
        Some((completion, self.promote()))
    }

    pub(crate) fn hook_done(&mut self) {
        self.pending_hooks = self.pending_hooks.saturating_sub(1);
    }

    /// Flag the slot for disposal. `Removed` cancels running invocations and
    /// withdraws waiting ones, returning their completions.
    pub(crate) fn mark_pending_disposal(&mut self, cause: DisposalCause) -> Vec<CompletionParams> {
        if self.lifecycle == Lifecycle::PendingDisposal(DisposalCause::Removed) {
            return Vec::new();
        }
        self.lifecycle = Lifecycle::PendingDisposal(cause);
        if cause == DisposalCause::Exhausted {
            return Vec::new();
        }

        self.cancel_root.cancel();
        for running in self.running.values_mut() {
            running.disposed = true;
        }
        let withdrawn: Vec<_> = self.waiting.drain(..).map(|w| w.params).collect();
        withdrawn
            .into_iter()
            .map(|params| {
                self.stats.record_dequeued();
                self.stats.record_skipped();
                self.skipped(params, CancellationReason::TaskDisposed)
            })
            .collect()
    }

    /// Undo a pending disposal after the same task was scheduled again.
    pub(crate) fn revive(&mut self) {
        if self.lifecycle == Lifecycle::PendingDisposal(DisposalCause::Removed) {
            self.cancel_root = CancellationToken::new();
        }
        self.lifecycle = Lifecycle::Active;
    }

    fn has_capacity(&self) -> bool {
        (self.stats.active_invocations as usize) < self.max_concurrent()
    }

    fn start(&mut self, params: InvocationParams) -> Launch {
        let cancel = self.cancel_root.child_token();
        self.running.insert(
            params.invocation_id,
            Running {
                params,
                disposed: false,
            },
        );
        self.stats.record_started();
        Launch { params, cancel }
    }

    fn promote(&mut self) -> Vec<Launch> {
        let mut launches = Vec::new();
        while self.has_capacity() && self.waiting.front().is_some_and(|w| w.approved) {
            let Some(next) = self.waiting.pop_front() else { break };
            self.stats.record_dequeued();
            launches.push(self.start(next.params));
        }
        launches
    }

    fn skipped(&mut self, params: InvocationParams, reason: CancellationReason) -> CompletionParams {
        self.pending_hooks += 1;
        CompletionParams {
            invocation: params,
            elapsed: TimeSpan::ZERO,
            failure: None,
            cancellation: Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskContext;
    use async_trait::async_trait;

    struct Limits {
        concurrent: usize,
        enqueued: usize,
    }

    #[async_trait]
    impl ScheduledTask for Limits {
        fn key(&self) -> &str {
            "limits"
        }

        fn max_concurrent_invocations(&self) -> usize {
            self.concurrent
        }

        fn max_enqueued_invocations(&self) -> usize {
            self.enqueued
        }

        async fn invoke(
            &self,
            _ctx: TaskContext,
            _params: InvocationParams,
            _cancel: CancellationToken,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn slot(concurrent: usize, enqueued: usize) -> TaskSlot {
        TaskSlot::new(Arc::new(Limits {
            concurrent,
            enqueued,
        }))
    }

    fn at(ticks: i64) -> Timestamp {
        Timestamp::from_ticks(ticks)
    }

    fn launched(admission: Admission) -> Launch {
        match admission {
            Admission::Launch(launch) => launch,
            _ => panic!("expected launch"),
        }
    }

    #[test]
    fn test_rejects_beyond_concurrency_without_queue() {
        let mut slot = slot(2, 0);
        let first = launched(slot.admit(at(1), at(1)));
        let second = launched(slot.admit(at(2), at(2)));
        assert_eq!((first.params.invocation_id, second.params.invocation_id), (1, 2));

        match slot.admit(at(3), at(3)) {
            Admission::Rejected(completion) => {
                assert_eq!(completion.invocation.invocation_id, 3);
                assert_eq!(
                    completion.cancellation,
                    Some(CancellationReason::MaxQueueSizeLimit)
                );
            }
            _ => panic!("expected rejection"),
        }
        assert_eq!(slot.stats().total_invocations, 3);
        assert_eq!(slot.stats().skipped_invocations, 1);
        assert_eq!(slot.stats().active_invocations, 2);
        assert_eq!(slot.stats().max_active_invocations, 2);
    }

    #[test]
    fn test_waiting_invocations_promote_in_fifo_order() {
        let mut slot = slot(1, 2);
        let running = launched(slot.admit(at(1), at(1)));

        let mut waiting = Vec::new();
        for t in 2..=3 {
            match slot.admit(at(t), at(t)) {
                Admission::Enqueued { params, position } => {
                    assert_eq!(position as i64, t - 2);
                    waiting.push(params.invocation_id);
                }
                _ => panic!("expected enqueue"),
            }
        }
        assert!(matches!(slot.admit(at(4), at(4)), Admission::Rejected(_)));
        assert_eq!(slot.stats().max_queued_invocations, 2);

        for id in &waiting {
            let (withdrawn, launches) = slot.resolve_enqueue(*id, true);
            assert!(withdrawn.is_none());
            assert!(launches.is_empty());
        }

        let (completion, launches) = slot
            .finish(running.params.invocation_id, TimeSpan::from_ticks(5), Outcome::Succeeded)
            .unwrap();
        assert!(completion.is_successful());
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].params.invocation_id, waiting[0]);
        assert_eq!(slot.stats().queued_invocations, 1);
        assert_eq!(slot.stats().delayed_invocations, 2);
        assert!(!slot.is_drained());
    }

    #[test]
    fn test_declined_enqueue_is_withdrawn() {
        let mut slot = slot(1, 1);
        let running = launched(slot.admit(at(1), at(1)));
        let Admission::Enqueued { params, .. } = slot.admit(at(2), at(2)) else {
            panic!("expected enqueue");
        };

        let (withdrawn, launches) = slot.resolve_enqueue(params.invocation_id, false);
        let withdrawn = withdrawn.unwrap();
        assert_eq!(
            withdrawn.cancellation,
            Some(CancellationReason::CancellationRequested)
        );
        assert!(launches.is_empty());
        assert_eq!(slot.stats().queued_invocations, 0);
        assert_eq!(slot.stats().skipped_invocations, 1);

        slot.hook_done();
        slot.finish(running.params.invocation_id, TimeSpan::ZERO, Outcome::Succeeded)
            .unwrap();
        slot.hook_done();
        assert!(slot.is_drained());
    }

    #[test]
    fn test_unapproved_head_blocks_promotion_until_resolved() {
        let mut slot = slot(1, 1);
        let running = launched(slot.admit(at(1), at(1)));
        let Admission::Enqueued { params, .. } = slot.admit(at(2), at(2)) else {
            panic!("expected enqueue");
        };

        let (_, launches) = slot
            .finish(running.params.invocation_id, TimeSpan::ZERO, Outcome::Succeeded)
            .unwrap();
        assert!(launches.is_empty());

        let (_, launches) = slot.resolve_enqueue(params.invocation_id, true);
        assert_eq!(launches.len(), 1);
        assert_eq!(slot.stats().active_invocations, 1);
    }

    #[test]
    fn test_removal_cancels_running_and_withdraws_waiting() {
        let mut slot = slot(1, 1);
        let running = launched(slot.admit(at(1), at(1)));
        let Admission::Enqueued { .. } = slot.admit(at(2), at(2)) else {
            panic!("expected enqueue");
        };

        let withdrawn = slot.mark_pending_disposal(DisposalCause::Removed);
        assert_eq!(withdrawn.len(), 1);
        assert_eq!(withdrawn[0].cancellation, Some(CancellationReason::TaskDisposed));
        assert!(running.cancel.is_cancelled());
        assert!(slot.is_disposed());

        let (completion, _) = slot
            .finish(running.params.invocation_id, TimeSpan::ZERO, Outcome::Cancelled)
            .unwrap();
        assert_eq!(completion.cancellation, Some(CancellationReason::TaskDisposed));
        slot.hook_done();
        slot.hook_done();
        assert!(slot.is_drained());
        assert_eq!(slot.stats().cancelled_invocations, 2);
    }

    #[test]
    fn test_removal_reason_survives_revive() {
        let mut slot = slot(1, 0);
        let running = launched(slot.admit(at(1), at(1)));
        assert!(slot.mark_pending_disposal(DisposalCause::Removed).is_empty());
        slot.revive();
        assert!(!slot.is_disposed());

        let (completion, _) = slot
            .finish(running.params.invocation_id, TimeSpan::ZERO, Outcome::Cancelled)
            .unwrap();
        assert_eq!(completion.cancellation, Some(CancellationReason::TaskDisposed));

        // Invocations started after the revive get a fresh token.
        let next = launched(slot.admit(at(2), at(2)));
        assert!(!next.cancel.is_cancelled());
    }

    #[test]
    fn test_exhaustion_keeps_running_work() {
        let mut slot = slot(1, 0);
        let running = launched(slot.admit(at(1), at(1)));
        assert!(slot.mark_pending_disposal(DisposalCause::Exhausted).is_empty());
        assert!(!running.cancel.is_cancelled());

        let (completion, _) = slot
            .finish(running.params.invocation_id, TimeSpan::ZERO, Outcome::Cancelled)
            .unwrap();
        assert_eq!(
            completion.cancellation,
            Some(CancellationReason::CancellationRequested)
        );

        slot.revive();
        assert_eq!(slot.lifecycle(), Lifecycle::Active);
    }

    #[test]
    fn test_concurrency_limit_clamped_to_one() {
        let mut slot = slot(0, 0);
        assert_eq!(slot.max_concurrent(), 1);
        launched(slot.admit(at(1), at(1)));
        assert!(matches!(slot.admit(at(2), at(2)), Admission::Rejected(_)));
    }
}
