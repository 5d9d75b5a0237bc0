//! Per-task running statistics.

use cadence_core::{TimeSpan, Timestamp};
use serde::Serialize;

use crate::task::CancellationReason;

/// Counters for one task. Never reset while the task is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatistics {
    pub total_invocations: u64,
    pub active_invocations: u64,
    pub max_active_invocations: u64,
    pub completed_invocations: u64,
    pub skipped_invocations: u64,
    pub delayed_invocations: u64,
    pub failed_invocations: u64,
    pub cancelled_invocations: u64,
    pub queued_invocations: u64,
    pub max_queued_invocations: u64,
    pub first_invocation: Option<Timestamp>,
    pub last_invocation: Option<Timestamp>,
    /// `TimeSpan::MAX` until something completes.
    pub min_elapsed: TimeSpan,
    /// `TimeSpan::MIN` until something completes.
    pub max_elapsed: TimeSpan,
    pub total_elapsed: TimeSpan,
}

impl Default for TaskStatistics {
    fn default() -> Self {
        Self {
            total_invocations: 0,
            active_invocations: 0,
            max_active_invocations: 0,
            completed_invocations: 0,
            skipped_invocations: 0,
            delayed_invocations: 0,
            failed_invocations: 0,
            cancelled_invocations: 0,
            queued_invocations: 0,
            max_queued_invocations: 0,
            first_invocation: None,
            last_invocation: None,
            min_elapsed: TimeSpan::MAX,
            max_elapsed: TimeSpan::MIN,
            total_elapsed: TimeSpan::ZERO,
        }
    }
}

impl TaskStatistics {
    /// Mean run time of the completed invocations, if any completed.
    pub fn average_elapsed(&self) -> Option<TimeSpan> {
        if self.completed_invocations == 0 {
            return None;
        }
        let count = i64::try_from(self.completed_invocations).unwrap_or(i64::MAX);
        Some(TimeSpan::from_ticks(self.total_elapsed.ticks() / count))
    }

    pub(crate) fn record_due(&mut self, at: Timestamp) {
        self.total_invocations += 1;
        self.first_invocation.get_or_insert(at);
        self.last_invocation = Some(at);
    }

    pub(crate) fn record_started(&mut self) {
        self.active_invocations += 1;
        self.max_active_invocations = self.max_active_invocations.max(self.active_invocations);
    }

    pub(crate) fn record_enqueued(&mut self) {
        self.queued_invocations += 1;
        self.delayed_invocations += 1;
        self.max_queued_invocations = self.max_queued_invocations.max(self.queued_invocations);
    }

    pub(crate) fn record_dequeued(&mut self) {
        self.queued_invocations = self.queued_invocations.saturating_sub(1);
    }

    /// Rejected by admission or withdrawn before it ran.
    pub(crate) fn record_skipped(&mut self) {
        self.skipped_invocations += 1;
        self.cancelled_invocations += 1;
    }

    pub(crate) fn record_finished(
        &mut self,
        elapsed: TimeSpan,
        failed: bool,
        cancellation: Option<CancellationReason>,
    ) {
        self.active_invocations = self.active_invocations.saturating_sub(1);
        self.completed_invocations += 1;
        self.min_elapsed = self.min_elapsed.min(elapsed);
        self.max_elapsed = self.max_elapsed.max(elapsed);
        self.total_elapsed += elapsed;
        if failed {
            self.failed_invocations += 1;
        } else if cancellation.is_some() {
            self.cancelled_invocations += 1;
        }
    }
}
