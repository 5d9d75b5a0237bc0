//! # Cadence Scheduler
//!
//! Timestamp-driven task scheduling inside one process:
//! - [`EventQueue`] / [`ReorderableEventQueue`]: keyed, repeating events
//!   ordered by due timestamp
//! - [`Scheduler`]: dispatch loop with per-task concurrency and queue limits
//! - [`PeriodicTimer`]: drift-resistant tick source
//! - [`TaskCollection`]: the same admission rules, driven by external ticks

mod admission;
pub mod collection;
pub mod engine;
mod invocation;
pub mod queue;
pub mod reorderable;
pub mod stats;
pub mod task;
pub mod timer;

#[cfg(test)]
mod testing;

pub use collection::{CollectionStatistics, TaskCollection, TickTask};
pub use engine::{Scheduler, SchedulerState};
pub use queue::{
    CaseInsensitive, Dispatch, EventQueue, KeyEquivalence, NaturalEquality, QueueEntry,
    QueueError, Repetitions,
};
pub use reorderable::ReorderableEventQueue;
pub use stats::TaskStatistics;
pub use task::{
    CancellationReason, Cancelled, CompletionParams, InvocationParams, ScheduledTask,
    TaskContext, TaskState,
};
pub use timer::{PeriodicTimer, Tick, TickStream, TimerOptions};
