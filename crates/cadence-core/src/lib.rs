//! # Cadence Core
//!
//! Shared building blocks for the Cadence scheduler crates:
//! - tick-resolution time values ([`Timestamp`], [`TimeSpan`])
//! - time sources ([`SystemClock`], [`MonotonicClock`], [`ManualClock`])
//! - configuration ([`CadenceConfig`]) loaded from TOML
//! - the error taxonomy ([`CadenceError`], [`TaskFailure`])

pub mod clock;
pub mod config;
pub mod error;
pub mod time;

pub use clock::{ManualClock, MonotonicClock, SharedClock, SystemClock, TimeSource};
pub use config::{CadenceConfig, LogConfig, SchedulerConfig, TimerConfig};
pub use error::{CadenceError, DisposalFailure, Result, TaskFailure, disposal_result};
pub use time::{TimeSpan, Timestamp};
