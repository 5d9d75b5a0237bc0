//! Tick-resolution time values.
//!
//! One tick is 100 nanoseconds. A [`Timestamp`] counts ticks since the Unix
//! epoch and a [`TimeSpan`] is a signed tick delta. Arithmetic saturates at the
//! representable bounds instead of wrapping.

use std::fmt;
use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const TICKS_PER_MICROSECOND: i64 = 10;
pub const TICKS_PER_MILLISECOND: i64 = 10_000;
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// An instant, in ticks since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

/// A signed tick-count delta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeSpan(i64);

impl Timestamp {
    pub const MIN: Timestamp = Timestamp(i64::MIN);
    pub const MAX: Timestamp = Timestamp(i64::MAX);
    pub const EPOCH: Timestamp = Timestamp(0);

    pub const fn from_ticks(ticks: i64) -> Self {
        Self(ticks)
    }

    pub const fn ticks(self) -> i64 {
        self.0
    }

    /// Convert a UTC date-time. Values outside the tick range saturate.
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        let secs = at.timestamp();
        let sub = i64::from(at.timestamp_subsec_nanos()) / 100;
        Self(secs.saturating_mul(TICKS_PER_SECOND).saturating_add(sub))
    }

    /// Convert back to a UTC date-time, if chrono can represent it.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let secs = self.0.div_euclid(TICKS_PER_SECOND);
        let nanos = (self.0.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
        DateTime::from_timestamp(secs, nanos)
    }

    pub fn checked_add(self, span: TimeSpan) -> Option<Self> {
        self.0.checked_add(span.0).map(Self)
    }

    pub fn saturating_sub_timestamp(self, earlier: Timestamp) -> TimeSpan {
        TimeSpan(self.0.saturating_sub(earlier.0))
    }
}

impl TimeSpan {
    pub const ZERO: TimeSpan = TimeSpan(0);
    pub const MIN: TimeSpan = TimeSpan(i64::MIN);
    pub const MAX: TimeSpan = TimeSpan(i64::MAX);
    pub const TICK: TimeSpan = TimeSpan(1);

    pub const fn from_ticks(ticks: i64) -> Self {
        Self(ticks)
    }

    pub const fn from_micros(micros: i64) -> Self {
        Self(micros.saturating_mul(TICKS_PER_MICROSECOND))
    }

    pub const fn from_millis(millis: i64) -> Self {
        Self(millis.saturating_mul(TICKS_PER_MILLISECOND))
    }

    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(TICKS_PER_SECOND))
    }

    pub const fn ticks(self) -> i64 {
        self.0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Whole milliseconds, truncated toward zero.
    pub const fn whole_millis(self) -> i64 {
        self.0 / TICKS_PER_MILLISECOND
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / TICKS_PER_SECOND as f64
    }

    /// Convert to a std duration. Negative spans clamp to zero.
    pub fn to_std(self) -> std::time::Duration {
        if self.0 <= 0 {
            return std::time::Duration::ZERO;
        }
        let ticks = self.0 as u64;
        std::time::Duration::new(
            ticks / TICKS_PER_SECOND as u64,
            ((ticks % TICKS_PER_SECOND as u64) * 100) as u32,
        )
    }

    /// Convert from a std duration, saturating at [`TimeSpan::MAX`].
    pub fn from_std(duration: std::time::Duration) -> Self {
        let ticks = duration.as_nanos() / 100;
        Self(i64::try_from(ticks).unwrap_or(i64::MAX))
    }

    pub fn checked_mul(self, factor: i64) -> Option<Self> {
        self.0.checked_mul(factor).map(Self)
    }
}

impl Add<TimeSpan> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: TimeSpan) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign<TimeSpan> for Timestamp {
    fn add_assign(&mut self, rhs: TimeSpan) {
        *self = *self + rhs;
    }
}

impl Sub<TimeSpan> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: TimeSpan) -> Timestamp {
        Timestamp(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign<TimeSpan> for Timestamp {
    fn sub_assign(&mut self, rhs: TimeSpan) {
        *self = *self - rhs;
    }
}

impl Sub for Timestamp {
    type Output = TimeSpan;

    fn sub(self, rhs: Timestamp) -> TimeSpan {
        self.saturating_sub_timestamp(rhs)
    }
}

impl Add for TimeSpan {
    type Output = TimeSpan;

    fn add(self, rhs: TimeSpan) -> TimeSpan {
        TimeSpan(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for TimeSpan {
    fn add_assign(&mut self, rhs: TimeSpan) {
        *self = *self + rhs;
    }
}

impl Sub for TimeSpan {
    type Output = TimeSpan;

    fn sub(self, rhs: TimeSpan) -> TimeSpan {
        TimeSpan(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for TimeSpan {
    fn sub_assign(&mut self, rhs: TimeSpan) {
        *self = *self - rhs;
    }
}

impl Mul<i64> for TimeSpan {
    type Output = TimeSpan;

    fn mul(self, rhs: i64) -> TimeSpan {
        TimeSpan(self.0.saturating_mul(rhs))
    }
}

impl Neg for TimeSpan {
    type Output = TimeSpan;

    fn neg(self) -> TimeSpan {
        TimeSpan(self.0.saturating_neg())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(at) => write!(f, "{}", at.to_rfc3339()),
            None => write!(f, "{}t", self.0),
        }
    }
}

impl fmt::Display for TimeSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TimeSpan::MAX => write!(f, "+inf"),
            TimeSpan::MIN => write!(f, "-inf"),
            span => write!(f, "{:.3}ms", span.0 as f64 / TICKS_PER_MILLISECOND as f64),
        }
    }
}
