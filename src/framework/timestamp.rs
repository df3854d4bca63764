//! Stream time domain.
//!
//! A `Timestamp` is a signed 64-bit microsecond count. The eight values at the
//! ends of the `i64` range are reserved sentinels, ordered as:
//!
//! ```text
//! Unset < Unstarted < PreStream < Min ..= Max < PostStream < OneOverPostStream < Done
//! ```
//!
//! Only `Min..=Max` are range values. Sentinels are never produced from a raw
//! integer; use the associated constants.

use crate::error::{GraphError, Result};
use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

/// A point in stream time.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

/// Signed distance between two timestamps.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimestampDiff(i64);

impl Timestamp {
    pub const UNSET: Timestamp = Timestamp(i64::MIN);
    pub const UNSTARTED: Timestamp = Timestamp(i64::MIN + 1);
    pub const PRE_STREAM: Timestamp = Timestamp(i64::MIN + 2);
    pub const MIN: Timestamp = Timestamp(i64::MIN + 3);
    pub const MAX: Timestamp = Timestamp(i64::MAX - 3);
    pub const POST_STREAM: Timestamp = Timestamp(i64::MAX - 2);
    pub const ONE_OVER_POST_STREAM: Timestamp = Timestamp(i64::MAX - 1);
    pub const DONE: Timestamp = Timestamp(i64::MAX);

    /// Build a range timestamp. Raw values that collide with a sentinel are rejected.
    pub fn new(value: i64) -> Result<Self> {
        let ts = Timestamp(value);
        if ts.is_range_value() {
            Ok(ts)
        } else {
            Err(GraphError::InvalidTimestamp(format!(
                "{} is reserved for a special timestamp",
                value
            )))
        }
    }

    /// Raw microsecond value, sentinels included.
    #[inline]
    pub const fn value(self) -> i64 {
        self.0
    }

    #[inline]
    pub fn is_range_value(self) -> bool {
        self >= Self::MIN && self <= Self::MAX
    }

    #[inline]
    pub fn is_special_value(self) -> bool {
        !self.is_range_value()
    }

    /// Range values plus PreStream and PostStream.
    #[inline]
    pub fn is_allowed_in_stream(self) -> bool {
        self.is_range_value() || self == Self::PRE_STREAM || self == Self::POST_STREAM
    }

    /// Smallest timestamp a stream may carry after a packet at `self`.
    ///
    /// PreStream and Max leave nothing else for the stream. Fails outside
    /// `PreStream..=Max`; streams handle PostStream packets on their own.
    pub fn next_allowed_in_stream(self) -> Result<Self> {
        if self < Self::PRE_STREAM || self > Self::MAX {
            return Err(GraphError::InvalidTimestamp(format!(
                "no timestamp is allowed after {} in a stream",
                self
            )));
        }
        if self == Self::PRE_STREAM || self == Self::MAX {
            Ok(Self::ONE_OVER_POST_STREAM)
        } else {
            Ok(Timestamp(self.0 + 1))
        }
    }

    /// Largest timestamp that can precede a bound at `self`.
    ///
    /// Returns Unstarted when nothing can precede it.
    pub fn previous_allowed_in_stream(self) -> Self {
        if self <= Self::MIN || self == Self::POST_STREAM {
            Self::UNSTARTED
        } else {
            Timestamp(self.0 - 1)
        }
    }

    /// Clamping addition that reports misuse of special values as an error.
    pub fn checked_add(self, diff: TimestampDiff) -> Result<Self> {
        if self.is_special_value() {
            return Err(GraphError::InvalidTimestamp(format!(
                "cannot add {} to special timestamp {}",
                diff, self
            )));
        }
        Ok(Self::clamped(self.0 as i128 + diff.0 as i128))
    }

    /// Clamping subtraction that reports misuse of special values as an error.
    pub fn checked_sub(self, diff: TimestampDiff) -> Result<Self> {
        if self.is_special_value() {
            return Err(GraphError::InvalidTimestamp(format!(
                "cannot subtract {} from special timestamp {}",
                diff, self
            )));
        }
        Ok(Self::clamped(self.0 as i128 - diff.0 as i128))
    }

    /// Difference between two range timestamps.
    pub fn checked_diff(self, other: Timestamp) -> Result<TimestampDiff> {
        if self.is_special_value() || other.is_special_value() {
            return Err(GraphError::InvalidTimestamp(format!(
                "cannot subtract {} from {}",
                other, self
            )));
        }
        let diff = self.0 as i128 - other.0 as i128;
        i64::try_from(diff)
            .map(TimestampDiff)
            .map_err(|_| GraphError::InvalidTimestamp(format!("{} - {} overflows", self, other)))
    }

    /// `self + 1`, clamped to Max.
    pub fn increment(&mut self) {
        *self = *self + TimestampDiff(1);
    }

    /// `self - 1`, clamped to Min.
    pub fn decrement(&mut self) {
        *self = *self - TimestampDiff(1);
    }

    /// Seconds as a float, for display and rate computations.
    pub fn seconds(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    fn clamped(value: i128) -> Self {
        Timestamp(value.clamp(Self::MIN.0 as i128, Self::MAX.0 as i128) as i64)
    }

    fn special_name(self) -> Option<&'static str> {
        match self {
            Self::UNSET => Some("Unset"),
            Self::UNSTARTED => Some("Unstarted"),
            Self::PRE_STREAM => Some("PreStream"),
            Self::MIN => Some("Min"),
            Self::MAX => Some("Max"),
            Self::POST_STREAM => Some("PostStream"),
            Self::ONE_OVER_POST_STREAM => Some("OneOverPostStream"),
            Self::DONE => Some("Done"),
            _ => None,
        }
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::UNSET
    }
}

impl TryFrom<i64> for Timestamp {
    type Error = GraphError;

    fn try_from(value: i64) -> Result<Self> {
        Timestamp::new(value)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.special_name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "{}", self.0),
        }
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self)
    }
}

impl Add<TimestampDiff> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: TimestampDiff) -> Timestamp {
        match self.checked_add(rhs) {
            Ok(ts) => ts,
            Err(e) => panic!("{}", e),
        }
    }
}

impl Sub<TimestampDiff> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: TimestampDiff) -> Timestamp {
        match self.checked_sub(rhs) {
            Ok(ts) => ts,
            Err(e) => panic!("{}", e),
        }
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = TimestampDiff;

    fn sub(self, rhs: Timestamp) -> TimestampDiff {
        match self.checked_diff(rhs) {
            Ok(diff) => diff,
            Err(e) => panic!("{}", e),
        }
    }
}

impl AddAssign<TimestampDiff> for Timestamp {
    fn add_assign(&mut self, rhs: TimestampDiff) {
        *self = *self + rhs;
    }
}

impl SubAssign<TimestampDiff> for Timestamp {
    fn sub_assign(&mut self, rhs: TimestampDiff) {
        *self = *self - rhs;
    }
}

// ── TimestampDiff ──────────────────────────────────────────────────────────

impl TimestampDiff {
    pub const fn new(value: i64) -> Self {
        TimestampDiff(value)
    }

    #[inline]
    pub const fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TimestampDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TimestampDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimestampDiff({})", self.0)
    }
}

impl Add for TimestampDiff {
    type Output = TimestampDiff;

    fn add(self, rhs: TimestampDiff) -> TimestampDiff {
        match self.0.checked_add(rhs.0) {
            Some(v) => TimestampDiff(v),
            None => panic!("TimestampDiff overflow: {} + {}", self, rhs),
        }
    }
}

impl Sub for TimestampDiff {
    type Output = TimestampDiff;

    fn sub(self, rhs: TimestampDiff) -> TimestampDiff {
        match self.0.checked_sub(rhs.0) {
            Some(v) => TimestampDiff(v),
            None => panic!("TimestampDiff overflow: {} - {}", self, rhs),
        }
    }
}

impl Neg for TimestampDiff {
    type Output = TimestampDiff;

    fn neg(self) -> TimestampDiff {
        match self.0.checked_neg() {
            Some(v) => TimestampDiff(v),
            None => panic!("TimestampDiff overflow: -{}", self),
        }
    }
}

/// Timestamp settled by a stream whose next bound is `bound`.
///
/// Everything strictly before the bound is settled. PostStream and
/// OneOverPostStream bounds settle the whole range and PostStream respectively.
pub(crate) fn settled_timestamp(bound: Timestamp) -> Timestamp {
    if bound == Timestamp::POST_STREAM {
        Timestamp::MAX
    } else if bound == Timestamp::ONE_OVER_POST_STREAM {
        Timestamp::POST_STREAM
    } else {
        bound.previous_allowed_in_stream()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(v: i64) -> Timestamp {
        Timestamp::new(v).unwrap()
    }

    #[test]
    fn test_sentinel_ordering() {
        let ordered = [
            Timestamp::UNSET,
            Timestamp::UNSTARTED,
            Timestamp::PRE_STREAM,
            Timestamp::MIN,
            ts(0),
            Timestamp::MAX,
            Timestamp::POST_STREAM,
            Timestamp::ONE_OVER_POST_STREAM,
            Timestamp::DONE,
        ];
        assert!(ordered.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_new_rejects_sentinels() {
        assert!(Timestamp::new(i64::MIN).is_err());
        assert!(Timestamp::new(i64::MAX - 1).is_err());
        assert_eq!(Timestamp::new(i64::MIN + 3).unwrap(), Timestamp::MIN);
        assert!(Timestamp::try_from(42).is_ok());
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(ts(10) - ts(0), TimestampDiff::new(10));
        assert_eq!(ts(0) + TimestampDiff::new(10), ts(10));
        assert_eq!(Timestamp::MAX + TimestampDiff::new(100), Timestamp::MAX);
        assert_eq!(Timestamp::MIN - TimestampDiff::new(100), Timestamp::MIN);
        let mut t = Timestamp::MAX;
        t.increment();
        assert_eq!(t, Timestamp::MAX);
        t.decrement();
        assert_eq!(t, ts(i64::MAX - 4));
    }

    #[test]
    #[should_panic]
    fn test_special_arithmetic_panics() {
        let _ = Timestamp::POST_STREAM + TimestampDiff::new(1);
    }

    #[test]
    fn test_checked_special_arithmetic() {
        assert!(Timestamp::DONE.checked_add(TimestampDiff::new(1)).is_err());
        assert!(Timestamp::PRE_STREAM.checked_sub(TimestampDiff::new(1)).is_err());
    }

    #[test]
    #[should_panic]
    fn test_diff_overflow_panics() {
        let _ = TimestampDiff::new(i64::MAX) + TimestampDiff::new(1);
    }

    #[test]
    fn test_next_allowed_in_stream() {
        assert_eq!(ts(5).next_allowed_in_stream().unwrap(), ts(6));
        assert_eq!(
            Timestamp::MAX.next_allowed_in_stream().unwrap(),
            Timestamp::ONE_OVER_POST_STREAM
        );
        assert_eq!(
            Timestamp::PRE_STREAM.next_allowed_in_stream().unwrap(),
            Timestamp::ONE_OVER_POST_STREAM
        );
        assert!(Timestamp::POST_STREAM.next_allowed_in_stream().is_err());
        assert!(Timestamp::UNSET.next_allowed_in_stream().is_err());
    }

    #[test]
    fn test_previous_allowed_in_stream() {
        assert_eq!(ts(6).previous_allowed_in_stream(), ts(5));
        assert_eq!(Timestamp::MIN.previous_allowed_in_stream(), Timestamp::UNSTARTED);
        assert_eq!(Timestamp::POST_STREAM.previous_allowed_in_stream(), Timestamp::UNSTARTED);
        assert_eq!(
            Timestamp::DONE.previous_allowed_in_stream(),
            Timestamp::ONE_OVER_POST_STREAM
        );
    }

    #[test]
    fn test_settled_timestamp() {
        assert_eq!(settled_timestamp(ts(10)), ts(9));
        assert_eq!(settled_timestamp(Timestamp::PRE_STREAM), Timestamp::UNSTARTED);
        assert_eq!(settled_timestamp(Timestamp::POST_STREAM), Timestamp::MAX);
        assert_eq!(
            settled_timestamp(Timestamp::ONE_OVER_POST_STREAM),
            Timestamp::POST_STREAM
        );
    }

    #[test]
    fn test_display_names_sentinels() {
        assert_eq!(Timestamp::PRE_STREAM.to_string(), "PreStream");
        assert_eq!(ts(17).to_string(), "17");
        assert_eq!(format!("{:?}", Timestamp::DONE), "Timestamp(Done)");
    }

    #[test]
    fn test_allowed_in_stream() {
        assert!(Timestamp::PRE_STREAM.is_allowed_in_stream());
        assert!(Timestamp::POST_STREAM.is_allowed_in_stream());
        assert!(!Timestamp::ONE_OVER_POST_STREAM.is_allowed_in_stream());
        assert!(!Timestamp::UNSET.is_allowed_in_stream());
    }
}
