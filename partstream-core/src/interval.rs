//! Validity intervals over scene time

use std::fmt;

use serde::{Deserialize, Serialize};

/// Scene time in seconds
pub type Time = f64;

/// Closed time range `[start, end]` over which a computed value stays correct.
///
/// An interval with `start > end` is empty and contains no time at all.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    /// First instant covered
    pub start: Time,

    /// Last instant covered
    pub end: Time,
}

impl Interval {
    /// Valid at every time
    pub const FOREVER: Interval = Interval {
        start: f64::NEG_INFINITY,
        end: f64::INFINITY,
    };

    /// Valid at no time
    pub const NEVER: Interval = Interval {
        start: f64::INFINITY,
        end: f64::NEG_INFINITY,
    };

    /// Create an interval; an inverted range is empty
    pub fn new(start: Time, end: Time) -> Self {
        Self { start, end }
    }

    /// Interval covering the single instant `t`
    pub fn instant(t: Time) -> Self {
        Self { start: t, end: t }
    }

    /// Check if the interval covers no time
    pub fn is_empty(&self) -> bool {
        self.start > self.end || self.start.is_nan() || self.end.is_nan()
    }

    /// Check if `t` lies inside the closed range
    pub fn contains(&self, t: Time) -> bool {
        !self.is_empty() && self.start <= t && t <= self.end
    }

    /// Conservative combination of two dependencies' validity
    #[must_use]
    pub fn intersect(&self, other: &Interval) -> Interval {
        let result = Interval {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        };
        if result.is_empty() {
            Interval::NEVER
        } else {
            result
        }
    }

    /// Replace an empty interval with the instant `t`
    #[must_use]
    pub fn or_instant(self, t: Time) -> Interval {
        if self.is_empty() {
            Interval::instant(t)
        } else {
            self
        }
    }
}

impl Default for Interval {
    fn default() -> Self {
        Interval::NEVER
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "[never]")
        } else {
            write!(f, "[{}, {}]", self.start, self.end)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_is_closed() {
        let interval = Interval::new(1.0, 2.0);
        assert!(interval.contains(1.0));
        assert!(interval.contains(2.0));
        assert!(!interval.contains(2.0001));
        assert!(!Interval::NEVER.contains(0.0));
        assert!(Interval::FOREVER.contains(-1.0e9));
    }

    #[test]
    fn test_intersect() {
        let a = Interval::new(0.0, 10.0);
        let b = Interval::new(5.0, 20.0);
        assert_eq!(a.intersect(&b), Interval::new(5.0, 10.0));
        assert_eq!(a.intersect(&Interval::FOREVER), a);
        assert!(a.intersect(&Interval::new(11.0, 12.0)).is_empty());
    }

    #[test]
    fn test_or_instant() {
        assert_eq!(Interval::NEVER.or_instant(3.0), Interval::instant(3.0));
        assert_eq!(Interval::FOREVER.or_instant(3.0), Interval::FOREVER);
    }
}
