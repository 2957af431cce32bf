//! Device time representation.
//!
//! Devices timestamp packets with a 64-bit tick count; the tick rate is a
//! property that propagates through the graph. [`TimeSpec`] keeps integer
//! seconds separate from fractional seconds so that long uptimes do not lose
//! sub-sample precision in a single `f64`.

use std::cmp::Ordering;
use std::ops::{Add, AddAssign, Sub};

/// A point in device time: full seconds plus a fractional part in `[0, 1)`.
#[derive(Debug, Copy, Clone, Default)]
pub struct TimeSpec {
    full_secs: i64,
    frac_secs: f64,
}

impl TimeSpec {
    /// Time zero.
    pub const ZERO: TimeSpec = TimeSpec {
        full_secs: 0,
        frac_secs: 0.0,
    };

    /// Creates a time spec, normalizing the fractional part into `[0, 1)`.
    pub fn new(full_secs: i64, frac_secs: f64) -> TimeSpec {
        let carry = frac_secs.floor();
        TimeSpec {
            full_secs: full_secs + carry as i64,
            frac_secs: frac_secs - carry,
        }
    }

    /// Creates a time spec from fractional seconds.
    pub fn from_secs(secs: f64) -> TimeSpec {
        TimeSpec::new(0, secs)
    }

    /// Converts a tick count into a time spec at the given tick rate.
    pub fn from_ticks(ticks: i64, tick_rate: f64) -> TimeSpec {
        let rate_i = tick_rate as i64;
        if tick_rate.fract() == 0.0 && rate_i > 0 {
            let full = ticks.div_euclid(rate_i);
            let rem = ticks.rem_euclid(rate_i);
            TimeSpec {
                full_secs: full,
                frac_secs: rem as f64 / tick_rate,
            }
        } else {
            TimeSpec::from_secs(ticks as f64 / tick_rate)
        }
    }

    /// Returns the integer seconds.
    pub fn full_secs(&self) -> i64 {
        self.full_secs
    }

    /// Returns the fractional seconds in `[0, 1)`.
    pub fn frac_secs(&self) -> f64 {
        self.frac_secs
    }

    /// Returns the time as floating point seconds.
    pub fn secs(&self) -> f64 {
        self.full_secs as f64 + self.frac_secs
    }

    /// Converts the time spec into a tick count at the given tick rate.
    pub fn to_ticks(&self, tick_rate: f64) -> i64 {
        let rate_i = tick_rate as i64;
        if tick_rate.fract() == 0.0 && rate_i > 0 {
            self.full_secs * rate_i + (self.frac_secs * tick_rate).round() as i64
        } else {
            (self.secs() * tick_rate).round() as i64
        }
    }
}

impl Add for TimeSpec {
    type Output = TimeSpec;

    fn add(self, rhs: TimeSpec) -> TimeSpec {
        TimeSpec::new(self.full_secs + rhs.full_secs, self.frac_secs + rhs.frac_secs)
    }
}

impl AddAssign for TimeSpec {
    fn add_assign(&mut self, rhs: TimeSpec) {
        *self = *self + rhs;
    }
}

impl Sub for TimeSpec {
    type Output = TimeSpec;

    fn sub(self, rhs: TimeSpec) -> TimeSpec {
        TimeSpec::new(self.full_secs - rhs.full_secs, self.frac_secs - rhs.frac_secs)
    }
}

impl PartialEq for TimeSpec {
    fn eq(&self, other: &TimeSpec) -> bool {
        self.full_secs == other.full_secs && self.frac_secs == other.frac_secs
    }
}

impl PartialOrd for TimeSpec {
    fn partial_cmp(&self, other: &TimeSpec) -> Option<Ordering> {
        match self.full_secs.cmp(&other.full_secs) {
            Ordering::Equal => self.frac_secs.partial_cmp(&other.frac_secs),
            ord => Some(ord),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tick_conversion_integer_rate() {
        let rate = 200e6;
        let t = TimeSpec::from_ticks(300_000_000, rate);
        assert_eq!(t.full_secs(), 1);
        assert_eq!(t.frac_secs(), 0.5);
        assert_eq!(t.to_ticks(rate), 300_000_000);
    }

    #[test]
    fn tick_round_trip_preserves_large_times() {
        let rate = 122.88e6;
        let ticks = 1_000_000 * 122_880_000 + 12345;
        let t = TimeSpec::from_ticks(ticks, rate);
        assert_eq!(t.to_ticks(rate), ticks);
        assert_eq!(t.full_secs(), 1_000_000);
    }

    #[test]
    fn arithmetic_normalizes() {
        let a = TimeSpec::new(1, 0.75);
        let b = TimeSpec::new(0, 0.5);
        let sum = a + b;
        assert_eq!(sum.full_secs(), 2);
        assert!((sum.frac_secs() - 0.25).abs() < 1e-12);
        let diff = sum - b;
        assert_eq!(diff.full_secs(), 1);
        assert!((diff.frac_secs() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn ordering() {
        assert!(TimeSpec::new(1, 0.1) < TimeSpec::new(1, 0.2));
        assert!(TimeSpec::new(2, 0.0) > TimeSpec::new(1, 0.999));
    }
}
