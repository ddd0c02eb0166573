//! Time points for deadline bookkeeping.
//!
//! A [`TimePoint`] is a nanosecond offset from a kernel clock's epoch
//! (boot for the monotonic clock, the UNIX epoch for the wall clock).
//! The runtime never mixes points from different clocks; each timer
//! service is bound to a single clock domain.

use std::ops::{Add, AddAssign, Sub};
use std::time::Duration;

/// A point on a kernel clock, with nanosecond resolution.
///
/// `TimePoint::ZERO` doubles as the "unset" sentinel for stopped
/// timers; a real reading of either supported clock is far from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimePoint(Duration);

impl TimePoint {
    pub const ZERO: TimePoint = TimePoint(Duration::ZERO);

    /// Read the given kernel clock.
    pub(crate) fn read(clock_id: libc::clockid_t) -> TimePoint {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let rc = unsafe { libc::clock_gettime(clock_id, &mut ts) };
        // Only fails for an invalid clock id, which would be a bug here.
        assert_eq!(rc, 0, "clock_gettime failed for clock {}", clock_id);
        TimePoint(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
    }

    /// Offset from the clock epoch.
    pub fn since_epoch(self) -> Duration {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, or `None` if `earlier`
    /// is in the future.
    pub fn checked_duration_since(self, earlier: TimePoint) -> Option<Duration> {
        self.0.checked_sub(earlier.0)
    }

    /// Split into whole seconds and leftover nanoseconds, the shape
    /// `timerfd_settime` wants.
    pub(crate) fn to_timespec(self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.0.as_secs() as libc::time_t,
            tv_nsec: self.0.subsec_nanos() as libc::c_long,
        }
    }
}

impl Add<Duration> for TimePoint {
    type Output = TimePoint;

    fn add(self, rhs: Duration) -> TimePoint {
        TimePoint(self.0 + rhs)
    }
}

impl AddAssign<Duration> for TimePoint {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs;
    }
}

impl Sub<Duration> for TimePoint {
    type Output = TimePoint;

    fn sub(self, rhs: Duration) -> TimePoint {
        TimePoint(self.0 - rhs)
    }
}

impl From<Duration> for TimePoint {
    fn from(d: Duration) -> Self {
        TimePoint(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_the_offset() {
        let a = TimePoint::from(Duration::from_millis(10));
        let b = TimePoint::from(Duration::from_millis(20));
        assert!(a < b);
        assert_eq!(b.checked_duration_since(a), Some(Duration::from_millis(10)));
        assert_eq!(a.checked_duration_since(b), None);
    }

    #[test]
    fn arithmetic_round_trips() {
        let a = TimePoint::from(Duration::from_secs(5));
        let b = a + Duration::from_millis(1500);
        assert_eq!(b.since_epoch(), Duration::from_millis(6500));
        assert_eq!(b - Duration::from_millis(1500), a);
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = TimePoint::read(libc::CLOCK_MONOTONIC);
        let b = TimePoint::read(libc::CLOCK_MONOTONIC);
        assert!(b >= a);
        assert!(a > TimePoint::ZERO);
    }

    #[test]
    fn timespec_split() {
        let tp = TimePoint::from(Duration::new(3, 250_000_000));
        let ts = tp.to_timespec();
        assert_eq!(ts.tv_sec, 3);
        assert_eq!(ts.tv_nsec, 250_000_000);
    }
}
