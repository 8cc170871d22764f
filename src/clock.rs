//! Virtual time for age comparisons and demand windows
//!
//! The filler never reads the wall clock directly; it holds a cheap,
//! cloneable [`Clock`] handle over a [`TimeSource`]. Time is an opaque tick
//! count plus a frequency, used only for age comparisons and for sizing the
//! subrelease demand window.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of monotonic virtual time
pub trait TimeSource {
    /// Current time in ticks; monotone non-decreasing
    fn now(&self) -> i64;

    /// Ticks per second
    fn freq(&self) -> f64;
}

/// Shared handle to a [`TimeSource`]
#[derive(Clone)]
pub struct Clock(Arc<dyn TimeSource + Send + Sync>);

impl Clock {
    /// Wrap a time source in a shareable handle
    pub fn new(source: Arc<dyn TimeSource + Send + Sync>) -> Self {
        Clock(source)
    }

    /// Current time in ticks
    #[inline]
    pub fn now(&self) -> i64 {
        self.0.now()
    }

    /// Ticks per second
    #[inline]
    pub fn freq(&self) -> f64 {
        self.0.freq()
    }

    /// Convert a duration into ticks of this clock
    pub fn ticks_for(&self, d: Duration) -> i64 {
        (d.as_secs_f64() * self.freq()) as i64
    }

    /// Age in seconds of an event stamped at `then`
    pub fn seconds_since(&self, then: i64) -> f64 {
        (self.now() - then) as f64 / self.freq()
    }
}

/// Monotonic time backed by [`Instant`], in nanosecond ticks
pub struct MonotonicTime {
    origin: Instant,
}

impl MonotonicTime {
    /// Create a source anchored at the current instant
    pub fn new() -> Self {
        MonotonicTime {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTime {
    fn now(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }

    fn freq(&self) -> f64 {
        1e9
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new(Arc::new(MonotonicTime::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_time_advances() {
        let clock = Clock::default();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert_eq!(clock.freq(), 1e9);
    }

    #[test]
    fn test_ticks_for_duration() {
        let clock = Clock::default();
        assert_eq!(clock.ticks_for(Duration::from_secs(2)), 2_000_000_000);
        assert_eq!(clock.ticks_for(Duration::ZERO), 0);
    }

    #[test]
    fn test_seconds_since() {
        let clock = Clock::default();
        let then = clock.now();
        assert!(clock.seconds_since(then) >= 0.0);
    }
}
