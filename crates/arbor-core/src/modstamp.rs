//! Modstamps for sync conflict resolution
//!
//! A modstamp is a millisecond timestamp. The clock hands out strictly
//! increasing values even when the wall clock stalls or steps backwards.

use std::cell::Cell;

use chrono::Utc;

/// Milliseconds since the Unix epoch
pub type Modstamp = i64;

/// Strictly increasing modstamp source
#[derive(Debug, Default)]
pub struct ModstampClock {
    last: Cell<Modstamp>,
}

impl ModstampClock {
    /// Create a clock with no history
    pub fn new() -> Self {
        Self::default()
    }

    /// Next modstamp: the wall clock, or one past the previous value
    pub fn next(&self) -> Modstamp {
        self.next_after(Modstamp::MIN)
    }

    /// Next modstamp that is also strictly greater than `floor`
    ///
    /// Used when reviving a tombstoned uid, whose new modstamps must beat
    /// the tombstone's so sync does not resurrect the old state.
    pub fn next_after(&self, floor: Modstamp) -> Modstamp {
        let now = Utc::now().timestamp_millis();
        let stamp = now
            .max(self.last.get().saturating_add(1))
            .max(floor.saturating_add(1));
        self.last.set(stamp);
        stamp
    }

    /// Last modstamp handed out (0 if none)
    pub fn last(&self) -> Modstamp {
        self.last.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strictly_increasing() {
        let clock = ModstampClock::new();
        let mut prev = clock.next();
        for _ in 0..1000 {
            let next = clock.next();
            assert!(next > prev);
            prev = next;
        }
        assert_eq!(clock.last(), prev);
    }

    #[test]
    fn test_next_after_future_floor() {
        let clock = ModstampClock::new();
        let far_future = Utc::now().timestamp_millis() + 1_000_000;
        let stamp = clock.next_after(far_future);
        assert_eq!(stamp, far_future + 1);
        assert!(clock.next() > stamp);
    }
}
