use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(saturating_millis)
        .unwrap_or(0)
}

fn saturating_millis(elapsed: Duration) -> i64 {
    i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
}

/// Hands out producer timestamps that never go backwards, even if the wall
/// clock is stepped back.
#[derive(Debug, Default, Clone)]
pub struct TimestampClock {
    last: i64,
}

impl TimestampClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp: the wall clock, or the previous value if that is later.
    pub fn next(&mut self) -> i64 {
        self.observe(now_millis())
    }

    fn observe(&mut self, wall: i64) -> i64 {
        self.last = self.last.max(wall);
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_goes_backwards() {
        let mut clock = TimestampClock::new();
        assert_eq!(clock.observe(1_700_000_000_500), 1_700_000_000_500);
        assert_eq!(clock.observe(1_700_000_000_100), 1_700_000_000_500);
        assert_eq!(clock.observe(1_700_000_000_900), 1_700_000_000_900);
    }

    #[test]
    fn millis_saturate_instead_of_wrapping() {
        assert_eq!(saturating_millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(saturating_millis(Duration::MAX), i64::MAX);
    }

    #[test]
    fn wall_clock_is_after_2023() {
        let mut clock = TimestampClock::new();
        assert!(clock.next() > 1_672_531_200_000);
    }
}
