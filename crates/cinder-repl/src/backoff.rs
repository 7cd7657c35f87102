//! Capped exponential reconnect backoff.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with a ceiling and jitter.
///
/// Delays double on each failure (1s, 2s, 4s, ... capped at the ceiling)
/// with up to 20% random jitter added so a fleet of slaves does not
/// reconnect in lockstep.
#[derive(Debug)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    /// Creates a backoff starting at `floor` and capped at `ceiling`.
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        debug_assert!(floor <= ceiling, "backoff floor above ceiling");
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// Returns the next delay and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.ceiling);

        let jitter_ceiling = base.as_millis() as u64 / 5;
        let jitter = if jitter_ceiling == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ceiling)
        };
        base + Duration::from_millis(jitter)
    }

    /// Resets the schedule after a successful attempt.
    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_to_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));

        let first = backoff.next_delay();
        assert!(first >= Duration::from_secs(1) && first < Duration::from_millis(1300));

        let second = backoff.next_delay();
        assert!(second >= Duration::from_secs(2) && second < Duration::from_millis(2500));

        // Drain past the cap.
        for _ in 0..10 {
            backoff.next_delay();
        }
        let capped = backoff.next_delay();
        assert!(capped >= Duration::from_secs(10) && capped <= Duration::from_secs(12));
    }

    #[test]
    fn reset_returns_to_floor() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert!(backoff.next_delay() < Duration::from_millis(1300));
    }
}
