//! Exponential backoff bounded by a minimum and maximum delay.

use std::time::Duration;

/// Smallest delay growth starts from when `min` is zero.
const GROWTH_FLOOR: Duration = Duration::from_millis(1);

/// Doubling delay sequence clamped to `[min, max]`.
///
/// The first delay is `min`; each following delay doubles until it reaches
/// `max`, where it stays. A zero `min` still grows, starting from 1ms. Use
/// [`Backoff::reset`] after a success.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            current: None,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.min,
            Some(current) => current.saturating_mul(2).max(GROWTH_FLOOR).min(self.max),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_delay())
    }
}
