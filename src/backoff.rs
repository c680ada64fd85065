/// Exponential backoff for bounded retries of the LLM call.
///
/// The delay doubles (or grows by `multiplier`) after each retry, capped
/// at `max_delay`. `next_retry()` hands out delays until `max_retries`
/// have been used, then returns `None`.
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    max_delay: Duration,
    multiplier: u32,
    max_retries: u32,
    current_delay: Duration,
    /// Retries handed out so far.
    pub attempt: u32,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: u32, max_retries: u32) -> Self {
        Self {
            max_delay,
            multiplier,
            max_retries,
            current_delay: initial_delay,
            attempt: 0,
        }
    }

    /// Delay before the next retry, or `None` once the budget is spent.
    pub fn next_retry(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_retries {
            return None;
        }
        let delay = self.current_delay.min(self.max_delay);
        self.attempt += 1;
        self.current_delay = (self.current_delay * self.multiplier).min(self.max_delay);
        Some(delay)
    }
}
