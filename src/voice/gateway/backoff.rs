use std::time::Duration;

/// Base delay for the exponential reconnect backoff.
pub const BACKOFF_BASE_MS: u64 = 1_000;

pub(crate) struct Backoff {
    attempt: u32,
    max_attempts: u32,
}

impl Backoff {
    pub(crate) fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
        }
    }

    pub(crate) fn next(&mut self) -> Duration {
        self.attempt += 1;
        let delay = BACKOFF_BASE_MS * 2u64.pow((self.attempt - 1).min(3));
        Duration::from_millis(delay)
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}
