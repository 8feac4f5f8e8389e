use std::time::Duration;

/// Delay schedule for the retries of one failed crank request.
///
/// The caller sleeps on the returned delay so the wait can be raced against
/// cancellation.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_retries: u32,
    current_attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxRetriesExceeded {
    pub attempts: u32,
}

impl std::fmt::Display for MaxRetriesExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Maximum retry attempts exceeded ({})", self.attempts)
    }
}

impl std::error::Error for MaxRetriesExceeded {}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, retries: u32) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max,
            max_retries: retries,
            current_attempt: 0,
        }
    }

    /// Delay before the next attempt, or an error once retries are used up
    pub fn next_delay(&mut self) -> Result<Duration, MaxRetriesExceeded> {
        if self.current_attempt >= self.max_retries {
            return Err(MaxRetriesExceeded {
                attempts: self.current_attempt,
            });
        }

        let factor = 2_u32.saturating_pow(self.current_attempt);
        let delay = std::cmp::min(self.initial_delay.saturating_mul(factor), self.max_delay);

        log::warn!(
            "⏳ Retry attempt {} of {} in {:?}",
            self.current_attempt + 1,
            self.max_retries,
            delay
        );

        self.current_attempt += 1;
        Ok(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_and_cap() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(350), 4);

        assert_eq!(backoff.next_delay(), Ok(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Ok(Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(), Ok(Duration::from_millis(350)));
        assert_eq!(backoff.next_delay(), Ok(Duration::from_millis(350)));
        assert_eq!(backoff.next_delay(), Err(MaxRetriesExceeded { attempts: 4 }));
    }

    #[test]
    fn test_reset_restores_initial_delay() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1), 2);
        backoff.next_delay().unwrap();
        backoff.next_delay().unwrap();
        assert!(backoff.next_delay().is_err());

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Ok(Duration::from_millis(10)));
    }

    #[test]
    fn test_zero_retries_fails_immediately() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1), 0);
        assert!(backoff.next_delay().is_err());
    }
}
