//! Pause applied to the backend after failed accepts.

use std::time::Duration;

/// Exponential back-off for backend accept failures.
///
/// After a failed accept the backend is not polled for `initial_delay`;
/// every further consecutive failure doubles the pause up to `max_delay`.
/// Record layers and virtual connections keep being served meanwhile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Pause after the first failure.
    pub initial_delay: Duration,
    /// Longest pause.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffConfig {
    /// Clamp both delays to at least 1 ms and order them.
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use usocks::server::BackoffConfig;
    ///
    /// let cfg = BackoffConfig {
    ///     initial_delay: Duration::from_millis(50),
    ///     max_delay: Duration::ZERO,
    /// }
    /// .normalized();
    /// assert_eq!(cfg.initial_delay, Duration::from_millis(1));
    /// assert_eq!(cfg.max_delay, Duration::from_millis(50));
    /// ```
    #[must_use]
    pub fn normalized(self) -> Self {
        let floor = Duration::from_millis(1);
        let a = self.initial_delay.max(floor);
        let b = self.max_delay.max(floor);
        Self {
            initial_delay: a.min(b),
            max_delay: a.max(b),
        }
    }

    /// Delay following `current` after another failure.
    #[must_use]
    pub fn next(&self, current: Duration) -> Duration { (current * 2).min(self.max_delay) }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(10, 20)]
    #[case(600, 1000)]
    #[case(1000, 1000)]
    fn doubles_up_to_the_cap(#[case] current: u64, #[case] expected: u64) {
        let cfg = BackoffConfig::default();
        assert_eq!(
            cfg.next(Duration::from_millis(current)),
            Duration::from_millis(expected)
        );
    }
}
