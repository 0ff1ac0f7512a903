//! How long a checkout waits before its payment authorization is captured.

use std::time::Duration;

/// Length of the post-checkout editing window, in seconds.
pub const EDIT_WINDOW_SECS: u64 = 3600;

/// Buffer subtracted from the editing window when none is configured.
pub const DEFAULT_CAPTURE_BUFFER_SECS: u64 = 30;

/// Milliseconds between checkout and the scheduled capture.
///
/// A buffer larger than the editing window floors at zero rather than
/// producing a negative delay.
pub fn calculate_capture_delay_ms(buffer_seconds: u64) -> u64 {
    EDIT_WINDOW_SECS.saturating_sub(buffer_seconds) * 1000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayPolicy {
    buffer_seconds: u64,
}

impl DelayPolicy {
    pub fn new(buffer_seconds: u64) -> Self {
        Self { buffer_seconds }
    }

    pub fn buffer_seconds(&self) -> u64 {
        self.buffer_seconds
    }

    pub fn capture_delay_ms(&self) -> u64 {
        calculate_capture_delay_ms(self.buffer_seconds)
    }

    pub fn capture_delay(&self) -> Duration {
        Duration::from_millis(self.capture_delay_ms())
    }
}

impl Default for DelayPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_CAPTURE_BUFFER_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(30, 3_570_000)]
    #[case(60, 3_540_000)]
    #[case(0, 3_600_000)]
    #[case(3600, 0)]
    #[case(7200, 0)]
    fn delay_is_window_minus_buffer(#[case] buffer: u64, #[case] expected: u64) {
        assert_eq!(calculate_capture_delay_ms(buffer), expected);
    }

    #[test]
    fn default_policy_waits_fifty_nine_and_a_half_minutes() {
        let policy = DelayPolicy::default();
        assert_eq!(policy.buffer_seconds(), 30);
        assert_eq!(policy.capture_delay(), Duration::from_secs(59 * 60 + 30));
    }
}
