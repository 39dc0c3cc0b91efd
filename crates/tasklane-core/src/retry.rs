use std::time::Duration;

/// What the job's failure handler wants the engine to do next.
///
/// Only consulted for failures reported by the job body, and only while the
/// retry budget is not exhausted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Stop retrying; the job terminates with `RetryCancelled`.
    Cancel,
    /// Retry after a fixed number of seconds (0 = immediately).
    RetryAfter(f64),
    /// Retry after `initial * 2^(n-1)` seconds, `n` being the number of
    /// consecutive failures since the last success.
    ExponentialBackoff(f64),
}

impl RetryDecision {
    pub fn retry_after(delay: Duration) -> Self {
        RetryDecision::RetryAfter(delay.as_secs_f64())
    }

    /// Backoff delay in seconds for the `repetition`-th consecutive failure
    /// (1-indexed).
    pub fn backoff_delay(initial: f64, repetition: u32) -> f64 {
        if repetition <= 1 {
            return initial;
        }
        let exponent = i32::try_from(repetition - 1).unwrap_or(i32::MAX);
        initial * 2_f64.powi(exponent)
    }
}

/// Seconds as a `Duration`; negative and NaN clamp to zero, overflow to `MAX`.
pub fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
