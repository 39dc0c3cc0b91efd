use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Wall-clock source for time-based constraints.
///
/// Reads tokio's monotonic clock and offsets it from the wall time captured at
/// construction. Deadlines and delays therefore move in step with tokio
/// timers, including under paused test time, and ignore wall-clock jumps
/// while the process runs.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    anchor_wall: DateTime<Utc>,
    anchor: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// A clock whose "now" is `wall` at the moment of construction.
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            anchor_wall: wall,
            anchor: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.anchor.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.anchor_wall + elapsed
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
