use std::time::Duration;

use tasklane_core::JobRecord;
use tracing::debug;

use super::{Constraint, RunTrigger};
use crate::clock::Clock;

/// Holds the job back until `delay` has elapsed since admission was first
/// attempted. The start instant lives in the record, so a rehydrated job only
/// waits for what is left.
pub struct DelayConstraint {
    delay: Duration,
    clock: Clock,
}

impl DelayConstraint {
    pub fn new(delay: Duration, clock: Clock) -> Self {
        Self { delay, clock }
    }
}

impl Constraint for DelayConstraint {
    fn name(&self) -> &'static str {
        "delay"
    }

    fn is_satisfied(&self, record: &mut JobRecord, trigger: &RunTrigger) -> bool {
        let now = self.clock.now();
        let started = *record.delay_started_at.get_or_insert(now);
        // A start in the future (clock skew across restarts) counts as zero elapsed.
        let elapsed = (now - started).to_std().unwrap_or_default();

        match self.delay.checked_sub(elapsed) {
            Some(remaining) if !remaining.is_zero() => {
                debug!(job_id = %record.id, remaining_ms = remaining.as_millis() as u64, "delaying job");
                trigger.fire_after(remaining);
                false
            }
            _ => true,
        }
    }
}
