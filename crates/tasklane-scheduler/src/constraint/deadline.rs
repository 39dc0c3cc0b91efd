use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tasklane_core::{ConstraintError, JobRecord};
use tracing::debug;

use super::{Constraint, RunTrigger};
use crate::clock::Clock;

/// Past the deadline by at least this much when the wake-up fires, since
/// `will_run` only rejects strictly after it.
const WAKE_MARGIN: Duration = Duration::from_millis(1);

/// Discards the job, without running it, once the deadline has passed.
///
/// The first admission arms a one-shot wake-up just past the deadline, so a
/// job parked on a later constraint or a retry timer is still discarded on
/// time.
pub struct DeadlineConstraint {
    deadline: DateTime<Utc>,
    clock: Clock,
    armed: AtomicBool,
}

impl DeadlineConstraint {
    pub fn new(deadline: DateTime<Utc>, clock: Clock) -> Self {
        Self {
            deadline,
            clock,
            armed: AtomicBool::new(false),
        }
    }
}

impl Constraint for DeadlineConstraint {
    fn name(&self) -> &'static str {
        "deadline"
    }

    fn will_run(&self, _record: &JobRecord) -> Result<(), ConstraintError> {
        if self.clock.now() > self.deadline {
            return Err(ConstraintError::DeadlinePassed {
                deadline: self.deadline,
            });
        }
        Ok(())
    }

    fn is_satisfied(&self, record: &mut JobRecord, trigger: &RunTrigger) -> bool {
        if !self.armed.swap(true, Ordering::AcqRel) {
            let remaining = (self.deadline - self.clock.now())
                .to_std()
                .unwrap_or_default();
            debug!(job_id = %record.id, remaining_ms = remaining.as_millis() as u64, "deadline armed");
            trigger.fire_after(remaining + WAKE_MARGIN);
        }
        true
    }
}
