use tasklane_core::{ConstraintError, JobRecord};
use tracing::info;

use super::{Constraint, QueueContext};

/// At most one live job per uuid. Depending on the record's override flag a
/// second submission either replaces the live job or is refused.
pub struct UniqueInstanceConstraint {
    uuid: String,
}

impl UniqueInstanceConstraint {
    pub fn new(uuid: String) -> Self {
        Self { uuid }
    }
}

impl Constraint for UniqueInstanceConstraint {
    fn name(&self) -> &'static str {
        "unique_instance"
    }

    fn will_schedule(
        &self,
        queue: &dyn QueueContext,
        record: &JobRecord,
    ) -> Result<(), ConstraintError> {
        if !queue.is_claimed(&self.uuid) {
            return Ok(());
        }
        if record.override_existing {
            queue.cancel_claim(&self.uuid);
            info!(uuid = %self.uuid, job_id = %record.id, "replacing live job with same uuid");
            return Ok(());
        }
        Err(ConstraintError::DuplicateJob {
            uuid: self.uuid.clone(),
        })
    }
}
