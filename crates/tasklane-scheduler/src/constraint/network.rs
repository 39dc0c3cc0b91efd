use std::sync::Arc;

use tasklane_core::{ConstraintError, JobRecord, NetworkRequirement};
use tracing::debug;

use super::{Constraint, RunTrigger};
use crate::connectivity::ConnectivityProvider;

/// Blocks the job until connectivity meets its requirement, then re-runs it
/// on the first qualifying change notification.
pub struct NetworkConstraint {
    required: NetworkRequirement,
    provider: Arc<dyn ConnectivityProvider>,
}

impl NetworkConstraint {
    pub fn new(required: NetworkRequirement, provider: Arc<dyn ConnectivityProvider>) -> Self {
        Self { required, provider }
    }
}

impl Constraint for NetworkConstraint {
    fn name(&self) -> &'static str {
        "network"
    }

    /// Waiting is pointless once the provider can no longer announce changes.
    fn will_run(&self, _record: &JobRecord) -> Result<(), ConstraintError> {
        if self.required.is_met_by(self.provider.current()) {
            return Ok(());
        }
        if self.provider.subscribe().has_changed().is_err() {
            return Err(ConstraintError::NetworkUnavailable {
                required: self.required,
            });
        }
        Ok(())
    }

    fn is_satisfied(&self, record: &mut JobRecord, trigger: &RunTrigger) -> bool {
        let mut rx = self.provider.subscribe();
        if self.required.is_met_by(*rx.borrow_and_update()) {
            return true;
        }

        debug!(job_id = %record.id, required = %self.required, "waiting for connectivity");
        let required = self.required;
        let trigger = trigger.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        // Provider gone: re-admit so `will_run` can reject the job.
                        if changed.is_err() || required.is_met_by(*rx.borrow_and_update()) {
                            trigger.fire();
                            return;
                        }
                    }
                    _ = trigger.cancellation().cancelled() => return,
                }
            }
        });
        false
    }
}
