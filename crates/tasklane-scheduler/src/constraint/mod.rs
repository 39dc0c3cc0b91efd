//! Admission checks evaluated before scheduling and before every run attempt.

mod deadline;
mod delay;
mod network;
mod unique;

use std::sync::Arc;
use std::time::Duration;

use tasklane_core::{ConstraintError, JobRecord, NetworkRequirement};
use tokio_util::sync::CancellationToken;

use crate::{clock::Clock, connectivity::ConnectivityProvider};

pub use deadline::DeadlineConstraint;
pub use delay::DelayConstraint;
pub use network::NetworkConstraint;
pub use unique::UniqueInstanceConstraint;

/// One admission rule. All three hooks default to "allow".
pub trait Constraint: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs once, synchronously, when the job is submitted.
    fn will_schedule(
        &self,
        _queue: &dyn QueueContext,
        _record: &JobRecord,
    ) -> Result<(), ConstraintError> {
        Ok(())
    }

    /// Runs before every attempt; a failure terminates the job.
    fn will_run(&self, _record: &JobRecord) -> Result<(), ConstraintError> {
        Ok(())
    }

    /// Non-failing poll. Returning `false` blocks the attempt, and the
    /// constraint takes over responsibility for calling `trigger.fire()` once
    /// it may be satisfied. Called with the engine locked, so the trigger must
    /// only ever fire from another task.
    fn is_satisfied(&self, _record: &mut JobRecord, _trigger: &RunTrigger) -> bool {
        true
    }
}

/// The view of the queue that schedule-time constraints get.
///
/// Calls happen while the queue's registry is locked, so the answers stay
/// valid until the submission is registered.
pub trait QueueContext {
    /// Whether a live job already claims `uuid`.
    fn is_claimed(&self, uuid: &str) -> bool;

    /// Cancel the live job claiming `uuid`. Returns `false` if there is none.
    fn cancel_claim(&self, uuid: &str) -> bool;
}

/// Handle a blocking constraint uses to re-enter the engine's run path later.
#[derive(Clone)]
pub struct RunTrigger {
    reenter: Arc<dyn Fn() + Send + Sync>,
    cancel: CancellationToken,
}

impl RunTrigger {
    pub fn new(cancel: CancellationToken, reenter: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            reenter: Arc::new(reenter),
            cancel,
        }
    }

    /// Ask the engine to attempt admission again.
    pub fn fire(&self) {
        (self.reenter)();
    }

    /// Fire once after `delay`, unless the job is cancelled first.
    pub fn fire_after(&self, delay: Duration) {
        let trigger = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => trigger.fire(),
                _ = trigger.cancel.cancelled() => {}
            }
        });
    }

    /// Cancelled once the job terminates; background waiters should stop.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Build the chain for `record` in its fixed evaluation order:
/// deadline, delay, unique instance, network. Constraints whose field is
/// unset are left out.
pub fn chain_for(
    record: &JobRecord,
    clock: Clock,
    connectivity: &Arc<dyn ConnectivityProvider>,
) -> Vec<Box<dyn Constraint>> {
    let mut chain: Vec<Box<dyn Constraint>> = Vec::new();
    if let Some(deadline) = record.deadline {
        chain.push(Box::new(DeadlineConstraint::new(deadline, clock)));
    }
    if !record.delay().is_zero() {
        chain.push(Box::new(DelayConstraint::new(record.delay(), clock)));
    }
    if let Some(uuid) = &record.uuid {
        chain.push(Box::new(UniqueInstanceConstraint::new(uuid.clone())));
    }
    if record.network != NetworkRequirement::None {
        chain.push(Box::new(NetworkConstraint::new(
            record.network,
            Arc::clone(connectivity),
        )));
    }
    chain
}
