use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tasklane_core::{
    retry::secs_to_duration, ConstraintError, JobError, JobOutcome, JobRecord, RetryDecision,
};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    constraint::{Constraint, QueueContext, RunTrigger},
    job::{Completion, Job, JobContext},
    store::JobStore,
};

/// Lifecycle position of one job.
///
/// ```text
/// Idle → Scheduling → Admitting ⇄ Blocked
///                        ↓
///                     Running → Succeeded | Failed → Retrying → Admitting
///                        ↓
///                    Terminated (absorbing, reachable from every state)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Scheduling,
    Admitting,
    /// A constraint is not satisfied yet and will re-enter the run path.
    Blocked,
    Running,
    Succeeded,
    Failed,
    /// Waiting on a retry or interval timer.
    Retrying,
    Terminated,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Idle => "idle",
            JobState::Scheduling => "scheduling",
            JobState::Admitting => "admitting",
            JobState::Blocked => "blocked",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Retrying => "retrying",
            JobState::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

/// What the driver loop does after an attempt.
enum Step {
    /// Attempt again right away.
    Again,
    /// Wait for a constraint or timer to call `run`.
    Park,
    Done,
}

enum Admission {
    Run,
    Blocked,
    Rejected(ConstraintError),
}

struct EngineInner {
    record: JobRecord,
    state: JobState,
}

/// Drives one job from submission to its single remove notification.
///
/// All lifecycle mutation happens on the driver task started by [`start`];
/// the only cross-thread entry points are [`run`] (re-entry from a
/// constraint or timer) and [`cancel`]. Both take the same lock as the
/// driver, and termination is decided under it exactly once.
///
/// [`start`]: ExecutionEngine::start
/// [`run`]: ExecutionEngine::run
/// [`cancel`]: ExecutionEngine::cancel
pub struct ExecutionEngine {
    id: String,
    job_type: String,
    group: String,
    uuid: Option<String>,
    tags: BTreeSet<String>,
    job: Arc<dyn Job>,
    constraints: Vec<Box<dyn Constraint>>,
    store: Option<Arc<dyn JobStore>>,
    inner: Mutex<EngineInner>,
    wake: Notify,
    cancel: CancellationToken,
    outcome: watch::Sender<Option<JobOutcome>>,
}

impl ExecutionEngine {
    pub fn new(
        record: JobRecord,
        job: Arc<dyn Job>,
        constraints: Vec<Box<dyn Constraint>>,
        store: Option<Arc<dyn JobStore>>,
    ) -> Arc<Self> {
        let (outcome, _rx) = watch::channel(None);
        Arc::new(Self {
            id: record.id.clone(),
            job_type: record.job_type.clone(),
            group: record.group.clone(),
            uuid: record.uuid.clone(),
            tags: record.tags.clone(),
            job,
            constraints,
            store,
            inner: Mutex::new(EngineInner {
                record,
                state: JobState::Idle,
            }),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            outcome,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn state(&self) -> JobState {
        self.lock().state
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == JobState::Terminated
    }

    /// Snapshot of the record, counters included.
    pub fn record(&self) -> JobRecord {
        self.lock().record.clone()
    }

    /// Resolves to `Some(outcome)` once the job has terminated.
    pub fn subscribe(&self) -> watch::Receiver<Option<JobOutcome>> {
        self.outcome.subscribe()
    }

    /// Cancelled exactly when the job terminates.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Schedule-time checks, in chain order. Does not notify on failure: the
    /// caller releases its queue lock first and then calls [`abort`].
    ///
    /// [`abort`]: ExecutionEngine::abort
    pub fn schedule(&self, queue: &dyn QueueContext) -> Result<(), JobError> {
        let snapshot = {
            let mut inner = self.lock();
            if inner.state != JobState::Idle {
                return Err(JobError::InvalidRecord(format!(
                    "job {} was already scheduled",
                    self.id
                )));
            }
            inner.state = JobState::Scheduling;
            inner.record.clone()
        };

        for constraint in &self.constraints {
            if let Err(e) = constraint.will_schedule(queue, &snapshot) {
                warn!(
                    job_id = %self.id,
                    job_type = %self.job_type,
                    constraint = constraint.name(),
                    error = %e,
                    "job refused at schedule time"
                );
                return Err(e.into());
            }
        }

        debug!(job_id = %self.id, job_type = %self.job_type, "job scheduled");
        self.persist(&snapshot);
        Ok(())
    }

    /// Terminate a job that never made it into the queue.
    pub fn abort(&self, error: JobError) -> bool {
        self.terminate(JobOutcome::Fail(error))
    }

    /// External cancellation, safe from any thread. Returns `false` if the
    /// job had already terminated; that call is then a no-op.
    pub fn cancel(&self) -> bool {
        self.terminate(JobOutcome::Fail(JobError::Cancelled))
    }

    /// Run entry point for constraints and timers. Only a job parked in
    /// `Blocked` or `Retrying` is woken; anything else is ignored.
    pub fn run(&self) {
        let mut inner = self.lock();
        match inner.state {
            JobState::Blocked | JobState::Retrying => {
                inner.state = JobState::Admitting;
                self.wake.notify_one();
            }
            state => {
                debug!(job_id = %self.id, %state, "run requested outside a parked state; ignored");
            }
        }
    }

    /// Start hook, called once by the queue. Returns when the job terminates.
    pub async fn start(self: Arc<Self>) {
        {
            let mut inner = self.lock();
            match inner.state {
                JobState::Idle | JobState::Scheduling => inner.state = JobState::Admitting,
                JobState::Terminated => return,
                state => {
                    warn!(job_id = %self.id, %state, "engine started twice; ignored");
                    return;
                }
            }
        }
        info!(job_id = %self.id, job_type = %self.job_type, group = %self.group, "job started");

        loop {
            match self.attempt().await {
                Step::Again => continue,
                Step::Park => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
                Step::Done => break,
            }
        }
    }

    /// One pass through admission and, if admitted, one execution.
    async fn attempt(self: &Arc<Self>) -> Step {
        let trigger = self.trigger();
        let (admission, snapshot) = {
            let mut inner = self.lock();
            if inner.state == JobState::Terminated {
                return Step::Done;
            }
            inner.state = JobState::Admitting;
            let EngineInner { record, state } = &mut *inner;

            let mut admission = Admission::Run;
            for constraint in &self.constraints {
                if let Err(e) = constraint.will_run(record) {
                    admission = Admission::Rejected(e);
                    break;
                }
            }
            if matches!(admission, Admission::Run) {
                for constraint in &self.constraints {
                    if !constraint.is_satisfied(record, &trigger) {
                        debug!(job_id = %self.id, constraint = constraint.name(), "job blocked");
                        admission = Admission::Blocked;
                        break;
                    }
                }
            }
            *state = match &admission {
                Admission::Run => JobState::Running,
                Admission::Blocked => JobState::Blocked,
                Admission::Rejected(_) => JobState::Admitting,
            };
            (admission, record.clone())
        };

        match admission {
            Admission::Rejected(e) => {
                self.terminate(JobOutcome::Fail(e.into()));
                return Step::Done;
            }
            Admission::Blocked => {
                self.persist(&snapshot);
                return Step::Park;
            }
            Admission::Run => {}
        }

        debug!(
            job_id = %self.id,
            run_count = snapshot.run_count,
            repetition = snapshot.current_repetition,
            "executing job"
        );
        let (completion, rx) = Completion::channel();
        self.job
            .execute(JobContext::new(snapshot, self.cancel.clone()), completion);

        let result = tokio::select! {
            result = rx => result.unwrap_or_else(|_| Err("completion dropped without a result".to_string())),
            _ = self.cancel.cancelled() => return Step::Done,
        };

        match result {
            Ok(()) => self.on_success(&trigger),
            Err(message) => self.on_failure(JobError::Execution { message }, &trigger),
        }
    }

    fn on_success(&self, trigger: &RunTrigger) -> Step {
        let (step, snapshot) = {
            let mut inner = self.lock();
            if inner.state == JobState::Terminated {
                return Step::Done;
            }
            inner.state = JobState::Succeeded;
            let EngineInner { record, state } = &mut *inner;
            record.current_repetition = 0;

            if record.max_runs.reached(record.run_count + 1) {
                (None, record.clone())
            } else {
                record.run_count = record.run_count.saturating_add(1);
                let interval = record.interval();
                let step = if interval.is_zero() {
                    *state = JobState::Admitting;
                    Step::Again
                } else {
                    *state = JobState::Retrying;
                    trigger.fire_after(interval);
                    Step::Park
                };
                info!(job_id = %self.id, run_count = record.run_count, "periodic run finished");
                (Some(step), record.clone())
            }
        };

        match step {
            None => {
                self.terminate(JobOutcome::Success);
                Step::Done
            }
            Some(step) => {
                self.persist(&snapshot);
                step
            }
        }
    }

    fn on_failure(&self, error: JobError, trigger: &RunTrigger) -> Step {
        let exhausted = {
            let mut inner = self.lock();
            if inner.state == JobState::Terminated {
                return Step::Done;
            }
            inner.state = JobState::Failed;
            inner.record.retry_limit.is_exhausted()
        };
        warn!(job_id = %self.id, job_type = %self.job_type, error = %error, exhausted, "job execution failed");

        if exhausted {
            self.terminate(JobOutcome::Fail(error));
            return Step::Done;
        }

        // User code runs outside the lock.
        let decision = self.job.on_retry_decision(&error);

        let (delay, snapshot) = {
            let mut inner = self.lock();
            if inner.state == JobState::Terminated {
                return Step::Done;
            }
            let record = &mut inner.record;
            let delay = match decision {
                RetryDecision::Cancel => None,
                RetryDecision::RetryAfter(secs) => {
                    record.retry_limit.decrement();
                    Some(secs_to_duration(secs))
                }
                RetryDecision::ExponentialBackoff(initial) => {
                    record.current_repetition = record.current_repetition.saturating_add(1);
                    record.retry_limit.decrement();
                    Some(secs_to_duration(RetryDecision::backoff_delay(
                        initial,
                        record.current_repetition,
                    )))
                }
            };
            let snapshot = record.clone();
            if let Some(delay) = delay {
                inner.state = if delay.is_zero() {
                    JobState::Admitting
                } else {
                    trigger.fire_after(delay);
                    JobState::Retrying
                };
            }
            (delay, snapshot)
        };

        let Some(delay) = delay else {
            self.terminate(JobOutcome::Fail(JobError::RetryCancelled(Box::new(error))));
            return Step::Done;
        };

        info!(
            job_id = %self.id,
            delay_ms = delay.as_millis() as u64,
            retries_left = %snapshot.retry_limit,
            "retrying job"
        );
        self.persist(&snapshot);
        if delay == Duration::ZERO {
            Step::Again
        } else {
            Step::Park
        }
    }

    /// Move to `Terminated` once; every later call is absorbed.
    fn terminate(&self, outcome: JobOutcome) -> bool {
        let persisted = {
            let mut inner = self.lock();
            if inner.state == JobState::Terminated {
                return false;
            }
            inner.state = JobState::Terminated;
            inner.record.persisted
        };
        self.cancel.cancel();

        match &outcome {
            JobOutcome::Success => info!(job_id = %self.id, job_type = %self.job_type, "job finished"),
            JobOutcome::Fail(e) => info!(
                job_id = %self.id,
                job_type = %self.job_type,
                code = e.code(),
                error = %e,
                "job removed"
            ),
        }

        self.job.on_removed(&outcome);
        if persisted {
            if let Some(store) = &self.store {
                if let Err(e) = store.remove(&self.id) {
                    warn!(job_id = %self.id, "failed to delete job record: {e}");
                }
            }
        }
        self.outcome.send_replace(Some(outcome));
        true
    }

    fn persist(&self, record: &JobRecord) {
        if !record.persisted {
            return;
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.save(record) {
                warn!(job_id = %self.id, "failed to save job record: {e}");
            }
        }
    }

    fn trigger(self: &Arc<Self>) -> RunTrigger {
        let engine = Arc::downgrade(self);
        RunTrigger::new(self.cancel.clone(), move || {
            if let Some(engine) = engine.upgrade() {
                engine.run();
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, EngineInner> {
        self.inner.lock().expect("engine state poisoned")
    }
}
