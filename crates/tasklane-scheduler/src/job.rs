use std::fmt::Display;

use tasklane_core::{JobError, JobOutcome, JobRecord, Params, RetryDecision};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A runnable job, materialised from a record by a [`crate::JobFactory`].
///
/// Every callback runs on the engine's driver task and must not block: a job
/// with real work to do spawns it and resolves the [`Completion`] later.
pub trait Job: Send + Sync + 'static {
    /// Start one execution. `done` must eventually be resolved exactly once;
    /// dropping it unresolved counts as a failure.
    fn execute(&self, ctx: JobContext, done: Completion);

    /// Decide how to recover from a failed execution. Only called while the
    /// retry budget is not exhausted, and never for constraint failures.
    fn on_retry_decision(&self, error: &JobError) -> RetryDecision;

    /// Terminal notification, delivered exactly once per job lifetime.
    fn on_removed(&self, outcome: &JobOutcome);
}

/// What a single execution gets to see: a snapshot of the record as of this
/// attempt and the job's cancellation signal.
#[derive(Debug, Clone)]
pub struct JobContext {
    record: JobRecord,
    cancel: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(record: JobRecord, cancel: CancellationToken) -> Self {
        Self { record, cancel }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn job_type(&self) -> &str {
        &self.record.job_type
    }

    pub fn params(&self) -> &Params {
        &self.record.params
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    /// Cancellation is cooperative for a running body: long work should
    /// check this (or await `cancellation().cancelled()`) and stop early.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

pub(crate) type CompletionResult = Result<(), String>;

/// One-shot completion signal for a single execution.
///
/// Consuming methods make a second resolution impossible. Resolving after the
/// job was cancelled is a silent no-op.
#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<CompletionResult>,
}

impl Completion {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<CompletionResult>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn success(self) {
        self.finish::<String>(Ok(()));
    }

    pub fn fail(self, reason: impl Display) {
        self.finish(Err(reason));
    }

    pub fn finish<E: Display>(self, result: Result<(), E>) {
        // A closed receiver means the engine already terminated.
        let _ = self.tx.send(result.map_err(|e| e.to_string()));
    }
}
