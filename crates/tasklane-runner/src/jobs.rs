//! Job types the runner ships with.

use std::time::Duration;

use tasklane_core::{JobError, JobOutcome, Params, RetryDecision};
use tasklane_scheduler::{Completion, Job, JobContext, JobRegistry};
use tracing::{info, warn};

pub fn builtin_registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry
        .register("log", |params: &Params| LogJob {
            message: str_param(params, "message").unwrap_or("(no message)").to_string(),
        })
        .register("sleep", |params: &Params| SleepJob {
            duration: Duration::from_secs_f64(f64_param(params, "secs").unwrap_or(1.0)),
        })
        .register("fail", |params: &Params| FailJob {
            backoff_secs: f64_param(params, "backoff_secs").unwrap_or(1.0),
        });
    registry
}

fn str_param<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

/// Non-negative, finite number parameter.
fn f64_param(params: &Params, key: &str) -> Option<f64> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .filter(|n| n.is_finite() && *n >= 0.0)
}

fn log_removed(kind: &str, outcome: &JobOutcome) {
    match outcome {
        JobOutcome::Success => info!(kind, "job done"),
        JobOutcome::Fail(e) => warn!(kind, code = e.code(), "job gave up: {e}"),
    }
}

/// Writes its `message` param to the log.
struct LogJob {
    message: String,
}

impl Job for LogJob {
    fn execute(&self, ctx: JobContext, done: Completion) {
        info!(job_id = %ctx.id(), run = ctx.record().run_count + 1, "{}", self.message);
        done.success();
    }

    fn on_retry_decision(&self, _error: &JobError) -> RetryDecision {
        RetryDecision::Cancel
    }

    fn on_removed(&self, outcome: &JobOutcome) {
        log_removed("log", outcome);
    }
}

/// Sleeps for `secs` seconds, stopping early when cancelled.
struct SleepJob {
    duration: Duration,
}

impl Job for SleepJob {
    fn execute(&self, ctx: JobContext, done: Completion) {
        let duration = self.duration;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => done.success(),
                _ = ctx.cancellation().cancelled() => {}
            }
        });
    }

    fn on_retry_decision(&self, _error: &JobError) -> RetryDecision {
        RetryDecision::retry_after(self.duration)
    }

    fn on_removed(&self, outcome: &JobOutcome) {
        log_removed("sleep", outcome);
    }
}

/// Always fails; retries with exponential backoff starting at `backoff_secs`.
struct FailJob {
    backoff_secs: f64,
}

impl Job for FailJob {
    fn execute(&self, ctx: JobContext, done: Completion) {
        done.fail(format!(
            "simulated failure (repetition {})",
            ctx.record().current_repetition
        ));
    }

    fn on_retry_decision(&self, _error: &JobError) -> RetryDecision {
        RetryDecision::ExponentialBackoff(self.backoff_secs)
    }

    fn on_removed(&self, outcome: &JobOutcome) {
        log_removed("fail", outcome);
    }
}
