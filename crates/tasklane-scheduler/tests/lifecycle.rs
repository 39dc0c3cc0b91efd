//! End-to-end job lifecycles on paused tokio time.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tasklane_core::{
    ConstraintError, Connectivity, JobError, JobOutcome, JobRecord, Limit, NetworkRequirement,
    Params, QueueConfig, RetryDecision,
};
use tasklane_scheduler::{
    Completion, ConnectivityProvider, Job, JobContext, JobFactory, JobQueue, JobState, JobStore,
    ManualConnectivity, SqliteJobStore,
};
use tokio::time::{sleep, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tasklane_scheduler=debug")
        .with_test_writer()
        .try_init();
}

/// Scripted job that records every attempt.
struct Probe {
    script: Mutex<VecDeque<bool>>,
    fallback: bool,
    decision: RetryDecision,
    work: Duration,
    attempts: Mutex<Vec<Instant>>,
    retry_calls: AtomicUsize,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    removed: Mutex<Vec<JobOutcome>>,
}

impl Probe {
    fn new(fallback: bool, decision: RetryDecision) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            decision,
            work: Duration::ZERO,
            attempts: Mutex::new(Vec::new()),
            retry_calls: AtomicUsize::new(0),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            removed: Mutex::new(Vec::new()),
        }
    }

    fn succeeding() -> Arc<Self> {
        Arc::new(Self::new(true, RetryDecision::Cancel))
    }

    fn failing(decision: RetryDecision) -> Arc<Self> {
        Arc::new(Self::new(false, decision))
    }

    fn scripted(script: &[bool], decision: RetryDecision) -> Arc<Self> {
        let probe = Self::new(true, decision);
        *probe.script.lock().unwrap() = script.iter().copied().collect();
        Arc::new(probe)
    }

    fn working(work: Duration) -> Arc<Self> {
        Arc::new(Self {
            work,
            ..Self::new(true, RetryDecision::Cancel)
        })
    }

    fn attempts(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    /// Whole seconds between consecutive attempts.
    fn gaps(&self) -> Vec<u64> {
        let attempts = self.attempts.lock().unwrap();
        attempts
            .windows(2)
            .map(|w| (w[1] - w[0]).as_secs_f64().round() as u64)
            .collect()
    }

    fn removed(&self) -> Vec<JobOutcome> {
        self.removed.lock().unwrap().clone()
    }
}

impl Job for Probe {
    fn execute(&self, _ctx: JobContext, done: Completion) {
        self.attempts.lock().unwrap().push(Instant::now());
        let succeed = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);

        if self.work.is_zero() {
            if succeed {
                done.success();
            } else {
                done.fail("boom");
            }
            return;
        }

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let work = self.work;
        tokio::spawn(async move {
            sleep(work).await;
            running.fetch_sub(1, Ordering::SeqCst);
            done.success();
        });
    }

    fn on_retry_decision(&self, _error: &JobError) -> RetryDecision {
        self.retry_calls.fetch_add(1, Ordering::SeqCst);
        self.decision
    }

    fn on_removed(&self, outcome: &JobOutcome) {
        self.removed.lock().unwrap().push(outcome.clone());
    }
}

/// Holds on to its completion so the test decides when it resolves.
#[derive(Default)]
struct Held {
    pending: Mutex<Option<Completion>>,
    removed: Mutex<Vec<JobOutcome>>,
}

impl Job for Held {
    fn execute(&self, _ctx: JobContext, done: Completion) {
        *self.pending.lock().unwrap() = Some(done);
    }

    fn on_retry_decision(&self, _error: &JobError) -> RetryDecision {
        RetryDecision::Cancel
    }

    fn on_removed(&self, outcome: &JobOutcome) {
        self.removed.lock().unwrap().push(outcome.clone());
    }
}

fn queue() -> JobQueue {
    init_tracing();
    JobQueue::new(QueueConfig::default())
}

fn boom() -> JobOutcome {
    JobOutcome::Fail(JobError::execution("boom"))
}

#[tokio::test(start_paused = true)]
async fn zero_retry_budget_never_consults_the_handler() {
    let queue = queue();
    let probe = Probe::failing(RetryDecision::RetryAfter(0.0));
    let record = JobRecord::new("probe").with_retry_limit(Limit::Limited(0));

    let outcome = queue.submit(record, probe.clone()).unwrap().wait().await;

    assert_eq!(outcome, boom());
    assert_eq!(probe.attempts(), 1);
    assert_eq!(probe.retry_calls.load(Ordering::SeqCst), 0);
    assert_eq!(probe.removed(), vec![boom()]);
}

#[tokio::test(start_paused = true)]
async fn retry_budget_of_three_gives_four_attempts() {
    let queue = queue();
    let probe = Probe::failing(RetryDecision::RetryAfter(0.0));
    let record = JobRecord::new("probe").with_retry_limit(Limit::Limited(3));

    let outcome = queue.submit(record, probe.clone()).unwrap().wait().await;

    assert_eq!(outcome, boom());
    assert_eq!(probe.attempts(), 4);
    assert_eq!(probe.retry_calls.load(Ordering::SeqCst), 3);
    assert_eq!(probe.gaps(), vec![0, 0, 0]);
}

#[tokio::test(start_paused = true)]
async fn exponential_backoff_doubles_each_attempt() {
    let queue = queue();
    let probe = Probe::failing(RetryDecision::ExponentialBackoff(1.0));
    let record = JobRecord::new("probe").with_retry_limit(Limit::Limited(4));

    let outcome = queue.submit(record, probe.clone()).unwrap().wait().await;

    assert_eq!(outcome, boom());
    assert_eq!(probe.gaps(), vec![1, 2, 4, 8]);
}

#[tokio::test(start_paused = true)]
async fn success_resets_the_backoff_curve() {
    let queue = queue();
    let probe = Probe::scripted(
        &[false, false, true, false, true],
        RetryDecision::ExponentialBackoff(1.0),
    );
    let record = JobRecord::new("probe")
        .periodic(Limit::Limited(2), Duration::ZERO)
        .with_retry_limit(Limit::Unlimited);

    let outcome = queue.submit(record, probe.clone()).unwrap().wait().await;

    assert_eq!(outcome, JobOutcome::Success);
    assert_eq!(probe.gaps(), vec![1, 2, 0, 1]);
}

#[tokio::test(start_paused = true)]
async fn periodic_job_runs_exactly_max_runs_times() {
    let queue = queue();
    let probe = Probe::succeeding();
    let record = JobRecord::new("probe").periodic(Limit::Limited(3), Duration::ZERO);

    let outcome = queue.submit(record, probe.clone()).unwrap().wait().await;

    assert_eq!(outcome, JobOutcome::Success);
    assert_eq!(probe.attempts(), 3);
    assert_eq!(probe.removed(), vec![JobOutcome::Success]);
}

#[tokio::test(start_paused = true)]
async fn interval_spaces_periodic_runs() {
    let queue = queue();
    let probe = Probe::succeeding();
    let record = JobRecord::new("probe").periodic(Limit::Limited(3), Duration::from_secs(10));

    let handle = queue.submit(record, probe.clone()).unwrap();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(handle.state(), JobState::Retrying);
    assert_eq!(handle.record().run_count, 1);

    assert_eq!(handle.wait().await, JobOutcome::Success);
    assert_eq!(probe.gaps(), vec![10, 10]);
}

#[tokio::test(start_paused = true)]
async fn past_deadline_never_executes() {
    let queue = queue();
    let probe = Probe::failing(RetryDecision::RetryAfter(0.0));
    let record = JobRecord::new("probe")
        .with_deadline(chrono::Utc::now() - chrono::Duration::seconds(60))
        .with_retry_limit(Limit::Limited(5));

    let outcome = queue.submit(record, probe.clone()).unwrap().wait().await;

    let error = outcome.error().expect("deadline failure");
    assert!(error.is_constraint_violation());
    assert_eq!(error.code(), "DEADLINE_PASSED");
    assert_eq!(probe.attempts(), 0);
    assert_eq!(probe.retry_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn deadline_expiring_during_delay_fails_the_job() {
    let queue = queue();
    let probe = Probe::succeeding();
    let record = JobRecord::new("probe")
        .with_delay(Duration::from_secs(10))
        .with_deadline(chrono::Utc::now() + chrono::Duration::seconds(5));

    let outcome = queue.submit(record, probe.clone()).unwrap().wait().await;

    assert_eq!(outcome.error().map(JobError::code), Some("DEADLINE_PASSED"));
    assert_eq!(probe.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn duplicate_uuid_is_refused_without_override() {
    let queue = queue();
    let first = Probe::succeeding();
    let second = Probe::succeeding();
    let delayed = |uuid: &str| {
        JobRecord::new("probe")
            .with_uuid(uuid)
            .with_delay(Duration::from_secs(60))
    };

    let handle = queue.submit(delayed("sync"), first.clone()).unwrap();
    let err = queue
        .submit(delayed("sync"), second.clone())
        .err()
        .expect("duplicate must be refused");

    assert_eq!(
        err,
        JobError::ConstraintViolation(ConstraintError::DuplicateJob {
            uuid: "sync".into()
        })
    );
    assert_eq!(second.removed(), vec![JobOutcome::Fail(err)]);
    assert!(first.removed().is_empty());
    assert_eq!(queue.active_count(), 1);

    assert_eq!(handle.wait().await, JobOutcome::Success);
    assert_eq!(first.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn override_replaces_the_live_job() {
    let queue = queue();
    let first = Probe::succeeding();
    let second = Probe::succeeding();

    let old = queue
        .submit(
            JobRecord::new("probe")
                .with_uuid("sync")
                .with_delay(Duration::from_secs(60)),
            first.clone(),
        )
        .unwrap();
    let new = queue
        .submit(
            JobRecord::new("probe")
                .with_uuid("sync")
                .with_override(true)
                .with_delay(Duration::from_secs(30)),
            second.clone(),
        )
        .unwrap();

    assert_eq!(old.wait().await, JobOutcome::Fail(JobError::Cancelled));
    sleep(Duration::from_secs(1)).await;
    assert_eq!(queue.active_count(), 1);

    // The old job's cleanup must not release the replacement's claim.
    let third = Probe::succeeding();
    let refused = queue.submit(JobRecord::new("probe").with_uuid("sync"), third.clone());
    assert_eq!(refused.err().map(|e| e.code()), Some("DUPLICATE_JOB"));

    assert_eq!(new.wait().await, JobOutcome::Success);
    assert_eq!(first.attempts(), 0);
    assert_eq!(second.attempts(), 1);
    assert_eq!(third.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_while_delayed_never_executes() {
    let queue = queue();
    let probe = Probe::succeeding();
    let record = JobRecord::new("probe").with_delay(Duration::from_secs(30));

    let handle = queue.submit(record, probe.clone()).unwrap();
    sleep(Duration::from_secs(5)).await;
    assert_eq!(handle.state(), JobState::Blocked);

    queue.cancel(handle.id()).unwrap();
    assert_eq!(handle.wait().await, JobOutcome::Fail(JobError::Cancelled));

    sleep(Duration::from_secs(60)).await;
    assert_eq!(probe.attempts(), 0);
    assert_eq!(probe.removed().len(), 1);
    assert_eq!(queue.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_retry_wait_stops_the_job() {
    let queue = queue();
    let probe = Probe::failing(RetryDecision::RetryAfter(3600.0));
    let record = JobRecord::new("probe").with_retry_limit(Limit::Limited(3));

    let handle = queue.submit(record, probe.clone()).unwrap();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(handle.state(), JobState::Retrying);

    assert!(handle.cancel());
    assert_eq!(handle.wait().await, JobOutcome::Fail(JobError::Cancelled));

    sleep(Duration::from_secs(7200)).await;
    assert_eq!(probe.attempts(), 1);
    assert_eq!(probe.removed(), vec![JobOutcome::Fail(JobError::Cancelled)]);
    assert_eq!(queue.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_decision_wraps_the_failure() {
    let queue = queue();
    let probe = Probe::failing(RetryDecision::Cancel);
    let record = JobRecord::new("probe").with_retry_limit(Limit::Limited(2));

    let outcome = queue.submit(record, probe.clone()).unwrap().wait().await;

    assert_eq!(
        outcome,
        JobOutcome::Fail(JobError::RetryCancelled(Box::new(JobError::execution("boom"))))
    );
    assert_eq!(probe.attempts(), 1);
    assert_eq!(probe.retry_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn network_gated_job_waits_for_connectivity() {
    init_tracing();
    let network = Arc::new(ManualConnectivity::new(Connectivity::Offline));
    let queue = JobQueue::builder(QueueConfig::default())
        .connectivity(network.clone())
        .build();
    let probe = Probe::succeeding();
    let record = JobRecord::new("probe").with_network(NetworkRequirement::Wifi);

    let handle = queue.submit(record, probe.clone()).unwrap();
    sleep(Duration::from_secs(5)).await;
    assert_eq!(handle.state(), JobState::Blocked);

    network.set(Connectivity::Cellular);
    sleep(Duration::from_secs(5)).await;
    assert_eq!(probe.attempts(), 0);

    network.set(Connectivity::Wifi);
    assert_eq!(network.current(), Connectivity::Wifi);
    assert_eq!(handle.wait().await, JobOutcome::Success);
    assert_eq!(probe.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn network_blocked_job_is_discarded_at_its_deadline() {
    init_tracing();
    let network = Arc::new(ManualConnectivity::new(Connectivity::Offline));
    let queue = JobQueue::builder(QueueConfig::default())
        .connectivity(network.clone())
        .build();
    let gated = Probe::succeeding();
    let record = JobRecord::new("probe")
        .with_network(NetworkRequirement::Wifi)
        .with_deadline(chrono::Utc::now() + chrono::Duration::seconds(5));

    let handle = queue.submit(record, gated.clone()).unwrap();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(handle.state(), JobState::Blocked);

    let outcome = handle.wait().await;
    assert_eq!(outcome.error().map(JobError::code), Some("DEADLINE_PASSED"));
    assert_eq!(handle.state(), JobState::Terminated);
    assert_eq!(gated.attempts(), 0);
    assert_eq!(gated.removed().len(), 1);

    // The group slot is free again for the next job.
    let next = Probe::succeeding();
    let outcome = queue
        .submit(JobRecord::new("probe"), next.clone())
        .unwrap()
        .wait()
        .await;
    assert_eq!(outcome, JobOutcome::Success);
    assert_eq!(next.attempts(), 1);
    queue.wait_idle().await;
    assert_eq!(queue.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn same_group_jobs_never_overlap() {
    let queue = queue();
    let probe = Probe::working(Duration::from_secs(5));

    let a = queue
        .submit(JobRecord::new("probe").with_group("uploads"), probe.clone())
        .unwrap();
    let b = queue
        .submit(JobRecord::new("probe").with_group("uploads"), probe.clone())
        .unwrap();
    a.wait().await;
    b.wait().await;

    assert_eq!(probe.peak.load(Ordering::SeqCst), 1);
    assert_eq!(probe.gaps(), vec![5]);
}

#[tokio::test(start_paused = true)]
async fn different_groups_run_concurrently() {
    let queue = queue();
    let probe = Probe::working(Duration::from_secs(5));

    let a = queue
        .submit(JobRecord::new("probe").with_group("uploads"), probe.clone())
        .unwrap();
    let b = queue
        .submit(JobRecord::new("probe").with_group("thumbnails"), probe.clone())
        .unwrap();
    a.wait().await;
    b.wait().await;

    assert_eq!(probe.peak.load(Ordering::SeqCst), 2);
    assert_eq!(probe.gaps(), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn configured_group_concurrency_is_honoured() {
    init_tracing();
    let queue = JobQueue::new(QueueConfig::default().with_group("uploads", 2));
    let probe = Probe::working(Duration::from_secs(5));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            queue
                .submit(JobRecord::new("probe").with_group("uploads"), probe.clone())
                .unwrap()
        })
        .collect();
    for handle in &handles {
        handle.wait().await;
    }

    assert_eq!(probe.peak.load(Ordering::SeqCst), 2);
    assert_eq!(probe.gaps(), vec![0, 5]);
}

#[tokio::test(start_paused = true)]
async fn cancel_racing_completion_notifies_once() {
    let queue = queue();
    let held = Arc::new(Held::default());
    let handle = queue.submit(JobRecord::new("held"), held.clone()).unwrap();

    while held.pending.lock().unwrap().is_none() {
        sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(handle.state(), JobState::Running);

    assert!(handle.cancel());
    let late = held.pending.lock().unwrap().take().unwrap();
    late.success();
    assert!(!handle.cancel());

    assert_eq!(handle.wait().await, JobOutcome::Fail(JobError::Cancelled));
    queue.wait_idle().await;
    assert_eq!(
        *held.removed.lock().unwrap(),
        vec![JobOutcome::Fail(JobError::Cancelled)]
    );
}

#[tokio::test(start_paused = true)]
async fn cancel_by_tag_only_touches_tagged_jobs() {
    let queue = queue();
    let probe = Probe::succeeding();
    let delayed = || JobRecord::new("probe").with_delay(Duration::from_secs(60));

    let a = queue.submit(delayed().with_tag("sync"), probe.clone()).unwrap();
    let b = queue
        .submit(delayed().with_tag("sync").with_group("other"), probe.clone())
        .unwrap();
    let c = queue.submit(delayed().with_tag("media"), probe.clone()).unwrap();

    assert_eq!(queue.cancel_by_tag("sync"), 2);
    assert_eq!(a.wait().await, JobOutcome::Fail(JobError::Cancelled));
    assert_eq!(b.wait().await, JobOutcome::Fail(JobError::Cancelled));
    assert_eq!(c.wait().await, JobOutcome::Success);
    assert_eq!(queue.cancel_all(), 0);
}

#[tokio::test(start_paused = true)]
async fn persisted_job_is_saved_then_deleted() {
    init_tracing();
    let store = Arc::new(SqliteJobStore::open_in_memory().unwrap());
    let queue = JobQueue::builder(QueueConfig::default())
        .store(store.clone())
        .build();
    let probe = Probe::succeeding();
    let record = JobRecord::new("probe")
        .persisted()
        .periodic(Limit::Limited(2), Duration::from_secs(10));
    let id = record.id.clone();

    let handle = queue.submit(record, probe.clone()).unwrap();
    sleep(Duration::from_secs(1)).await;

    let rows = store.load_all().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, id);
    assert_eq!(rows[0].decode().unwrap().run_count, 1);

    assert_eq!(handle.wait().await, JobOutcome::Success);
    assert!(store.load_all().unwrap().is_empty());
}

struct ProbeFactory(Arc<Probe>);

impl JobFactory for ProbeFactory {
    fn create(&self, job_type: &str, _params: &Params) -> Option<Arc<dyn Job>> {
        (job_type == "probe").then(|| self.0.clone() as Arc<dyn Job>)
    }
}

#[tokio::test(start_paused = true)]
async fn rehydrate_resumes_counters_and_drops_bad_rows() {
    init_tracing();
    let uri = "file:tasklane_rehydrate?mode=memory&cache=shared";
    let store = Arc::new(SqliteJobStore::new(Connection::open(uri).unwrap()).unwrap());
    let raw = Connection::open(uri).unwrap();

    let mut resumed = JobRecord::new("probe")
        .persisted()
        .periodic(Limit::Limited(3), Duration::ZERO)
        .with_tag("nightly");
    resumed.run_count = 2;
    let unknown = JobRecord::new("mystery").persisted();
    store.save(&resumed).unwrap();
    store.save(&unknown).unwrap();
    raw.execute(
        "INSERT INTO queued_jobs (id, job_type, job_group, record, created_at, updated_at)
         VALUES ('garbled', 'probe', 'default', '{not json', '2020-01-01T00:00:00Z', '2020-01-01T00:00:00Z')",
        [],
    )
    .unwrap();

    let probe = Probe::succeeding();
    let queue = JobQueue::builder(QueueConfig::default())
        .store(store.clone())
        .build();
    let report = queue.rehydrate(&ProbeFactory(probe.clone())).unwrap();

    assert_eq!(report.restored, vec![resumed.id.clone()]);
    let dropped: BTreeSet<&str> = report.dropped.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(dropped, BTreeSet::from(["garbled", unknown.id.as_str()]));

    let handle = queue.get(&resumed.id).expect("restored job is live");
    assert_eq!(handle.record().tags, resumed.tags);
    assert_eq!(handle.wait().await, JobOutcome::Success);

    // Only the one remaining run executes.
    assert_eq!(probe.attempts(), 1);
    queue.wait_idle().await;
    assert!(store.load_all().unwrap().is_empty());
}
