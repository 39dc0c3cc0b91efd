use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use tasklane_core::{Connectivity, JobError, JobOutcome, JobRecord, QueueConfig};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    connectivity::{ConnectivityProvider, ManualConnectivity},
    constraint::{chain_for, QueueContext},
    engine::{ExecutionEngine, JobState},
    error::{Result, SchedulerError},
    job::Job,
    registry::JobFactory,
    store::JobStore,
};

#[derive(Default)]
struct ActiveJobs {
    engines: HashMap<String, Arc<ExecutionEngine>>,
    /// uuid → id of the engine holding it.
    claims: HashMap<String, String>,
}

impl ActiveJobs {
    fn claimant(&self, uuid: &str) -> Option<&Arc<ExecutionEngine>> {
        self.claims
            .get(uuid)
            .and_then(|id| self.engines.get(id))
            .filter(|engine| !engine.is_terminated())
    }
}

struct QueueInner {
    config: QueueConfig,
    active: Mutex<ActiveJobs>,
    groups: DashMap<String, Arc<Semaphore>>,
    idle: Notify,
    clock: Clock,
    connectivity: Arc<dyn ConnectivityProvider>,
    store: Option<Arc<dyn JobStore>>,
}

/// Runs submitted jobs on the tokio runtime, one semaphore per group.
///
/// Cloning is cheap; every clone drives the same set of jobs.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

/// Builder for [`JobQueue`]. Without a connectivity provider the queue
/// assumes Wi-Fi, and without a store nothing is persisted.
pub struct QueueBuilder {
    config: QueueConfig,
    clock: Option<Clock>,
    connectivity: Option<Arc<dyn ConnectivityProvider>>,
    store: Option<Arc<dyn JobStore>>,
}

impl QueueBuilder {
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn connectivity(mut self, provider: Arc<dyn ConnectivityProvider>) -> Self {
        self.connectivity = Some(provider);
        self
    }

    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> JobQueue {
        let connectivity = self
            .connectivity
            .unwrap_or_else(|| Arc::new(ManualConnectivity::new(Connectivity::Wifi)));
        JobQueue {
            inner: Arc::new(QueueInner {
                config: self.config,
                active: Mutex::new(ActiveJobs::default()),
                groups: DashMap::new(),
                idle: Notify::new(),
                clock: self.clock.unwrap_or_default(),
                connectivity,
                store: self.store,
            }),
        }
    }
}

/// Schedule-time view handed to constraints while the registry is locked.
/// Displaced claimants are collected and cancelled once the lock is gone.
struct ScheduleContext<'a> {
    active: &'a ActiveJobs,
    displaced: RefCell<Vec<Arc<ExecutionEngine>>>,
}

impl QueueContext for ScheduleContext<'_> {
    fn is_claimed(&self, uuid: &str) -> bool {
        self.active.claimant(uuid).is_some()
    }

    fn cancel_claim(&self, uuid: &str) -> bool {
        match self.active.claimant(uuid) {
            Some(engine) => {
                self.displaced.borrow_mut().push(Arc::clone(engine));
                true
            }
            None => false,
        }
    }
}

impl JobQueue {
    pub fn builder(config: QueueConfig) -> QueueBuilder {
        QueueBuilder {
            config,
            clock: None,
            connectivity: None,
            store: None,
        }
    }

    /// Queue with default collaborators; mostly for tests and embedding.
    pub fn new(config: QueueConfig) -> Self {
        Self::builder(config).build()
    }

    /// Validate, schedule and start `record`. Must be called inside a tokio
    /// runtime.
    ///
    /// A refused job has already been through its remove notification when
    /// this returns `Err`; the error is the same one `on_removed` saw.
    pub fn submit(
        &self,
        record: JobRecord,
        job: Arc<dyn Job>,
    ) -> std::result::Result<JobHandle, JobError> {
        let invalid = record.validate().err();
        let constraints = chain_for(&record, self.inner.clock, &self.inner.connectivity);
        let engine = ExecutionEngine::new(record, job, constraints, self.inner.store.clone());

        if let Some(e) = invalid {
            warn!(job_id = %engine.id(), error = %e, "rejecting invalid job");
            engine.abort(e.clone());
            return Err(e);
        }

        let (scheduled, displaced) = {
            let mut active = self.lock();
            let ctx = ScheduleContext {
                active: &active,
                displaced: RefCell::new(Vec::new()),
            };
            let scheduled = engine.schedule(&ctx);
            let displaced = ctx.displaced.into_inner();
            if scheduled.is_ok() {
                if let Some(uuid) = engine.uuid() {
                    active.claims.insert(uuid.to_string(), engine.id().to_string());
                }
                active
                    .engines
                    .insert(engine.id().to_string(), Arc::clone(&engine));
            }
            (scheduled, displaced)
        };

        for old in displaced {
            old.cancel();
        }

        if let Err(e) = scheduled {
            engine.abort(e.clone());
            return Err(e);
        }

        let queue = self.clone();
        let driver = Arc::clone(&engine);
        tokio::spawn(async move {
            queue.drive(driver).await;
        });

        Ok(JobHandle { engine })
    }

    /// Hold one slot of the job's group for the engine's whole lifetime.
    async fn drive(&self, engine: Arc<ExecutionEngine>) {
        let slots = self.group_slots(engine.group());
        let cancelled = engine.cancellation();
        let permit = tokio::select! {
            permit = slots.acquire_owned() => permit.ok(),
            _ = cancelled.cancelled() => None,
        };

        if permit.is_some() {
            debug!(job_id = %engine.id(), group = %engine.group(), "group slot acquired");
            Arc::clone(&engine).start().await;
        }
        drop(permit);
        self.finish(&engine);
    }

    fn finish(&self, engine: &ExecutionEngine) {
        let mut active = self.lock();
        active.engines.remove(engine.id());
        if let Some(uuid) = engine.uuid() {
            if active.claims.get(uuid).map(String::as_str) == Some(engine.id()) {
                active.claims.remove(uuid);
            }
        }
        if active.engines.is_empty() {
            self.inner.idle.notify_waiters();
        }
    }

    fn group_slots(&self, group: &str) -> Arc<Semaphore> {
        self.inner
            .groups
            .entry(group.to_string())
            .or_insert_with(|| {
                let slots = self.inner.config.concurrency_for(group);
                debug!(group, slots, "creating group");
                Arc::new(Semaphore::new(slots))
            })
            .clone()
    }

    /// Cancel one job by id.
    pub fn cancel(&self, id: &str) -> Result<()> {
        let engine = self
            .lock()
            .engines
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;
        engine.cancel();
        Ok(())
    }

    /// Cancel the live job claiming `uuid`. Returns whether one existed.
    pub fn cancel_by_uuid(&self, uuid: &str) -> bool {
        let engine = self.lock().claimant(uuid).cloned();
        engine.is_some_and(|engine| engine.cancel())
    }

    /// Cancel every live job carrying `tag`. Returns how many were cancelled.
    pub fn cancel_by_tag(&self, tag: &str) -> usize {
        let matching = self.collect(|engine| engine.tags().contains(tag));
        let cancelled = matching.iter().filter(|engine| engine.cancel()).count();
        info!(tag, cancelled, "cancelled jobs by tag");
        cancelled
    }

    pub fn cancel_all(&self) -> usize {
        let all = self.collect(|_| true);
        let cancelled = all.iter().filter(|engine| engine.cancel()).count();
        info!(cancelled, "cancelled all jobs");
        cancelled
    }

    /// Jobs submitted and not yet finished.
    pub fn active_count(&self) -> usize {
        self.lock().engines.len()
    }

    pub fn get(&self, id: &str) -> Option<JobHandle> {
        self.lock()
            .engines
            .get(id)
            .cloned()
            .map(|engine| JobHandle { engine })
    }

    /// Resolve once no job is active.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Resubmit every stored job. Rows that cannot be decoded or whose type
    /// `factory` does not know are deleted and reported.
    pub fn rehydrate(&self, factory: &dyn JobFactory) -> Result<RehydrateReport> {
        let store = match &self.inner.store {
            Some(store) => Arc::clone(store),
            None => return Ok(RehydrateReport::default()),
        };

        let mut report = RehydrateReport::default();
        for row in store.load_all()? {
            let record = match row.decode() {
                Ok(record) => record,
                Err(e) => {
                    report.drop_row(store.as_ref(), &row.id, e.to_string());
                    continue;
                }
            };
            let Some(job) = factory.create(&record.job_type, &record.params) else {
                let reason = format!("unknown job type {:?}", record.job_type);
                report.drop_row(store.as_ref(), &row.id, reason);
                continue;
            };

            let id = record.id.clone();
            match self.submit(record, job) {
                Ok(_) => report.restored.push(id),
                Err(e) => {
                    // The engine's remove path already deleted the row.
                    warn!(job_id = %id, error = %e, "restored job refused");
                    report.dropped.push(DroppedJob {
                        id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            restored = report.restored.len(),
            dropped = report.dropped.len(),
            "rehydrated persisted jobs"
        );
        Ok(report)
    }

    fn collect(&self, filter: impl Fn(&ExecutionEngine) -> bool) -> Vec<Arc<ExecutionEngine>> {
        self.lock()
            .engines
            .values()
            .filter(|engine| filter(engine))
            .cloned()
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, ActiveJobs> {
        self.inner.active.lock().expect("job registry poisoned")
    }
}

/// Result of [`JobQueue::rehydrate`].
#[derive(Debug, Default, Clone)]
pub struct RehydrateReport {
    /// Ids of resubmitted jobs, in store order.
    pub restored: Vec<String>,
    pub dropped: Vec<DroppedJob>,
}

impl RehydrateReport {
    fn drop_row(&mut self, store: &dyn JobStore, id: &str, reason: String) {
        warn!(job_id = %id, %reason, "dropping stored job");
        if let Err(e) = store.remove(id) {
            warn!(job_id = %id, "failed to delete stored job: {e}");
        }
        self.dropped.push(DroppedJob {
            id: id.to_string(),
            reason,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedJob {
    pub id: String,
    pub reason: String,
}

/// Caller-side view of one submitted job.
#[derive(Clone)]
pub struct JobHandle {
    engine: Arc<ExecutionEngine>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        self.engine.id()
    }

    pub fn state(&self) -> JobState {
        self.engine.state()
    }

    pub fn record(&self) -> JobRecord {
        self.engine.record()
    }

    /// Returns `false` if the job had already terminated.
    pub fn cancel(&self) -> bool {
        self.engine.cancel()
    }

    /// Wait for the final outcome.
    pub async fn wait(&self) -> JobOutcome {
        let mut rx = self.engine.subscribe();
        let outcome = rx.wait_for(Option::is_some).await.ok().and_then(|o| o.clone());
        outcome.unwrap_or(JobOutcome::Fail(JobError::Cancelled))
    }
}
