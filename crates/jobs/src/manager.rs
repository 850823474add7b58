//! Concurrent job scheduler with retry, backoff and cooperative cancellation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batcher::{BatchSink, Batcher};
use crate::config::JobManagerConfig;
use crate::store::{JobStore, JobStoreError};
use crate::types::{JobId, JobOutcome, JobRecord, RetryConfig, RunContext};

/// Host policy plugged into the generic manager.
#[async_trait]
pub trait JobHandler<T>: Send + Sync + 'static
where
    T: Send + Sync + 'static,
{
    /// Store query used to pick the next jobs.
    type Query: Send + 'static;

    /// Deterministic id derived from immutable payload fields.
    fn job_id(&self, data: &T) -> JobId;

    /// Identifier safe to write to logs.
    fn job_id_for_logging(&self, data: &T) -> String;

    fn retry_config(&self, data: &T) -> RetryConfig;

    /// Query for up to `limit` jobs eligible at `now`.
    fn next_jobs_query(&self, limit: usize, now: DateTime<Utc>) -> Self::Query;

    /// While true, scheduling passes start nothing.
    async fn should_hold_off(&self) -> bool {
        false
    }

    /// The job body. An `Err` is an unexpected failure and is retried.
    async fn run(&self, job: JobRecord<T>, ctx: RunContext) -> anyhow::Result<JobOutcome<T>>;
}

/// Job manager error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobManagerError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddJobOptions {
    /// Run as soon as a concurrency slot is free, ahead of the backlog.
    pub force_start: bool,
}

impl AddJobOptions {
    pub fn forced() -> Self {
        Self { force_start: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelReason {
    /// `stop`: leave the record queued.
    Shutdown,
    /// `cancel_jobs`: delete the record.
    Removed,
}

struct ActiveJob {
    cancellation: CancellationToken,
    reason: Option<CancelReason>,
}

struct ManagerState {
    enabled: bool,
    shutdown: Option<CancellationToken>,
    scheduler: Option<JoinHandle<()>>,
    active: HashMap<JobId, ActiveJob>,
    forced: VecDeque<JobId>,
    idle_waiters: Vec<oneshot::Sender<()>>,
}

/// Runs stored jobs with bounded concurrency.
///
/// Cheap to clone; clones share the same scheduler.
pub struct JobManager<T, H, S>
where
    T: Clone + Send + Sync + 'static,
    H: JobHandler<T>,
    S: JobStore<T, H::Query> + 'static,
{
    inner: Arc<Inner<T, H, S>>,
}

impl<T, H, S> Clone for JobManager<T, H, S>
where
    T: Clone + Send + Sync + 'static,
    H: JobHandler<T>,
    S: JobStore<T, H::Query> + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T, H, S>
where
    T: Clone + Send + Sync + 'static,
    H: JobHandler<T>,
    S: JobStore<T, H::Query> + 'static,
{
    config: JobManagerConfig,
    handler: H,
    store: S,
    batcher: Batcher<JobRecord<T>, StoreSink<T, H, S>>,
    slots: Arc<Semaphore>,
    state: Mutex<ManagerState>,
    wake: Notify,
    active_changed: watch::Sender<usize>,
}

/// Writes batched inserts to the store and requests a pass.
struct StoreSink<T, H, S>
where
    T: Clone + Send + Sync + 'static,
    H: JobHandler<T>,
    S: JobStore<T, H::Query> + 'static,
{
    manager: Weak<Inner<T, H, S>>,
}

#[async_trait]
impl<T, H, S> BatchSink<JobRecord<T>> for StoreSink<T, H, S>
where
    T: Clone + Send + Sync + 'static,
    H: JobHandler<T>,
    S: JobStore<T, H::Query> + 'static,
{
    async fn write_batch(&self, items: &[JobRecord<T>]) -> anyhow::Result<()> {
        let Some(inner) = self.manager.upgrade() else {
            return Ok(());
        };
        inner.store.insert(items.to_vec()).await?;
        inner.wake.notify_one();
        Ok(())
    }
}

impl<T, H, S> JobManager<T, H, S>
where
    T: Clone + Send + Sync + 'static,
    H: JobHandler<T>,
    S: JobStore<T, H::Query> + 'static,
{
    pub fn new(config: JobManagerConfig, handler: H, store: S) -> Self {
        let inner = Arc::new_cyclic(|weak| Inner {
            slots: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            batcher: Batcher::new(
                config.batch.clone(),
                StoreSink {
                    manager: weak.clone(),
                },
            ),
            config,
            handler,
            store,
            state: Mutex::new(ManagerState {
                enabled: false,
                shutdown: None,
                scheduler: None,
                active: HashMap::new(),
                forced: VecDeque::new(),
                idle_waiters: Vec::new(),
            }),
            wake: Notify::new(),
            active_changed: watch::Sender::new(0),
        });
        Self { inner }
    }

    pub fn handler(&self) -> &H {
        &self.inner.handler
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn config(&self) -> &JobManagerConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_state().enabled
    }

    pub fn active_job_count(&self) -> usize {
        self.inner.lock_state().active.len()
    }

    pub fn is_active(&self, id: &JobId) -> bool {
        self.inner.lock_state().active.contains_key(id)
    }

    /// Start scheduling. Idempotent.
    ///
    /// Records left active by a previous process are released first.
    pub async fn start(&self) -> Result<(), JobManagerError> {
        {
            let mut state = self.inner.lock_state();
            if state.enabled {
                return Ok(());
            }
            state.enabled = true;
        }

        self.inner.batcher.flush_and_wait().await;
        if let Err(err) = self.inner.store.mark_all_inactive().await {
            self.inner.lock_state().enabled = false;
            error!(manager = %self.inner.config.name, error = %err, "failed to release stale jobs");
            return Err(err.into());
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(scheduler_loop(Arc::clone(&self.inner), shutdown.clone()));
        {
            let mut state = self.inner.lock_state();
            state.shutdown = Some(shutdown);
            state.scheduler = Some(handle);
        }

        info!(
            manager = %self.inner.config.name,
            max_concurrent_jobs = self.inner.config.max_concurrent_jobs,
            "job manager started"
        );
        Ok(())
    }

    /// Stop scheduling and wait for active jobs to unwind.
    ///
    /// Interrupted jobs stay queued and resume after the next `start`.
    pub async fn stop(&self) {
        let (shutdown, scheduler) = {
            let mut state = self.inner.lock_state();
            if !state.enabled {
                return;
            }
            state.enabled = false;
            (state.shutdown.take(), state.scheduler.take())
        };

        if let Some(shutdown) = shutdown {
            shutdown.cancel();
        }
        if let Some(scheduler) = scheduler {
            if let Err(err) = scheduler.await {
                error!(manager = %self.inner.config.name, error = %err, "scheduler task failed");
            }
        }

        let cancelled = {
            let mut state = self.inner.lock_state();
            for job in state.active.values_mut() {
                job.reason.get_or_insert(CancelReason::Shutdown);
                job.cancellation.cancel();
            }
            state.active.len()
        };
        if cancelled > 0 {
            info!(manager = %self.inner.config.name, cancelled, "waiting for active jobs to stop");
        }

        self.inner.wait_until(|state| state.active.is_empty()).await;
        self.inner.lock_state().idle_waiters.clear();
        info!(manager = %self.inner.config.name, "job manager stopped");
    }

    /// Persist a job and request a scheduling pass.
    ///
    /// Adding an id that is already stored refreshes its payload only.
    pub async fn add_job(&self, data: T, options: AddJobOptions) -> Result<JobId, JobManagerError> {
        let id = self.inner.handler.job_id(&data);
        let logging_id = self.inner.handler.job_id_for_logging(&data);
        let record = JobRecord::new(id.clone(), data);

        if options.force_start {
            self.inner.store.insert(vec![record]).await?;
            self.inner.lock_state().forced.push_back(id.clone());
            debug!(manager = %self.inner.config.name, job = %logging_id, "added forced job");
            self.inner.wake.notify_one();
        } else {
            self.inner.batcher.add(record);
            debug!(manager = %self.inner.config.name, job = %logging_id, "queued job");
        }

        Ok(id)
    }

    /// Request a scheduling pass, e.g. after an external pause cleared.
    pub fn wake(&self) {
        self.inner.wake.notify_one();
    }

    /// Write any batched inserts to the store now.
    pub async fn flush_batched_jobs(&self) {
        self.inner.batcher.flush_and_wait().await;
    }

    /// Cancel and delete every job matching `predicate`.
    ///
    /// Returns once matching active jobs have unwound. Yields the number of
    /// jobs cancelled.
    pub async fn cancel_jobs<F>(&self, predicate: F) -> Result<usize, JobManagerError>
    where
        F: Fn(&JobRecord<T>) -> bool,
    {
        self.flush_batched_jobs().await;

        let jobs = self.inner.store.jobs().await?;
        let mut queued = Vec::new();
        let mut running = HashSet::new();
        {
            let mut state = self.inner.lock_state();
            for record in jobs.iter().filter(|record| predicate(record)) {
                match state.active.get_mut(&record.id) {
                    Some(active) => {
                        active.reason = Some(CancelReason::Removed);
                        active.cancellation.cancel();
                        running.insert(record.id.clone());
                    }
                    None => queued.push(record.id.clone()),
                }
            }
            let removed: HashSet<_> = queued.iter().collect();
            state.forced.retain(|id| !removed.contains(id));
        }

        for id in &queued {
            self.inner.store.remove(id).await?;
        }

        let count = queued.len() + running.len();
        if count > 0 {
            info!(
                manager = %self.inner.config.name,
                queued = queued.len(),
                running = running.len(),
                "cancelling jobs"
            );
        }

        self.inner
            .wait_until(|state| running.iter().all(|id| !state.active.contains_key(id)))
            .await;
        self.inner.wake.notify_one();
        Ok(count)
    }

    /// Resolve once nothing is running and nothing runnable is queued.
    ///
    /// Also resolves when the manager stops, and immediately while it is
    /// stopped.
    pub async fn wait_for_idle(&self) {
        self.reached_idle().await;
    }

    /// Run `callback` once, the next time the manager becomes idle.
    ///
    /// The callback is dropped if the manager stops first.
    pub fn wait_for_idle_then<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let manager = self.clone();
        tokio::spawn(async move {
            if manager.reached_idle().await {
                callback();
            }
        });
    }

    /// False when the manager was or became stopped before draining.
    async fn reached_idle(&self) -> bool {
        self.flush_batched_jobs().await;

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.lock_state();
            if !state.enabled {
                return false;
            }
            state.idle_waiters.push(tx);
        }
        self.inner.wake.notify_one();
        rx.await.is_ok()
    }
}

async fn scheduler_loop<T, H, S>(inner: Arc<Inner<T, H, S>>, shutdown: CancellationToken)
where
    T: Clone + Send + Sync + 'static,
    H: JobHandler<T>,
    S: JobStore<T, H::Query> + 'static,
{
    let mut ticker = tokio::time::interval(inner.config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = inner.wake.notified() => {}
            _ = ticker.tick() => {}
        }
        inner.run_pass().await;
    }

    debug!(manager = %inner.config.name, "scheduler loop exited");
}

impl<T, H, S> Inner<T, H, S>
where
    T: Clone + Send + Sync + 'static,
    H: JobHandler<T>,
    S: JobStore<T, H::Query> + 'static,
{
    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_active_count(&self, count: usize) {
        self.active_changed.send_replace(count);
    }

    async fn wait_until<F>(&self, done: F)
    where
        F: Fn(&ManagerState) -> bool,
    {
        let mut changes = self.active_changed.subscribe();
        loop {
            if done(&self.lock_state()) {
                return;
            }
            if changes.changed().await.is_err() {
                return;
            }
        }
    }

    fn resolve_idle_waiters(&self) {
        let waiters = std::mem::take(&mut self.lock_state().idle_waiters);
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    /// One scheduling pass. Passes never overlap: only the scheduler loop
    /// runs them.
    async fn run_pass(self: &Arc<Self>) {
        if !self.lock_state().enabled {
            return;
        }

        if self.handler.should_hold_off().await {
            debug!(manager = %self.config.name, "holding off, not starting jobs");
            if self.lock_state().active.is_empty() {
                self.resolve_idle_waiters();
            }
            return;
        }

        self.start_forced_jobs().await;

        let free = self.slots.available_permits();
        if free > 0 {
            let query = self.handler.next_jobs_query(free, Utc::now());
            match self.store.next_jobs(query).await {
                Ok(jobs) => {
                    for record in jobs {
                        if !self.start_job(record).await {
                            break;
                        }
                    }
                }
                Err(err) => {
                    error!(manager = %self.config.name, error = %err, "failed to fetch next jobs");
                }
            }
        }

        self.check_idle().await;
    }

    async fn start_forced_jobs(self: &Arc<Self>) {
        loop {
            if self.slots.available_permits() == 0 {
                return;
            }
            let Some(id) = self.lock_state().forced.pop_front() else {
                return;
            };

            match self.store.get(&id).await {
                Ok(Some(record)) => {
                    self.start_job(record).await;
                }
                Ok(None) => debug!(manager = %self.config.name, job_id = %id, "forced job no longer stored"),
                Err(err) => {
                    error!(manager = %self.config.name, job_id = %id, error = %err, "failed to load forced job");
                }
            }
        }
    }

    async fn check_idle(&self) {
        {
            let state = self.lock_state();
            if state.idle_waiters.is_empty() || !state.active.is_empty() || !state.forced.is_empty()
            {
                return;
            }
        }

        let query = self.handler.next_jobs_query(1, Utc::now());
        match self.store.next_jobs(query).await {
            Ok(jobs) if jobs.is_empty() => {
                debug!(manager = %self.config.name, "job manager is idle");
                self.resolve_idle_waiters();
            }
            Ok(_) => {}
            Err(err) => {
                error!(manager = %self.config.name, error = %err, "failed to check for queued jobs");
            }
        }
    }

    /// Claim `record` and spawn its body. Returns false when no slot is free.
    async fn start_job(self: &Arc<Self>, mut record: JobRecord<T>) -> bool {
        let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
            return false;
        };

        let cancellation = CancellationToken::new();
        let active_count = {
            let mut state = self.lock_state();
            if !state.enabled || state.active.contains_key(&record.id) {
                return true;
            }
            state.active.insert(
                record.id.clone(),
                ActiveJob {
                    cancellation: cancellation.clone(),
                    reason: None,
                },
            );
            state.active.len()
        };
        self.publish_active_count(active_count);

        record.mark_running(Utc::now());
        if let Err(err) = self.store.update(&record).await {
            match err {
                JobStoreError::NotFound(_) => {
                    debug!(manager = %self.config.name, job_id = %record.id, "job removed before start");
                }
                err => {
                    error!(manager = %self.config.name, job_id = %record.id, error = %err, "failed to claim job");
                }
            }
            self.release(&record.id);
            return true;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.drive(record, cancellation, permit).await });
        true
    }

    async fn drive(
        self: Arc<Self>,
        record: JobRecord<T>,
        cancellation: CancellationToken,
        permit: OwnedSemaphorePermit,
    ) {
        let retry = self.handler.retry_config(&record.data);
        let logging_id = self.handler.job_id_for_logging(&record.data);
        let ctx = RunContext {
            cancellation,
            attempt: record.attempts,
            is_last_attempt: retry.is_last_attempt(record.attempts),
        };

        info!(
            manager = %self.config.name,
            job = %logging_id,
            attempt = record.attempts,
            is_last_attempt = ctx.is_last_attempt,
            "starting job"
        );

        let body = {
            let inner = Arc::clone(&self);
            let job = record.clone();
            tokio::spawn(async move { inner.handler.run(job, ctx).await })
        };
        let outcome = match body.await {
            Ok(result) => result,
            Err(err) => Err(anyhow::anyhow!("job task failed: {err}")),
        };

        self.complete(record, &retry, &logging_id, outcome).await;
        drop(permit);
        self.wake.notify_one();
    }

    async fn complete(
        &self,
        mut record: JobRecord<T>,
        retry: &RetryConfig,
        logging_id: &str,
        outcome: anyhow::Result<JobOutcome<T>>,
    ) {
        let name = &self.config.name;
        let reason = self
            .lock_state()
            .active
            .get(&record.id)
            .and_then(|job| job.reason);

        let removed = match (reason, outcome) {
            (Some(CancelReason::Removed), _) => {
                info!(manager = %name, job = %logging_id, "job cancelled and removed");
                self.remove_record(&record.id).await;
                true
            }
            (_, Ok(JobOutcome::Finished { follow_up })) => {
                info!(manager = %name, job = %logging_id, attempt = record.attempts, "job finished");
                self.remove_record(&record.id).await;
                if let Some(data) = follow_up {
                    let follow_up = JobRecord::new(self.handler.job_id(&data), data);
                    if let Err(err) = self.store.insert(vec![follow_up]).await {
                        error!(manager = %name, job = %logging_id, error = %err, "failed to store follow-up job");
                    }
                }
                true
            }
            (Some(CancelReason::Shutdown), _) | (None, Ok(JobOutcome::Cancelled)) => {
                info!(manager = %name, job = %logging_id, "job interrupted, leaving it queued");
                record.mark_queued();
                self.write_record(&record).await;
                false
            }
            (None, result) => {
                if let Err(err) = &result {
                    error!(
                        manager = %name,
                        job = %logging_id,
                        attempt = record.attempts,
                        error = %err,
                        "job failed unexpectedly"
                    );
                }
                if retry.is_last_attempt(record.attempts) {
                    warn!(
                        manager = %name,
                        job = %logging_id,
                        attempts = record.attempts,
                        "attempts exhausted, removing job"
                    );
                    self.remove_record(&record.id).await;
                    true
                } else {
                    let delay = retry.backoff.delay_for_attempt(record.attempts);
                    let retry_after = retry_instant(Utc::now(), delay);
                    info!(
                        manager = %name,
                        job = %logging_id,
                        attempt = record.attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        "job will be retried"
                    );
                    record.mark_retry(retry_after);
                    self.write_record(&record).await;
                    false
                }
            }
        };

        // A cancel_jobs that raced with completion still gets its deletion.
        if let Some(CancelReason::Removed) = self.release(&record.id) {
            if !removed {
                self.remove_record(&record.id).await;
            }
        }
    }

    /// Drop `id` from the active set; returns its final cancel reason.
    fn release(&self, id: &JobId) -> Option<CancelReason> {
        let (job, count) = {
            let mut state = self.lock_state();
            let job = state.active.remove(id);
            (job, state.active.len())
        };
        self.publish_active_count(count);
        job.and_then(|job| job.reason)
    }

    async fn remove_record(&self, id: &JobId) {
        if let Err(err) = self.store.remove(id).await {
            error!(manager = %self.config.name, job_id = %id, error = %err, "failed to remove job");
        }
    }

    async fn write_record(&self, record: &JobRecord<T>) {
        match self.store.update(record).await {
            Ok(()) => {}
            Err(JobStoreError::NotFound(_)) => {
                debug!(manager = %self.config.name, job_id = %record.id, "job removed while running");
            }
            Err(err) => {
                error!(manager = %self.config.name, job_id = %record.id, error = %err, "failed to update job");
            }
        }
    }
}

fn retry_instant(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
