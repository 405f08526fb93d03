use crate::errors::QueueError;
use crate::registry::{self, JobHandler, Worker, WorkerOptions, box_handler};
use crate::schema::{Job, JobData};
use crate::storage;
use crate::util::{now_ms, try_to_extract_panic_info};
use futures_util::FutureExt;
use futures_util::future::join_all;
use serde_json::Value;
use sqlx::SqlitePool;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, instrument, trace, warn};
use uuid::Uuid;

/// Lifespan-bounded runs only claim jobs whose timeout leaves at least this
/// much of the lifespan unspent, covering claim and bookkeeping latency
/// before the host enforces its own kill deadline.
const SHUTDOWN_BUFFER_MS: i64 = 500;

const DEFAULT_TIMEOUT_MS: i64 = 25_000;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Path of the SQLite database file holding the job table.
    pub db_path: PathBuf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("jobstash.db"),
        }
    }
}

/// Options for a single job, all optional via [`Default`].
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Scheduling priority; higher runs first. Default `0`.
    pub priority: i64,
    /// Per-attempt timeout in milliseconds; `0` disables the timeout.
    /// Default `25_000`. Lifespan-bounded runs skip jobs without a timeout.
    pub timeout: i64,
    /// Total attempts before the job is marked failed. Default `1`.
    pub attempts: i64,
    /// Delay in milliseconds before a failed attempt may run again.
    /// Default `0`.
    pub retry_delay: i64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            timeout: DEFAULT_TIMEOUT_MS,
            attempts: 1,
            retry_delay: 0,
        }
    }
}

#[derive(Debug, Default)]
struct LoopState {
    active: bool,
    start_time: Option<i64>,
    lifespan: i64,
}

impl LoopState {
    /// Remaining lifespan in ms. `0` means "no lifespan mode"; an exactly
    /// expired lifespan maps to `-1` so callers can tell the two apart.
    fn lifespan_remaining(&self, now: i64) -> i64 {
        let Some(start_time) = self.start_time else {
            return 0;
        };
        if self.lifespan <= 0 {
            return 0;
        }
        let remaining = self.lifespan - (now - start_time);
        if remaining == 0 { -1 } else { remaining }
    }
}

/// A durable, priority-ordered job queue backed by a local SQLite database.
///
/// Cloning is cheap; clones share the store handle and the processing-loop
/// state. Worker registrations are process-wide and shared by every queue
/// instance.
#[derive(Debug, Clone)]
pub struct Queue {
    pool: SqlitePool,
    db_path: PathBuf,
    state: Arc<Mutex<LoopState>>,
}

impl Queue {
    /// Opens (or creates) the queue database and returns a queue handle.
    ///
    /// The underlying store handle is shared process-wide per path and
    /// initialized lazily on first open.
    pub async fn open(config: QueueConfig) -> Result<Self, QueueError> {
        let pool = storage::open(&config.db_path).await?;
        Ok(Self {
            pool,
            db_path: config.db_path,
            state: Arc::new(Mutex::new(LoopState::default())),
        })
    }

    /// Registers a worker for jobs named `name`.
    ///
    /// Re-registering a name replaces the previous worker. Handlers already
    /// executing keep the callable they were dispatched with.
    pub fn add_worker<F, Fut>(
        &self,
        name: &str,
        handler: F,
        options: WorkerOptions,
    ) -> Result<(), QueueError>
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        registry::register(
            name,
            Worker {
                handler: box_handler(handler),
                options,
            },
        )
    }

    /// Removes the worker for `name`. Jobs of that name subsequently fail
    /// with [`QueueError::NoWorker`].
    pub fn remove_worker(&self, name: &str) {
        registry::unregister(name);
    }

    /// Persists a new job and returns its id.
    ///
    /// With `start_queue` set, an idle queue begins processing in the
    /// background; the call itself never waits on job execution.
    #[instrument(name = "queue.create_job", skip(self, payload, options))]
    pub async fn create_job(
        &self,
        name: &str,
        payload: Value,
        options: JobOptions,
        start_queue: bool,
    ) -> Result<String, QueueError> {
        if name.is_empty() {
            return Err(QueueError::InvalidArgument(
                "job name must be non-empty".into(),
            ));
        }
        if options.timeout < 0 {
            return Err(QueueError::InvalidArgument(
                "job timeout must be non-negative".into(),
            ));
        }
        if options.attempts < 0 {
            return Err(QueueError::InvalidArgument(
                "job attempts must be non-negative".into(),
            ));
        }
        if options.retry_delay < 0 {
            return Err(QueueError::InvalidArgument(
                "job retry delay must be non-negative".into(),
            ));
        }

        let now = now_ms();
        let job = Job {
            id: Uuid::new_v4().to_string(),
            name: name.to_owned(),
            payload: serde_json::to_string(&payload)?,
            data: serde_json::to_string(&JobData::new(options.attempts))?,
            priority: options.priority,
            active: false,
            timeout: options.timeout,
            created: now,
            failed: None,
            next_valid_time: now,
            retry_delay: options.retry_delay,
        };

        let mut tx = self.pool.begin().await?;
        storage::insert_job(&mut tx, &job).await?;
        tx.commit().await?;
        debug!(job.id = %job.id, "Created job");

        if start_queue && !self.state.lock().await.active {
            let queue = self.clone();
            tokio::spawn(async move {
                queue.start(0, -1).await;
            });
        }

        Ok(job.id)
    }

    /// Claims the next batch of eligible jobs inside one transaction.
    ///
    /// The highest-priority eligible job (ties broken by creation time)
    /// becomes the pivot; up to its worker's concurrency jobs of the same
    /// name are claimed together. `jobs_limit < 0` means unlimited.
    /// `lifespan_remaining > 0` restricts the batch to jobs whose timeout
    /// fits with the shutdown buffer; a negative value means a lifespan has
    /// expired, and nothing is claimed.
    pub async fn get_concurrent_jobs(
        &self,
        jobs_limit: i64,
        lifespan_remaining: i64,
    ) -> Result<Vec<Job>, QueueError> {
        if lifespan_remaining < 0 {
            return Ok(Vec::new());
        }

        let now = now_ms();
        let timeout_upper =
            (lifespan_remaining > 0).then(|| (lifespan_remaining - (SHUTDOWN_BUFFER_MS - 1)).max(0));
        let limit = (jobs_limit >= 0).then_some(jobs_limit);

        let mut tx = self.pool.begin().await?;
        let candidates = storage::select_eligible(&mut tx, now, timeout_upper, None, limit).await?;
        let Some(pivot) = candidates.first() else {
            return Ok(Vec::new());
        };

        let concurrency = registry::concurrency_of(&pivot.name).unwrap_or(1);
        let mut batch =
            storage::select_eligible(&mut tx, now, timeout_upper, Some(&pivot.name), limit).await?;
        batch.truncate(concurrency);

        for job in &mut batch {
            storage::mark_active(&mut tx, &job.id).await?;
            job.active = true;
        }
        tx.commit().await?;

        trace!(count = batch.len(), name = %pivot.name, "Claimed job batch");
        Ok(batch)
    }

    /// Executes one claimed job: races the handler against the job's
    /// timeout, then records the outcome.
    ///
    /// Success deletes the row; failure releases the claim, increments the
    /// attempt bookkeeping, and defers the job by its retry delay. Handler
    /// errors, timeouts, and missing workers are absorbed into row state;
    /// only storage errors escape.
    #[instrument(name = "job", skip_all, fields(job.id = %job.id, job.name = %job.name))]
    pub async fn process_job(&self, job: &Job) -> Result<(), QueueError> {
        // Snapshot before execution; the row may be deleted before a late
        // lifecycle hook fires.
        let id = job.id.clone();
        let payload = job.json_payload().unwrap_or(Value::Null);
        let worker = registry::lookup(&job.name).ok();

        if let Some(worker) = &worker {
            fire_hooks(
                vec![(worker.options.on_start.clone(), "onStart")],
                id.clone(),
                payload.clone(),
            );
        }

        debug!("Running job…");
        let result = self.run_handler(job, worker.as_ref(), &id, &payload).await;

        match result {
            Ok(()) => {
                debug!("Deleting successful job…");
                let mut tx = self.pool.begin().await?;
                storage::delete_successful_job(&mut tx, &id).await?;
                tx.commit().await?;

                if let Some(worker) = worker {
                    fire_hooks(
                        vec![
                            (worker.options.on_success.clone(), "onSuccess"),
                            (worker.options.on_complete.clone(), "onComplete"),
                        ],
                        id,
                        payload,
                    );
                }
            }
            Err(error) => {
                warn!("Failed to run job: {error}");
                let now = now_ms();

                let mut data = job.job_data()?;
                let failed_attempts = data.failed_attempts.unwrap_or(0) + 1;
                let terminal = failed_attempts >= data.attempts;
                data.failed_attempts = Some(failed_attempts);
                data.errors
                    .get_or_insert_with(Vec::new)
                    .push(error.to_string());

                let mut updated = job.clone();
                updated.data = serde_json::to_string(&data)?;
                updated.active = false;
                updated.next_valid_time = now + job.retry_delay;
                if terminal {
                    updated.failed = Some(now);
                }

                let mut tx = self.pool.begin().await?;
                storage::update_failed_job(&mut tx, &updated).await?;
                tx.commit().await?;

                if job.retry_delay > 0 {
                    self.schedule_retry_restart(job.retry_delay).await;
                }

                if let Some(worker) = worker {
                    let mut hooks = vec![(worker.options.on_failure.clone(), "onFailure")];
                    if terminal {
                        hooks.push((worker.options.on_failed.clone(), "onFailed"));
                        hooks.push((worker.options.on_complete.clone(), "onComplete"));
                    }
                    fire_hooks(hooks, id, payload);
                }
            }
        }

        Ok(())
    }

    async fn run_handler(
        &self,
        job: &Job,
        worker: Option<&Worker>,
        id: &str,
        payload: &Value,
    ) -> Result<(), QueueError> {
        let Some(worker) = worker else {
            return Err(QueueError::NoWorker(job.name.clone()));
        };

        let future = (worker.handler)(id.to_owned(), payload.clone());
        let future = AssertUnwindSafe(future).catch_unwind();

        let settled = if job.timeout > 0 {
            let window = Duration::from_millis(u64::try_from(job.timeout).unwrap_or(u64::MAX));
            match timeout(window, future).await {
                Ok(settled) => settled,
                Err(_) => {
                    return Err(QueueError::Timeout {
                        id: id.to_owned(),
                        ms: job.timeout,
                    });
                }
            }
        } else {
            future.await
        };

        match settled {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(QueueError::HandlerFailure(error.to_string())),
            Err(panic) => Err(QueueError::HandlerFailure(
                try_to_extract_panic_info(&*panic).to_string(),
            )),
        }
    }

    /// Runs the processing loop until the queue drains, `max_jobs` jobs
    /// have been processed, or the lifespan is spent.
    ///
    /// Returns `false` immediately if a loop is already running. A
    /// `lifespan` of `0` runs unbounded; `max_jobs < 0` means unlimited.
    /// Jobs within a batch run concurrently; batches run strictly one
    /// after another.
    pub async fn start(&self, lifespan: i64, max_jobs: i64) -> bool {
        {
            let mut state = self.state.lock().await;
            if state.active {
                return false;
            }
            state.active = true;

            let now = now_ms();
            let expired = matches!(
                state.start_time,
                Some(started) if state.lifespan > 0 && now - started >= state.lifespan
            );
            if state.start_time.is_none() || expired {
                state.start_time = Some(now);
            }
            state.lifespan = lifespan;
        }
        debug!(lifespan, max_jobs, "Starting queue…");

        let mut jobs_processed: i64 = 0;
        loop {
            let (still_active, remaining) = {
                let state = self.state.lock().await;
                (state.active, state.lifespan_remaining(now_ms()))
            };
            if !still_active {
                break;
            }

            let limit = if max_jobs < 0 {
                -1
            } else {
                max_jobs - jobs_processed
            };
            let batch = match self.get_concurrent_jobs(limit, remaining).await {
                Ok(batch) => batch,
                Err(error) => {
                    error!("Failed to claim jobs: {error}");
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }

            let results = join_all(batch.iter().map(|job| self.process_job(job))).await;
            jobs_processed += batch.len() as i64;

            if let Some(error) = results.into_iter().find_map(Result::err) {
                error!("Failed to record job outcome: {error}");
                break;
            }
            if max_jobs >= 0 && jobs_processed >= max_jobs {
                break;
            }
        }

        let mut state = self.state.lock().await;
        state.active = false;
        let window_remains =
            state.lifespan > 0 && state.lifespan_remaining(now_ms()) >= SHUTDOWN_BUFFER_MS;
        if !window_remains {
            state.start_time = None;
            state.lifespan = 0;
        }
        debug!(jobs_processed, "Queue loop finished");
        true
    }

    /// Stops the processing loop before its next batch.
    ///
    /// In-flight handlers run to completion; deferred retry restarts are
    /// unaffected.
    pub async fn stop(&self) {
        debug!("Stopping queue…");
        let mut state = self.state.lock().await;
        state.active = false;
        state.start_time = None;
        state.lifespan = 0;
    }

    /// Returns every job row, including claimed and terminally failed ones.
    ///
    /// With `consistent` set the read happens inside a transaction
    /// snapshot.
    pub async fn get_jobs(&self, consistent: bool) -> Result<Vec<Job>, QueueError> {
        if consistent {
            let mut tx = self.pool.begin().await?;
            let jobs = storage::select_all_tx(&mut tx).await?;
            tx.commit().await?;
            Ok(jobs)
        } else {
            Ok(storage::select_all(&self.pool).await?)
        }
    }

    /// The number of jobs with at least one failed attempt, terminal or
    /// awaiting retry.
    pub async fn failed_job_count(&self) -> Result<i64, QueueError> {
        Ok(storage::failed_job_count(&self.pool).await?)
    }

    /// Deletes all jobs named `name`, or every job when `name` is `None`.
    pub async fn flush_queue(&self, name: Option<&str>) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await?;
        match name {
            Some(name) => {
                // Nothing matching the name means nothing to delete.
                if storage::count_by_name(&mut tx, name).await? > 0 {
                    storage::delete_by_name(&mut tx, name).await?;
                }
            }
            None => storage::delete_all(&mut tx).await?,
        }
        tx.commit().await?;
        Ok(())
    }

    /// Deletes the job with `id` if it exists.
    pub async fn flush_job(&self, id: &str) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await?;
        storage::delete_job(&mut tx, id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Stops the loop and closes the shared store handle for this path.
    pub async fn close(&self) {
        self.stop().await;
        storage::close(&self.db_path).await;
    }

    async fn schedule_retry_restart(&self, delay_ms: i64) {
        let lifespan = self.state.lock().await.lifespan;
        let queue = self.clone();
        let delay = Duration::from_millis(u64::try_from(delay_ms).unwrap_or(u64::MAX));
        tokio::spawn(async move {
            sleep(delay).await;
            trace!("Restarting queue after retry delay…");
            queue.start_boxed(lifespan, -1).await;
        });
    }

    /// Type-erased wrapper around `start`, used to break the recursive
    /// `impl Future` type that would otherwise form via
    /// `start` -> `schedule_retry_restart` -> `start`.
    fn start_boxed(
        &self,
        lifespan: i64,
        max_jobs: i64,
    ) -> std::pin::Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(self.start(lifespan, max_jobs))
    }
}

/// Fires lifecycle hooks in order on a detached task. Hook errors are
/// logged and never influence the job outcome.
fn fire_hooks(hooks: Vec<(Option<JobHandler>, &'static str)>, id: String, payload: Value) {
    tokio::spawn(async move {
        for (hook, hook_name) in hooks {
            let Some(hook) = hook else { continue };
            if let Err(error) = hook(id.clone(), payload.clone()).await {
                warn!("Job lifecycle hook {hook_name} failed: {error}");
            }
        }
    });
}
