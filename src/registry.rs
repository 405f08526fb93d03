use crate::errors::QueueError;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

/// A registered job handler: receives the job id and its decoded payload.
///
/// Lifecycle hooks share this signature.
pub type JobHandler =
    Arc<dyn Fn(String, Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A worker registration: the handler plus its options.
#[derive(Clone)]
pub(crate) struct Worker {
    pub(crate) handler: JobHandler,
    pub(crate) options: WorkerOptions,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("handler", &"<fn>")
            .field("options", &self.options)
            .finish()
    }
}

/// Per-worker options: batch concurrency and optional lifecycle hooks.
///
/// Hook failures are logged and never affect the job outcome.
#[derive(Clone)]
pub struct WorkerOptions {
    pub(crate) concurrency: usize,
    pub(crate) on_start: Option<JobHandler>,
    pub(crate) on_success: Option<JobHandler>,
    pub(crate) on_failure: Option<JobHandler>,
    pub(crate) on_failed: Option<JobHandler>,
    pub(crate) on_complete: Option<JobHandler>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            on_start: None,
            on_success: None,
            on_failure: None,
            on_failed: None,
            on_complete: None,
        }
    }
}

impl std::fmt::Debug for WorkerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerOptions")
            .field("concurrency", &self.concurrency)
            .field("on_start", &self.on_start.as_ref().map(|_| "<hook>"))
            .field("on_success", &self.on_success.as_ref().map(|_| "<hook>"))
            .field("on_failure", &self.on_failure.as_ref().map(|_| "<hook>"))
            .field("on_failed", &self.on_failed.as_ref().map(|_| "<hook>"))
            .field("on_complete", &self.on_complete.as_ref().map(|_| "<hook>"))
            .finish()
    }
}

impl WorkerOptions {
    /// Options with concurrency 1 and no hooks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum jobs of this worker's name claimed into one batch.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Hook fired when a job attempt begins.
    pub fn on_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_start = Some(box_handler(hook));
        self
    }

    /// Hook fired after a job completes successfully.
    pub fn on_success<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_success = Some(box_handler(hook));
        self
    }

    /// Hook fired after every failed attempt.
    pub fn on_failure<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_failure = Some(box_handler(hook));
        self
    }

    /// Hook fired once a job exhausts its attempts.
    pub fn on_failed<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_failed = Some(box_handler(hook));
        self
    }

    /// Hook fired when a job reaches either terminal outcome.
    pub fn on_complete<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_complete = Some(box_handler(hook));
        self
    }
}

pub(crate) fn box_handler<F, Fut>(handler: F) -> JobHandler
where
    F: Fn(String, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |id, payload| handler(id, payload).boxed())
}

/// One registry per process; every queue instance dispatches through it.
static REGISTRY: OnceLock<RwLock<HashMap<String, Worker>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, Worker>> {
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

pub(crate) fn register(name: &str, worker: Worker) -> Result<(), QueueError> {
    if name.is_empty() {
        return Err(QueueError::InvalidArgument(
            "worker name must be non-empty".into(),
        ));
    }
    if worker.options.concurrency < 1 {
        return Err(QueueError::InvalidArgument(
            "worker concurrency must be at least 1".into(),
        ));
    }
    registry()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(name.to_owned(), worker);
    Ok(())
}

pub(crate) fn unregister(name: &str) {
    registry()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(name);
}

/// Snapshot the worker for `name`; handlers dispatched from the snapshot
/// run to completion even if the name is unregistered afterwards.
pub(crate) fn lookup(name: &str) -> Result<Worker, QueueError> {
    registry()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .cloned()
        .ok_or_else(|| QueueError::NoWorker(name.to_owned()))
}

pub(crate) fn concurrency_of(name: &str) -> Result<usize, QueueError> {
    Ok(lookup(name)?.options.concurrency)
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};

    fn noop_worker(concurrency: usize) -> Worker {
        Worker {
            handler: box_handler(|_id, _payload| async { Ok(()) }),
            options: WorkerOptions::new().concurrency(concurrency),
        }
    }

    #[test]
    fn register_rejects_empty_names() {
        let error = assert_err!(register("", noop_worker(1)));
        assert!(matches!(error, QueueError::InvalidArgument(_)));
    }

    #[test]
    fn register_rejects_zero_concurrency() {
        let error = assert_err!(register("registry-zero-concurrency", noop_worker(0)));
        assert!(matches!(error, QueueError::InvalidArgument(_)));
    }

    #[test]
    fn lookup_reports_missing_workers() {
        let error = assert_err!(lookup("registry-not-registered"));
        assert!(matches!(error, QueueError::NoWorker(name) if name == "registry-not-registered"));
    }

    #[test]
    fn unregister_removes_the_mapping() {
        assert_ok!(register("registry-roundtrip", noop_worker(4)));
        assert_eq!(assert_ok!(concurrency_of("registry-roundtrip")), 4);

        unregister("registry-roundtrip");
        assert_err!(concurrency_of("registry-roundtrip"));
    }
}
