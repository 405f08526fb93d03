use thiserror::Error;

/// Errors surfaced by queue operations.
///
/// Job execution errors (`NoWorker`, `Timeout`, `HandlerFailure`) are
/// absorbed into the job row's audit trail by the processing loop and do not
/// escape it; they only appear directly when calling
/// [`Queue::process_job`](crate::Queue::process_job) yourself.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A job or worker was configured with an invalid option.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No worker is registered for the job's name.
    #[error("no worker registered for job name {0}")]
    NoWorker(String),

    /// The handler did not settle within the job's declared timeout.
    #[error("job {id} timed out after {ms} ms")]
    Timeout {
        /// Id of the job whose handler lost the race.
        id: String,
        /// The job's declared timeout in milliseconds.
        ms: i64,
    },

    /// The handler completed abnormally. Displays as the raw handler
    /// message so the on-row `errors` trail records it verbatim.
    #[error("{0}")]
    HandlerFailure(String),

    /// The persistence layer failed.
    #[error("storage error: {0}")]
    Store(#[from] sqlx::Error),

    /// A payload or bookkeeping record could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
