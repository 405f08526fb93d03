#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod errors;
mod queue;
mod registry;
/// Database schema definitions.
pub mod schema;
mod storage;
mod util;

/// Error type for queue operations.
pub use self::errors::QueueError;
/// The queue handle and its configuration types.
pub use self::queue::{JobOptions, Queue, QueueConfig};
/// Worker registration types.
pub use self::registry::{JobHandler, WorkerOptions};
/// The persisted job row and its bookkeeping record.
pub use self::schema::{Job, JobData};
