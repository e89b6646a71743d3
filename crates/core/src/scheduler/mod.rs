//! Publish scheduler.
//!
//! Bounds how many packages run through the state machine at once:
//! - Submissions beyond the bound wait in a FIFO queue
//! - Failed packages are retried explicitly, from their checkpoint
//! - Packages interrupted by a restart are resumed by `retry_all`

mod config;
mod runner;
mod types;

pub use config::SchedulerConfig;
pub use runner::PublishScheduler;
pub use types::{SchedulerError, SchedulerEvent, SchedulerStatus, SubmitRequest};
