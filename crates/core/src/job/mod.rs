//! Durable records for jobs and their stage history.
//!
//! A job is one call recording. Each attempted stage execution appends a
//! [`StageRecord`], so a failed job keeps the full ordered history of what
//! was tried.

mod sqlite_store;
mod store;
mod types;

pub use sqlite_store::SqliteJobStore;
pub use store::{CreateJobRequest, JobError, JobFilter, JobStore};
pub use types::*;
