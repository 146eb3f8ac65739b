//! Data models for the registry extraction platform.

mod job;
mod worker;

pub use job::{Job, JobKind, JobOutcome, JobStatus, SourceDescriptor};
pub use worker::{WorkerRecord, WorkerState};
