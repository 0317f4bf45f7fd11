//! `jobrelay-core`: the job record and its lifecycle.
//!
//! This crate is **pure data**: no queues, no IO. Backends in `jobrelay-queue`
//! and `jobrelay-infra` own the mutable lifecycle of a job after enqueue.

pub mod error;
pub mod id;
pub mod job;

pub use error::{CoreError, CoreResult};
pub use id::JobId;
pub use job::{Job, JobStatus, JobType};
