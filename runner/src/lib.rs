//! Portable job submission to HPC schedulers.
//!
//! A [`Job`] is built from a [`JobSpec`] and handed to a [`JobExecutor`], usually obtained by
//! name from the [`registry`]. Executors report progress by moving the job through its
//! [`JobState`]s, callers observe it through [`Job::wait`] or status callbacks.

pub mod callbacks;
pub mod command;
pub mod config;
pub mod executors;
pub mod job;
pub mod launchers;
pub mod registry;
pub mod spec;
pub mod status;

pub use executors::{ExecutorError, JobExecutor};
pub use job::Job;
pub use registry::get_instance;
pub use spec::{JobAttributes, JobSpec, ResourceSpec};
pub use status::{JobState, JobStatus};
