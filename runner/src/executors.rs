pub mod batch;
pub mod local;

use crate::{
    callbacks::{Dispatcher, StatusCallback},
    config::{ConfigErrors, ExecutorConfig},
    job::{Binding, Job},
    launchers::UnknownLauncher,
    spec::SpecError,
};
use std::sync::{Arc, Weak};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Invalid job: {0}")]
    InvalidJob(#[from] SpecError),
    #[error("Invalid job state: {0}")]
    InvalidState(String),
    #[error("Failed to submit job: {0}")]
    Submit(String),
    #[error("Unable to parse the output of {command}: {reason}")]
    UnparsableOutput { command: String, reason: String },
    #[error("The {backend} state '{state}' of job {native_id} has no known meaning")]
    UnmappedState {
        backend: &'static str,
        native_id: String,
        state: String,
    },
    #[error("{command} exited with {exit_code}: {output}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        output: String,
    },
    #[error("Failed to cancel job {native_id}: {reason}")]
    Cancel { native_id: String, reason: String },
    #[error("Cannot attach to '{0}'")]
    AttachAmbiguity(String),
    #[error("No executor named {0}")]
    NotFound(String),
    #[error("Executor {name} failed to load: {reason}")]
    LoadFailed { name: String, reason: String },
    #[error("Failed to render the submit script: {0}")]
    Template(String),
    #[error(transparent)]
    Launcher(#[from] UnknownLauncher),
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// A backend that runs jobs.
///
/// Implementations own every job they bind and are the only ones setting the status of those
/// jobs. Status changes are reported through the job, which wakes waiters and fires callbacks.
pub trait JobExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// Start `job`, which must be NEW and unbound. On success the job is QUEUED (or later) and
    /// carries its native id. A failed submission leaves the job FAILED.
    fn submit(&self, job: &Job) -> Result<(), ExecutorError>;

    /// Bind an unbound NEW job to an existing backend job without starting anything
    fn attach(&self, job: &Job, native_id: &str) -> Result<(), ExecutorError>;

    /// Ask the backend to stop `job`. The final state is set once the termination is observed.
    fn cancel(&self, job: &Job) -> Result<(), ExecutorError>;

    /// Native ids of the jobs the backend knows about for the current user
    fn list(&self) -> Result<Vec<String>, ExecutorError>;

    /// Callback fired for every status change of every job of this executor, after the
    /// job's own callback
    fn set_job_status_callback(&self, callback: StatusCallback);

    /// Stop background activity, giving pending callbacks a bounded grace period
    fn shutdown(&self);
}

/// Bookkeeping shared by all executor implementations
pub(crate) struct ExecutorCore {
    pub id: Uuid,
    pub name: String,
    pub dispatcher: Arc<Dispatcher>,
}

impl ExecutorCore {
    pub fn new(name: &str) -> Result<Self, ExecutorError> {
        Ok(Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            dispatcher: Dispatcher::start(name)?,
        })
    }

    pub fn bind(&self, job: &Job, executor: Weak<dyn JobExecutor>) -> Result<(), ExecutorError> {
        job.bind(Binding {
            executor_id: self.id,
            executor_name: self.name.clone(),
            executor,
            dispatcher: self.dispatcher.clone(),
        })
    }

    /// fails unless `job` belongs to this executor and is still running
    pub fn check_owned(&self, job: &Job) -> Result<(), ExecutorError> {
        match job.binding() {
            Some(binding) if binding.executor_id == self.id => {}
            _ => {
                return Err(ExecutorError::InvalidState(format!(
                    "job {} is not bound to executor {}",
                    job.id(),
                    self.name
                )))
            }
        }

        let state = job.status().state;
        if state.is_final() {
            return Err(ExecutorError::InvalidState(format!(
                "job {} is already {state}",
                job.id()
            )));
        }

        Ok(())
    }
}

/// Instantiate the executor `name` as described by `config`
pub fn create(name: &str, config: &ExecutorConfig) -> Result<Arc<dyn JobExecutor>, ExecutorError> {
    match config.kind.to_lowercase().as_str() {
        "local" => Ok(local::LocalExecutor::load(name, config)?),
        "slurm" => Ok(batch::BatchSchedulerExecutor::load(
            name,
            batch::slurm::Slurm,
            config,
        )?),
        "lsf" => Ok(batch::BatchSchedulerExecutor::load(
            name,
            batch::lsf::Lsf,
            config,
        )?),
        "pbs" => Ok(batch::BatchSchedulerExecutor::load(
            name,
            batch::pbs::Pbs,
            config,
        )?),
        "cobalt" => Ok(batch::BatchSchedulerExecutor::load(
            name,
            batch::cobalt::Cobalt,
            config,
        )?),
        _ => Err(ConfigErrors::UnsupportedExecutor(config.kind.clone()).into()),
    }
}
