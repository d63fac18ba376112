use crate::{
    callbacks::{Dispatcher, StatusCallback},
    executors::{ExecutorError, JobExecutor},
    spec::JobSpec,
    status::{JobState, JobStatus},
};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Link between a job and the executor that owns it, set exactly once
pub(crate) struct Binding {
    pub executor_id: Uuid,
    pub executor_name: String,
    pub executor: Weak<dyn JobExecutor>,
    pub dispatcher: Arc<Dispatcher>,
}

struct JobInner {
    id: Uuid,
    spec: JobSpec,
    status: Mutex<JobStatus>,
    changed: Condvar,
    native_id: OnceCell<String>,
    binding: OnceCell<Binding>,
    callback: Mutex<Option<StatusCallback>>,
    cancel_requested: AtomicBool,
}

/// User facing handle of a job. Clones share the same underlying job.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            inner: Arc::new(JobInner {
                id: Uuid::new_v4(),
                spec,
                status: Mutex::new(JobStatus::new(JobState::New)),
                changed: Condvar::new(),
                native_id: OnceCell::new(),
                binding: OnceCell::new(),
                callback: Mutex::new(None),
                cancel_requested: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn spec(&self) -> &JobSpec {
        &self.inner.spec
    }

    pub fn status(&self) -> JobStatus {
        self.inner.status.lock().clone()
    }

    /// backend assigned id, available once the job was submitted or attached
    pub fn native_id(&self) -> Option<&str> {
        self.inner.native_id.get().map(String::as_str)
    }

    pub fn executor_name(&self) -> Option<&str> {
        self.inner
            .binding
            .get()
            .map(|binding| binding.executor_name.as_str())
    }

    /// Register a callback fired for every status change of this job. It runs before the
    /// executor wide callback.
    pub fn set_status_callback(&self, callback: StatusCallback) {
        *self.inner.callback.lock() = Some(callback);
    }

    pub(crate) fn callback(&self) -> Option<StatusCallback> {
        self.inner.callback.lock().clone()
    }

    /// Block until the job reaches a final state or `timeout` passes. Returns `None` on timeout,
    /// in which case the job is untouched and can be waited on again.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<JobStatus> {
        self.wait_for(&[], timeout)
    }

    /// Like [`Job::wait`] but also returns once the state is one of `states`
    pub fn wait_for(&self, states: &[JobState], timeout: Option<Duration>) -> Option<JobStatus> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut status = self.inner.status.lock();

        loop {
            if status.is_final() || states.contains(&status.state) {
                return Some(status.clone());
            }

            match deadline {
                Some(deadline) => {
                    if self
                        .inner
                        .changed
                        .wait_until(&mut status, deadline)
                        .timed_out()
                    {
                        return (status.is_final() || states.contains(&status.state))
                            .then(|| status.clone());
                    }
                }
                None => self.inner.changed.wait(&mut status),
            }
        }
    }

    /// Ask the owning executor to cancel this job. The final state is set later by whoever
    /// observes the job terminating.
    pub fn cancel(&self) -> Result<(), ExecutorError> {
        let binding = self
            .inner
            .binding
            .get()
            .ok_or_else(|| ExecutorError::InvalidState("job is not bound to an executor".into()))?;

        if self.status().is_final() {
            return Err(ExecutorError::InvalidState(format!(
                "job {} is already {}",
                self.id(),
                self.status().state
            )));
        }

        let executor = binding.executor.upgrade().ok_or_else(|| {
            ExecutorError::InvalidState(format!(
                "executor {} is no longer running",
                binding.executor_name
            ))
        })?;

        executor.cancel(self)
    }

    /// Apply `status` if it moves the job forward, wake waiters and queue callbacks.
    /// Returns false when the update was rejected.
    pub(crate) fn set_status(&self, status: JobStatus) -> bool {
        let mut current = self.inner.status.lock();

        if !current.state.can_transition_to(status.state) {
            if current.is_final() {
                warn!(
                    job_id = %self.id(),
                    current = %current.state,
                    rejected = %status.state,
                    "Ignoring status update for a job in a final state"
                );
            } else {
                trace!(
                    job_id = %self.id(),
                    current = %current.state,
                    rejected = %status.state,
                    "Ignoring stale status update"
                );
            }
            return false;
        }

        debug!(job_id = %self.id(), from = %current.state, to = %status.state, "Job status changed");
        *current = status.clone();

        // queued under the lock so callbacks see updates in the order they were applied
        if let Some(binding) = self.inner.binding.get() {
            binding.dispatcher.notify(self.clone(), status);
        }
        self.inner.changed.notify_all();

        true
    }

    pub(crate) fn bind(&self, binding: Binding) -> Result<(), ExecutorError> {
        let state = self.inner.status.lock().state;

        if state != JobState::New {
            return Err(ExecutorError::InvalidState(format!(
                "job {} is {state}, only NEW jobs can be bound",
                self.id()
            )));
        }

        self.inner.binding.set(binding).map_err(|_| {
            ExecutorError::InvalidState(format!("job {} is already bound to an executor", self.id()))
        })
    }

    pub(crate) fn binding(&self) -> Option<&Binding> {
        self.inner.binding.get()
    }

    pub(crate) fn set_native_id(&self, native_id: impl Into<String>) {
        if self.inner.native_id.set(native_id.into()).is_err() {
            warn!(job_id = %self.id(), "Native id was already assigned");
        }
    }

    pub(crate) fn request_cancel(&self) {
        self.inner.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear_cancel_request(&self) {
        self.inner.cancel_requested.store(false, Ordering::SeqCst);
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::SeqCst)
    }
}

impl Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.inner.id)
            .field("native_id", &self.native_id())
            .field("executor", &self.executor_name())
            .field("status", &*self.inner.status.lock())
            .finish()
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Job {}
