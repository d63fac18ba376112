use crate::{job::Job, status::JobStatus};
use parking_lot::{Mutex, RwLock};
use std::{
    io,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, error, warn};

/// Invoked with the job and the status that was just applied to it
pub type StatusCallback = Arc<dyn Fn(&Job, &JobStatus) + Send + Sync>;

enum Message {
    Status { job: Job, status: JobStatus },
    Flush(flume::Sender<()>),
    Stop,
}

/// Runs status callbacks on a dedicated thread.
///
/// Jobs enqueue a notification while holding their status lock, so the queue order is the
/// order in which updates were applied. Pollers never wait on user callbacks.
pub struct Dispatcher {
    sender: flume::Sender<Message>,
    executor_callback: Arc<RwLock<Option<StatusCallback>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    // disconnected once the worker thread returns
    finished: flume::Receiver<()>,
}

impl Dispatcher {
    pub fn start(name: &str) -> io::Result<Arc<Self>> {
        let (sender, receiver) = flume::unbounded::<Message>();
        let executor_callback: Arc<RwLock<Option<StatusCallback>>> = Arc::new(RwLock::new(None));
        let callback = executor_callback.clone();
        let (finished_sender, finished) = flume::bounded::<()>(0);

        let worker = thread::Builder::new()
            .name(format!("{name}-callbacks"))
            .spawn(move || {
                let _finished = finished_sender;
                while let Ok(message) = receiver.recv() {
                    match message {
                        Message::Status { job, status } => {
                            if let Some(job_callback) = job.callback() {
                                invoke("job", &job_callback, &job, &status);
                            }
                            // clone out so set_job_status_callback is never blocked by a callback
                            let executor_callback = callback.read().clone();
                            if let Some(executor_callback) = executor_callback {
                                invoke("executor", &executor_callback, &job, &status);
                            }
                        }
                        Message::Flush(done) => {
                            let _ = done.send(());
                        }
                        Message::Stop => break,
                    }
                }
                debug!("Callback dispatcher stopped");
            })?;

        Ok(Arc::new(Self {
            sender,
            executor_callback,
            worker: Mutex::new(Some(worker)),
            finished,
        }))
    }

    pub fn set_executor_callback(&self, callback: StatusCallback) {
        *self.executor_callback.write() = Some(callback);
    }

    pub(crate) fn notify(&self, job: Job, status: JobStatus) {
        if self.sender.send(Message::Status { job, status }).is_err() {
            warn!("Callback dispatcher is gone, dropping status notification");
        }
    }

    /// Wait until every notification queued so far has been delivered
    pub fn flush(&self, timeout: Duration) -> bool {
        let (done, finished) = flume::bounded(1);

        if self.sender.send(Message::Flush(done)).is_err() {
            return false;
        }

        finished.recv_timeout(timeout).is_ok()
    }

    /// Drain pending notifications for at most `grace`, then stop the worker thread
    pub fn shutdown(&self, grace: Duration) {
        let deadline = Instant::now() + grace;

        if !self.flush(grace) {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "Callbacks did not drain within the grace period"
            );
        }

        let _ = self.sender.send(Message::Stop);

        let Some(worker) = self.worker.lock().take() else {
            return;
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.finished.recv_timeout(remaining) {
            Err(flume::RecvTimeoutError::Disconnected) => {
                if worker.join().is_err() {
                    error!("Callback dispatcher thread panicked");
                }
            }
            // a callback stuck past the grace period would block forever on join
            _ => warn!("Callback dispatcher did not stop in time, detaching it"),
        }
    }
}

fn invoke(kind: &str, callback: &StatusCallback, job: &Job, status: &JobStatus) {
    if catch_unwind(AssertUnwindSafe(|| callback(job, status))).is_err() {
        error!(
            job_id = %job.id(),
            state = %status.state,
            "The {kind} status callback panicked"
        );
    }
}
