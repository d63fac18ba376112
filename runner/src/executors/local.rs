use super::{ExecutorCore, ExecutorError, JobExecutor};
use crate::{
    callbacks::StatusCallback,
    command::{collect, drain, exit_code_of},
    config::{BatchConfig, ExecutorConfig},
    job::Job,
    launchers::{self, Launcher},
    status::{JobState, JobStatus},
};
use nix::{
    errno::Errno,
    sys::signal::{kill, killpg, Signal},
    unistd::{getuid, Pid},
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fs,
    os::unix::{fs::MetadataExt, process::CommandExt},
    path::PathBuf,
    process::{Command, Stdio},
    sync::{Arc, Weak},
    thread,
    time::Duration,
};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// how often an attached process is checked for liveness
const ATTACH_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug)]
enum Target {
    // launcher started by us in its own process group
    Group(Pid),
    // foreign process bound through attach
    Process(Pid),
}

/// Executor that runs jobs as child processes of the current process
pub struct LocalExecutor {
    core: ExecutorCore,
    me: Weak<LocalExecutor>,
    launcher: PathBuf,
    launcher_log_file: Option<PathBuf>,
    config: BatchConfig,
    running: Mutex<HashMap<Uuid, Target>>,
}

impl LocalExecutor {
    /// create a new LocalExecutor instance
    pub fn load(name: &str, config: &ExecutorConfig) -> Result<Arc<Self>, ExecutorError> {
        let core = ExecutorCore::new(name)?;
        let launcher = config.launcher_path()?;

        Ok(Arc::new_cyclic(|me| Self {
            core,
            me: me.clone(),
            launcher,
            launcher_log_file: config.launcher_log_file.clone(),
            config: config.batch.clone(),
            running: Mutex::new(HashMap::new()),
        }))
    }

    fn weak(&self) -> Weak<dyn JobExecutor> {
        self.me.clone()
    }

    fn start(&self, job: &Job) -> Result<(), ExecutorError> {
        let spec = job.spec();
        spec.validate()?;
        let launcher = Launcher::for_spec(spec)?;

        let mut command = Command::new(&self.launcher);
        command
            .args(launcher.arguments(
                &job.id().to_string(),
                spec,
                self.launcher_log_file.as_deref(),
            ))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // own process group so cancel reaches every process of the job
            .process_group(0);

        if let Some(directory) = &spec.directory {
            command.current_dir(directory);
        }
        if !spec.inherit_environment {
            command.env_clear();
        }
        command.envs(&spec.environment);

        let mut child = command.spawn()?;
        let pid = child.id();
        debug!(pid, "Started launcher");

        job.set_native_id(pid.to_string());
        let group = Pid::from_raw(pid as i32);
        self.running.lock().insert(job.id(), Target::Group(group));

        // a cancel that arrived while spawning found no target to signal
        if job.cancel_requested() {
            debug!(pid, "Cancel requested during start");
            if let Err(errno) = killpg(group, Signal::SIGTERM) {
                warn!(pid, error = %errno, "Failed to signal launcher");
            }
        }
        job.set_status(JobStatus::new(JobState::Active).with_metadata("native_id", pid.to_string()));

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);
        let executor = self.me.clone();
        let watched = job.clone();

        thread::Builder::new()
            .name(format!("{}-{pid}", self.core.name))
            .spawn(move || {
                let result = child.wait();
                let output = collect(stdout);
                let errors = collect(stderr);

                if let Some(executor) = executor.upgrade() {
                    executor.running.lock().remove(&watched.id());
                }

                let status = match result {
                    Ok(status) => classify(
                        exit_code_of(status),
                        &output,
                        &errors,
                        watched.cancel_requested(),
                    ),
                    Err(e) => {
                        error!(error = ?e, pid, "Failed to wait for launcher");
                        JobStatus::new(JobState::Failed).with_message(e.to_string())
                    }
                };

                info!(job_id = %watched.id(), pid, status = %status, "Job finished");
                watched.set_status(status);
            })?;

        Ok(())
    }

    fn watch_attached(&self, job: &Job, pid: Pid) -> Result<(), ExecutorError> {
        let executor = self.me.clone();
        let watched = job.clone();

        thread::Builder::new()
            .name(format!("{}-attached-{pid}", self.core.name))
            .spawn(move || {
                let mut seen_alive = false;

                // EPERM means the process exists but belongs to someone else
                while matches!(kill(pid, None), Ok(()) | Err(Errno::EPERM)) {
                    if !seen_alive {
                        watched.set_status(
                            JobStatus::new(JobState::Active).with_metadata("native_id", pid.to_string()),
                        );
                        seen_alive = true;
                    }
                    thread::sleep(ATTACH_POLL_INTERVAL);
                }

                if let Some(executor) = executor.upgrade() {
                    executor.running.lock().remove(&watched.id());
                }

                watched.set_status(if watched.cancel_requested() {
                    JobStatus::new(JobState::Canceled)
                } else {
                    JobStatus::new(JobState::Completed)
                        .with_message("Process exited, its exit code is not available")
                });
            })?;

        Ok(())
    }
}

/// Final status of a launcher run
fn classify(exit_code: i32, output: &str, errors: &str, cancel_requested: bool) -> JobStatus {
    if cancel_requested && exit_code != 0 {
        return JobStatus::new(JobState::Canceled).with_exit_code(exit_code);
    }

    if launchers::launcher_failed(output) {
        let message = launchers::failure_message(&format!("{output}{errors}"))
            .unwrap_or_else(|| "Launcher failed".to_string());
        return JobStatus::new(JobState::Failed)
            .with_exit_code(exit_code)
            .with_message(message);
    }

    if exit_code == 0 {
        JobStatus::new(JobState::Completed).with_exit_code(0)
    } else {
        JobStatus::new(JobState::Failed).with_exit_code(exit_code)
    }
}

impl JobExecutor for LocalExecutor {
    fn name(&self) -> &str {
        &self.core.name
    }

    #[instrument(skip(self, job), fields(executor = %self.core.name, job_id = %job.id()), level = "info")]
    fn submit(&self, job: &Job) -> Result<(), ExecutorError> {
        self.core.bind(job, self.weak())?;
        job.set_status(JobStatus::new(JobState::Queued));

        if let Err(e) = self.start(job) {
            error!(error = ?e, "Failed to start job");
            job.set_status(JobStatus::new(JobState::Failed).with_message(e.to_string()));
            return Err(e);
        }

        Ok(())
    }

    fn attach(&self, job: &Job, native_id: &str) -> Result<(), ExecutorError> {
        let pid: i32 = native_id
            .trim()
            .parse()
            .map_err(|_| ExecutorError::AttachAmbiguity(format!("{native_id} is not a process id")))?;

        self.core.bind(job, self.weak())?;
        job.set_native_id(native_id.trim());

        let pid = Pid::from_raw(pid);
        self.running.lock().insert(job.id(), Target::Process(pid));
        self.watch_attached(job, pid)
    }

    fn cancel(&self, job: &Job) -> Result<(), ExecutorError> {
        self.core.check_owned(job)?;
        job.request_cancel();

        let target = self.running.lock().get(&job.id()).copied();
        let result = match target {
            Some(Target::Group(pid)) => killpg(pid, Signal::SIGTERM),
            Some(Target::Process(pid)) => kill(pid, Signal::SIGTERM),
            // already reaped, the watcher sets the final state
            None => return Ok(()),
        };

        match result {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(ExecutorError::Cancel {
                native_id: job.native_id().unwrap_or_default().to_string(),
                reason: errno.desc().to_string(),
            }),
        }
    }

    fn list(&self) -> Result<Vec<String>, ExecutorError> {
        let uid = getuid().as_raw();
        let mut pids = Vec::new();

        for entry in fs::read_dir("/proc")? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };

            if name.parse::<u32>().is_err() {
                continue;
            }

            match entry.metadata() {
                Ok(metadata) if metadata.uid() == uid => pids.push(name.to_string()),
                Ok(_) => {}
                // processes can exit while we scan
                Err(e) => debug!(pid = name, error = ?e, "Skipping process"),
            }
        }

        Ok(pids)
    }

    fn set_job_status_callback(&self, callback: StatusCallback) {
        self.core.dispatcher.set_executor_callback(callback);
    }

    fn shutdown(&self) {
        let running = self.running.lock().len();
        if running > 0 {
            warn!(running, "Shutting down with running jobs, they keep running");
        }

        self.core.dispatcher.shutdown(self.config.shutdown_grace());
    }
}
