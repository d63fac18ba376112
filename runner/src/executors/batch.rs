pub mod cobalt;
pub mod lsf;
pub mod pbs;
pub mod script;
pub mod slurm;


use super::{ExecutorCore, ExecutorError, JobExecutor};
use crate::{
    callbacks::StatusCallback,
    command::{run_command, CommandLine, CommandOutput},
    config::{BatchConfig, ExecutorConfig},
    job::Job,
    launchers::{self, Launcher},
    status::{JobState, JobStatus},
};
use nix::unistd::{getuid, User};
use parking_lot::Mutex;
use script::{shell_join, ScriptContext, ScriptGenerator, TemplatedScriptGenerator};
use std::{
    collections::{BTreeMap, HashMap},
    env,
    ffi::OsString,
    fs::{self, Permissions},
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Weak,
    },
    thread::{self, JoinHandle},
};
use tracing::{debug, error, info, instrument, warn};

/// Parsed result of a status command, keyed by native id. Per job errors mark states the
/// backend reported but that have no mapping.
pub type StatusReport = BTreeMap<String, Result<JobStatus, ExecutorError>>;

/// Command line conventions of a batch scheduler
pub trait BatchBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// handlebars template of the submit script, see [`ScriptGenerator`]
    fn template(&self) -> &'static str;

    fn submit_command(&self, script: &Path) -> CommandLine;

    fn job_id_from_submit_output(&self, output: &str) -> Result<String, ExecutorError>;

    fn cancel_command(&self, native_id: &str) -> CommandLine;

    /// Decide whether a failed cancel command can be ignored, e.g. because the job already
    /// finished. The next poll cycle reconciles the job either way.
    fn process_cancel_failure(
        &self,
        native_id: &str,
        output: &CommandOutput,
    ) -> Result<(), ExecutorError> {
        Err(ExecutorError::Cancel {
            native_id: native_id.to_string(),
            reason: output.combined().trim().to_string(),
        })
    }

    /// a single command querying all of `native_ids`
    fn status_command(&self, native_ids: &[String]) -> CommandLine;

    fn parse_status_output(&self, output: &CommandOutput) -> Result<StatusReport, ExecutorError>;

    fn list_command(&self) -> CommandLine;

    fn parse_list_output(&self, output: &str) -> Vec<String>;

    /// exit codes meaning the job was killed, used unless the configuration overrides them
    fn kill_exit_codes(&self) -> &'static [i32] {
        &[]
    }
}

/// fail unless the command exited cleanly
pub fn check_exit_code(command: &str, output: &CommandOutput) -> Result<(), ExecutorError> {
    if output.success() {
        Ok(())
    } else {
        Err(ExecutorError::CommandFailed {
            command: command.to_string(),
            exit_code: output.exit_code,
            output: output.combined().trim().to_string(),
        })
    }
}

/// What the files written by the submit script tell about a finished job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Evidence {
    pub exit_code: Option<i32>,
    pub output: Option<String>,
}

/// Final status of a job from what the backend reported (`None` if it no longer lists the
/// job) and the files it left behind.
pub(crate) fn reconcile(
    observed: Option<JobStatus>,
    evidence: &Evidence,
    cancel_requested: bool,
    kill_exit_codes: &[i32],
) -> JobStatus {
    let listed = observed.is_some();
    let mut status = observed.unwrap_or_else(|| JobStatus::new(JobState::Completed));

    if status.state == JobState::Canceled {
        return status;
    }

    let backend_code = status.exit_code;
    let file_code = evidence.exit_code;

    let killed = [backend_code, file_code]
        .into_iter()
        .flatten()
        .any(|code| code != 0 && kill_exit_codes.contains(&code));
    // a canceled job either never wrote an exit code or died from a signal
    if killed || (cancel_requested && file_code.map_or(true, |code| code > 128)) {
        status.state = JobState::Canceled;
        status.exit_code = file_code.or(backend_code);
        return status;
    }

    match file_code.or(backend_code) {
        Some(0) => {
            if status.state != JobState::Failed {
                status.state = JobState::Completed;
            }
            status.exit_code = Some(0);
        }
        Some(code) => {
            status.state = JobState::Failed;
            status.exit_code = Some(code);
        }
        None if !listed => {
            status
                .message
                .get_or_insert_with(|| "Job is no longer known to the scheduler and left no exit code".into());
        }
        None => {}
    }

    if status.state == JobState::Failed && status.message.is_none() {
        status.message = evidence.output.as_deref().and_then(launchers::failure_message);
    }

    status
}

struct Poller {
    stop: flume::Sender<()>,
    // disconnects once the polling thread exits
    finished: flume::Receiver<()>,
    handle: JoinHandle<()>,
}

/// Executor for schedulers driven through command line tools.
///
/// Submission happens on the caller's thread. A single polling thread per executor, started on
/// first use, queries the state of every tracked job with one command per cycle and is the
/// only place that moves jobs into a final state.
pub struct BatchSchedulerExecutor<B: BatchBackend> {
    core: ExecutorCore,
    me: Weak<Self>,
    backend: B,
    generator: Box<dyn ScriptGenerator>,
    config: BatchConfig,
    work_directory: PathBuf,
    launcher: PathBuf,
    launcher_log_file: Option<PathBuf>,
    kill_exit_codes: Vec<i32>,
    // native id -> jobs, several jobs may be attached to the same native id
    jobs: Mutex<HashMap<String, Vec<Job>>>,
    poller: Mutex<Option<Poller>>,
    poll_errors: AtomicU32,
    stopped: AtomicBool,
}

impl<B: BatchBackend> BatchSchedulerExecutor<B> {
    /// Executor rendering submit scripts from the backend's own template
    pub fn load(name: &str, backend: B, config: &ExecutorConfig) -> Result<Arc<Self>, ExecutorError> {
        let generator = TemplatedScriptGenerator::new(backend.template())?;
        Self::new(name, backend, Box::new(generator), config)
    }

    pub fn new(
        name: &str,
        backend: B,
        generator: Box<dyn ScriptGenerator>,
        config: &ExecutorConfig,
    ) -> Result<Arc<Self>, ExecutorError> {
        let core = ExecutorCore::new(name)?;
        let work_directory = config.work_directory(name)?;
        let launcher = config.launcher_path()?;
        let kill_exit_codes = config
            .batch
            .kill_exit_codes
            .clone()
            .unwrap_or_else(|| backend.kill_exit_codes().to_vec());

        Ok(Arc::new_cyclic(|me| Self {
            core,
            me: me.clone(),
            backend,
            generator,
            config: config.batch.clone(),
            work_directory,
            launcher,
            launcher_log_file: config.launcher_log_file.clone(),
            kill_exit_codes,
            jobs: Mutex::new(HashMap::new()),
            poller: Mutex::new(None),
            poll_errors: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn work_directory(&self) -> &Path {
        &self.work_directory
    }

    /// number of native ids currently polled
    pub fn tracked(&self) -> usize {
        self.jobs.lock().len()
    }

    fn weak(&self) -> Weak<dyn JobExecutor> {
        self.me.clone()
    }

    fn script_path(&self, job: &Job) -> PathBuf {
        self.work_directory.join(format!("{}.job", job.id()))
    }

    fn aux_path(&self, native_id: &str, extension: &str) -> PathBuf {
        self.work_directory.join(format!("{native_id}.{extension}"))
    }

    fn ensure_poller(&self) -> Result<(), ExecutorError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ExecutorError::InvalidState(format!(
                "executor {} was shut down",
                self.core.name
            )));
        }

        let mut poller = self.poller.lock();
        if poller.is_some() {
            return Ok(());
        }

        let (stop, stop_requested) = flume::bounded::<()>(1);
        let (done, finished) = flume::bounded::<()>(0);
        let executor = self.me.clone();
        let initial_delay = self.config.initial_polling_delay();
        let interval = self.config.polling_interval();

        let handle = thread::Builder::new()
            .name(format!("{}-poller", self.core.name))
            .spawn(move || {
                let _done = done;
                let mut delay = initial_delay;

                // a stop message or a dropped executor both end the loop
                while let Err(flume::RecvTimeoutError::Timeout) = stop_requested.recv_timeout(delay) {
                    match executor.upgrade() {
                        Some(executor) => executor.poll(),
                        None => break,
                    }
                    delay = interval;
                }

                debug!("Poller stopped");
            })?;

        debug!(executor = %self.core.name, "Started poller");
        *poller = Some(Poller {
            stop,
            finished,
            handle,
        });

        Ok(())
    }

    fn submit_script(&self, job: &Job) -> Result<String, ExecutorError> {
        let spec = job.spec();
        spec.validate()?;
        let launcher = Launcher::for_spec(spec)?;

        let mut launch: Vec<OsString> = vec![self.launcher.clone().into_os_string()];
        launch.extend(launcher.arguments(
            &job.id().to_string(),
            spec,
            self.launcher_log_file.as_deref(),
        ));

        let context = ScriptContext::new(
            job,
            self.backend.name(),
            &self.work_directory,
            shell_join(&launch),
        );
        let script = self.generator.generate(&context)?;

        fs::create_dir_all(&self.work_directory)?;
        let path = self.script_path(job);
        fs::write(&path, script)?;
        fs::set_permissions(&path, Permissions::from_mode(0o755))?;

        let command = self.backend.submit_command(&path);
        let output = run_command(&command, self.config.command_timeout())
            .map_err(|e| ExecutorError::Submit(format!("failed to run the submit command: {e}")))?;

        if !output.success() {
            return Err(ExecutorError::Submit(format!(
                "{} exited with {}: {}",
                program_name(&command),
                output.exit_code,
                output.combined().trim()
            )));
        }

        self.backend.job_id_from_submit_output(&output.stdout)
    }

    /// One poll cycle over every tracked job
    #[instrument(skip(self), fields(executor = %self.core.name), level = "debug")]
    fn poll(&self) {
        let native_ids: Vec<String> = self.jobs.lock().keys().cloned().collect();

        if native_ids.is_empty() {
            return;
        }

        let report = match self.query(&native_ids) {
            Ok(report) => {
                self.poll_errors.store(0, Ordering::SeqCst);
                report
            }
            Err(e) => {
                self.poll_failed(e);
                return;
            }
        };

        debug!(
            tracked = native_ids.len(),
            reported = report.len(),
            "Polled job states"
        );

        for native_id in native_ids {
            let observed = match report.get(&native_id) {
                Some(Ok(status)) => Some(status.clone()),
                Some(Err(e)) => {
                    error!(%native_id, error = %e, "Unmapped backend state, failing the job");
                    Some(JobStatus::new(JobState::Failed).with_message(e.to_string()))
                }
                None => None,
            };

            self.apply(&native_id, observed);
        }
    }

    fn query(&self, native_ids: &[String]) -> Result<StatusReport, ExecutorError> {
        let command = self.backend.status_command(native_ids);
        let output = run_command(&command, self.config.command_timeout())?;

        self.backend.parse_status_output(&output)
    }

    fn poll_failed(&self, error: ExecutorError) {
        let errors = self.poll_errors.fetch_add(1, Ordering::SeqCst) + 1;
        error!(errors, error = %error, "Failed to poll job states");

        if errors > self.config.polling_error_threshold {
            let jobs: Vec<(String, Vec<Job>)> = self.jobs.lock().drain().collect();
            let message = format!("Polling failed {errors} times in a row: {error}");
            error!(jobs = jobs.len(), "Giving up on all tracked jobs");

            for (native_id, jobs) in jobs {
                for job in jobs.iter() {
                    job.set_status(JobStatus::new(JobState::Failed).with_message(message.clone()));
                }
                self.clean_up(&native_id, &jobs);
            }

            self.poll_errors.store(0, Ordering::SeqCst);
        }
    }

    fn apply(&self, native_id: &str, observed: Option<JobStatus>) {
        let jobs = match self.jobs.lock().get(native_id) {
            Some(jobs) => jobs.clone(),
            None => return,
        };

        let status = match observed {
            Some(status) if !status.is_final() => status,
            observed => {
                let skip_files = matches!(&observed, Some(status) if status.state == JobState::Canceled);
                let evidence = if skip_files {
                    Evidence::default()
                } else {
                    self.read_evidence(native_id)
                };
                let cancel_requested = jobs.iter().any(Job::cancel_requested);

                reconcile(observed, &evidence, cancel_requested, &self.kill_exit_codes)
            }
        };

        if !status.is_final() {
            for job in jobs.iter() {
                job.set_status(status.clone());
            }
            return;
        }

        // jobs attached since the snapshot are finished as well
        let jobs = self.jobs.lock().remove(native_id).unwrap_or(jobs);
        info!(native_id, status = %status, "Job finished");

        for job in jobs.iter() {
            job.set_status(status.clone());
        }
        self.clean_up(native_id, &jobs);
    }

    fn read_evidence(&self, native_id: &str) -> Evidence {
        Evidence {
            exit_code: fs::read_to_string(self.aux_path(native_id, "ec"))
                .ok()
                .and_then(|code| code.trim().parse().ok()),
            output: fs::read_to_string(self.aux_path(native_id, "out")).ok(),
        }
    }

    fn clean_up(&self, native_id: &str, jobs: &[Job]) {
        if self.config.keep_files {
            return;
        }

        let paths = ["ec", "out", "nodefile"]
            .into_iter()
            .map(|extension| self.aux_path(native_id, extension))
            .chain(jobs.iter().map(|job| self.script_path(job)));

        for path in paths {
            remove_file(&path);
        }
    }
}

/// login name of the current user, for backends listing jobs per user
pub(crate) fn current_user() -> String {
    User::from_uid(getuid())
        .ok()
        .flatten()
        .map(|user| user.name)
        .or_else(|| env::var("USER").ok())
        .unwrap_or_default()
}

fn remove_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = ?e, "Failed to remove file"),
    }
}

fn program_name(command: &[OsString]) -> String {
    command
        .first()
        .map(|program| program.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl<B: BatchBackend> JobExecutor for BatchSchedulerExecutor<B> {
    fn name(&self) -> &str {
        &self.core.name
    }

    #[instrument(skip(self, job), fields(executor = %self.core.name, job_id = %job.id()), level = "info")]
    fn submit(&self, job: &Job) -> Result<(), ExecutorError> {
        self.core.bind(job, self.weak())?;

        match self.ensure_poller().and_then(|()| self.submit_script(job)) {
            Ok(native_id) => {
                info!(%native_id, "Job submitted");
                job.set_native_id(native_id.clone());
                job.set_status(
                    JobStatus::new(JobState::Queued).with_metadata("native_id", native_id.clone()),
                );
                self.jobs.lock().entry(native_id).or_default().push(job.clone());

                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Submission failed");
                job.set_status(JobStatus::new(JobState::Failed).with_message(e.to_string()));
                if !self.config.keep_files {
                    remove_file(&self.script_path(job));
                }

                Err(e)
            }
        }
    }

    fn attach(&self, job: &Job, native_id: &str) -> Result<(), ExecutorError> {
        let native_id = native_id.trim();

        if native_id.is_empty() || native_id.contains(char::is_whitespace) {
            return Err(ExecutorError::AttachAmbiguity(native_id.to_string()));
        }

        self.ensure_poller()?;
        self.core.bind(job, self.weak())?;
        job.set_native_id(native_id);
        self.jobs
            .lock()
            .entry(native_id.to_string())
            .or_default()
            .push(job.clone());

        debug!(executor = %self.core.name, native_id, "Attached job");
        Ok(())
    }

    fn cancel(&self, job: &Job) -> Result<(), ExecutorError> {
        self.core.check_owned(job)?;
        let native_id = job
            .native_id()
            .ok_or_else(|| ExecutorError::InvalidState(format!("job {} has no native id", job.id())))?
            .to_string();

        job.request_cancel();

        let output = match run_command(
            &self.backend.cancel_command(&native_id),
            self.config.command_timeout(),
        ) {
            Ok(output) => output,
            Err(e) => {
                job.clear_cancel_request();
                return Err(ExecutorError::Cancel {
                    native_id,
                    reason: e.to_string(),
                });
            }
        };

        if !output.success() {
            if let Err(e) = self.backend.process_cancel_failure(&native_id, &output) {
                job.clear_cancel_request();
                return Err(e);
            }
            debug!(%native_id, "Ignoring cancel failure of a finished job");
        }

        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, ExecutorError> {
        let command = self.backend.list_command();
        let output = run_command(&command, self.config.command_timeout())?;
        check_exit_code(&program_name(&command), &output)?;

        Ok(self.backend.parse_list_output(&output.stdout))
    }

    fn set_job_status_callback(&self, callback: StatusCallback) {
        self.core.dispatcher.set_executor_callback(callback);
    }

    fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let grace = self.config.shutdown_grace();

        let poller = self.poller.lock().take();
        if let Some(poller) = poller {
            let _ = poller.stop.send(());

            match poller.finished.recv_timeout(grace) {
                Err(flume::RecvTimeoutError::Disconnected) => {
                    let _ = poller.handle.join();
                }
                _ => warn!(
                    executor = %self.core.name,
                    "Poller did not stop within the grace period"
                ),
            }
        }

        self.core.dispatcher.shutdown(grace);
    }
}
