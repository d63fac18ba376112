//! Drives the batch executor against a small scheduler made of bash scripts. `qsub` starts each
//! job in its own session after a short queueing delay, `qstat` reports the state files of
//! live jobs and `qdel` kills the session of a job. Flag files in the state directory make
//! `qsub` reject jobs, `qstat` fail, or `qstat` report states no backend knows.

use indoc::{formatdoc, indoc};
use jobport::{
    command::{command_line, CommandLine, CommandOutput},
    config::ExecutorConfig,
    executors::batch::{check_exit_code, BatchBackend, BatchSchedulerExecutor, StatusReport},
    ExecutorError, Job, JobExecutor, JobSpec, JobState, JobStatus,
};
use parking_lot::Mutex;
use std::{
    env,
    ffi::OsString,
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
    time::Duration,
};
use uuid::Uuid;

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(60));

const TEMPLATE: &str = indoc! {r#"
    #!/bin/bash
    {{#each environment}}
    export {{@key}}={{this}}
    {{/each}}
    {{#if directory}}cd {{directory}} || exit 1{{/if}}

    {{{launch_command}}} > {{work_directory}}/"$FAKE_JOB_ID.out" 2>&1
    echo "$?" > {{work_directory}}/"$FAKE_JOB_ID.ec"
"#};

struct FakeScheduler {
    root: PathBuf,
    bin: PathBuf,
    state: PathBuf,
}

impl FakeScheduler {
    fn new() -> Self {
        let root = env::temp_dir().join(format!("jobport-batch-{}", Uuid::new_v4()));
        let bin = root.join("bin");
        let state = root.join("state");
        fs::create_dir_all(&bin).unwrap();
        fs::create_dir_all(&state).unwrap();

        let state_dir = state.display();

        install(
            &bin.join("qsub"),
            &formatdoc! {r#"
                #!/bin/bash
                S="{state_dir}"
                [ -f "$S/reject" ] && {{ echo "qsub: queue is closed" >&2; exit 3; }}

                exec 9>"$S/lock"
                flock 9
                id=$(( $(cat "$S/counter" 2>/dev/null || echo 1000) + 1 ))
                echo "$id" > "$S/counter"
                flock -u 9

                echo Q > "$S/$id.tmp" && mv "$S/$id.tmp" "$S/$id.state"

                setsid bash -c '
                    S="$1"; id="$2"; script="$3"
                    sleep 0.3
                    [ -f "$S/$id.state" ] || exit 0
                    echo R > "$S/$id.tmp" && mv "$S/$id.tmp" "$S/$id.state"
                    FAKE_JOB_ID="$id" bash "$script"
                    rm -f "$S/$id.state"
                ' fake-job "$S" "$id" "$1" < /dev/null > /dev/null 2>&1 &
                echo "$!" > "$S/$id.pid"

                echo "Job <$id> submitted"
            "#},
        );

        install(
            &bin.join("qstat"),
            &formatdoc! {r#"
                #!/bin/bash
                S="{state_dir}"
                [ -f "$S/broken" ] && {{ echo "qstat: cannot reach the server" >&2; exit 2; }}

                if [ "$#" -eq 0 ]; then
                    set -- $(cd "$S" && ls *.state 2>/dev/null | sed 's/\.state$//')
                fi

                for id in "$@"; do
                    state=$(cat "$S/$id.state" 2>/dev/null) || continue
                    [ -f "$S/unknown-states" ] && state=ZZ
                    echo "$id $state"
                done
                exit 0
            "#},
        );

        install(
            &bin.join("qdel"),
            &formatdoc! {r#"
                #!/bin/bash
                S="{state_dir}"
                id="$1"

                if [ ! -f "$S/$id.state" ]; then
                    echo "qdel: job $id has already finished" >&2
                    exit 35
                fi

                kill -TERM -- "-$(cat "$S/$id.pid")" 2>/dev/null
                rm -f "$S/$id.state"
            "#},
        );

        Self { root, bin, state }
    }

    fn backend(&self) -> FakeBackend {
        FakeBackend {
            bin: self.bin.clone(),
        }
    }

    fn config(&self) -> ExecutorConfig {
        let mut config = ExecutorConfig::new("fake");
        config.work_directory = Some(self.root.join(format!("work-{}", Uuid::new_v4())));
        config.launcher_path = Some(PathBuf::from(env!("CARGO_BIN_EXE_jobport-launch")));
        config.batch.polling_interval_ms = 100;
        config.batch.initial_polling_delay_ms = 0;
        config.batch.command_timeout_ms = 10_000;
        config.batch.shutdown_grace_ms = 2_000;
        config
    }

    fn executor(&self, config: &ExecutorConfig) -> Arc<BatchSchedulerExecutor<FakeBackend>> {
        BatchSchedulerExecutor::load("fake", self.backend(), config).unwrap()
    }

    fn toggle(&self, flag: &str, on: bool) {
        let path = self.state.join(flag);
        if on {
            fs::write(path, "").unwrap();
        } else {
            let _ = fs::remove_file(path);
        }
    }

    fn kill(&self, native_id: &str) {
        let _ = Command::new(self.bin.join("qdel")).arg(native_id).status();
    }
}

impl Drop for FakeScheduler {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn install(path: &Path, script: &str) {
    fs::write(path, script).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

struct FakeBackend {
    bin: PathBuf,
}

impl FakeBackend {
    fn tool(&self, name: &str) -> OsString {
        self.bin.join(name).into_os_string()
    }
}

impl BatchBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn template(&self) -> &'static str {
        TEMPLATE
    }

    fn submit_command(&self, script: &Path) -> CommandLine {
        vec![self.tool("qsub"), script.into()]
    }

    fn job_id_from_submit_output(&self, output: &str) -> Result<String, ExecutorError> {
        output
            .split(|c: char| c == '<' || c == '>')
            .nth(1)
            .map(str::to_string)
            .ok_or_else(|| ExecutorError::UnparsableOutput {
                command: "qsub".into(),
                reason: output.to_string(),
            })
    }

    fn cancel_command(&self, native_id: &str) -> CommandLine {
        vec![self.tool("qdel"), native_id.into()]
    }

    fn process_cancel_failure(
        &self,
        native_id: &str,
        output: &CommandOutput,
    ) -> Result<(), ExecutorError> {
        if output.combined().contains("already finished") {
            Ok(())
        } else {
            Err(ExecutorError::Cancel {
                native_id: native_id.to_string(),
                reason: output.combined(),
            })
        }
    }

    fn status_command(&self, native_ids: &[String]) -> CommandLine {
        let mut command = vec![self.tool("qstat")];
        command.extend(native_ids.iter().map(OsString::from));
        command
    }

    fn parse_status_output(&self, output: &CommandOutput) -> Result<StatusReport, ExecutorError> {
        check_exit_code("qstat", output)?;

        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.split_once(' '))
            .map(|(native_id, state)| {
                let status = match state.trim() {
                    "Q" => Ok(JobStatus::new(JobState::Queued)),
                    "R" => Ok(JobStatus::new(JobState::Active)),
                    other => Err(ExecutorError::UnmappedState {
                        backend: "fake",
                        native_id: native_id.to_string(),
                        state: other.to_string(),
                    }),
                };
                (native_id.to_string(), status)
            })
            .collect())
    }

    fn list_command(&self) -> CommandLine {
        command_line([self.tool("qstat")])
    }

    fn parse_list_output(&self, output: &str) -> Vec<String> {
        output
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect()
    }
}

fn job(executable: &str, arguments: &[&str]) -> Job {
    Job::new(
        JobSpec::builder(executable)
            .args(arguments.iter().copied())
            .build()
            .unwrap(),
    )
}

#[test]
fn echo_completes_and_cleans_up() {
    let scheduler = FakeScheduler::new();
    let config = scheduler.config();
    let executor = scheduler.executor(&config);
    let stdout = scheduler.root.join("echo.out");

    let job = Job::new(
        JobSpec::builder("/bin/echo")
            .arg("hello")
            .stdout(&stdout)
            .build()
            .unwrap(),
    );
    executor.submit(&job).unwrap();

    let native_id = job.native_id().unwrap().to_string();

    let status = job.wait(TIMEOUT).unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.exit_code, Some(0));
    assert_eq!(fs::read_to_string(&stdout).unwrap(), "hello\n");

    executor.shutdown();

    let work = executor.work_directory();
    assert!(!work.join(format!("{native_id}.ec")).exists());
    assert!(!work.join(format!("{native_id}.out")).exists());
    assert!(!work.join(format!("{}.job", job.id())).exists());
    assert_eq!(executor.tracked(), 0);
}

#[test]
fn failing_job_reports_its_exit_code() {
    let scheduler = FakeScheduler::new();
    let config = scheduler.config();
    let executor = scheduler.executor(&config);

    let job = job("/bin/sh", &["-c", "exit 3"]);
    executor.submit(&job).unwrap();

    let status = job.wait(TIMEOUT).unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.exit_code, Some(3));

    executor.shutdown();
}

#[test]
fn kept_files_survive() {
    let scheduler = FakeScheduler::new();
    let mut config = scheduler.config();
    config.batch.keep_files = true;
    let executor = scheduler.executor(&config);

    let job = job("/bin/true", &[]);
    executor.submit(&job).unwrap();
    assert_eq!(job.wait(TIMEOUT).unwrap().state, JobState::Completed);
    executor.shutdown();

    let work = executor.work_directory();
    let native_id = job.native_id().unwrap();
    assert_eq!(
        fs::read_to_string(work.join(format!("{native_id}.ec")))
            .unwrap()
            .trim(),
        "0"
    );
    assert!(work.join(format!("{}.job", job.id())).exists());
}

#[test]
fn cancel_while_queued() {
    let scheduler = FakeScheduler::new();
    let config = scheduler.config();
    let executor = scheduler.executor(&config);

    let job = job("/bin/sleep", &["60"]);
    executor.submit(&job).unwrap();
    job.cancel().unwrap();

    assert_eq!(job.wait(TIMEOUT).unwrap().state, JobState::Canceled);
    executor.shutdown();
}

#[test]
fn cancel_while_active() {
    let scheduler = FakeScheduler::new();
    let config = scheduler.config();
    let executor = scheduler.executor(&config);

    let job = job("/bin/sleep", &["60"]);
    executor.submit(&job).unwrap();
    assert_eq!(
        job.wait_for(&[JobState::Active], TIMEOUT).unwrap().state,
        JobState::Active
    );

    job.cancel().unwrap();

    assert_eq!(job.wait(TIMEOUT).unwrap().state, JobState::Canceled);
    executor.shutdown();
}

#[test]
fn rejected_submission_fails_the_job() {
    let scheduler = FakeScheduler::new();
    let config = scheduler.config();
    let executor = scheduler.executor(&config);
    scheduler.toggle("reject", true);

    let job = job("/bin/true", &[]);
    match executor.submit(&job) {
        Err(ExecutorError::Submit(message)) => assert!(message.contains("queue is closed")),
        other => panic!("unexpected submit result: {other:?}"),
    }

    let status = job.status();
    assert_eq!(status.state, JobState::Failed);
    assert!(status.message.is_some());
    assert!(!executor
        .work_directory()
        .join(format!("{}.job", job.id()))
        .exists());

    executor.shutdown();
}

#[test]
fn invalid_spec_is_rejected() {
    let scheduler = FakeScheduler::new();
    let config = scheduler.config();
    let executor = scheduler.executor(&config);

    let mut spec = JobSpec::builder("/bin/true").build().unwrap();
    spec.resources.process_count = Some(2);
    spec.resources.node_count = Some(2);
    spec.resources.processes_per_node = Some(2);

    let job = Job::new(spec);
    assert!(matches!(
        executor.submit(&job),
        Err(ExecutorError::InvalidJob(_))
    ));
    assert_eq!(job.status().state, JobState::Failed);

    executor.shutdown();
}

#[test]
fn many_concurrent_jobs() {
    let scheduler = FakeScheduler::new();
    let config = scheduler.config();
    let executor = scheduler.executor(&config);

    let jobs: Vec<Job> = (0..25)
        .map(|index| {
            let job = job("/bin/sh", &["-c", &format!("exit {}", index % 2)]);
            executor.submit(&job).unwrap();
            job
        })
        .collect();

    for (index, job) in jobs.iter().enumerate() {
        let status = job.wait(TIMEOUT).unwrap();
        let expected = if index % 2 == 0 {
            JobState::Completed
        } else {
            JobState::Failed
        };
        assert_eq!(status.state, expected, "job {index}");
    }

    executor.shutdown();
}

#[test]
fn attach_to_unknown_job_resolves() {
    let scheduler = FakeScheduler::new();
    let config = scheduler.config();
    let executor = scheduler.executor(&config);

    let job = Job::new(JobSpec::default());
    executor.attach(&job, "424242").unwrap();
    assert_eq!(job.native_id(), Some("424242"));

    let status = job.wait(TIMEOUT).unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert!(status.message.is_some());

    assert!(matches!(
        executor.attach(&Job::new(JobSpec::default()), "  "),
        Err(ExecutorError::AttachAmbiguity(_))
    ));

    executor.shutdown();
}

#[test]
fn attached_jobs_share_the_outcome() {
    let scheduler = FakeScheduler::new();
    let config = scheduler.config();
    let executor = scheduler.executor(&config);

    let submitted = job("/bin/sh", &["-c", "sleep 1; exit 5"]);
    executor.submit(&submitted).unwrap();
    let native_id = submitted.native_id().unwrap().to_string();

    let attached = Job::new(JobSpec::default());
    executor.attach(&attached, &native_id).unwrap();

    // a second executor only sees what the scheduler reports
    let other_config = scheduler.config();
    let other = scheduler.executor(&other_config);
    let observer = Job::new(JobSpec::default());
    other.attach(&observer, &native_id).unwrap();

    let first = submitted.wait(TIMEOUT).unwrap();
    let second = attached.wait(TIMEOUT).unwrap();
    assert_eq!(first.state, JobState::Failed);
    assert_eq!(first.exit_code, Some(5));
    assert_eq!(second.state, first.state);
    assert_eq!(second.exit_code, first.exit_code);

    assert!(observer.wait(TIMEOUT).unwrap().is_final());

    executor.shutdown();
    other.shutdown();
}

#[test]
fn callbacks_follow_the_job() {
    let scheduler = FakeScheduler::new();
    let config = scheduler.config();
    let executor = scheduler.executor(&config);
    let seen: Arc<Mutex<Vec<JobState>>> = Arc::default();

    let recorder = seen.clone();
    executor.set_job_status_callback(Arc::new(move |_: &Job, status: &JobStatus| {
        recorder.lock().push(status.state)
    }));

    let job = job("/bin/sleep", &["1"]);
    executor.submit(&job).unwrap();
    job.wait(TIMEOUT).unwrap();
    executor.shutdown();

    assert_eq!(
        *seen.lock(),
        vec![JobState::Queued, JobState::Active, JobState::Completed]
    );
}

#[test]
fn repeated_poll_failures_fail_tracked_jobs() {
    let scheduler = FakeScheduler::new();
    let mut config = scheduler.config();
    config.batch.polling_error_threshold = 2;
    let executor = scheduler.executor(&config);

    let job = job("/bin/sleep", &["60"]);
    executor.submit(&job).unwrap();
    scheduler.toggle("broken", true);

    let status = job.wait(TIMEOUT).unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert!(status
        .message
        .unwrap()
        .contains("cannot reach the server"));
    assert_eq!(executor.tracked(), 0);

    executor.shutdown();
    scheduler.toggle("broken", false);
    scheduler.kill(job.native_id().unwrap());
}

#[test]
fn unknown_backend_state_fails_the_job() {
    let scheduler = FakeScheduler::new();
    let config = scheduler.config();
    let executor = scheduler.executor(&config);

    let job = job("/bin/sleep", &["60"]);
    executor.submit(&job).unwrap();
    scheduler.toggle("unknown-states", true);

    let status = job.wait(TIMEOUT).unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert!(status.message.unwrap().contains("'ZZ'"));
    assert_eq!(executor.tracked(), 0);

    executor.shutdown();
    scheduler.kill(job.native_id().unwrap());
}

#[test]
fn list_reports_live_jobs() {
    let scheduler = FakeScheduler::new();
    let config = scheduler.config();
    let executor = scheduler.executor(&config);

    let job = job("/bin/sleep", &["60"]);
    executor.submit(&job).unwrap();

    let native_id = job.native_id().unwrap().to_string();
    assert!(executor.list().unwrap().contains(&native_id));

    job.cancel().unwrap();
    assert_eq!(job.wait(TIMEOUT).unwrap().state, JobState::Canceled);
    executor.shutdown();
}

#[test]
fn submit_after_shutdown_is_refused() {
    let scheduler = FakeScheduler::new();
    let config = scheduler.config();
    let executor = scheduler.executor(&config);
    executor.shutdown();

    let job = job("/bin/true", &[]);
    assert!(matches!(
        executor.submit(&job),
        Err(ExecutorError::InvalidState(_))
    ));
}
