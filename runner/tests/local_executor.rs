use jobport::{
    config::ExecutorConfig,
    executors::local::LocalExecutor,
    spec::{JobSpec, JobSpecBuilder, ResourceSpec},
    ExecutorError, Job, JobExecutor, JobState, JobStatus,
};
use parking_lot::Mutex;
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use uuid::Uuid;

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(30));

/// Temporary directory removed at the end of the test
struct Scratch(PathBuf);

impl Scratch {
    fn join(&self, name: &str) -> PathBuf {
        self.0.join(name)
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

fn scratch() -> Scratch {
    let directory = env::temp_dir().join(format!("jobport-local-{}", Uuid::new_v4()));
    fs::create_dir_all(&directory).unwrap();
    Scratch(directory)
}

fn multiple(script: &str, processes: u32, stdout: &Path) -> JobSpecBuilder {
    JobSpec::builder("/bin/sh")
        .args(["-c", script])
        .launcher("multiple")
        .stdout(stdout)
        .resources(ResourceSpec {
            process_count: Some(processes),
            ..Default::default()
        })
}

fn executor() -> Arc<LocalExecutor> {
    let mut config = ExecutorConfig::new("local");
    config.launcher_path = Some(PathBuf::from(env!("CARGO_BIN_EXE_jobport-launch")));
    config.batch.shutdown_grace_ms = 2_000;

    LocalExecutor::load("local-test", &config).unwrap()
}

#[test]
fn echo_completes() {
    let directory = scratch();
    let stdout = directory.join("out.txt");
    let executor = executor();

    let job = Job::new(
        JobSpec::builder("/bin/echo")
            .arg("hello")
            .stdout(&stdout)
            .build()
            .unwrap(),
    );
    executor.submit(&job).unwrap();
    assert!(job.native_id().is_some());

    let status = job.wait(TIMEOUT).unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.exit_code, Some(0));
    assert_eq!(fs::read_to_string(&stdout).unwrap(), "hello\n");

    executor.shutdown();
}

#[test]
fn non_zero_exit_fails() {
    let executor = executor();
    let job = Job::new(JobSpec::builder("/bin/false").build().unwrap());

    executor.submit(&job).unwrap();

    let status = job.wait(TIMEOUT).unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.exit_code, Some(1));

    executor.shutdown();
}

#[test]
fn missing_executable_fails() {
    let executor = executor();
    let job = Job::new(
        JobSpec::builder("/nonexistent/jobport/binary")
            .build()
            .unwrap(),
    );

    executor.submit(&job).unwrap();

    let status = job.wait(TIMEOUT).unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.exit_code, Some(127));

    executor.shutdown();
}

#[test]
fn cancel_running_job() {
    let executor = executor();
    let job = Job::new(JobSpec::builder("/bin/sleep").arg("60").build().unwrap());

    executor.submit(&job).unwrap();
    assert_eq!(
        job.wait_for(&[JobState::Active], TIMEOUT).unwrap().state,
        JobState::Active
    );

    let start = Instant::now();
    job.cancel().unwrap();

    let status = job.wait(TIMEOUT).unwrap();
    assert_eq!(status.state, JobState::Canceled);
    assert!(start.elapsed() < Duration::from_secs(20));

    // final jobs cannot be canceled again
    assert!(matches!(job.cancel(), Err(ExecutorError::InvalidState(_))));

    executor.shutdown();
}

#[test]
fn cancel_while_starting_is_not_lost() {
    let executor = executor();
    let job = Job::new(JobSpec::builder("/bin/sleep").arg("60").build().unwrap());

    // runs on the dispatcher thread, racing the spawn in submit
    job.set_status_callback(Arc::new(|job: &Job, status: &JobStatus| {
        if status.state == JobState::Queued {
            job.cancel().unwrap();
        }
    }));

    let start = Instant::now();
    executor.submit(&job).unwrap();

    let status = job.wait(TIMEOUT).unwrap();
    assert_eq!(status.state, JobState::Canceled);
    assert!(start.elapsed() < Duration::from_secs(20));

    executor.shutdown();
}

#[test]
fn multiple_launcher_runs_every_process() {
    let directory = scratch();
    let stdout = directory.join("out.txt");
    let executor = executor();

    let job = Job::new(
        multiple("echo \"$JOBPORT_PROCESS_INDEX/$JOBPORT_PROCESS_COUNT\"", 3, &stdout)
            .build()
            .unwrap(),
    );
    executor.submit(&job).unwrap();

    assert_eq!(job.wait(TIMEOUT).unwrap().state, JobState::Completed);

    let mut lines: Vec<String> = fs::read_to_string(&stdout)
        .unwrap()
        .lines()
        .map(String::from)
        .collect();
    lines.sort();
    assert_eq!(lines, vec!["0/3", "1/3", "2/3"]);

    executor.shutdown();
}

#[test]
fn every_instance_sees_a_slot_per_process() {
    let directory = scratch();
    let stdout = directory.join("out.txt");
    let executor = executor();

    let job = Job::new(
        multiple("wc -l < \"$JOBPORT_NODELIST\"", 3, &stdout)
            .build()
            .unwrap(),
    );
    executor.submit(&job).unwrap();

    assert_eq!(job.wait(TIMEOUT).unwrap().state, JobState::Completed);

    let counts: Vec<String> = fs::read_to_string(&stdout)
        .unwrap()
        .lines()
        .map(|line| line.trim().to_string())
        .collect();
    assert_eq!(counts, vec!["3", "3", "3"]);

    executor.shutdown();
}

#[test]
fn post_launch_runs_after_every_instance() {
    let directory = scratch();
    let markers = directory.join("markers");
    fs::create_dir_all(&markers).unwrap();
    let report = directory.join("post.txt");
    let post_launch = directory.join("teardown.sh");
    fs::write(
        &post_launch,
        format!("ls '{}' | wc -l > '{}'\n", markers.display(), report.display()),
    )
    .unwrap();
    let executor = executor();

    // the last instance finishes well after the first
    let script = format!(
        "sleep \"$JOBPORT_PROCESS_INDEX\"; touch '{}'/\"$JOBPORT_PROCESS_INDEX\"",
        markers.display()
    );
    let job = Job::new(
        multiple(&script, 3, &directory.join("out.txt"))
            .post_launch(&post_launch)
            .build()
            .unwrap(),
    );
    executor.submit(&job).unwrap();

    assert_eq!(job.wait(TIMEOUT).unwrap().state, JobState::Completed);
    assert_eq!(fs::read_to_string(&report).unwrap().trim(), "3");

    executor.shutdown();
}

#[test]
fn concurrent_output_keeps_lines_whole() {
    let directory = scratch();
    let stdout = directory.join("out.txt");
    let executor = executor();

    let script = "long=$(head -c 10000 /dev/zero | tr '\\0' x); \
        for i in $(seq 100); do echo \"$JOBPORT_PROCESS_INDEX:$long\"; done";
    let job = Job::new(multiple(script, 4, &stdout).build().unwrap());
    executor.submit(&job).unwrap();

    assert_eq!(job.wait(TIMEOUT).unwrap().state, JobState::Completed);

    let output = fs::read_to_string(&stdout).unwrap();
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines.len(), 400);

    for line in lines {
        let (index, payload) = line.split_once(':').unwrap();
        assert!(["0", "1", "2", "3"].contains(&index), "{index}");
        assert_eq!(payload.len(), 10000);
        assert!(payload.bytes().all(|b| b == b'x'));
    }

    executor.shutdown();
}

#[test]
fn pre_launch_exports_reach_the_job() {
    let directory = scratch();
    let stdout = directory.join("out.txt");
    let pre_launch = directory.join("setup.sh");
    fs::write(&pre_launch, "export GREETING=hi\n").unwrap();
    let executor = executor();

    let job = Job::new(
        JobSpec::builder("/bin/sh")
            .args(["-c", "echo \"$GREETING\""])
            .pre_launch(&pre_launch)
            .stdout(&stdout)
            .build()
            .unwrap(),
    );
    executor.submit(&job).unwrap();

    assert_eq!(job.wait(TIMEOUT).unwrap().state, JobState::Completed);
    assert_eq!(fs::read_to_string(&stdout).unwrap(), "hi\n");

    executor.shutdown();
}

#[test]
fn failing_pre_launch_reports_a_launcher_failure() {
    let directory = scratch();
    let pre_launch = directory.join("setup.sh");
    fs::write(&pre_launch, "exit 4\n").unwrap();
    let executor = executor();

    let job = Job::new(
        JobSpec::builder("/bin/true")
            .pre_launch(&pre_launch)
            .build()
            .unwrap(),
    );
    executor.submit(&job).unwrap();

    let status = job.wait(TIMEOUT).unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert!(status.message.unwrap().starts_with("Launcher failed"));

    executor.shutdown();
}

#[test]
fn wait_timeout_leaves_the_job_running() {
    let executor = executor();
    let job = Job::new(JobSpec::builder("/bin/sleep").arg("60").build().unwrap());
    executor.submit(&job).unwrap();

    assert_eq!(job.wait(Some(Duration::from_millis(200))), None);
    assert!(!job.status().is_final());

    job.cancel().unwrap();
    assert_eq!(job.wait(TIMEOUT).unwrap().state, JobState::Canceled);

    executor.shutdown();
}

#[test]
fn jobs_cannot_be_submitted_twice() {
    let executor = executor();
    let job = Job::new(JobSpec::builder("/bin/true").build().unwrap());

    executor.submit(&job).unwrap();
    assert!(matches!(
        executor.submit(&job),
        Err(ExecutorError::InvalidState(_))
    ));

    job.wait(TIMEOUT).unwrap();
    executor.shutdown();
}

#[test]
fn callbacks_see_every_state_in_order() {
    let executor = executor();
    let seen: Arc<Mutex<Vec<JobState>>> = Arc::default();
    let job_seen: Arc<Mutex<Vec<JobState>>> = Arc::default();

    let recorder = seen.clone();
    executor.set_job_status_callback(Arc::new(move |_: &Job, status: &JobStatus| {
        recorder.lock().push(status.state)
    }));

    let job = Job::new(JobSpec::builder("/bin/true").build().unwrap());
    let recorder = job_seen.clone();
    job.set_status_callback(Arc::new(move |_: &Job, status: &JobStatus| {
        recorder.lock().push(status.state)
    }));

    executor.submit(&job).unwrap();
    job.wait(TIMEOUT).unwrap();
    executor.shutdown();

    let expected = vec![JobState::Queued, JobState::Active, JobState::Completed];
    assert_eq!(*seen.lock(), expected);
    assert_eq!(*job_seen.lock(), expected);
}

#[test]
fn panicking_callback_does_not_stop_delivery() {
    let executor = executor();
    let seen: Arc<Mutex<Vec<JobState>>> = Arc::default();

    let recorder = seen.clone();
    executor.set_job_status_callback(Arc::new(move |_: &Job, status: &JobStatus| {
        recorder.lock().push(status.state)
    }));

    let job = Job::new(JobSpec::builder("/bin/true").build().unwrap());
    job.set_status_callback(Arc::new(|_: &Job, _: &JobStatus| panic!("callback failure")));

    executor.submit(&job).unwrap();
    job.wait(TIMEOUT).unwrap();
    executor.shutdown();

    assert_eq!(seen.lock().last(), Some(&JobState::Completed));
}

#[test]
fn attach_follows_a_foreign_process() {
    let executor = executor();
    let mut child = std::process::Command::new("/bin/sleep")
        .arg("1")
        .spawn()
        .unwrap();

    let job = Job::new(JobSpec::default());
    executor.attach(&job, &child.id().to_string()).unwrap();

    // reap the child so the pid disappears once it exits
    let reaper = thread::spawn(move || child.wait());

    let status = job.wait(TIMEOUT).unwrap();
    assert_eq!(status.state, JobState::Completed);
    reaper.join().unwrap().unwrap();

    assert!(matches!(
        executor.attach(&Job::new(JobSpec::default()), "not-a-pid"),
        Err(ExecutorError::AttachAmbiguity(_))
    ));

    executor.shutdown();
}
