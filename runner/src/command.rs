use std::{
    ffi::OsString,
    io::{self, Read},
    os::unix::process::ExitStatusExt,
    process::{Command, ExitStatus, Stdio},
    thread,
    time::Duration,
};
use tracing::{debug, trace, warn};
use wait_timeout::ChildExt;

/// Exit code reported when a command had to be killed after its timeout
pub const TIMEOUT_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr, what schedulers usually print errors into
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// A backend command line, program first
pub type CommandLine = Vec<OsString>;

pub fn command_line<I, S>(parts: I) -> CommandLine
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    parts.into_iter().map(Into::into).collect()
}

/// Run a command to completion, killing it after `timeout`.
///
/// Both pipes are drained on separate threads while waiting, a chatty command would otherwise
/// block on a full pipe and never exit.
#[tracing::instrument(level = "debug", skip(timeout))]
pub fn run_command(args: &[OsString], timeout: Duration) -> io::Result<CommandOutput> {
    let (program, arguments) = args
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;

    let mut child = Command::new(program)
        .args(arguments)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let exit_code = match child.wait_timeout(timeout)? {
        Some(status) => exit_code_of(status),
        None => {
            warn!(
                command = ?program,
                timeout_ms = timeout.as_millis() as u64,
                "Command ran into timeout, killing it"
            );
            child.kill()?;
            child.wait()?;
            TIMEOUT_EXIT_CODE
        }
    };

    let output = CommandOutput {
        exit_code,
        stdout: collect(stdout),
        stderr: collect(stderr),
    };

    debug!(exit_code = output.exit_code, "Command finished");
    trace!(stdout = %output.stdout, stderr = %output.stderr);

    Ok(output)
}

/// Exit code of a finished process, using the shell's `128 + signal` for signaled processes
pub fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(TIMEOUT_EXIT_CODE)
}

pub(crate) fn drain<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Err(error) = reader.read_to_end(&mut buffer) {
            warn!(error = ?error, "Failed to read command output");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

pub(crate) fn collect(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}
