use super::{
    Launcher, ENV_JOB_ID, ENV_NODEFILE, ENV_NODELIST, ENV_NODE_COUNT, ENV_NODE_INDEX,
    ENV_PROCESS_COUNT, ENV_PROCESS_INDEX,
};
use crate::command::exit_code_of;
use clap::Parser;
use itertools::Itertools;
use nix::unistd::gethostname;
use parking_lot::Mutex;
use std::{
    env,
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Read, Write},
    os::unix::ffi::OsStringExt,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::Arc,
    thread::{self, JoinHandle},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// exit code of an instance whose executable could not be started, as a shell would report it
const SPAWN_FAILED_EXIT_CODE: i32 = 127;

type Environment = Vec<(OsString, OsString)>;
type SharedOutput = Arc<Mutex<File>>;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("{stage} script {path} failed with exit code {exit_code}")]
    Script {
        stage: &'static str,
        path: PathBuf,
        exit_code: i32,
    },
    #[error("Failed to open {path}: {source}")]
    Redirect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl LaunchError {
    /// exit code of the launcher when it fails before reporting a job result
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Script { exit_code, .. } if *exit_code != 0 => *exit_code,
            _ => 1,
        }
    }
}

/// Positional arguments are fixed: job id, log file, pre-launch script, post-launch script,
/// stdin, stdout, stderr, executable and its arguments. Empty strings stand for "not set".
#[derive(Parser, Debug, Clone)]
#[command(
    name = "jobport-launch",
    version,
    about = "Start the processes of a job on its allocated resources"
)]
pub struct LaunchArgs {
    #[arg(value_enum)]
    pub strategy: Launcher,
    #[arg(long, default_value_t = 1)]
    pub processes: u32,
    #[arg(long, default_value_t = 1)]
    pub processes_per_node: u32,
    #[arg(long, default_value_t = 1)]
    pub nodes: u32,
    pub job_id: String,
    pub log_file: String,
    pub pre_launch: String,
    pub post_launch: String,
    pub stdin: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    #[arg(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        required = true,
        num_args = 1..
    )]
    pub command: Vec<String>,
}

/// Run the job described by `args` and return the aggregated exit code of its processes
#[instrument(skip(args), fields(job_id = %args.job_id, strategy = %args.strategy))]
pub fn launch(args: &LaunchArgs) -> Result<i32, LaunchError> {
    let environment = match non_empty(&args.pre_launch) {
        Some(script) => Some(source_script("pre-launch", script, None)?),
        None => None,
    };

    let hosts = allocated_hosts(args.nodes)?;
    let nodelist = env::temp_dir().join(format!("jobport-{}.nodelist", args.job_id));
    write_nodelist(&nodelist, &hosts, args.processes_per_node, args.processes)?;

    let result = run_instances(args, environment.as_ref(), &nodelist, hosts.len());

    if let Err(e) = fs::remove_file(&nodelist) {
        debug!(error = ?e, "Failed to remove the node list");
    }

    let exit_code = result?;
    info!(exit_code, "All job processes finished");

    if let Some(script) = non_empty(&args.post_launch) {
        source_script("post-launch", script, environment.as_ref())?;
    }

    Ok(exit_code)
}

fn non_empty(path: &str) -> Option<&Path> {
    (!path.is_empty()).then(|| Path::new(path))
}

/// Source `script` in bash and capture the resulting environment, so exported variables
/// reach the job processes. Output of the script goes to stderr, stdout is reserved for the
/// launcher's own report.
fn source_script(
    stage: &'static str,
    script: &Path,
    environment: Option<&Environment>,
) -> Result<Environment, LaunchError> {
    debug!(stage, script = %script.display(), "Sourcing script");

    let mut command = Command::new("bash");
    command
        .arg("-c")
        .arg(r#"source "$1" 1>&2 || exit $?; env -0"#)
        .arg("jobport-launch")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    if let Some(environment) = environment {
        command.env_clear().envs(environment.iter().cloned());
    }

    let output = command.output()?;

    if !output.status.success() {
        return Err(LaunchError::Script {
            stage,
            path: script.to_path_buf(),
            exit_code: exit_code_of(output.status),
        });
    }

    Ok(parse_environment(output.stdout))
}

/// parse the NUL separated output of `env -0`
fn parse_environment(raw: Vec<u8>) -> Environment {
    raw.split(|byte| *byte == 0)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let split = entry.iter().position(|byte| *byte == b'=')?;
            Some((
                OsString::from_vec(entry[..split].to_vec()),
                OsString::from_vec(entry[split + 1..].to_vec()),
            ))
        })
        .collect()
}

/// Hosts granted by the scheduler, or the local host when running outside an allocation
fn allocated_hosts(nodes: u32) -> Result<Vec<String>, LaunchError> {
    let mut hosts = match env::var_os(ENV_NODEFILE).filter(|path| !path.is_empty()) {
        Some(path) => fs::read_to_string(&path)?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .unique()
            .map(String::from)
            .take(nodes.max(1) as usize)
            .collect_vec(),
        None => Vec::new(),
    };

    if hosts.is_empty() {
        let hostname = gethostname().map_err(io::Error::from)?;
        hosts.push(hostname.to_string_lossy().into_owned());
    }

    Ok(hosts)
}

/// one line per process slot, each host repeated `processes_per_node` times
fn nodelist_entries(hosts: &[String], processes_per_node: u32, processes: u32) -> Vec<&str> {
    hosts
        .iter()
        .flat_map(|host| std::iter::repeat(host.as_str()).take(processes_per_node.max(1) as usize))
        .take(processes.max(1) as usize)
        .collect()
}

fn write_nodelist(
    path: &Path,
    hosts: &[String],
    processes_per_node: u32,
    processes: u32,
) -> Result<(), LaunchError> {
    let mut file = File::create(path)?;

    for host in nodelist_entries(hosts, processes_per_node, processes) {
        writeln!(file, "{host}")?;
    }

    Ok(())
}

fn open_output(path: &Path) -> Result<SharedOutput, LaunchError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(|file| Arc::new(Mutex::new(file)))
        .map_err(|source| LaunchError::Redirect {
            path: path.to_path_buf(),
            source,
        })
}

/// Copy `reader` into `target` one complete line at a time
fn forward_lines<R: Read + Send + 'static>(reader: R, target: SharedOutput) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();

        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    if let Err(e) = target.lock().write_all(&line) {
                        warn!(error = ?e, "Failed to forward process output");
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = ?e, "Failed to read process output");
                    break;
                }
            }
        }
    })
}

fn run_instances(
    args: &LaunchArgs,
    environment: Option<&Environment>,
    nodelist: &Path,
    node_count: usize,
) -> Result<i32, LaunchError> {
    let stdout = open_output(&args.stdout)?;
    let stderr = if args.stderr == args.stdout {
        stdout.clone()
    } else {
        open_output(&args.stderr)?
    };

    let instances = match args.strategy {
        Launcher::Multiple => args.processes.max(1),
        _ => 1,
    };
    let command_line = args.strategy.wrap(
        args.processes.max(1),
        args.processes_per_node.max(1),
        &args.command,
    );

    let mut children: Vec<Option<Child>> = Vec::new();
    let mut forwarders = Vec::new();

    for index in 0..instances {
        let stdin = File::open(&args.stdin).map_err(|source| LaunchError::Redirect {
            path: args.stdin.clone(),
            source,
        })?;

        let mut command = Command::new(&command_line[0]);
        command.args(&command_line[1..]);

        if let Some(environment) = environment {
            command.env_clear().envs(environment.iter().cloned());
        }

        command
            .env(ENV_JOB_ID, &args.job_id)
            .env(ENV_PROCESS_INDEX, index.to_string())
            .env(ENV_PROCESS_COUNT, args.processes.max(1).to_string())
            .env(
                ENV_NODE_INDEX,
                (index / args.processes_per_node.max(1)).to_string(),
            )
            .env(ENV_NODE_COUNT, node_count.to_string())
            .env(ENV_NODELIST, nodelist)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        match command.spawn() {
            Ok(mut child) => {
                debug!(index, pid = child.id(), "Started process instance");

                if let Some(pipe) = child.stdout.take() {
                    forwarders.push(forward_lines(pipe, stdout.clone()));
                }
                if let Some(pipe) = child.stderr.take() {
                    forwarders.push(forward_lines(pipe, stderr.clone()));
                }
                children.push(Some(child));
            }
            Err(e) => {
                error!(index, error = ?e, "Failed to start process instance");
                writeln!(
                    stderr.lock(),
                    "jobport-launch: failed to start {}: {e}",
                    command_line[0]
                )?;
                children.push(None);
            }
        }
    }

    let mut exit_codes = Vec::with_capacity(children.len());
    for child in children {
        exit_codes.push(match child {
            Some(mut child) => exit_code_of(child.wait()?),
            None => SPAWN_FAILED_EXIT_CODE,
        });
    }

    for forwarder in forwarders {
        let _ = forwarder.join();
    }

    Ok(aggregate_exit_codes(&exit_codes))
}

/// 0 if every instance succeeded, otherwise the first non-zero exit code
pub fn aggregate_exit_codes(exit_codes: &[i32]) -> i32 {
    exit_codes
        .iter()
        .copied()
        .find(|code| *code != 0)
        .unwrap_or(0)
}
