use clap::{Args, Parser, Subcommand};
use jobport::{
    config::{ConfigErrors, RunnerConfig},
    launchers::Launcher,
    registry::ExecutorRegistry,
    ExecutorError, Job, JobExecutor, JobSpec, JobState, JobStatus, ResourceSpec,
};
use std::{path::PathBuf, process::ExitCode, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "jobport")]
#[command(version)]
#[command(about = "Submit and track jobs on HPC schedulers")]
struct Cli {
    /// YAML file describing the available executors
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a job and print its native id
    Submit(SubmitArgs),
    /// Follow a job that was submitted earlier
    Attach {
        #[arg(long, short = 'e')]
        executor: String,
        native_id: String,
        /// block until the job finishes
        #[arg(long)]
        wait: bool,
    },
    /// Cancel a job by its native id
    Cancel {
        #[arg(long, short = 'e')]
        executor: String,
        native_id: String,
    },
    /// List the native ids the backend knows for the current user
    List {
        #[arg(long, short = 'e')]
        executor: String,
    },
}

#[derive(Args, Debug)]
struct SubmitArgs {
    #[arg(long, short = 'e')]
    executor: String,

    #[arg(long, value_enum)]
    launcher: Option<Launcher>,

    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    directory: Option<PathBuf>,

    #[arg(long)]
    nodes: Option<u32>,

    #[arg(long)]
    processes: Option<u32>,

    #[arg(long)]
    processes_per_node: Option<u32>,

    #[arg(long)]
    stdout: Option<PathBuf>,

    #[arg(long)]
    stderr: Option<PathBuf>,

    /// walltime in minutes
    #[arg(long)]
    duration: Option<u64>,

    #[arg(long)]
    queue: Option<String>,

    #[arg(long)]
    project: Option<String>,

    /// block until the job finishes and print its final status
    #[arg(long)]
    wait: bool,

    /// executable followed by its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true, num_args = 1..)]
    command: Vec<String>,
}

impl SubmitArgs {
    fn spec(&self) -> Result<JobSpec, ExecutorError> {
        let (executable, arguments) = self
            .command
            .split_first()
            .ok_or_else(|| ExecutorError::Submit("no executable given".into()))?;

        let mut builder = JobSpec::builder(executable.clone())
            .args(arguments.iter().cloned())
            .resources(ResourceSpec {
                node_count: self.nodes,
                process_count: self.processes,
                processes_per_node: self.processes_per_node,
                ..Default::default()
            });

        if let Some(launcher) = self.launcher {
            builder = builder.launcher(launcher.name());
        }
        if let Some(name) = &self.name {
            builder = builder.name(name.clone());
        }
        if let Some(directory) = &self.directory {
            builder = builder.directory(directory.clone());
        }
        if let Some(stdout) = &self.stdout {
            builder = builder.stdout(stdout.clone());
        }
        if let Some(stderr) = &self.stderr {
            builder = builder.stderr(stderr.clone());
        }

        let mut spec = builder.build()?;
        if let Some(minutes) = self.duration {
            spec.attributes.duration = Duration::from_secs(minutes * 60);
        }
        spec.attributes.queue_name = self.queue.clone();
        spec.attributes.project_name = self.project.clone();

        Ok(spec)
    }
}

fn load_registry(config: Option<&PathBuf>) -> Result<ExecutorRegistry, ConfigErrors> {
    let Some(path) = config else {
        return Ok(ExecutorRegistry::with_defaults());
    };

    let mut config = RunnerConfig::load(path)?;
    // broken entries only fail once they are used
    if config.preflight_checks() {
        warn!(path = %path.display(), "Configuration contains broken executors");
    }
    info!(path = %path.display(), executors = config.executors.len(), "Loaded configuration");

    Ok(ExecutorRegistry::from_config(&config))
}

fn print_status(status: &JobStatus) {
    match serde_yaml::to_string(status) {
        Ok(yaml) => print!("{yaml}"),
        Err(e) => error!(error = ?e, "Failed to serialize the job status"),
    }
}

impl Commands {
    fn executor(&self) -> &str {
        match self {
            Commands::Submit(args) => &args.executor,
            Commands::Attach { executor, .. }
            | Commands::Cancel { executor, .. }
            | Commands::List { executor } => executor,
        }
    }
}

fn run(executor: &dyn JobExecutor, command: Commands) -> Result<(), ExecutorError> {
    match command {
        Commands::Submit(args) => {
            let job = Job::new(args.spec()?);
            executor.submit(&job)?;
            println!("{}", job.native_id().unwrap_or_default());

            if args.wait {
                if let Some(status) = job.wait(None) {
                    print_status(&status);
                }
            }
        }
        Commands::Attach {
            native_id, wait, ..
        } => {
            let job = Job::new(JobSpec::default());
            executor.attach(&job, &native_id)?;

            let status = if wait {
                job.wait(None)
            } else {
                job.wait_for(&[JobState::Queued, JobState::Active], None)
            };
            if let Some(status) = status {
                print_status(&status);
            }
        }
        Commands::Cancel { native_id, .. } => {
            let job = Job::new(JobSpec::default());
            executor.attach(&job, &native_id)?;
            job.cancel()?;
            info!(%native_id, "Cancel requested");
        }
        Commands::List { .. } => {
            for native_id in executor.list()? {
                println!("{native_id}");
            }
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let executor = match load_registry(cli.config.as_ref())
        .map_err(ExecutorError::from)
        .and_then(|executors| executors.get_instance(cli.command.executor()))
    {
        Ok(executor) => executor,
        Err(e) => {
            error!(error = %e, "Failed to load the executor");
            return ExitCode::FAILURE;
        }
    };

    let result = run(executor.as_ref(), cli.command);
    executor.shutdown();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            ExitCode::FAILURE
        }
    }
}
