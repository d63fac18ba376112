use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    env,
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

pub const SUPPORTED_EXECUTORS: [&str; 5] = ["local", "slurm", "lsf", "pbs", "cobalt"];
pub const LAUNCHER_BINARY: &str = "jobport-launch";

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Executor {0} is not supported")]
    UnsupportedExecutor(String),
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[source] Error),
    #[error("Failed to read the configuration")]
    Io(#[from] Error),
    #[error("Failed to parse the configuration")]
    Parse(#[from] serde_yaml::Error),
    #[error("Unable to determine a home directory for the default work directory")]
    NoHomeDirectory,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // executor instances by name, the name is what `get_instance` resolves
    #[serde(default)]
    pub executors: BTreeMap<String, ExecutorConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    // backend implementation, one of SUPPORTED_EXECUTORS
    pub kind: String,
    // submit scripts and exit code/output files live here
    pub work_directory: Option<PathBuf>,
    // launcher binary invoked on the lead node
    pub launcher_path: Option<PathBuf>,
    // diagnostics of the launcher, discarded if unset
    pub launcher_log_file: Option<PathBuf>,
    #[serde(default)]
    pub batch: BatchConfig,
}

impl ExecutorConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            work_directory: None,
            launcher_path: None,
            launcher_log_file: None,
            batch: BatchConfig::default(),
        }
    }

    /// configured work directory, or `~/.jobport/work/<name>`
    pub fn work_directory(&self, name: &str) -> Result<PathBuf, ConfigErrors> {
        match &self.work_directory {
            Some(path) => Ok(path.clone()),
            None => env::var_os("HOME")
                .map(|home| {
                    PathBuf::from(home)
                        .join(".jobport")
                        .join("work")
                        .join(name)
                })
                .ok_or(ConfigErrors::NoHomeDirectory),
        }
    }

    /// configured launcher, or the launcher binary installed next to the current executable
    pub fn launcher_path(&self) -> Result<PathBuf, ConfigErrors> {
        match &self.launcher_path {
            Some(path) => Ok(path.clone()),
            None => {
                let current = env::current_exe()?;
                let directory = current
                    .parent()
                    .ok_or_else(|| ConfigErrors::FileNotFound(current.clone()))?;
                Ok(directory.join(LAUNCHER_BINARY))
            }
        }
    }
}

/// Timing and bookkeeping of batch scheduler executors. All durations are in milliseconds.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    #[serde(default = "default_polling_interval")]
    pub polling_interval_ms: u64,
    #[serde(default = "default_initial_polling_delay")]
    pub initial_polling_delay_ms: u64,
    #[serde(default = "default_polling_error_threshold")]
    pub polling_error_threshold: u32,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub keep_files: bool,
    // overrides the backend's exit codes that mean "killed"
    pub kill_exit_codes: Option<Vec<i32>>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: default_polling_interval(),
            initial_polling_delay_ms: default_initial_polling_delay(),
            polling_error_threshold: default_polling_error_threshold(),
            command_timeout_ms: default_command_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
            keep_files: false,
            kill_exit_codes: None,
        }
    }
}

impl BatchConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn initial_polling_delay(&self) -> Duration {
        Duration::from_millis(self.initial_polling_delay_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        Self::from_yaml(&fs::read_to_string(path)?)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Report every problem in the configuration instead of stopping at the first one.
    /// Returns true if any error was found.
    pub fn preflight_checks(&mut self) -> bool {
        let mut contains_error = false;

        if self.executors.is_empty() {
            warn!("No executor was configured, only the built-in defaults are available");
        }

        for (name, config) in self.executors.iter_mut() {
            config.kind = config.kind.to_lowercase();

            if let Err(e) = check_executor(config) {
                error!("executors.{name}: {e}");
                contains_error = true;
            }
        }

        contains_error
    }
}

/// Validate a single executor entry
pub fn check_executor(config: &ExecutorConfig) -> Result<(), String> {
    if !SUPPORTED_EXECUTORS.contains(&config.kind.as_str()) {
        return Err(format!(
            "kind ({}) is not supported, use one of {}",
            config.kind,
            SUPPORTED_EXECUTORS.join(", ")
        ));
    }

    if config.batch.polling_interval_ms == 0 {
        return Err("batch.polling_interval_ms cannot be 0".into());
    }

    if config.batch.command_timeout_ms == 0 {
        return Err("batch.command_timeout_ms cannot be 0".into());
    }

    if let Some(path) = &config.launcher_path {
        match check_executable(path) {
            Ok(true) => {}
            Ok(false) => {
                return Err(format!(
                    "launcher_path {} is not executable",
                    path.to_string_lossy()
                ))
            }
            Err(e) => {
                return Err(format!(
                    "failed to check launcher_path {}: {e}",
                    path.to_string_lossy()
                ))
            }
        }
    }

    Ok(())
}

fn default_polling_interval() -> u64 {
    30_000
}

fn default_initial_polling_delay() -> u64 {
    2_000
}

fn default_polling_error_threshold() -> u32 {
    2
}

fn default_command_timeout() -> u64 {
    60_000
}

fn default_shutdown_grace() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn defaults_are_filled_in() {
        let config = RunnerConfig::from_yaml(indoc! {"
            executors:
              cluster:
                kind: slurm
        "})
        .unwrap();

        let cluster = &config.executors["cluster"];
        assert_eq!(cluster.batch, BatchConfig::default());
        assert_eq!(cluster.batch.polling_interval(), Duration::from_secs(30));
        assert_eq!(cluster.batch.initial_polling_delay(), Duration::from_secs(2));
        assert_eq!(cluster.batch.polling_error_threshold, 2);
        assert!(!cluster.batch.keep_files);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = RunnerConfig::from_yaml(indoc! {"
            executors:
              cluster:
                kind: pbs
                batch:
                  poll_every: 10
        "});

        assert!(matches!(result, Err(ConfigErrors::Parse(_))));
    }

    #[test]
    fn preflight_reports_bad_entries() {
        let mut config = RunnerConfig::from_yaml(indoc! {"
            executors:
              good:
                kind: LSF
                batch:
                  polling_interval_ms: 500
                  kill_exit_codes: [130, 137]
              bad:
                kind: condor
        "})
        .unwrap();

        assert!(config.preflight_checks());
        assert_eq!(config.executors["good"].kind, "lsf");
        assert!(check_executor(&config.executors["good"]).is_ok());
        assert!(check_executor(&config.executors["bad"]).is_err());
    }

    #[test]
    fn explicit_work_directory_wins() {
        let mut config = ExecutorConfig::new("local");
        config.work_directory = Some(PathBuf::from("/scratch/jobs"));

        assert_eq!(
            config.work_directory("local").unwrap(),
            PathBuf::from("/scratch/jobs")
        );
    }
}
