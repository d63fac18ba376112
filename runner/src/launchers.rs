pub mod run;

use crate::spec::JobSpec;
use std::{
    ffi::OsString,
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

/// Last line printed by a launcher that ran the job to completion
pub const SENTINEL: &str = "_JOBPORT_LAUNCHER_DONE";
pub const NULL_DEVICE: &str = "/dev/null";

// environment seen by every launched process instance
pub const ENV_JOB_ID: &str = "JOBPORT_JOB_ID";
pub const ENV_PROCESS_INDEX: &str = "JOBPORT_PROCESS_INDEX";
pub const ENV_PROCESS_COUNT: &str = "JOBPORT_PROCESS_COUNT";
pub const ENV_NODE_INDEX: &str = "JOBPORT_NODE_INDEX";
pub const ENV_NODE_COUNT: &str = "JOBPORT_NODE_COUNT";
pub const ENV_NODELIST: &str = "JOBPORT_NODELIST";
/// hosts allocated by the scheduler, one per line, exported by submit scripts
pub const ENV_NODEFILE: &str = "JOBPORT_NODEFILE";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No launcher named '{0}'")]
pub struct UnknownLauncher(pub String);

/// How the processes of a job are started once resources are granted
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Launcher {
    /// run the executable once
    #[default]
    Single,
    /// run `process_count` copies on the lead node
    Multiple,
    Mpirun,
    Srun,
    Jsrun,
    Aprun,
}

impl Launcher {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Multiple => "multiple",
            Self::Mpirun => "mpirun",
            Self::Srun => "srun",
            Self::Jsrun => "jsrun",
            Self::Aprun => "aprun",
        }
    }

    pub fn for_spec(spec: &JobSpec) -> Result<Self, UnknownLauncher> {
        match &spec.launcher {
            Some(name) => name.parse(),
            None => Ok(Self::default()),
        }
    }

    /// Arguments of the launcher binary for `spec`, strategy first
    pub fn arguments(&self, job_id: &str, spec: &JobSpec, log_file: Option<&Path>) -> Vec<OsString> {
        let resources = &spec.resources;
        let mut arguments: Vec<OsString> = vec![
            self.name().into(),
            "--processes".into(),
            resources.computed_process_count().to_string().into(),
            "--processes-per-node".into(),
            resources.computed_processes_per_node().to_string().into(),
            "--nodes".into(),
            resources.computed_node_count().to_string().into(),
            job_id.into(),
            log_file.map(OsString::from).unwrap_or_default(),
            optional_path(&spec.pre_launch),
            optional_path(&spec.post_launch),
            redirect(&spec.stdin_path),
            redirect(&spec.stdout_path),
            redirect(&spec.stderr_path),
            spec.executable.clone().into(),
        ];

        arguments.extend(spec.arguments.iter().map(OsString::from));
        arguments
    }

    /// Command line wrapping the executable for the delegating strategies
    pub fn wrap(&self, processes: u32, processes_per_node: u32, command: &[String]) -> Vec<String> {
        let processes = processes.to_string();
        let processes_per_node = processes_per_node.to_string();

        let mut wrapped: Vec<String> = match self {
            Self::Single | Self::Multiple => Vec::new(),
            Self::Mpirun => vec!["mpirun".into(), "-n".into(), processes],
            Self::Srun => vec![
                "srun".into(),
                "--ntasks".into(),
                processes,
                "--ntasks-per-node".into(),
                processes_per_node,
            ],
            Self::Jsrun => vec!["jsrun".into(), "-n".into(), processes, "-a".into(), "1".into()],
            Self::Aprun => vec![
                "aprun".into(),
                "-n".into(),
                processes,
                "-N".into(),
                processes_per_node,
            ],
        };

        wrapped.extend(command.iter().cloned());
        wrapped
    }
}

impl FromStr for Launcher {
    type Err = UnknownLauncher;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "multiple" => Ok(Self::Multiple),
            "mpirun" => Ok(Self::Mpirun),
            "srun" => Ok(Self::Srun),
            "jsrun" => Ok(Self::Jsrun),
            "aprun" => Ok(Self::Aprun),
            _ => Err(UnknownLauncher(s.to_string())),
        }
    }
}

impl Display for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn optional_path(path: &Option<PathBuf>) -> OsString {
    path.as_ref().map(OsString::from).unwrap_or_default()
}

fn redirect(path: &Option<PathBuf>) -> OsString {
    path.as_ref()
        .map(OsString::from)
        .unwrap_or_else(|| NULL_DEVICE.into())
}

/// true if the launcher output lacks the final sentinel line
pub fn launcher_failed(output: &str) -> bool {
    output
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .map_or(true, |line| line.trim() != SENTINEL)
}

/// Message describing a launcher failure, `None` if the launcher finished normally
pub fn failure_message(output: &str) -> Option<String> {
    if !launcher_failed(output) {
        return None;
    }

    let details = output.trim();
    Some(if details.is_empty() {
        "Launcher failed without output".to_string()
    } else {
        format!("Launcher failed: {details}")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ResourceSpec;

    #[test]
    fn names_round_trip() {
        for launcher in [
            Launcher::Single,
            Launcher::Multiple,
            Launcher::Mpirun,
            Launcher::Srun,
            Launcher::Jsrun,
            Launcher::Aprun,
        ] {
            assert_eq!(launcher.name().parse::<Launcher>(), Ok(launcher));
        }
        assert_eq!(
            "flux".parse::<Launcher>(),
            Err(UnknownLauncher("flux".into()))
        );
    }

    #[test]
    fn arguments_follow_the_positional_contract() {
        let spec = JobSpec::builder("/bin/echo")
            .args(["-n", "hello"])
            .pre_launch("/opt/setup.sh")
            .stdout("/tmp/out.txt")
            .resources(ResourceSpec {
                process_count: Some(4),
                processes_per_node: Some(2),
                ..Default::default()
            })
            .build()
            .unwrap();

        let arguments = Launcher::Multiple.arguments("job-1", &spec, None);
        let arguments: Vec<&str> = arguments.iter().map(|a| a.to_str().unwrap()).collect();

        assert_eq!(
            arguments,
            vec![
                "multiple",
                "--processes",
                "4",
                "--processes-per-node",
                "2",
                "--nodes",
                "2",
                "job-1",
                "",
                "/opt/setup.sh",
                "",
                NULL_DEVICE,
                "/tmp/out.txt",
                NULL_DEVICE,
                "/bin/echo",
                "-n",
                "hello",
            ]
        );
    }

    #[test]
    fn delegating_strategies_wrap_the_command() {
        let command = vec!["./a.out".to_string(), "-v".to_string()];

        assert_eq!(Launcher::Single.wrap(1, 1, &command), command);
        assert_eq!(
            Launcher::Mpirun.wrap(8, 4, &command),
            vec!["mpirun", "-n", "8", "./a.out", "-v"]
        );
        assert_eq!(
            Launcher::Aprun.wrap(8, 4, &command),
            vec!["aprun", "-n", "8", "-N", "4", "./a.out", "-v"]
        );
    }

    #[test]
    fn sentinel_detection() {
        assert!(!launcher_failed(&format!("some output\n{SENTINEL}\n")));
        assert!(!launcher_failed(&format!("{SENTINEL}\n\n")));
        assert!(launcher_failed(""));
        assert!(launcher_failed(&format!("{SENTINEL}\nmpirun: not found\n")));

        assert_eq!(failure_message(SENTINEL), None);
        assert_eq!(
            failure_message("srun: error: Unable to create step\n").as_deref(),
            Some("Launcher failed: srun: error: Unable to create step")
        );
    }
}
