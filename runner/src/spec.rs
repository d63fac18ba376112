use std::{collections::BTreeMap, path::PathBuf, time::Duration};
use thiserror::Error;

pub const DEFAULT_DURATION: Duration = Duration::from_secs(10 * 60);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("A job needs an executable")]
    MissingExecutable,
    #[error("{0} must be greater than zero")]
    ZeroCount(&'static str),
    #[error("The process_count ({process_count}) must be an integral multiple of {divisor_name} ({divisor})")]
    NotAMultiple {
        process_count: u32,
        divisor_name: &'static str,
        divisor: u32,
    },
    #[error("The resources must satisfy process_count ({process_count}) = node_count ({node_count}) * processes_per_node ({processes_per_node})")]
    Inconsistent {
        process_count: u32,
        node_count: u32,
        processes_per_node: u32,
    },
    #[error("node_count ({node_count}) * processes_per_node ({processes_per_node}) does not fit a process count")]
    TooManyProcesses {
        node_count: u32,
        processes_per_node: u32,
    },
}

/// Resources requested for a job.
///
/// Any two of `node_count`, `processes_per_node` and `process_count` determine the third. An
/// empty spec denotes a single process on a single node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceSpec {
    pub node_count: Option<u32>,
    pub processes_per_node: Option<u32>,
    pub process_count: Option<u32>,
    pub cpu_cores_per_process: Option<u32>,
    pub gpu_cores_per_process: Option<u32>,
    pub exclusive_node_use: bool,
}

impl ResourceSpec {
    pub fn validate(&self) -> Result<(), SpecError> {
        for (name, value) in [
            ("node_count", self.node_count),
            ("processes_per_node", self.processes_per_node),
            ("process_count", self.process_count),
            ("cpu_cores_per_process", self.cpu_cores_per_process),
        ] {
            if value == Some(0) {
                return Err(SpecError::ZeroCount(name));
            }
        }

        match (self.process_count, self.node_count, self.processes_per_node) {
            (Some(process_count), Some(node_count), Some(processes_per_node)) => {
                if node_count.checked_mul(processes_per_node) != Some(process_count) {
                    return Err(SpecError::Inconsistent {
                        process_count,
                        node_count,
                        processes_per_node,
                    });
                }
            }
            (Some(process_count), None, Some(processes_per_node)) => {
                if process_count % processes_per_node != 0 {
                    return Err(SpecError::NotAMultiple {
                        process_count,
                        divisor_name: "processes_per_node",
                        divisor: processes_per_node,
                    });
                }
            }
            (Some(process_count), Some(node_count), None) => {
                if process_count % node_count != 0 {
                    return Err(SpecError::NotAMultiple {
                        process_count,
                        divisor_name: "node_count",
                        divisor: node_count,
                    });
                }
            }
            (None, Some(node_count), Some(processes_per_node)) => {
                if node_count.checked_mul(processes_per_node).is_none() {
                    return Err(SpecError::TooManyProcesses {
                        node_count,
                        processes_per_node,
                    });
                }
            }
            _ => {}
        }

        Ok(())
    }

    pub fn computed_process_count(&self) -> u32 {
        match (self.process_count, self.node_count, self.processes_per_node) {
            (Some(count), _, _) => count,
            (None, Some(nodes), Some(ppn)) => nodes.saturating_mul(ppn),
            (None, Some(nodes), None) => nodes,
            (None, None, Some(ppn)) => ppn,
            (None, None, None) => 1,
        }
    }

    pub fn computed_node_count(&self) -> u32 {
        match (self.node_count, self.process_count, self.processes_per_node) {
            (Some(nodes), _, _) => nodes,
            (None, Some(count), Some(ppn)) => (count / ppn).max(1),
            _ => 1,
        }
    }

    pub fn computed_processes_per_node(&self) -> u32 {
        match (self.processes_per_node, self.process_count, self.node_count) {
            (Some(ppn), _, _) => ppn,
            (None, Some(count), Some(nodes)) => (count / nodes).max(1),
            (None, Some(count), None) => count,
            _ => 1,
        }
    }
}

/// Scheduling metadata that is not about the process itself
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobAttributes {
    pub queue_name: Option<String>,
    pub project_name: Option<String>,
    pub reservation_id: Option<String>,
    pub duration: Duration,
    /// keys are namespaced by backend, e.g. `slurm.qos` or `pbs.place`
    pub custom_attributes: BTreeMap<String, String>,
}

impl Default for JobAttributes {
    fn default() -> Self {
        Self {
            queue_name: None,
            project_name: None,
            reservation_id: None,
            duration: DEFAULT_DURATION,
            custom_attributes: BTreeMap::new(),
        }
    }
}

impl JobAttributes {
    /// custom attributes in the namespace of `backend` with the prefix stripped
    pub fn custom_attributes_for<'a>(&'a self, backend: &str) -> BTreeMap<&'a str, &'a str> {
        self.custom_attributes
            .iter()
            .filter_map(|(key, value)| {
                key.split_once('.')
                    .filter(|(namespace, _)| *namespace == backend)
                    .map(|(_, name)| (name, value.as_str()))
            })
            .collect()
    }

    /// duration formatted as `HH:MM:SS`, which every supported scheduler accepts
    pub fn formatted_duration(&self) -> String {
        let total = self.duration.as_secs();
        format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
    }
}

/// Static description of what to run, fixed once the job is bound to an executor
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSpec {
    pub name: Option<String>,
    pub executable: String,
    pub arguments: Vec<String>,
    pub directory: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,
    pub inherit_environment: bool,
    pub stdin_path: Option<PathBuf>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    pub pre_launch: Option<PathBuf>,
    pub post_launch: Option<PathBuf>,
    pub launcher: Option<String>,
    pub resources: ResourceSpec,
    pub attributes: JobAttributes,
}

impl Default for JobSpec {
    fn default() -> Self {
        Self {
            name: None,
            executable: String::new(),
            arguments: Vec::new(),
            directory: None,
            environment: BTreeMap::new(),
            inherit_environment: true,
            stdin_path: None,
            stdout_path: None,
            stderr_path: None,
            pre_launch: None,
            post_launch: None,
            launcher: None,
            resources: ResourceSpec::default(),
            attributes: JobAttributes::default(),
        }
    }
}

impl JobSpec {
    pub fn builder(executable: impl Into<String>) -> JobSpecBuilder {
        JobSpecBuilder {
            spec: JobSpec {
                executable: executable.into(),
                ..Default::default()
            },
        }
    }

    /// name used for the backend job, falls back to the executable's file name
    pub fn display_name(&self) -> &str {
        match &self.name {
            Some(name) => name,
            None => self
                .executable
                .rsplit('/')
                .next()
                .filter(|name| !name.is_empty())
                .unwrap_or("job"),
        }
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        if self.executable.is_empty() {
            return Err(SpecError::MissingExecutable);
        }

        self.resources.validate()
    }
}

#[derive(Debug, Clone)]
pub struct JobSpecBuilder {
    spec: JobSpec,
}

impl JobSpecBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.spec.name = Some(name.into());
        self
    }

    pub fn arg(mut self, argument: impl Into<String>) -> Self {
        self.spec.arguments.push(argument.into());
        self
    }

    pub fn args<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec
            .arguments
            .extend(arguments.into_iter().map(Into::into));
        self
    }

    pub fn directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.spec.directory = Some(directory.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.environment.insert(key.into(), value.into());
        self
    }

    pub fn inherit_environment(mut self, inherit: bool) -> Self {
        self.spec.inherit_environment = inherit;
        self
    }

    pub fn stdin(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.stdin_path = Some(path.into());
        self
    }

    pub fn stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.stdout_path = Some(path.into());
        self
    }

    pub fn stderr(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.stderr_path = Some(path.into());
        self
    }

    pub fn pre_launch(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.pre_launch = Some(path.into());
        self
    }

    pub fn post_launch(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.post_launch = Some(path.into());
        self
    }

    pub fn launcher(mut self, launcher: impl Into<String>) -> Self {
        self.spec.launcher = Some(launcher.into());
        self
    }

    pub fn resources(mut self, resources: ResourceSpec) -> Self {
        self.spec.resources = resources;
        self
    }

    pub fn attributes(mut self, attributes: JobAttributes) -> Self {
        self.spec.attributes = attributes;
        self
    }

    pub fn build(self) -> Result<JobSpec, SpecError> {
        self.spec.validate()?;

        Ok(self.spec)
    }
}
