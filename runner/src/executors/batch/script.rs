use crate::{executors::ExecutorError, job::Job};
use handlebars::Handlebars;
use serde::Serialize;
use std::{collections::BTreeMap, ffi::OsString, path::Path};

const TEMPLATE: &str = "submit";

/// Turns a job into the text of a submit script.
///
/// Scripts must run the launch command, write its combined output to
/// `<work_directory>/<native id>.out` and its exit code to `<work_directory>/<native id>.ec`.
pub trait ScriptGenerator: Send + Sync {
    fn generate(&self, context: &ScriptContext) -> Result<String, ExecutorError>;
}

/// Values available to submit script templates
#[derive(Serialize, Debug, Clone)]
pub struct ScriptContext {
    pub job_id: String,
    pub name: String,
    pub directory: Option<String>,
    pub node_count: u32,
    pub process_count: u32,
    pub processes_per_node: u32,
    pub cpus_per_process: Option<u32>,
    pub gpus_per_process: Option<u32>,
    pub exclusive: bool,
    /// `HH:MM:SS`
    pub duration: String,
    pub duration_minutes: u64,
    pub queue_name: Option<String>,
    pub project_name: Option<String>,
    pub reservation_id: Option<String>,
    pub custom_attributes: BTreeMap<String, String>,
    pub environment: BTreeMap<String, String>,
    pub inherit_environment: bool,
    pub work_directory: String,
    /// already escaped, render with triple braces
    pub launch_command: String,
}

impl ScriptContext {
    pub fn new(job: &Job, backend: &str, work_directory: &Path, launch_command: String) -> Self {
        let spec = job.spec();
        let resources = &spec.resources;
        let attributes = &spec.attributes;

        Self {
            job_id: job.id().to_string(),
            name: spec.display_name().to_string(),
            directory: spec
                .directory
                .as_ref()
                .map(|directory| directory.to_string_lossy().into_owned()),
            node_count: resources.computed_node_count(),
            process_count: resources.computed_process_count(),
            processes_per_node: resources.computed_processes_per_node(),
            cpus_per_process: resources.cpu_cores_per_process,
            gpus_per_process: resources.gpu_cores_per_process,
            exclusive: resources.exclusive_node_use,
            duration: attributes.formatted_duration(),
            duration_minutes: ((attributes.duration.as_secs() + 59) / 60).max(1),
            queue_name: attributes.queue_name.clone(),
            project_name: attributes.project_name.clone(),
            reservation_id: attributes.reservation_id.clone(),
            custom_attributes: attributes
                .custom_attributes_for(backend)
                .into_iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
            environment: spec.environment.clone(),
            inherit_environment: spec.inherit_environment,
            work_directory: work_directory.to_string_lossy().into_owned(),
            launch_command,
        }
    }
}

/// Renders handlebars templates, escaping every `{{value}}` for bash
pub struct TemplatedScriptGenerator {
    handlebars: Handlebars<'static>,
}

impl TemplatedScriptGenerator {
    pub fn new(template: &str) -> Result<Self, ExecutorError> {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(bash_escape);
        handlebars
            .register_template_string(TEMPLATE, template)
            .map_err(|e| ExecutorError::Template(e.to_string()))?;

        Ok(Self { handlebars })
    }
}

impl ScriptGenerator for TemplatedScriptGenerator {
    fn generate(&self, context: &ScriptContext) -> Result<String, ExecutorError> {
        self.handlebars
            .render(TEMPLATE, context)
            .map_err(|e| ExecutorError::Template(e.to_string()))
    }
}

/// Quote `value` for bash unless it only contains characters that need no quoting
pub fn bash_escape(value: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c);

    if value.is_empty() {
        "''".to_string()
    } else if value.chars().all(safe) {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r#"'"'"'"#))
    }
}

/// a command line as a single escaped bash string
pub fn shell_join(arguments: &[OsString]) -> String {
    arguments
        .iter()
        .map(|argument| bash_escape(&argument.to_string_lossy()))
        .collect::<Vec<_>>()
        .join(" ")
}
