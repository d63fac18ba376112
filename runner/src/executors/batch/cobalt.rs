use super::{check_exit_code, current_user, BatchBackend, StatusReport};
use crate::{
    command::{command_line, CommandLine, CommandOutput},
    executors::ExecutorError,
    status::{JobState, JobStatus},
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{ffi::OsString, path::Path};
use tracing_unwrap::ResultExt;

const QSTAT: &str = "qstat";

static QSUB_JOB_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[0-9]{4,}\b").unwrap_or_log());
static QSTAT_JOB_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Jobid\s*:\s*([0-9]{4,})").unwrap_or_log());
static QSTAT_STATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)State\s*:\s*(\w+)").unwrap_or_log());

#[derive(Debug, Clone, Copy, Default)]
pub struct Cobalt;

fn state(state: &str) -> Option<JobState> {
    Some(match state.to_lowercase().as_str() {
        "queued" => JobState::Queued,
        "starting" | "running" | "exiting" => JobState::Active,
        "killing" => JobState::Failed,
        _ => return None,
    })
}

/// `(job id, state)` pairs of `qstat -l` output, where each `Jobid:` line is followed by its
/// `State:` line
fn records(output: &str) -> Vec<(String, String)> {
    let lines: Vec<&str> = output.lines().collect();
    let mut records = Vec::new();
    let mut index = 0;

    while index + 1 < lines.len() {
        let job_id = QSTAT_JOB_ID.captures(lines[index]).map(|c| c[1].to_string());
        let state = QSTAT_STATE.captures(lines[index + 1]).map(|c| c[1].to_string());

        match (job_id, state) {
            (Some(job_id), Some(state)) => {
                records.push((job_id, state));
                index += 2;
            }
            _ => index += 1,
        }
    }

    records
}

impl BatchBackend for Cobalt {
    fn name(&self) -> &'static str {
        "cobalt"
    }

    fn template(&self) -> &'static str {
        include_str!("templates/cobalt.hbs")
    }

    fn submit_command(&self, script: &Path) -> CommandLine {
        vec![OsString::from("qsub"), script.into()]
    }

    fn job_id_from_submit_output(&self, output: &str) -> Result<String, ExecutorError> {
        QSUB_JOB_ID
            .find(output)
            .map(|id| id.as_str().to_string())
            .ok_or_else(|| ExecutorError::UnparsableOutput {
                command: "qsub".into(),
                reason: format!("no job id in '{}'", output.trim()),
            })
    }

    fn cancel_command(&self, native_id: &str) -> CommandLine {
        command_line(["qdel", native_id])
    }

    fn status_command(&self, native_ids: &[String]) -> CommandLine {
        let mut command = command_line([QSTAT, "-l", "--header=Jobid:State"]);
        command.extend(native_ids.iter().map(OsString::from));
        command
    }

    fn parse_status_output(&self, output: &CommandOutput) -> Result<StatusReport, ExecutorError> {
        // qstat fails without output once none of the ids are known anymore
        if !output.success() && output.combined().trim().is_empty() {
            return Ok(StatusReport::new());
        }
        check_exit_code(QSTAT, output)?;

        Ok(records(&output.stdout)
            .into_iter()
            .map(|(native_id, reported)| {
                let status = match state(&reported) {
                    Some(state) => Ok(JobStatus::new(state)),
                    None => Err(ExecutorError::UnmappedState {
                        backend: self.name(),
                        native_id: native_id.clone(),
                        state: reported,
                    }),
                };

                (native_id, status)
            })
            .collect())
    }

    fn list_command(&self) -> CommandLine {
        command_line([
            QSTAT.to_string(),
            "-l".to_string(),
            "--header=Jobid:State".to_string(),
            "-u".to_string(),
            current_user(),
        ])
    }

    fn parse_list_output(&self, output: &str) -> Vec<String> {
        records(output).into_iter().map(|(job_id, _)| job_id).collect()
    }
}
