use super::{check_exit_code, current_user, BatchBackend, StatusReport};
use crate::{
    command::{command_line, CommandLine, CommandOutput},
    executors::ExecutorError,
    status::{JobState, JobStatus},
};
use serde::Deserialize;
use std::{collections::BTreeMap, ffi::OsString, path::Path};

const QSTAT: &str = "qstat";

/// exit status PBS assigns to jobs removed with qdel
pub const KILLED_EXIT_STATUS: i32 = 265;

/// PBS Pro and OpenPBS
#[derive(Debug, Clone, Copy, Default)]
pub struct Pbs;

#[derive(Deserialize, Debug)]
struct Qstat {
    #[serde(rename = "Jobs", default)]
    jobs: BTreeMap<String, QstatJob>,
}

#[derive(Deserialize, Debug)]
struct QstatJob {
    job_state: String,
    #[serde(rename = "Exit_status")]
    exit_status: Option<i32>,
    comment: Option<String>,
}

fn state(job_state: &str) -> Option<JobState> {
    Some(match job_state {
        // E is still running its epilogue, final details are not in the report yet
        "B" | "E" | "R" => JobState::Active,
        "H" | "M" | "Q" | "S" | "T" | "U" | "W" => JobState::Queued,
        // F covers failures too, the exit status tells them apart
        "F" | "X" => JobState::Completed,
        _ => return None,
    })
}

impl BatchBackend for Pbs {
    fn name(&self) -> &'static str {
        "pbs"
    }

    fn template(&self) -> &'static str {
        include_str!("templates/pbs.hbs")
    }

    fn submit_command(&self, script: &Path) -> CommandLine {
        vec![OsString::from("qsub"), script.into()]
    }

    fn job_id_from_submit_output(&self, output: &str) -> Result<String, ExecutorError> {
        output
            .split_whitespace()
            .last()
            .map(str::to_string)
            .ok_or_else(|| ExecutorError::UnparsableOutput {
                command: "qsub".into(),
                reason: "no job id in empty output".into(),
            })
    }

    fn cancel_command(&self, native_id: &str) -> CommandLine {
        command_line(["qdel", native_id])
    }

    // -x includes finished jobs, the JSON report carries full length ids as returned by qsub
    fn status_command(&self, native_ids: &[String]) -> CommandLine {
        let mut command = command_line([QSTAT, "-f", "-F", "json", "-x"]);
        command.extend(native_ids.iter().map(OsString::from));
        command
    }

    fn parse_status_output(&self, output: &CommandOutput) -> Result<StatusReport, ExecutorError> {
        check_exit_code(QSTAT, output)?;

        let qstat: Qstat =
            serde_json::from_str(&output.stdout).map_err(|e| ExecutorError::UnparsableOutput {
                command: QSTAT.into(),
                reason: e.to_string(),
            })?;

        Ok(qstat
            .jobs
            .into_iter()
            .map(|(native_id, job)| {
                let status = match state(&job.job_state) {
                    Some(state) => {
                        let mut status = JobStatus::new(state);
                        if state == JobState::Completed {
                            status.exit_code = job.exit_status;
                        }
                        status.message = job.comment;
                        Ok(status)
                    }
                    None => Err(ExecutorError::UnmappedState {
                        backend: self.name(),
                        native_id: native_id.clone(),
                        state: job.job_state,
                    }),
                };

                (native_id, status)
            })
            .collect())
    }

    fn list_command(&self) -> CommandLine {
        command_line([QSTAT.to_string(), "-u".to_string(), current_user()])
    }

    fn parse_list_output(&self, output: &str) -> Vec<String> {
        output
            .lines()
            .skip(2)
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect()
    }

    fn kill_exit_codes(&self) -> &'static [i32] {
        &[KILLED_EXIT_STATUS]
    }
}
