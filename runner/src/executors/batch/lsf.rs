use super::{check_exit_code, BatchBackend, StatusReport};
use crate::{
    command::{command_line, CommandLine, CommandOutput},
    executors::ExecutorError,
    status::{JobState, JobStatus},
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::{ffi::OsString, path::Path};
use tracing_unwrap::ResultExt;

const BJOBS: &str = "bjobs";

static BSUB_JOB_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Job <([0-9]+)>").unwrap_or_log());
static BKILL_FINISHED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(no matching job)|(already finished)").unwrap_or_log());

#[derive(Debug, Clone, Copy, Default)]
pub struct Lsf;

#[derive(Deserialize, Debug)]
struct Bjobs {
    #[serde(rename = "RECORDS", default)]
    records: Vec<Record>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct Record {
    #[serde(default)]
    jobid: String,
    #[serde(default)]
    stat: String,
    #[serde(default)]
    exit_reason: String,
    #[serde(default)]
    kill_reason: String,
    #[serde(default)]
    suspend_reason: String,
    // set instead of the fields above for ids bjobs does not know
    error: Option<String>,
}

fn state(stat: &str) -> Option<JobState> {
    Some(match stat {
        "PEND" | "PROV" | "PSUSP" | "WAIT" => JobState::Queued,
        "RUN" | "USUSP" | "SSUSP" | "UNKWN" | "ZOMBI" => JobState::Active,
        "DONE" => JobState::Completed,
        "EXIT" => JobState::Failed,
        _ => return None,
    })
}

impl BatchBackend for Lsf {
    fn name(&self) -> &'static str {
        "lsf"
    }

    fn template(&self) -> &'static str {
        include_str!("templates/lsf.hbs")
    }

    fn submit_command(&self, script: &Path) -> CommandLine {
        vec![OsString::from("bsub"), script.into()]
    }

    fn job_id_from_submit_output(&self, output: &str) -> Result<String, ExecutorError> {
        BSUB_JOB_ID
            .captures(output)
            .and_then(|captures| captures.get(1))
            .map(|id| id.as_str().to_string())
            .ok_or_else(|| ExecutorError::UnparsableOutput {
                command: "bsub".into(),
                reason: format!("no job id in '{}'", output.trim()),
            })
    }

    fn cancel_command(&self, native_id: &str) -> CommandLine {
        command_line(["bkill", native_id])
    }

    fn process_cancel_failure(
        &self,
        native_id: &str,
        output: &CommandOutput,
    ) -> Result<(), ExecutorError> {
        let output = output.combined();

        if BKILL_FINISHED.is_match(&output) {
            Ok(())
        } else {
            Err(ExecutorError::Cancel {
                native_id: native_id.to_string(),
                reason: output.trim().to_string(),
            })
        }
    }

    fn status_command(&self, native_ids: &[String]) -> CommandLine {
        let mut command = command_line([
            BJOBS,
            "-o",
            "JOBID STAT EXIT_REASON KILL_REASON SUSPEND_REASON",
            "-json",
            "-a",
        ]);
        command.extend(native_ids.iter().map(OsString::from));
        command
    }

    fn parse_status_output(&self, output: &CommandOutput) -> Result<StatusReport, ExecutorError> {
        check_exit_code(BJOBS, output)?;

        let bjobs: Bjobs =
            serde_json::from_str(&output.stdout).map_err(|e| ExecutorError::UnparsableOutput {
                command: BJOBS.into(),
                reason: e.to_string(),
            })?;

        let mut report = StatusReport::new();

        for record in bjobs.records {
            if record.error.is_some() || record.jobid.is_empty() {
                continue;
            }

            let status = match state(&record.stat) {
                // killed jobs exit too, bkill leaves a reason behind
                Some(JobState::Failed) if !record.kill_reason.is_empty() => {
                    Ok(JobStatus::new(JobState::Canceled).with_message(record.kill_reason.clone()))
                }
                Some(state) => {
                    let status = JobStatus::new(state);
                    Ok(
                        match [&record.exit_reason, &record.kill_reason, &record.suspend_reason]
                            .into_iter()
                            .find(|reason| !reason.is_empty())
                        {
                            Some(reason) => status.with_message(reason.clone()),
                            None => status,
                        },
                    )
                }
                None => Err(ExecutorError::UnmappedState {
                    backend: self.name(),
                    native_id: record.jobid.clone(),
                    state: record.stat.clone(),
                }),
            };

            report.insert(record.jobid, status);
        }

        Ok(report)
    }

    fn list_command(&self) -> CommandLine {
        command_line([BJOBS, "-o", "JOBID", "-noheader"])
    }

    fn parse_list_output(&self, output: &str) -> Vec<String> {
        output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && line.chars().all(|c| c.is_ascii_digit()))
            .map(str::to_string)
            .collect()
    }
}
