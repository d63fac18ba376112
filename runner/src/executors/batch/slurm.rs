use super::{check_exit_code, BatchBackend, StatusReport};
use crate::{
    command::{command_line, CommandLine, CommandOutput},
    executors::ExecutorError,
    status::{JobState, JobStatus},
};
use std::path::Path;

const SQUEUE: &str = "squeue";

#[derive(Debug, Clone, Copy, Default)]
pub struct Slurm;

/// compact squeue states
fn state(state: &str) -> Option<JobState> {
    Some(match state {
        "BF" => JobState::Failed,
        "CA" => JobState::Canceled,
        "CD" => JobState::Completed,
        "CF" => JobState::Queued,
        "CG" => JobState::Active,
        "DL" => JobState::Failed,
        "F" => JobState::Failed,
        "NF" => JobState::Failed,
        "OOM" => JobState::Failed,
        "PD" => JobState::Queued,
        "PR" => JobState::Failed,
        "R" => JobState::Active,
        "RD" => JobState::Queued,
        "RF" => JobState::Queued,
        "RH" => JobState::Queued,
        "RQ" => JobState::Active,
        "RS" => JobState::Active,
        "RV" => JobState::Queued,
        "SE" => JobState::Active,
        "SI" => JobState::Active,
        "SO" => JobState::Active,
        "ST" => JobState::Active,
        "S" => JobState::Active,
        "TO" => JobState::Failed,
        _ => return None,
    })
}

fn reason(reason: &str) -> Option<&'static str> {
    Some(match reason {
        "AssociationJobLimit" => "The job's association has reached its maximum job count.",
        "AssociationResourceLimit" => "The job's association has reached some resource limit.",
        "AssociationTimeLimit" => "The job's association has reached its time limit.",
        "BadConstraints" => "The job's constraints can not be satisfied.",
        "BeginTime" => "The job's earliest start time has not yet been reached.",
        "Cleaning" => "The job is being requeued and still cleaning up from its previous execution.",
        "Dependency" => "This job is waiting for a dependent job to complete.",
        "FrontEndDown" => "No front end node is available to execute this job.",
        "InactiveLimit" => "The job reached the system InactiveLimit.",
        "InvalidAccount" => "The job's account is invalid.",
        "InvalidQOS" => "The job's QOS is invalid.",
        "JobHeldAdmin" => "The job is held by a system administrator.",
        "JobHeldUser" => "The job is held by the user.",
        "JobLaunchFailure" => "The job could not be launched. This may be due to a file system problem, invalid program name, etc.",
        "Licenses" => "The job is waiting for a license.",
        "NodeDown" => "A node required by the job is down.",
        "NonZeroExitCode" => "The job terminated with a non-zero exit code.",
        "PartitionDown" => "The partition required by this job is in a DOWN state.",
        "PartitionInactive" => "The partition required by this job is in an Inactive state and not able to start jobs.",
        "PartitionNodeLimit" => "The number of nodes required by this job is outside of its partition's current limits. Can also indicate that required nodes are DOWN or DRAINED.",
        "PartitionTimeLimit" => "The job's time limit exceeds its partition's current time limit.",
        "Priority" => "One or more higher priority jobs exist for this partition or advanced reservation.",
        "Prolog" => "Its PrologSlurmctld program is still running.",
        "QOSJobLimit" => "The job's QOS has reached its maximum job count.",
        "QOSResourceLimit" => "The job's QOS has reached some resource limit.",
        "QOSTimeLimit" => "The job's QOS has reached its time limit.",
        "QOSUsageThreshold" => "Required QOS threshold has been breached.",
        "ReqNodeNotAvail" => "Some node specifically required by the job is not currently available.",
        "Reservation" => "The job is waiting its advanced reservation to become available.",
        "Resources" => "The job is waiting for resources to become available.",
        "SystemFailure" => "Failure of the Slurm system, a file system, the network, etc.",
        "TimeLimit" => "The job exhausted its time limit.",
        "WaitingForScheduling" => "No reason has been set for this job yet. Waiting for the scheduler to determine the appropriate reason.",
        _ => return None,
    })
}

impl BatchBackend for Slurm {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn template(&self) -> &'static str {
        include_str!("templates/slurm.hbs")
    }

    fn submit_command(&self, script: &Path) -> CommandLine {
        command_line([Path::new("sbatch").as_os_str(), script.as_os_str()])
    }

    fn job_id_from_submit_output(&self, output: &str) -> Result<String, ExecutorError> {
        // Submitted batch job 1234
        output
            .split_whitespace()
            .last()
            .map(str::to_string)
            .ok_or_else(|| ExecutorError::UnparsableOutput {
                command: "sbatch".into(),
                reason: "no job id in empty output".into(),
            })
    }

    fn cancel_command(&self, native_id: &str) -> CommandLine {
        command_line(["scancel", "-Q", native_id])
    }

    // squeue --me lists every job of the user, one query covers all tracked ids.
    // JobArrayID keeps array elements under the id sbatch returned.
    fn status_command(&self, _native_ids: &[String]) -> CommandLine {
        command_line([
            SQUEUE,
            "-O",
            "JobArrayID,StateCompact,Reason",
            "-t",
            "all",
            "--me",
        ])
    }

    fn parse_status_output(&self, output: &CommandOutput) -> Result<StatusReport, ExecutorError> {
        check_exit_code(SQUEUE, output)?;

        let mut report = StatusReport::new();

        for line in output.stdout.lines().skip(1) {
            let mut columns = line.split_whitespace();
            let (Some(native_id), Some(compact)) = (columns.next(), columns.next()) else {
                continue;
            };
            let reported = columns.collect::<Vec<_>>().join(" ");

            let status = match state(compact) {
                Some(JobState::Failed) => {
                    let message = reason(&reported).map_or(reported, str::to_string);
                    let status = JobStatus::new(JobState::Failed);
                    Ok(if message.is_empty() {
                        status
                    } else {
                        status.with_message(message)
                    })
                }
                Some(state) => Ok(JobStatus::new(state)),
                None => Err(ExecutorError::UnmappedState {
                    backend: self.name(),
                    native_id: native_id.to_string(),
                    state: compact.to_string(),
                }),
            };

            report.insert(native_id.to_string(), status);
        }

        Ok(report)
    }

    fn list_command(&self) -> CommandLine {
        command_line([SQUEUE, "--me", "-o", "%i", "-h", "-r", "-t", "all"])
    }

    fn parse_list_output(&self, output: &str) -> Vec<String> {
        output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }
}
