use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, collections::BTreeMap, fmt::Display, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown job state '{0}'")]
pub struct UnknownState(pub String);

/// Lifecycle position of a job.
///
/// States are only partially ordered: `NEW < QUEUED < ACTIVE < {COMPLETED, FAILED, CANCELED}`
/// while the three final states are not comparable with each other. A job only ever moves
/// to a state that compares strictly greater than its current one.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    New,
    Queued,
    Active,
    Completed,
    Failed,
    Canceled,
}

impl JobState {
    pub const FINAL: [JobState; 3] = [JobState::Completed, JobState::Failed, JobState::Canceled];

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::New => 0,
            Self::Queued => 1,
            Self::Active => 2,
            Self::Completed | Self::Failed | Self::Canceled => 3,
        }
    }

    /// true if a job currently in `self` may move to `next`
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(self.partial_cmp(&next), Some(Ordering::Less))
    }
}

impl PartialOrd for JobState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self == other {
            return Some(Ordering::Equal);
        }

        match self.rank().cmp(&other.rank()) {
            // two distinct final states
            Ordering::Equal => None,
            ordering => Some(ordering),
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::Queued => "QUEUED",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        };

        f.write_str(name)
    }
}

impl FromStr for JobState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NEW" => Ok(Self::New),
            "QUEUED" => Ok(Self::Queued),
            "ACTIVE" => Ok(Self::Active),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELED" | "CANCELLED" => Ok(Self::Canceled),
            _ => Err(UnknownState(s.to_string())),
        }
    }
}

/// Immutable snapshot of a job's state at a point in time
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct JobStatus {
    pub state: JobState,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl JobStatus {
    pub fn new(state: JobState) -> Self {
        Self {
            state,
            time: Utc::now(),
            message: None,
            exit_code: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_final(&self) -> bool {
        self.state.is_final()
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::new(JobState::New)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.state)?;

        if let Some(code) = self.exit_code {
            write!(f, " (exit code {code})")?;
        }
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }

        Ok(())
    }
}
