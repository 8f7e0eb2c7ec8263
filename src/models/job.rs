use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{AsRefStr, Display, EnumString};

/// Identifier assigned by the job store. Unique and strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl JobId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Opaque identity of the submitting caller. Never interpreted by the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerId(String);

impl CallerId {
    pub const ANONYMOUS: &'static str = "anonymous";

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn anonymous() -> Self {
        Self(Self::ANONYMOUS.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a detection job.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Completed,
    Failed,
    /// The submitter stopped waiting before a worker finished.
    Abandoned,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Input for creating a job record.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub caller: CallerId,
    /// Stored and forwarded, not used for scheduling.
    pub priority: i16,
    pub request_size: i64,
}

impl NewJob {
    pub fn new(caller: CallerId, request_size: usize) -> Self {
        Self {
            caller,
            priority: 0,
            request_size: request_size as i64,
        }
    }
}

/// Durable record of a submitted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub caller: CallerId,
    pub status: JobStatus,
    pub priority: i16,
    pub request_size: i64,
    pub model_name: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_string_form() {
        assert_eq!(JobStatus::Queued.as_ref(), "queued");
        assert_eq!(JobStatus::Abandoned.to_string(), "abandoned");
        assert_eq!(JobStatus::from_str("completed").unwrap(), JobStatus::Completed);
        assert!(JobStatus::from_str("processing").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Abandoned.is_terminal());
    }

    #[test]
    fn test_job_id_serializes_as_integer() {
        let json = serde_json::to_string(&JobId(42)).unwrap();
        assert_eq!(json, "42");
    }
}
