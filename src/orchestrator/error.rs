//! Orchestrator failure taxonomy and exit codes

use std::collections::BTreeSet;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::CommandError;
use crate::config::ConfigError;
use crate::service::batch::ServiceError;
use crate::service::docdb::DocumentError;
use crate::service::storage::StorageError;
use crate::stager::StageError;

use super::phase::{JobPhase, PhaseError};

/// A task the service refused during a collection add
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedTask {
    pub task_id: String,
    pub message: String,
}

/// Stable process exit codes
pub mod exit {
    pub const SUCCESS: i32 = 0;
    pub const CONFIG: i32 = 1;
    pub const COMMAND: i32 = 2;
    pub const STAGING: i32 = 3;
    pub const PROVISIONING: i32 = 20;
    pub const DUPLICATE_JOB: i32 = 21;
    pub const PARTIAL_SUBMISSION: i32 = 22;
    pub const TIMEOUT: i32 = 30;
    /// Every task finished but at least one exited non-zero
    pub const TASKS_FAILED: i32 = 31;
    pub const SERVICE: i32 = 40;
    pub const STORAGE: i32 = 41;
    pub const AUTHORIZATION_EXPIRED: i32 = 42;
    pub const DOCUMENT: i32 = 43;
    pub const TEARDOWN: i32 = 50;
    pub const STATE: i32 = 60;
    pub const CANCELLED: i32 = crate::signal::EXIT_CODE_CANCELLED;
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("command error: {0}")]
    Command(#[from] CommandError),

    #[error("staging error: {0}")]
    Stage(#[source] StageError),

    #[error("cannot provision pool {pool_id}: {reason}")]
    Provisioning { pool_id: String, reason: String },

    #[error("job already exists: {0}")]
    DuplicateJob(String),

    #[error(
        "{} of {} task(s) rejected by job {job_id}: {}",
        .rejected.len(),
        .submitted,
        join_rejected(.rejected)
    )]
    PartialSubmission {
        job_id: String,
        submitted: usize,
        rejected: Vec<RejectedTask>,
    },

    #[error(
        "job {job_id} did not finish within {}s; incomplete: {}",
        .timeout.as_secs(),
        join_ids(.incomplete)
    )]
    Timeout {
        job_id: String,
        timeout: Duration,
        incomplete: BTreeSet<String>,
    },

    #[error("job {job_id} cancelled; incomplete: {}", join_ids(.incomplete))]
    Cancelled {
        job_id: String,
        incomplete: BTreeSet<String>,
    },

    #[error("{}", describe_teardown(.job_id, .pool_id, .job_error, .pool_error))]
    Teardown {
        job_id: String,
        pool_id: String,
        job_error: Option<ServiceError>,
        pool_error: Option<ServiceError>,
    },

    #[error("access grant expired: {0}")]
    AuthorizationExpired(#[source] StorageError),

    #[error("storage error: {0}")]
    Storage(#[source] StorageError),

    #[error("batch service error: {0}")]
    Service(#[from] ServiceError),

    #[error("document store error: {0}")]
    Document(#[from] DocumentError),

    #[error("cannot {operation} job {job_id} in phase {phase:?}")]
    WrongPhase {
        job_id: String,
        phase: JobPhase,
        operation: &'static str,
    },

    #[error("state error: {0}")]
    Phase(#[from] PhaseError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StorageError> for OrchestratorError {
    fn from(e: StorageError) -> Self {
        if e.is_authorization_expired() {
            OrchestratorError::AuthorizationExpired(e)
        } else {
            OrchestratorError::Storage(e)
        }
    }
}

impl From<StageError> for OrchestratorError {
    fn from(e: StageError) -> Self {
        match e {
            StageError::Storage(e) => e.into(),
            other => OrchestratorError::Stage(other),
        }
    }
}

impl OrchestratorError {
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::Config(_) => exit::CONFIG,
            OrchestratorError::Command(_) => exit::COMMAND,
            OrchestratorError::Stage(_) => exit::STAGING,
            OrchestratorError::Provisioning { .. } => exit::PROVISIONING,
            OrchestratorError::DuplicateJob(_) => exit::DUPLICATE_JOB,
            OrchestratorError::PartialSubmission { .. } => exit::PARTIAL_SUBMISSION,
            OrchestratorError::Timeout { .. } => exit::TIMEOUT,
            OrchestratorError::Cancelled { .. } => exit::CANCELLED,
            OrchestratorError::Teardown { .. } => exit::TEARDOWN,
            OrchestratorError::AuthorizationExpired(_) => exit::AUTHORIZATION_EXPIRED,
            OrchestratorError::Storage(_) => exit::STORAGE,
            OrchestratorError::Service(_) => exit::SERVICE,
            OrchestratorError::Document(_) => exit::DOCUMENT,
            OrchestratorError::WrongPhase { .. } | OrchestratorError::Phase(_) => exit::STATE,
            OrchestratorError::Io(_) | OrchestratorError::Serialization(_) => exit::CONFIG,
        }
    }

    /// Task ids still outstanding when polling stopped
    pub fn incomplete_tasks(&self) -> Option<&BTreeSet<String>> {
        match self {
            OrchestratorError::Timeout { incomplete, .. }
            | OrchestratorError::Cancelled { incomplete, .. } => Some(incomplete),
            _ => None,
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

fn join_ids(ids: &BTreeSet<String>) -> String {
    if ids.is_empty() {
        return "none".to_string();
    }
    ids.iter().cloned().collect::<Vec<_>>().join(", ")
}

fn join_rejected(rejected: &[RejectedTask]) -> String {
    rejected
        .iter()
        .map(|r| format!("{} ({})", r.task_id, r.message))
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_teardown(
    job_id: &str,
    pool_id: &str,
    job_error: &Option<ServiceError>,
    pool_error: &Option<ServiceError>,
) -> String {
    let mut parts = Vec::new();
    if let Some(e) = job_error {
        parts.push(format!("delete job {}: {}", job_id, e));
    }
    if let Some(e) = pool_error {
        parts.push(format!("delete pool {}: {}", pool_id, e));
    }
    format!("teardown failed: {}", parts.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grant::GrantError;
    use chrono::{DateTime, Utc};

    #[test]
    fn test_timeout_message_lists_incomplete_ids() {
        let err = OrchestratorError::Timeout {
            job_id: "states-1".to_string(),
            timeout: Duration::from_secs(120),
            incomplete: ["task3".to_string(), "task1".to_string()].into(),
        };
        assert_eq!(
            err.to_string(),
            "job states-1 did not finish within 120s; incomplete: task1, task3"
        );
        assert_eq!(err.exit_code(), exit::TIMEOUT);
        assert_eq!(err.incomplete_tasks().map(|s| s.len()), Some(2));
    }

    #[test]
    fn test_expired_grant_maps_to_its_own_variant() {
        let expired_at: DateTime<Utc> = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let err: OrchestratorError =
            StorageError::Authorization(GrantError::Expired { expired_at }).into();
        assert!(matches!(err, OrchestratorError::AuthorizationExpired(_)));
        assert_eq!(err.exit_code(), exit::AUTHORIZATION_EXPIRED);

        let err: OrchestratorError = StorageError::ContainerNotFound("c".to_string()).into();
        assert_eq!(err.exit_code(), exit::STORAGE);
    }

    #[test]
    fn test_stage_storage_errors_unwrap() {
        let err: OrchestratorError =
            StageError::Storage(StorageError::InvalidName("A".to_string())).into();
        assert!(matches!(err, OrchestratorError::Storage(_)));
    }

    #[test]
    fn test_teardown_reports_both_errors() {
        let err = OrchestratorError::Teardown {
            job_id: "j".to_string(),
            pool_id: "p".to_string(),
            job_error: Some(ServiceError::JobNotFound("j".to_string())),
            pool_error: Some(ServiceError::Unavailable("down".to_string())),
        };
        let message = err.to_string();
        assert!(message.contains("delete job j: job not found: j"));
        assert!(message.contains("delete pool p: service unavailable: down"));
    }

    #[test]
    fn test_partial_submission_message() {
        let err = OrchestratorError::PartialSubmission {
            job_id: "j".to_string(),
            submitted: 3,
            rejected: vec![RejectedTask {
                task_id: "task2".to_string(),
                message: "bad".to_string(),
            }],
        };
        assert_eq!(err.to_string(), "1 of 3 task(s) rejected by job j: task2 (bad)");
        assert_eq!(err.exit_code(), exit::PARTIAL_SUBMISSION);
    }
}
