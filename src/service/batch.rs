//! Compute-batch service contract
//!
//! Request/response model for pools, jobs and tasks, plus the
//! [`BatchService`] trait the orchestrator drives.

use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::Platform;

/// A marketplace image a pool node can boot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    pub publisher: String,
    pub offer: String,
    pub sku: String,
    pub version: String,
}

/// A node agent build together with the images verified against it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAgentSku {
    pub id: String,
    pub os_type: Platform,
    pub verified_image_references: Vec<ImageReference>,
}

/// Remote file a task (or start task) downloads before running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFile {
    /// Path relative to the task working directory
    pub file_path: String,
    /// Blob URL including the access token
    pub blob_source: String,
    /// When the embedded grant stops working
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Bootstrap command run once on each node before any task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTask {
    pub command_line: String,
    pub resource_files: Vec<ResourceFile>,
    /// Node is not schedulable until the start task succeeds
    pub wait_for_success: bool,
    /// Run as a pool-scoped admin user
    pub run_elevated: bool,
}

/// Pool creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSpec {
    pub id: String,
    pub vm_size: String,
    pub target_dedicated_nodes: u32,
    pub image: ImageReference,
    pub node_agent_sku_id: String,
    pub start_task: Option<StartTask>,
}

/// Job creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: String,
    pub pool_id: String,
}

/// Task creation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub command_line: String,
    pub resource_files: Vec<ResourceFile>,
}

/// Remote task state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Active,
    Preparing,
    Running,
    Completed,
}

impl TaskState {
    /// Completed is terminal whatever the exit code was
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed)
    }
}

/// How a completed task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResult {
    Success,
    Failure,
}

/// Point-in-time view of one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: String,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Per-task outcome of a collection add
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAddStatus {
    Success,
    ClientError,
    ServerError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAddResult {
    pub task_id: String,
    pub status: TaskAddStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskAddResult {
    pub fn accepted(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskAddStatus::Success,
            error: None,
        }
    }

    pub fn rejected(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskAddStatus::ClientError,
            error: Some(message.into()),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == TaskAddStatus::Success
    }
}

/// Batch service errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("pool already exists: {0}")]
    PoolExists(String),

    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("job already exists: {0}")]
    JobExists(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("task already exists: {job_id}/{task_id}")]
    TaskExists { job_id: String, task_id: String },

    #[error("task not found: {job_id}/{task_id}")]
    TaskNotFound { job_id: String, task_id: String },

    #[error("file {file_name} not found for task {job_id}/{task_id}")]
    FileNotFound {
        job_id: String,
        task_id: String,
        file_name: String,
    },

    #[error("start task failed on pool {pool_id}: {message}")]
    StartTaskFailed { pool_id: String, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Compute-batch service
///
/// All calls block until the service answers.
pub trait BatchService: Send + Sync {
    fn list_node_agent_skus(&self) -> ServiceResult<Vec<NodeAgentSku>>;

    fn add_pool(&self, pool: &PoolSpec) -> ServiceResult<()>;

    fn delete_pool(&self, pool_id: &str) -> ServiceResult<()>;

    fn add_job(&self, job: &JobSpec) -> ServiceResult<()>;

    fn delete_job(&self, job_id: &str) -> ServiceResult<()>;

    fn add_task(&self, job_id: &str, task: &TaskSpec) -> ServiceResult<()>;

    /// Add many tasks in one call; per-task acceptance is reported back
    fn add_task_collection(
        &self,
        job_id: &str,
        tasks: &[TaskSpec],
    ) -> ServiceResult<Vec<TaskAddResult>>;

    fn list_tasks(&self, job_id: &str) -> ServiceResult<Vec<TaskStatus>>;

    fn get_task(&self, job_id: &str, task_id: &str) -> ServiceResult<TaskStatus>;

    /// Raw bytes of a file in the task directory (`stdout.txt`, `stderr.txt`)
    fn get_task_file(&self, job_id: &str, task_id: &str, file_name: &str)
        -> ServiceResult<Vec<u8>>;
}
