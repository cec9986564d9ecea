//! Task error types

use batchlane::service::docdb::DocumentError;
use batchlane::service::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("line {line}: {message}")]
    Csv { line: usize, message: String },

    #[error("input has no '{0}' column")]
    MissingColumn(String),

    #[error("line {line}: '{value}' in column '{column}' is not a number")]
    InvalidNumber {
        column: String,
        line: usize,
        value: String,
    },

    #[error("input has no data rows")]
    Empty,

    #[error("storage endpoint '{0}' is not reachable from this node")]
    UnreachableStorage(String),

    #[error("no --storage-endpoint given")]
    NoStorageEndpoint,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("document store error: {0}")]
    Document(#[from] DocumentError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl TaskError {
    pub fn exit_code(&self) -> u8 {
        match self {
            TaskError::Csv { .. }
            | TaskError::MissingColumn(_)
            | TaskError::InvalidNumber { .. }
            | TaskError::Empty => 2,
            TaskError::UnreachableStorage(_) | TaskError::NoStorageEndpoint => 3,
            TaskError::Storage(_) => 4,
            TaskError::Document(_) => 5,
            TaskError::Io(_) | TaskError::Json(_) | TaskError::Zip(_) => 1,
        }
    }
}

pub type TaskResult<T> = Result<T, TaskError>;
