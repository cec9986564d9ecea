//! External service contracts
//!
//! The compute-batch service, blob storage and the document database are
//! consumed only through these traits. `crate::mock` and `crate::local`
//! provide implementations.

pub mod batch;
pub mod docdb;
pub mod storage;

pub use batch::{
    BatchService, ImageReference, JobSpec, NodeAgentSku, PoolSpec, ResourceFile, ServiceError,
    ServiceResult, StartTask, TaskAddResult, TaskAddStatus, TaskResult, TaskSpec, TaskState,
    TaskStatus,
};
pub use docdb::{Document, DocumentError, DocumentResult, DocumentStore, Query};
pub use storage::{BlobItem, BlobStore, BlobUrl, StorageError, StorageResult};
