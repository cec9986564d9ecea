//! Local emulator backend
//!
//! Runs the whole submit, poll, collect and teardown cycle on one machine:
//! blobs and documents live on the filesystem, tasks run as child processes.
//! The layout under the emulator root is
//!
//! ```text
//! <root>/storage/   LocalBlobStore
//! <root>/batch/     LocalBatchService
//! ```
//!
//! Document collections are directories named by a `file://` URI.

mod batch;
mod docdb;
mod storage;

use std::path::{Path, PathBuf};

pub use batch::{LocalBatchService, LOCAL_NODE_AGENT};
pub use docdb::LocalDocumentStore;
pub use storage::{LocalBlobStore, FILE_SCHEME};
pub(crate) use storage::write_atomic;

pub fn storage_root(root: &Path) -> PathBuf {
    root.join("storage")
}

pub fn batch_root(root: &Path) -> PathBuf {
    root.join("batch")
}
