//! In-memory service doubles
//!
//! Deterministic implementations of the service traits for tests and the
//! `memory` backend:
//!
//! - [`MemoryBatchService`]: tasks complete after a scripted number of
//!   observations; individual tasks can be held, rejected or given exit
//!   codes and output streams
//! - [`MemoryBlobStore`]: containers and blobs in maps, grant checks against
//!   an injectable clock
//! - [`MemoryDocumentStore`]: one collection in a vector
//!
//! Every double supports per-operation failure injection.

use std::sync::{Mutex, MutexGuard, PoisonError};

mod batch;
mod docdb;
mod failure;
mod storage;

pub use batch::{BatchOp, MemoryBatchService, TaskScript};
pub use docdb::MemoryDocumentStore;
pub use failure::{FailureConfig, FailureInjector};
pub use storage::{MemoryBlobStore, StorageOp};

/// Lock ignoring poisoning; a panicked test thread must not wedge the rest
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
