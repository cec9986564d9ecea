//! batchlane task programs
//!
//! The programs a batchlane job runs on its pool nodes. Each reads one
//! staged input from the task working directory and writes its results
//! through the write grants it was given on the command line.

pub mod args;
pub mod csv;
pub mod error;
pub mod etl;
pub mod node;
pub mod state_center;
pub mod unpack;

pub use args::{parse_flag, CommonArgs};
pub use error::{TaskError, TaskResult};
pub use node::{BlobSink, LogData, Sinks, TaskEnv};
