//! Per-task output streams
//!
//! Every task leaves `stdout.txt` and `stderr.txt` in its directory. Each
//! stream is fetched and decoded on its own; a failure is kept against that
//! stream and never stops the other stream or sibling tasks.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::string::FromUtf8Error;

use serde::Serialize;

use crate::local::write_atomic;
use crate::service::batch::{BatchService, ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub const ALL: [Stream; 2] = [Stream::Stdout, Stream::Stderr];

    /// Name of the file the node writes the stream to
    pub fn file_name(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout.txt",
            Stream::Stderr => "stderr.txt",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("could not fetch {stream} for task {task_id}: {source}")]
    Fetch {
        task_id: String,
        stream: Stream,
        #[source]
        source: ServiceError,
    },

    #[error("{stream} of task {task_id} is not valid UTF-8: {source}")]
    Decode {
        task_id: String,
        stream: Stream,
        #[source]
        source: FromUtf8Error,
    },
}

impl OutputError {
    pub fn task_id(&self) -> &str {
        match self {
            OutputError::Fetch { task_id, .. } | OutputError::Decode { task_id, .. } => task_id,
        }
    }
}

/// Output of one task, each stream decoded on its own
#[derive(Debug)]
pub struct OutputStreams {
    pub stdout: Result<String, OutputError>,
    pub stderr: Result<String, OutputError>,
}

impl OutputStreams {
    pub fn get(&self, stream: Stream) -> Result<&str, &OutputError> {
        let result = match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        };
        result.as_deref()
    }

    pub fn errors(&self) -> impl Iterator<Item = &OutputError> {
        Stream::ALL.into_iter().filter_map(move |s| self.get(s).err())
    }

    pub fn is_complete(&self) -> bool {
        self.stdout.is_ok() && self.stderr.is_ok()
    }
}

/// Outputs keyed by task id
pub type TaskOutputs = BTreeMap<String, OutputStreams>;

/// Fetch and decode one stream of a task
pub fn fetch_stream(
    batch: &dyn BatchService,
    job_id: &str,
    task_id: &str,
    stream: Stream,
) -> Result<String, OutputError> {
    let bytes = batch
        .get_task_file(job_id, task_id, stream.file_name())
        .map_err(|source| OutputError::Fetch {
            task_id: task_id.to_string(),
            stream,
            source,
        })?;
    String::from_utf8(bytes).map_err(|source| OutputError::Decode {
        task_id: task_id.to_string(),
        stream,
        source,
    })
}

/// Fetch both streams of one task; a bad stream never hides the other
pub fn fetch_streams(batch: &dyn BatchService, job_id: &str, task_id: &str) -> OutputStreams {
    OutputStreams {
        stdout: fetch_stream(batch, job_id, task_id, Stream::Stdout),
        stderr: fetch_stream(batch, job_id, task_id, Stream::Stderr),
    }
}

/// `<job>-<task>-<stamp>-<stream file>`
pub fn output_file_name(job_id: &str, task_id: &str, stamp: i64, stream: Stream) -> String {
    format!("{}-{}-{}-{}", job_id, task_id, stamp, stream.file_name())
}

/// Write every successfully collected stream under `dir`
///
/// Streams that failed are skipped. Returns the files written.
pub fn persist_outputs(
    outputs: &TaskOutputs,
    job_id: &str,
    stamp: i64,
    dir: &Path,
) -> std::io::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let mut written = Vec::new();
    for (task_id, streams) in outputs {
        for stream in Stream::ALL {
            let Ok(text) = streams.get(stream) else {
                continue;
            };
            let path = dir.join(output_file_name(job_id, task_id, stamp, stream));
            write_atomic(&path, text.as_bytes())?;
            tracing::debug!(path = %path.display(), "stream file written");
            written.push(path);
        }
    }
    Ok(written)
}
