//! Run log (run-<job>.json)
//!
//! A nested JSON record of one CLI run: the redacted effective config, the
//! service environment, timestamped events and the final state of every
//! task. It is written whether the run succeeds or fails.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{is_secret_key, EffectiveConfig, EnvEntry};
use crate::local::write_atomic;
use crate::orchestrator::{exit, OrchestratorError, TaskOutputs};
use crate::service::batch::{TaskState, TaskStatus};

pub const RUN_LOG_SCHEMA_VERSION: u32 = 1;

pub const RUN_LOG_SCHEMA_ID: &str = "batchlane/run_log@1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub at: DateTime<Utc>,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

/// Final view of one task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<TaskState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLog {
    pub schema_version: u32,
    pub schema_id: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<String>,
    /// Effective configuration, secrets already redacted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    /// Service environment, secrets masked
    pub environment: BTreeMap<String, Option<String>>,
    pub events: Vec<RunEvent>,
    pub tasks: BTreeMap<String, TaskRecord>,
}

impl RunLog {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: RUN_LOG_SCHEMA_VERSION,
            schema_id: RUN_LOG_SCHEMA_ID.to_string(),
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at,
            finished_at: None,
            status: RunStatus::Running,
            exit_code: None,
            error: None,
            job_id: None,
            pool_id: None,
            config: None,
            environment: BTreeMap::new(),
            events: Vec::new(),
            tasks: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, config: &EffectiveConfig) -> Self {
        self.config = serde_json::to_value(config).ok();
        self
    }

    pub fn with_environment(mut self, entries: &[EnvEntry]) -> Self {
        for entry in entries {
            let value = match &entry.value {
                Some(_) if is_secret_key(&entry.name) => Some("<redacted>".to_string()),
                other => other.clone(),
            };
            self.environment.insert(entry.name.clone(), value);
        }
        self
    }

    pub fn record(&mut self, at: DateTime<Utc>, kind: &str, detail: Value) {
        tracing::debug!(kind, "run event");
        self.events.push(RunEvent {
            at,
            kind: kind.to_string(),
            detail,
        });
    }

    pub fn set_job(&mut self, job_id: &str, pool_id: &str) {
        self.job_id = Some(job_id.to_string());
        self.pool_id = Some(pool_id.to_string());
    }

    pub fn record_statuses(&mut self, statuses: &[TaskStatus]) {
        for status in statuses {
            let record = self.tasks.entry(status.id.clone()).or_default();
            record.state = Some(status.state);
            record.exit_code = status.exit_code;
        }
    }

    pub fn record_outputs(&mut self, outputs: &TaskOutputs) {
        for (task_id, streams) in outputs {
            let record = self.tasks.entry(task_id.clone()).or_default();
            record.stdout_bytes = streams.stdout.as_ref().ok().map(String::len);
            record.stderr_bytes = streams.stderr.as_ref().ok().map(String::len);
            let errors: Vec<String> = streams.errors().map(|e| e.to_string()).collect();
            if !errors.is_empty() {
                record.output_error = Some(errors.join("; "));
            }
        }
    }

    /// Close the log with the run's outcome
    pub fn finish(&mut self, at: DateTime<Utc>, result: Result<(), &OrchestratorError>) {
        self.finished_at = Some(at);
        match result {
            Ok(()) => {
                self.status = RunStatus::Succeeded;
                self.exit_code = Some(exit::SUCCESS);
            }
            Err(e) => {
                self.status = match e {
                    OrchestratorError::Timeout { .. } => RunStatus::TimedOut,
                    OrchestratorError::Cancelled { .. } => RunStatus::Cancelled,
                    _ => RunStatus::Failed,
                };
                self.exit_code = Some(e.exit_code());
                self.error = Some(e.to_string());
            }
        }
    }

    /// `run-<job>.json`, or the run id before a job exists
    pub fn file_name(&self) -> String {
        format!("run-{}.json", self.job_id.as_deref().unwrap_or(&self.run_id))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Write atomically into `dir`, returning the file path
    pub fn write_to_dir(&self, dir: &Path) -> io::Result<PathBuf> {
        let json = self
            .to_json()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("JSON error: {}", e)))?;
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        write_atomic(&path, json.as_bytes())?;
        Ok(path)
    }
}
