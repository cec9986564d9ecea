//! Typed view of the merged configuration

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::{CommandTemplate, Platform, TaskParams};
use crate::service::storage::validate_name;
use crate::timeout::TimeoutConfig;

use super::effective::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub job: JobSettings,
    pub pool: PoolSettings,
    pub task: TaskSettings,
    pub containers: ContainerSettings,
    pub grants: GrantSettings,
    pub output: OutputSettings,
    pub backend: BackendSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    pub timeout_minutes: u64,
    pub poll_interval_seconds: u64,
    pub task_id_base: usize,
}

impl JobSettings {
    pub fn timeout_config(&self) -> TimeoutConfig {
        TimeoutConfig {
            timeout_minutes: self.timeout_minutes,
            poll_interval_seconds: self.poll_interval_seconds,
        }
    }
}

/// Which marketplace image a pool boots
///
/// `sku` is a prefix: "16" matches "16.04-LTS".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSelector {
    pub publisher: String,
    pub offer: String,
    pub sku: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    pub node_count: u32,
    pub vm_size: String,
    pub platform: Platform,
    pub image: ImageSelector,
    pub start_task: Vec<CommandTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSettings {
    pub template: CommandTemplate,
    pub file: String,
    pub command: String,
    /// Extra template parameters shared by every task
    #[serde(default)]
    pub extras: BTreeMap<String, Value>,
}

impl TaskSettings {
    /// `extras` as template parameters; non-string values use their JSON text
    pub fn extra_params(&self) -> TaskParams {
        let mut params = TaskParams::new();
        for (name, value) in &self.extras {
            match value {
                Value::String(s) => params.insert(name.clone(), s),
                other => params.insert(name.clone(), other),
            }
        }
        params
    }
}

/// One container per role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSettings {
    pub tasks: String,
    pub inputs: String,
    pub outputs: String,
    pub logs: String,
}

impl ContainerSettings {
    /// Distinct names, in role order
    pub fn all(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for name in [&self.tasks, &self.inputs, &self.outputs, &self.logs] {
            if !names.contains(&name.as_str()) {
                names.push(name);
            }
        }
        names
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GrantSettings {
    pub ttl_minutes: u64,
    pub margin_minutes: u64,
}

impl GrantSettings {
    /// Lifetime for grants used by a job with `job_timeout`
    ///
    /// Grants must outlive polling: max(ttl, timeout + margin).
    pub fn lifetime_for(&self, job_timeout: Duration) -> Duration {
        let ttl = Duration::from_secs(self.ttl_minutes * 60);
        let floor = job_timeout + Duration::from_secs(self.margin_minutes * 60);
        ttl.max(floor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Filesystem storage and child-process tasks
    Local,
    /// In-process doubles; nothing survives the process
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub root: PathBuf,
}

impl Settings {
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value.clone())
            .map_err(|e| ConfigError::ValidationError(format!("invalid configuration: {}", e)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.job
            .timeout_config()
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        if self.job.task_id_base > 1 {
            return Err(ConfigError::ValidationError(format!(
                "job.task_id_base must be 0 or 1, got {}",
                self.job.task_id_base
            )));
        }

        if self.pool.node_count == 0 {
            return Err(ConfigError::ValidationError(
                "pool.node_count must be at least 1".to_string(),
            ));
        }

        if self.grants.ttl_minutes == 0 {
            return Err(ConfigError::ValidationError(
                "grants.ttl_minutes must be positive".to_string(),
            ));
        }

        for name in self.containers.all() {
            validate_name(name).map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        }
        validate_name(&self.task.file).map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        Ok(())
    }
}
