//! What a task knows about the node it runs on
//!
//! Job and task ids come from the environment the batch service sets up;
//! blob writes go through the write grants passed on the command line.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use batchlane::clock::Clock;
use batchlane::config::is_secret_key;
use batchlane::local::{LocalBlobStore, FILE_SCHEME};
use batchlane::service::BlobStore;

use crate::args::CommonArgs;
use crate::error::{TaskError, TaskResult};

pub const JOB_ID_VAR: &str = "AZ_BATCH_JOB_ID";
pub const TASK_ID_VAR: &str = "AZ_BATCH_TASK_ID";

/// Identity of the running task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEnv {
    pub job_id: String,
    pub task_id: String,
    pub started_at: DateTime<Utc>,
}

impl TaskEnv {
    pub fn from_env(clock: &dyn Clock) -> Self {
        Self::from_lookup(|name| std::env::var(name).ok(), clock.now())
    }

    /// Missing ids read as `None`, the way the node scripts always logged them
    pub fn from_lookup<F>(lookup: F, started_at: DateTime<Utc>) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            job_id: lookup(JOB_ID_VAR).unwrap_or_else(|| "None".to_string()),
            task_id: lookup(TASK_ID_VAR).unwrap_or_else(|| "None".to_string()),
            started_at,
        }
    }

    pub fn start_epoch(&self) -> i64 {
        self.started_at.timestamp()
    }

    /// `<job>-<task>-<start>-<name>-<now>.log`
    pub fn log_blob_name(&self, name: &str, now: DateTime<Utc>) -> String {
        format!(
            "{}-{}-{}-{}-{}.log",
            self.job_id,
            self.task_id,
            self.start_epoch(),
            name,
            now.timestamp()
        )
    }

    /// `<job>-<task>-<suffix>`
    pub fn scoped_name(&self, suffix: &str) -> String {
        format!("{}-{}-{}", self.job_id, self.task_id, suffix)
    }
}

/// Open the storage account named by `--storage-endpoint`
pub fn open_store(args: &CommonArgs, clock: Arc<dyn Clock>) -> TaskResult<Arc<dyn BlobStore>> {
    let endpoint = args
        .storage_endpoint
        .as_deref()
        .ok_or(TaskError::NoStorageEndpoint)?;
    if !endpoint.starts_with(FILE_SCHEME) {
        return Err(TaskError::UnreachableStorage(endpoint.to_string()));
    }
    Ok(Arc::new(LocalBlobStore::from_endpoint(endpoint, clock)?))
}

/// One container plus the write grant for it
#[derive(Clone)]
pub struct BlobSink {
    store: Arc<dyn BlobStore>,
    container: String,
    token: String,
}

impl BlobSink {
    pub fn new(store: Arc<dyn BlobStore>, container: &str, token: &str) -> Self {
        Self {
            store,
            container: container.to_string(),
            token: token.to_string(),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn put(&self, blob: &str, content: &[u8]) -> TaskResult<()> {
        self.store
            .put_with_grant(&self.container, blob, &self.token, content)?;
        tracing::debug!(container = %self.container, blob, bytes = content.len(), "blob written");
        Ok(())
    }

    pub fn put_text(&self, blob: &str, text: &str) -> TaskResult<()> {
        self.put(blob, text.as_bytes())
    }
}

/// The output and logging sinks of a task
#[derive(Clone)]
pub struct Sinks {
    pub output: BlobSink,
    pub logging: BlobSink,
}

impl Sinks {
    pub fn open(args: &CommonArgs, clock: Arc<dyn Clock>) -> TaskResult<Self> {
        let store = open_store(args, clock)?;
        Ok(Self::from_store(store, args))
    }

    pub fn from_store(store: Arc<dyn BlobStore>, args: &CommonArgs) -> Self {
        Self {
            output: BlobSink::new(store.clone(), &args.output_container, &args.output_token),
            logging: BlobSink::new(store, &args.logging_container, &args.logging_token),
        }
    }
}

/// Structured record of what a task did, written as a JSON blob
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogData {
    #[serde(flatten)]
    fields: BTreeMap<String, Value>,
    app_events: Vec<String>,
}

impl LogData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field; values of secret-looking keys are masked
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let value = if is_secret_key(key) {
            Value::String("<redacted>".to_string())
        } else {
            value.into()
        };
        self.fields.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn event(&mut self, message: impl Into<String>) {
        self.app_events.push(message.into());
    }

    pub fn events(&self) -> &[String] {
        &self.app_events
    }

    /// Record every process environment variable as `env.<NAME>`
    pub fn capture_env(&mut self, vars: impl IntoIterator<Item = (String, String)>) {
        for (name, value) in vars {
            self.set(&format!("env.{}", name), value);
        }
    }

    pub fn to_json(&self) -> TaskResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchlane::grant::Permissions;
    use batchlane::mock::MemoryBlobStore;
    use batchlane::stager::ResourceStager;
    use batchlane::FakeClock;

    fn env() -> TaskEnv {
        let vars = [(JOB_ID_VAR, "states-1"), (TASK_ID_VAR, "task3")];
        TaskEnv::from_lookup(
            |name| vars.iter().find(|(k, _)| *k == name).map(|(_, v)| v.to_string()),
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        )
    }

    #[test]
    fn test_names() {
        let env = env();
        let later = DateTime::from_timestamp(1_700_000_042, 0).unwrap();
        assert_eq!(
            env.log_blob_name("boj", later),
            "states-1-task3-1700000000-boj-1700000042.log"
        );
        assert_eq!(env.scoped_name("log_data.json"), "states-1-task3-log_data.json");
    }

    #[test]
    fn test_missing_ids() {
        let env = TaskEnv::from_lookup(|_| None, Utc::now());
        assert_eq!(env.job_id, "None");
        assert_eq!(env.task_id, "None");
    }

    #[test]
    fn test_log_data_masks_secrets() {
        let mut log = LogData::new();
        log.set("filepath", "a.csv");
        log.set("output_token", "sig=abc");
        log.capture_env([("AZURE_STORAGE_KEY".to_string(), "s3cret".to_string())]);
        log.event("started");

        let json = log.to_json().unwrap();
        assert!(json.contains("\"filepath\": \"a.csv\""));
        assert!(!json.contains("sig=abc"));
        assert!(!json.contains("s3cret"));
        assert_eq!(log.events(), ["started".to_string()]);
    }

    #[test]
    fn test_sink_needs_write_grant() {
        let clock = Arc::new(FakeClock::at_epoch_seconds(1_700_000_000));
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new("acct", "key", clock));
        store.create_container("out", false).unwrap();
        let stager = ResourceStager::new(store.clone());

        let write = stager.container_access_grant("out", Permissions::WRITE);
        BlobSink::new(store.clone(), "out", &write)
            .put_text("a.txt", "hello")
            .unwrap();
        assert_eq!(store.get_blob_to_text("out", "a.txt").unwrap(), "hello");

        let read_only = stager.container_access_grant("out", Permissions::READ);
        let err = BlobSink::new(store, "out", &read_only)
            .put_text("b.txt", "nope")
            .unwrap_err();
        assert!(matches!(err, TaskError::Storage(_)));
    }

    #[test]
    fn test_open_store_requires_file_endpoint() {
        let mut args = crate::testutil::args("a.csv");
        args.storage_endpoint = None;
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::at_epoch_seconds(0));
        assert!(matches!(
            open_store(&args, clock.clone()),
            Err(TaskError::NoStorageEndpoint)
        ));
        args.storage_endpoint = Some("https://acct.blob.core.windows.net".to_string());
        assert!(matches!(
            open_store(&args, clock),
            Err(TaskError::UnreachableStorage(_))
        ));
    }
}
