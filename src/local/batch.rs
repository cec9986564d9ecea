//! Child-process compute-batch emulator
//!
//! Pools, jobs and tasks are directories under the batch root:
//!
//! ```text
//! pools/<pool>/pool.json
//! pools/<pool>/shared/            AZ_BATCH_NODE_SHARED_DIR
//! pools/<pool>/startup/           start task working dir and output
//! jobs/<job>/job.json
//! jobs/<job>/tasks/<task>/task.json
//! jobs/<job>/tasks/<task>/wd/     AZ_BATCH_TASK_WORKING_DIR
//! jobs/<job>/tasks/<task>/{stdout.txt,stderr.txt,exit_code}
//! ```
//!
//! A task runs as `sh -c <command line>` under a small runner that records
//! the exit status in `exit_code`, so any process can read task state from
//! disk. At most `target_dedicated_nodes` tasks of a job run at once; queued
//! tasks start when `list_tasks` or `get_task` observes a free slot. Resource
//! files are fetched through their grants when the task starts, as a real
//! node would.
//!
//! Only the process that started a task can kill it on `delete_job`.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::command::Platform;
use crate::service::batch::{
    BatchService, ImageReference, JobSpec, NodeAgentSku, PoolSpec, ResourceFile, ServiceError,
    ServiceResult, StartTask, TaskAddResult, TaskResult, TaskSpec, TaskState, TaskStatus,
};
use crate::service::storage::{validate_name, BlobStore};

use super::storage::write_atomic;

/// Runs the task command and records its exit status
const RUNNER: &str = "sh -c \"$BATCHLANE_TASK_COMMAND\"; code=$?; \
echo \"$code\" > \"$AZ_BATCH_TASK_DIR/.exit_code.tmp\" && \
mv \"$AZ_BATCH_TASK_DIR/.exit_code.tmp\" \"$AZ_BATCH_TASK_DIR/exit_code\"; exit $code";

pub const LOCAL_NODE_AGENT: &str = "batch.node.local";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskRecord {
    spec: TaskSpec,
    /// Submission order within the job
    seq: usize,
    started: bool,
    /// Set when the task could not be started at all
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<String>,
}

pub struct LocalBatchService {
    root: PathBuf,
    storage: Arc<dyn BlobStore>,
    /// Running children keyed by `<job>/<task>`; the lock also serializes
    /// every filesystem mutation made by this process
    children: Mutex<HashMap<String, Child>>,
}

impl LocalBatchService {
    pub fn open(root: &Path, storage: Arc<dyn BlobStore>) -> ServiceResult<Self> {
        fs::create_dir_all(root.join("pools"))?;
        fs::create_dir_all(root.join("jobs"))?;
        Ok(Self {
            root: root.canonicalize()?,
            storage,
            children: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Child>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pool_dir(&self, pool_id: &str) -> PathBuf {
        self.root.join("pools").join(pool_id)
    }

    fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join("jobs").join(job_id)
    }

    fn task_dir(&self, job_id: &str, task_id: &str) -> PathBuf {
        self.job_dir(job_id).join("tasks").join(task_id)
    }

    fn existing_job(&self, job_id: &str) -> ServiceResult<JobSpec> {
        checked_id(job_id)?;
        let path = self.job_dir(job_id).join("job.json");
        if !path.exists() {
            return Err(ServiceError::JobNotFound(job_id.to_string()));
        }
        read_json(&path)
    }

    fn existing_pool(&self, pool_id: &str) -> ServiceResult<PoolSpec> {
        checked_id(pool_id)?;
        let path = self.pool_dir(pool_id).join("pool.json");
        if !path.exists() {
            return Err(ServiceError::PoolNotFound(pool_id.to_string()));
        }
        read_json(&path)
    }

    fn download_resources(&self, files: &[ResourceFile], into: &Path) -> ServiceResult<()> {
        for file in files {
            validate_name(&file.file_path)
                .map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;
            let content = self
                .storage
                .get_with_grant(&file.blob_source)
                .map_err(|e| {
                    ServiceError::InvalidRequest(format!(
                        "resource file {}: {}",
                        file.file_path, e
                    ))
                })?;
            fs::write(into.join(&file.file_path), content)?;
        }
        Ok(())
    }

    fn run_start_task(&self, pool_id: &str, start: &StartTask) -> ServiceResult<()> {
        let pool_dir = self.pool_dir(pool_id);
        let startup = pool_dir.join("startup");
        fs::create_dir_all(&startup)?;
        self.download_resources(&start.resource_files, &startup)?;

        let status = Command::new("sh")
            .arg("-c")
            .arg(&start.command_line)
            .current_dir(&startup)
            .env("AZ_BATCH_NODE_SHARED_DIR", pool_dir.join("shared"))
            .env("AZ_BATCH_NODE_STARTUP_DIR", &startup)
            .stdin(Stdio::null())
            .stdout(File::create(startup.join("stdout.txt"))?)
            .stderr(File::create(startup.join("stderr.txt"))?)
            .status()?;

        if status.success() {
            return Ok(());
        }
        let stderr = fs::read_to_string(startup.join("stderr.txt")).unwrap_or_default();
        Err(ServiceError::StartTaskFailed {
            pool_id: pool_id.to_string(),
            message: format!("exit status {}: {}", status, stderr.trim()),
        })
    }

    fn task_records(&self, job_id: &str) -> ServiceResult<Vec<TaskRecord>> {
        let tasks_dir = self.job_dir(job_id).join("tasks");
        let mut records = Vec::new();
        for entry in fs::read_dir(&tasks_dir)? {
            let path = entry?.path().join("task.json");
            if path.exists() {
                records.push(read_json::<TaskRecord>(&path)?);
            }
        }
        records.sort_by_key(|r| r.seq);
        Ok(records)
    }

    fn exit_code(&self, job_id: &str, task_id: &str) -> Option<i32> {
        fs::read_to_string(self.task_dir(job_id, task_id).join("exit_code"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    fn status_of(&self, job_id: &str, record: &TaskRecord) -> TaskStatus {
        let finished = |exit_code: Option<i32>| TaskStatus {
            id: record.spec.id.clone(),
            state: TaskState::Completed,
            exit_code,
            result: Some(match exit_code {
                Some(0) => TaskResult::Success,
                _ => TaskResult::Failure,
            }),
            node_id: Some("localhost".to_string()),
        };

        if record.failure.is_some() {
            return finished(None);
        }
        if let Some(code) = self.exit_code(job_id, &record.spec.id) {
            return finished(Some(code));
        }
        TaskStatus {
            id: record.spec.id.clone(),
            state: if record.started {
                TaskState::Running
            } else {
                TaskState::Active
            },
            exit_code: None,
            result: None,
            node_id: record.started.then(|| "localhost".to_string()),
        }
    }

    fn insert_task(&self, job_id: &str, task: &TaskSpec, seq: usize) -> ServiceResult<()> {
        checked_id(&task.id)?;
        let dir = self.task_dir(job_id, &task.id);
        if dir.exists() {
            return Err(ServiceError::TaskExists {
                job_id: job_id.to_string(),
                task_id: task.id.clone(),
            });
        }
        fs::create_dir_all(dir.join("wd"))?;
        let record = TaskRecord {
            spec: task.clone(),
            seq,
            started: false,
            failure: None,
        };
        write_json(&dir.join("task.json"), &record)
    }

    /// Reap finished children of `job_id` and start queued tasks into free slots
    fn refresh(&self, children: &mut HashMap<String, Child>, job: &JobSpec) -> ServiceResult<()> {
        let prefix = format!("{}/", job.id);
        children.retain(|key, child| {
            !key.starts_with(&prefix) || matches!(child.try_wait(), Ok(None))
        });

        let slots = self
            .existing_pool(&job.pool_id)
            .map(|p| p.target_dedicated_nodes as usize)
            .unwrap_or(1);
        let records = self.task_records(&job.id)?;
        let mut running = records
            .iter()
            .filter(|r| r.started && r.failure.is_none() && self.exit_code(&job.id, &r.spec.id).is_none())
            .count();

        for record in records.into_iter().filter(|r| !r.started && r.failure.is_none()) {
            if running >= slots {
                break;
            }
            self.start_task(children, job, record)?;
            running += 1;
        }
        Ok(())
    }

    fn start_task(
        &self,
        children: &mut HashMap<String, Child>,
        job: &JobSpec,
        mut record: TaskRecord,
    ) -> ServiceResult<()> {
        let dir = self.task_dir(&job.id, &record.spec.id);
        let wd = dir.join("wd");
        record.started = true;

        let spawned = self
            .download_resources(&record.spec.resource_files, &wd)
            .and_then(|()| {
                Command::new("sh")
                    .arg("-c")
                    .arg(RUNNER)
                    .current_dir(&wd)
                    .env("BATCHLANE_TASK_COMMAND", &record.spec.command_line)
                    .env("AZ_BATCH_NODE_SHARED_DIR", self.pool_dir(&job.pool_id).join("shared"))
                    .env("AZ_BATCH_JOB_ID", &job.id)
                    .env("AZ_BATCH_TASK_ID", &record.spec.id)
                    .env("AZ_BATCH_TASK_DIR", &dir)
                    .env("AZ_BATCH_TASK_WORKING_DIR", &wd)
                    .stdin(Stdio::null())
                    .stdout(File::create(dir.join("stdout.txt"))?)
                    .stderr(File::create(dir.join("stderr.txt"))?)
                    .spawn()
                    .map_err(ServiceError::from)
            });

        match spawned {
            Ok(child) => {
                tracing::debug!(job = %job.id, task = %record.spec.id, pid = child.id(), "task started");
                children.insert(format!("{}/{}", job.id, record.spec.id), child);
            }
            Err(e) => {
                tracing::warn!(job = %job.id, task = %record.spec.id, error = %e, "task failed to start");
                fs::write(dir.join("stderr.txt"), e.to_string())?;
                record.failure = Some(e.to_string());
            }
        }

        write_json(&dir.join("task.json"), &record)
    }
}

fn checked_id(id: &str) -> ServiceResult<()> {
    validate_name(id).map_err(|e| ServiceError::InvalidRequest(e.to_string()))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> ServiceResult<T> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ServiceError::Unavailable(format!("corrupt state file {}: {}", path.display(), e)))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> ServiceResult<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;
    write_atomic(path, &json)?;
    Ok(())
}

impl BatchService for LocalBatchService {
    fn list_node_agent_skus(&self) -> ServiceResult<Vec<NodeAgentSku>> {
        let ubuntu = |sku: &str| ImageReference {
            publisher: "Canonical".to_string(),
            offer: "UbuntuServer".to_string(),
            sku: sku.to_string(),
            version: "latest".to_string(),
        };
        Ok(vec![NodeAgentSku {
            id: LOCAL_NODE_AGENT.to_string(),
            os_type: Platform::Linux,
            verified_image_references: vec![ubuntu("16.04-LTS"), ubuntu("18.04-LTS")],
        }])
    }

    fn add_pool(&self, pool: &PoolSpec) -> ServiceResult<()> {
        checked_id(&pool.id)?;
        if pool.target_dedicated_nodes == 0 {
            return Err(ServiceError::InvalidRequest(
                "target_dedicated_nodes must be positive".to_string(),
            ));
        }
        let _guard = self.lock();
        let dir = self.pool_dir(&pool.id);
        if dir.exists() {
            return Err(ServiceError::PoolExists(pool.id.clone()));
        }
        fs::create_dir_all(dir.join("shared"))?;

        if let Some(start) = &pool.start_task {
            if let Err(e) = self.run_start_task(&pool.id, start) {
                if start.wait_for_success {
                    let _ = fs::remove_dir_all(&dir);
                    return Err(e);
                }
                tracing::warn!(pool = %pool.id, error = %e, "start task failed");
            }
        }

        write_json(&dir.join("pool.json"), pool)
    }

    fn delete_pool(&self, pool_id: &str) -> ServiceResult<()> {
        let _guard = self.lock();
        self.existing_pool(pool_id)?;
        fs::remove_dir_all(self.pool_dir(pool_id))?;
        Ok(())
    }

    fn add_job(&self, job: &JobSpec) -> ServiceResult<()> {
        checked_id(&job.id)?;
        let _guard = self.lock();
        let dir = self.job_dir(&job.id);
        if dir.exists() {
            return Err(ServiceError::JobExists(job.id.clone()));
        }
        self.existing_pool(&job.pool_id)?;
        fs::create_dir_all(dir.join("tasks"))?;
        write_json(&dir.join("job.json"), job)
    }

    fn delete_job(&self, job_id: &str) -> ServiceResult<()> {
        let mut children = self.lock();
        self.existing_job(job_id)?;

        let prefix = format!("{}/", job_id);
        let keys: Vec<String> = children.keys().filter(|k| k.starts_with(&prefix)).cloned().collect();
        for key in keys {
            if let Some(mut child) = children.remove(&key) {
                let _ = child.kill();
                let _ = child.wait();
            }
        }

        fs::remove_dir_all(self.job_dir(job_id))?;
        Ok(())
    }

    fn add_task(&self, job_id: &str, task: &TaskSpec) -> ServiceResult<()> {
        let mut children = self.lock();
        let job = self.existing_job(job_id)?;
        let seq = self.task_records(job_id)?.len();
        self.insert_task(job_id, task, seq)?;
        self.refresh(&mut children, &job)
    }

    fn add_task_collection(
        &self,
        job_id: &str,
        tasks: &[TaskSpec],
    ) -> ServiceResult<Vec<TaskAddResult>> {
        let mut children = self.lock();
        let job = self.existing_job(job_id)?;
        let mut seq = self.task_records(job_id)?.len();

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            match self.insert_task(job_id, task, seq) {
                Ok(()) => {
                    seq += 1;
                    results.push(TaskAddResult::accepted(&task.id));
                }
                Err(e) => results.push(TaskAddResult::rejected(&task.id, e.to_string())),
            }
        }

        self.refresh(&mut children, &job)?;
        Ok(results)
    }

    fn list_tasks(&self, job_id: &str) -> ServiceResult<Vec<TaskStatus>> {
        let mut children = self.lock();
        let job = self.existing_job(job_id)?;
        self.refresh(&mut children, &job)?;
        Ok(self
            .task_records(job_id)?
            .iter()
            .map(|r| self.status_of(job_id, r))
            .collect())
    }

    fn get_task(&self, job_id: &str, task_id: &str) -> ServiceResult<TaskStatus> {
        let mut children = self.lock();
        let job = self.existing_job(job_id)?;
        self.refresh(&mut children, &job)?;
        checked_id(task_id)?;
        let path = self.task_dir(job_id, task_id).join("task.json");
        if !path.exists() {
            return Err(ServiceError::TaskNotFound {
                job_id: job_id.to_string(),
                task_id: task_id.to_string(),
            });
        }
        let record: TaskRecord = read_json(&path)?;
        Ok(self.status_of(job_id, &record))
    }

    fn get_task_file(
        &self,
        job_id: &str,
        task_id: &str,
        file_name: &str,
    ) -> ServiceResult<Vec<u8>> {
        checked_id(job_id)?;
        checked_id(task_id)?;
        checked_id(file_name)?;
        let path = self.task_dir(job_id, task_id).join(file_name);
        fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ServiceError::FileNotFound {
                job_id: job_id.to_string(),
                task_id: task_id.to_string(),
                file_name: file_name.to_string(),
            },
            _ => e.into(),
        })
    }
}
