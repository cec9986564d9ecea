//! In-memory compute-batch service

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use crate::command::Platform;
use crate::service::batch::{
    BatchService, ImageReference, JobSpec, NodeAgentSku, PoolSpec, ServiceError, ServiceResult,
    TaskAddResult, TaskResult, TaskSpec, TaskState, TaskStatus,
};

use super::failure::{FailureConfig, FailureInjector};
use super::lock;

/// Operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchOp {
    ListNodeAgentSkus,
    AddPool,
    DeletePool,
    AddJob,
    DeleteJob,
    AddTask,
    ListTasks,
    GetTask,
    GetTaskFile,
}

/// How a task behaves once submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskScript {
    /// Observations until the task reports Completed
    pub polls_to_complete: u32,
    pub exit_code: i32,
    /// `None` makes `stdout.txt` missing
    pub stdout: Option<Vec<u8>>,
    pub stderr: Option<Vec<u8>>,
}

impl TaskScript {
    pub fn succeed_after(polls: u32) -> Self {
        Self {
            polls_to_complete: polls,
            exit_code: 0,
            stdout: None,
            stderr: Some(Vec::new()),
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_stdout(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdout = Some(bytes.into());
        self
    }

    pub fn with_stderr(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stderr = Some(bytes.into());
        self
    }

    pub fn without_stdout(mut self) -> Self {
        self.stdout = None;
        self
    }
}

#[derive(Debug)]
struct MockTask {
    spec: TaskSpec,
    script: TaskScript,
    observations: u32,
}

impl MockTask {
    fn state(&self, held: bool) -> TaskState {
        if held {
            TaskState::Running
        } else if self.observations >= self.script.polls_to_complete {
            TaskState::Completed
        } else if self.observations <= 1 {
            TaskState::Active
        } else {
            TaskState::Running
        }
    }

    fn status(&self, held: bool) -> TaskStatus {
        let state = self.state(held);
        let completed = state == TaskState::Completed;
        TaskStatus {
            id: self.spec.id.clone(),
            state,
            exit_code: completed.then_some(self.script.exit_code),
            result: completed.then(|| {
                if self.script.exit_code == 0 {
                    TaskResult::Success
                } else {
                    TaskResult::Failure
                }
            }),
            node_id: (state != TaskState::Active).then(|| "node-0".to_string()),
        }
    }
}

#[derive(Debug)]
struct MockJob {
    spec: JobSpec,
    tasks: Vec<MockTask>,
}

#[derive(Debug, Default)]
struct BatchState {
    pools: BTreeMap<String, PoolSpec>,
    jobs: BTreeMap<String, MockJob>,
    deleted_pools: Vec<String>,
    deleted_jobs: Vec<String>,
    /// Accepted tasks per job; outlives the job
    submitted: BTreeMap<String, Vec<TaskSpec>>,
}

/// Scripted batch service
pub struct MemoryBatchService {
    skus: Vec<NodeAgentSku>,
    default_polls: u32,
    state: Mutex<BatchState>,
    scripts: Mutex<HashMap<String, TaskScript>>,
    held: Mutex<HashSet<String>>,
    rejected: Mutex<HashMap<String, String>>,
    failures: Mutex<FailureInjector<BatchOp>>,
}

impl MemoryBatchService {
    pub fn new() -> Self {
        Self {
            skus: vec![NodeAgentSku {
                id: "batch.node.ubuntu 16.04".to_string(),
                os_type: Platform::Linux,
                verified_image_references: vec![
                    ImageReference {
                        publisher: "Canonical".to_string(),
                        offer: "UbuntuServer".to_string(),
                        sku: "14.04.5-LTS".to_string(),
                        version: "latest".to_string(),
                    },
                    ImageReference {
                        publisher: "Canonical".to_string(),
                        offer: "UbuntuServer".to_string(),
                        sku: "16.04-LTS".to_string(),
                        version: "latest".to_string(),
                    },
                ],
            }],
            default_polls: 1,
            state: Mutex::new(BatchState::default()),
            scripts: Mutex::new(HashMap::new()),
            held: Mutex::new(HashSet::new()),
            rejected: Mutex::new(HashMap::new()),
            failures: Mutex::new(FailureInjector::new()),
        }
    }

    /// Replace the advertised node agent SKUs
    pub fn with_skus(mut self, skus: Vec<NodeAgentSku>) -> Self {
        self.skus = skus;
        self
    }

    /// Observations before an unscripted task completes
    pub fn with_default_polls(mut self, polls: u32) -> Self {
        self.default_polls = polls;
        self
    }

    /// Script the task with this id in whichever job it is submitted to
    pub fn script_task(&self, task_id: &str, script: TaskScript) {
        lock(&self.scripts).insert(task_id.to_string(), script);
    }

    /// Keep a task Running until released
    pub fn hold_task(&self, task_id: &str) {
        lock(&self.held).insert(task_id.to_string());
    }

    pub fn release_task(&self, task_id: &str) {
        lock(&self.held).remove(task_id);
    }

    /// Reject this task id in collection adds
    pub fn reject_task(&self, task_id: &str, message: &str) {
        lock(&self.rejected).insert(task_id.to_string(), message.to_string());
    }

    pub fn inject_failure(&self, op: BatchOp, config: FailureConfig) {
        lock(&self.failures).inject(op, config);
    }

    pub fn inject_error(&self, op: BatchOp, message: &str) {
        lock(&self.failures).inject_error(op, message);
    }

    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    pub fn pool(&self, pool_id: &str) -> Option<PoolSpec> {
        lock(&self.state).pools.get(pool_id).cloned()
    }

    pub fn pool_ids(&self) -> Vec<String> {
        lock(&self.state).pools.keys().cloned().collect()
    }

    pub fn job_ids(&self) -> Vec<String> {
        lock(&self.state).jobs.keys().cloned().collect()
    }

    /// Pool a job was bound to
    pub fn job_pool(&self, job_id: &str) -> Option<String> {
        lock(&self.state)
            .jobs
            .get(job_id)
            .map(|j| j.spec.pool_id.clone())
    }

    /// Accepted tasks of a job in submission order, also after it was deleted
    pub fn submitted_tasks(&self, job_id: &str) -> Vec<TaskSpec> {
        lock(&self.state)
            .submitted
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn deleted_jobs(&self) -> Vec<String> {
        lock(&self.state).deleted_jobs.clone()
    }

    pub fn deleted_pools(&self) -> Vec<String> {
        lock(&self.state).deleted_pools.clone()
    }

    fn check_failure(&self, op: BatchOp) -> ServiceResult<()> {
        match lock(&self.failures).check(&op) {
            Some(message) => Err(ServiceError::Unavailable(message)),
            None => Ok(()),
        }
    }

    fn script_for(&self, task_id: &str) -> TaskScript {
        lock(&self.scripts).get(task_id).cloned().unwrap_or_else(|| {
            TaskScript::succeed_after(self.default_polls)
                .with_stdout(format!("{} finished\n", task_id))
        })
    }

    fn is_held(&self, task_id: &str) -> bool {
        lock(&self.held).contains(task_id)
    }

    fn insert_task(&self, state: &mut BatchState, job_id: &str, task: &TaskSpec) -> ServiceResult<()> {
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ServiceError::JobNotFound(job_id.to_string()))?;
        if job.tasks.iter().any(|t| t.spec.id == task.id) {
            return Err(ServiceError::TaskExists {
                job_id: job_id.to_string(),
                task_id: task.id.clone(),
            });
        }
        job.tasks.push(MockTask {
            spec: task.clone(),
            script: self.script_for(&task.id),
            observations: 0,
        });
        state
            .submitted
            .entry(job_id.to_string())
            .or_default()
            .push(task.clone());
        Ok(())
    }
}

impl Default for MemoryBatchService {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchService for MemoryBatchService {
    fn list_node_agent_skus(&self) -> ServiceResult<Vec<NodeAgentSku>> {
        self.check_failure(BatchOp::ListNodeAgentSkus)?;
        Ok(self.skus.clone())
    }

    fn add_pool(&self, pool: &PoolSpec) -> ServiceResult<()> {
        self.check_failure(BatchOp::AddPool)?;
        let mut state = lock(&self.state);
        if state.pools.contains_key(&pool.id) {
            return Err(ServiceError::PoolExists(pool.id.clone()));
        }
        if pool.target_dedicated_nodes == 0 {
            return Err(ServiceError::InvalidRequest(
                "target_dedicated_nodes must be positive".to_string(),
            ));
        }
        state.pools.insert(pool.id.clone(), pool.clone());
        Ok(())
    }

    fn delete_pool(&self, pool_id: &str) -> ServiceResult<()> {
        self.check_failure(BatchOp::DeletePool)?;
        let mut state = lock(&self.state);
        state
            .pools
            .remove(pool_id)
            .ok_or_else(|| ServiceError::PoolNotFound(pool_id.to_string()))?;
        state.deleted_pools.push(pool_id.to_string());
        Ok(())
    }

    fn add_job(&self, job: &JobSpec) -> ServiceResult<()> {
        self.check_failure(BatchOp::AddJob)?;
        let mut state = lock(&self.state);
        if state.jobs.contains_key(&job.id) {
            return Err(ServiceError::JobExists(job.id.clone()));
        }
        if !state.pools.contains_key(&job.pool_id) {
            return Err(ServiceError::PoolNotFound(job.pool_id.clone()));
        }
        state.jobs.insert(
            job.id.clone(),
            MockJob {
                spec: job.clone(),
                tasks: Vec::new(),
            },
        );
        Ok(())
    }

    fn delete_job(&self, job_id: &str) -> ServiceResult<()> {
        self.check_failure(BatchOp::DeleteJob)?;
        let mut state = lock(&self.state);
        state
            .jobs
            .remove(job_id)
            .ok_or_else(|| ServiceError::JobNotFound(job_id.to_string()))?;
        state.deleted_jobs.push(job_id.to_string());
        Ok(())
    }

    fn add_task(&self, job_id: &str, task: &TaskSpec) -> ServiceResult<()> {
        self.check_failure(BatchOp::AddTask)?;
        let mut state = lock(&self.state);
        self.insert_task(&mut state, job_id, task)
    }

    fn add_task_collection(
        &self,
        job_id: &str,
        tasks: &[TaskSpec],
    ) -> ServiceResult<Vec<TaskAddResult>> {
        self.check_failure(BatchOp::AddTask)?;
        let mut state = lock(&self.state);
        if !state.jobs.contains_key(job_id) {
            return Err(ServiceError::JobNotFound(job_id.to_string()));
        }

        let rejected = lock(&self.rejected).clone();
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            if let Some(message) = rejected.get(&task.id) {
                results.push(TaskAddResult::rejected(&task.id, message));
                continue;
            }
            match self.insert_task(&mut state, job_id, task) {
                Ok(()) => results.push(TaskAddResult::accepted(&task.id)),
                Err(e) => results.push(TaskAddResult::rejected(&task.id, e.to_string())),
            }
        }
        Ok(results)
    }

    fn list_tasks(&self, job_id: &str) -> ServiceResult<Vec<TaskStatus>> {
        self.check_failure(BatchOp::ListTasks)?;
        let held = lock(&self.held).clone();
        let mut state = lock(&self.state);
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ServiceError::JobNotFound(job_id.to_string()))?;

        Ok(job
            .tasks
            .iter_mut()
            .map(|task| {
                task.observations += 1;
                task.status(held.contains(&task.spec.id))
            })
            .collect())
    }

    fn get_task(&self, job_id: &str, task_id: &str) -> ServiceResult<TaskStatus> {
        self.check_failure(BatchOp::GetTask)?;
        let held = self.is_held(task_id);
        let mut state = lock(&self.state);
        let task = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ServiceError::JobNotFound(job_id.to_string()))?
            .tasks
            .iter_mut()
            .find(|t| t.spec.id == task_id)
            .ok_or_else(|| ServiceError::TaskNotFound {
                job_id: job_id.to_string(),
                task_id: task_id.to_string(),
            })?;
        task.observations += 1;
        Ok(task.status(held))
    }

    fn get_task_file(
        &self,
        job_id: &str,
        task_id: &str,
        file_name: &str,
    ) -> ServiceResult<Vec<u8>> {
        self.check_failure(BatchOp::GetTaskFile)?;
        let state = lock(&self.state);
        let task = state
            .jobs
            .get(job_id)
            .ok_or_else(|| ServiceError::JobNotFound(job_id.to_string()))?
            .tasks
            .iter()
            .find(|t| t.spec.id == task_id)
            .ok_or_else(|| ServiceError::TaskNotFound {
                job_id: job_id.to_string(),
                task_id: task_id.to_string(),
            })?;

        let content = match file_name {
            "stdout.txt" => task.script.stdout.clone(),
            "stderr.txt" => task.script.stderr.clone(),
            _ => None,
        };
        content.ok_or_else(|| ServiceError::FileNotFound {
            job_id: job_id.to_string(),
            task_id: task_id.to_string(),
            file_name: file_name.to_string(),
        })
    }
}
