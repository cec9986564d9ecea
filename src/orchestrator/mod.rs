//! Job orchestration
//!
//! [`Orchestrator`] owns the lifecycle of one batch job:
//!
//! 1. Create the role containers and stage task files and inputs
//! 2. Provision a pool on the latest matching verified image
//! 3. Create the job and enqueue one task per input
//! 4. Poll task states until all are terminal, the deadline passes or the
//!    cancel token is set
//! 5. Collect per-task output streams
//! 6. Delete job and pool on request
//!
//! Every call blocks. The only long wait is the poll loop, which sleeps on
//! the injected [`Clock`].

mod error;
mod outputs;
mod phase;

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::clock::Clock;
use crate::command::{build_command_sequence, Platform, TaskParams};
use crate::config::{ImageSelector, Settings};
use crate::grant::Permissions;
use crate::runlog::RunLog;
use crate::service::batch::{
    BatchService, ImageReference, JobSpec, NodeAgentSku, PoolSpec, ResourceFile, ServiceError,
    StartTask, TaskSpec, TaskStatus,
};
use crate::service::storage::BlobStore;
use crate::signal::CancelToken;
use crate::stager::{BlobFilter, ResourceStager};
use crate::taskgen::{generate_tasks, JobContext, TaskGenerator};
use crate::timeout::{poll_until, Probe, TimeoutConfig, WaitOutcome};

pub use error::{exit, OrchestratorError, OrchestratorResult, RejectedTask};
pub use outputs::{
    fetch_stream, fetch_streams, output_file_name, persist_outputs, OutputError, OutputStreams,
    Stream, TaskOutputs,
};
pub use phase::{JobPhase, PhaseChange, PhaseError, PhaseTracker};

/// Pool creation parameters
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub pool_id: String,
    pub vm_size: String,
    pub node_count: u32,
    pub platform: Platform,
    pub image: ImageSelector,
    pub start_task: Option<StartTask>,
}

/// A pool the orchestrator created
#[derive(Debug, Clone, Serialize)]
pub struct PoolHandle {
    pub pool_id: String,
    pub node_agent_sku_id: String,
    pub image: ImageReference,
    pub node_count: u32,
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub job_id: String,
}

impl JobConfig {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
        }
    }
}

/// A job the orchestrator created, with its tasks in submission order
#[derive(Debug, Clone, Serialize)]
pub struct JobHandle {
    job_id: String,
    pool_id: String,
    tasks: Vec<String>,
    /// Task states from the most recent poll
    statuses: Vec<TaskStatus>,
    phase: PhaseTracker,
}

impl JobHandle {
    fn new(job_id: String, pool_id: String, at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            pool_id,
            tasks: Vec::new(),
            statuses: Vec::new(),
            phase: PhaseTracker::new(at),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub fn task_ids(&self) -> &[String] {
        &self.tasks
    }

    pub fn last_statuses(&self) -> &[TaskStatus] {
        &self.statuses
    }

    pub fn phase(&self) -> JobPhase {
        self.phase.current()
    }

    pub fn phase_history(&self) -> &[PhaseChange] {
        self.phase.history()
    }

    fn wrong_phase(&self, operation: &'static str) -> OrchestratorError {
        OrchestratorError::WrongPhase {
            job_id: self.job_id.clone(),
            phase: self.phase(),
            operation,
        }
    }
}

/// Result of a successful wait
#[derive(Debug, Clone, Serialize)]
pub struct CompletionReport {
    pub statuses: Vec<TaskStatus>,
    pub polls: u32,
    pub elapsed: Duration,
}

impl CompletionReport {
    /// Completed tasks whose exit code was not zero
    pub fn failed_tasks(&self) -> Vec<&TaskStatus> {
        self.statuses
            .iter()
            .filter(|s| s.exit_code != Some(0))
            .collect()
    }
}

/// Latest verified image matching `selector`, with its node agent SKU id
///
/// Publisher and offer compare case-insensitively; `selector.sku` is a
/// prefix. Ties on sku are broken by version.
pub fn select_image(
    skus: &[NodeAgentSku],
    platform: Platform,
    selector: &ImageSelector,
) -> Option<(String, ImageReference)> {
    skus.iter()
        .filter(|sku| sku.os_type == platform)
        .flat_map(|sku| sku.verified_image_references.iter().map(move |img| (sku, img)))
        .filter(|(_, img)| {
            img.publisher.eq_ignore_ascii_case(&selector.publisher)
                && img.offer.eq_ignore_ascii_case(&selector.offer)
                && img.sku.starts_with(&selector.sku)
        })
        .max_by(|(_, a), (_, b)| (&a.sku, &a.version).cmp(&(&b.sku, &b.version)))
        .map(|(sku, img)| (sku.id.clone(), img.clone()))
}

/// Ids in `expected` or `statuses` that are not terminal
pub fn incomplete_tasks(expected: &[String], statuses: &[TaskStatus]) -> BTreeSet<String> {
    let terminal: BTreeSet<&str> = statuses
        .iter()
        .filter(|s| s.is_terminal())
        .map(|s| s.id.as_str())
        .collect();
    expected
        .iter()
        .map(String::as_str)
        .chain(statuses.iter().map(|s| s.id.as_str()))
        .filter(|id| !terminal.contains(id))
        .map(str::to_string)
        .collect()
}

/// Delete the job, then the pool
///
/// The pool delete is attempted even when the job delete fails; both
/// errors are reported.
pub fn delete_job_and_pool(
    batch: &dyn BatchService,
    job_id: &str,
    pool_id: &str,
) -> OrchestratorResult<()> {
    let job_error = batch.delete_job(job_id).err();
    let pool_error = batch.delete_pool(pool_id).err();
    if job_error.is_none() && pool_error.is_none() {
        tracing::info!(job = job_id, pool = pool_id, "deleted job and pool");
        return Ok(());
    }
    Err(OrchestratorError::Teardown {
        job_id: job_id.to_string(),
        pool_id: pool_id.to_string(),
        job_error,
        pool_error,
    })
}

/// Everything `execute` needs besides the services
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub job_id: String,
    pub pool_id: String,
    pub settings: Settings,
    /// Uploaded to the task container and copied onto every node
    pub task_files: Vec<PathBuf>,
    /// Local inputs uploaded to the input container
    pub inputs: Vec<PathBuf>,
    /// Blobs already in the input container to process as well
    pub existing_inputs: Option<BlobFilter>,
    /// Where output streams are saved; nothing is written when `None`
    pub output_dir: Option<PathBuf>,
    pub teardown: bool,
    pub dev: bool,
}

impl ExecutionPlan {
    pub fn new(job_id: impl Into<String>, pool_id: impl Into<String>, settings: Settings) -> Self {
        Self {
            job_id: job_id.into(),
            pool_id: pool_id.into(),
            settings,
            task_files: Vec::new(),
            inputs: Vec::new(),
            existing_inputs: None,
            output_dir: None,
            teardown: false,
            dev: false,
        }
    }

    /// Pool parameters, with a start task built from the configured commands
    pub fn pool_config(&self, task_resources: Vec<ResourceFile>) -> OrchestratorResult<PoolConfig> {
        let pool = &self.settings.pool;
        let start_task = if pool.start_task.is_empty() {
            None
        } else {
            let params = TaskParams::new()
                .set("task_file", &self.settings.task.file)
                .set("task_command", &self.settings.task.command);
            Some(StartTask {
                command_line: build_command_sequence(pool.platform, &pool.start_task, &params)?,
                resource_files: task_resources,
                wait_for_success: true,
                run_elevated: true,
            })
        };

        Ok(PoolConfig {
            pool_id: self.pool_id.clone(),
            vm_size: pool.vm_size.clone(),
            node_count: pool.node_count,
            platform: pool.platform,
            image: pool.image.clone(),
            start_task,
        })
    }
}

/// What a successful `execute` produced
#[derive(Debug)]
pub struct ExecutionReport {
    pub pool: PoolHandle,
    pub job: JobHandle,
    pub completion: CompletionReport,
    pub outputs: TaskOutputs,
    pub output_files: Vec<PathBuf>,
}

pub struct Orchestrator {
    batch: Arc<dyn BatchService>,
    stager: ResourceStager,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    poll_interval: Duration,
}

impl Orchestrator {
    pub fn new(batch: Arc<dyn BatchService>, store: Arc<dyn BlobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            batch,
            stager: ResourceStager::new(store),
            clock,
            cancel: CancelToken::new(),
            poll_interval: TimeoutConfig::default().poll_interval(),
        }
    }

    /// Poll interval and grant lifetime taken from `settings`
    pub fn from_settings(
        batch: Arc<dyn BatchService>,
        store: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        settings: &Settings,
    ) -> Self {
        let timeouts = settings.job.timeout_config();
        Self::new(batch, store, clock)
            .with_poll_interval(timeouts.poll_interval())
            .with_grant_lifetime(settings.grants.lifetime_for(timeouts.timeout()))
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_grant_lifetime(mut self, lifetime: Duration) -> Self {
        self.stager = self.stager.with_grant_lifetime(lifetime);
        self
    }

    pub fn batch(&self) -> &Arc<dyn BatchService> {
        &self.batch
    }

    pub fn stager(&self) -> &ResourceStager {
        &self.stager
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        self.stager.store()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Create a pool on the latest verified image matching the selector
    pub fn provision(&self, config: &PoolConfig) -> OrchestratorResult<PoolHandle> {
        let skus = self.batch.list_node_agent_skus()?;
        let (node_agent_sku_id, image) = select_image(&skus, config.platform, &config.image)
            .ok_or_else(|| OrchestratorError::Provisioning {
                pool_id: config.pool_id.clone(),
                reason: format!(
                    "no verified {} image matches {}/{}/{}*",
                    config.platform, config.image.publisher, config.image.offer, config.image.sku
                ),
            })?;

        let spec = PoolSpec {
            id: config.pool_id.clone(),
            vm_size: config.vm_size.clone(),
            target_dedicated_nodes: config.node_count,
            image: image.clone(),
            node_agent_sku_id: node_agent_sku_id.clone(),
            start_task: config.start_task.clone(),
        };
        self.batch
            .add_pool(&spec)
            .map_err(|e| OrchestratorError::Provisioning {
                pool_id: config.pool_id.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(
            pool = %config.pool_id,
            image = %format!("{}/{}/{}", image.publisher, image.offer, image.sku),
            nodes = config.node_count,
            "pool created"
        );
        Ok(PoolHandle {
            pool_id: config.pool_id.clone(),
            node_agent_sku_id,
            image,
            node_count: config.node_count,
        })
    }

    /// Create a job bound to `pool`
    pub fn submit_job(&self, pool: &PoolHandle, config: &JobConfig) -> OrchestratorResult<JobHandle> {
        let now = self.clock.now();
        let mut handle = JobHandle::new(config.job_id.clone(), pool.pool_id.clone(), now);

        let spec = JobSpec {
            id: config.job_id.clone(),
            pool_id: pool.pool_id.clone(),
        };
        match self.batch.add_job(&spec) {
            Ok(()) => {}
            Err(ServiceError::JobExists(id)) => return Err(OrchestratorError::DuplicateJob(id)),
            Err(e) => return Err(e.into()),
        }

        handle.phase.transition(JobPhase::Submitted, now)?;
        tracing::info!(job = %config.job_id, pool = %pool.pool_id, "job created");
        Ok(handle)
    }

    /// Submit `tasks` in one collection add
    ///
    /// Accepted tasks are recorded on the handle in submission order. Any
    /// rejection fails the call; nothing is retried.
    pub fn enqueue_tasks(&self, job: &mut JobHandle, tasks: &[TaskSpec]) -> OrchestratorResult<()> {
        if job.phase() != JobPhase::Submitted {
            return Err(job.wrong_phase("enqueue tasks for"));
        }
        if tasks.is_empty() {
            return Ok(());
        }

        let results = self.batch.add_task_collection(&job.job_id, tasks)?;
        let by_id: HashMap<&str, _> = results.iter().map(|r| (r.task_id.as_str(), r)).collect();

        let mut rejected = Vec::new();
        for task in tasks {
            match by_id.get(task.id.as_str()) {
                Some(result) if result.is_accepted() => job.tasks.push(task.id.clone()),
                Some(result) => rejected.push(RejectedTask {
                    task_id: task.id.clone(),
                    message: result
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("{:?}", result.status)),
                }),
                None => rejected.push(RejectedTask {
                    task_id: task.id.clone(),
                    message: "no result returned".to_string(),
                }),
            }
        }

        if !rejected.is_empty() {
            tracing::warn!(job = %job.job_id, rejected = rejected.len(), "task submission rejected");
            return Err(OrchestratorError::PartialSubmission {
                job_id: job.job_id.clone(),
                submitted: tasks.len(),
                rejected,
            });
        }

        tracing::info!(job = %job.job_id, tasks = tasks.len(), "tasks enqueued");
        Ok(())
    }

    /// Poll until every task is terminal
    ///
    /// Succeeds only if all tasks were seen terminal before `timeout`
    /// elapsed. A timed-out handle may be waited on again; the fresh wait
    /// moves it to `Completed` or leaves it `TimedOut`. A failed state
    /// query also leaves the handle `TimedOut`.
    pub fn await_completion(
        &self,
        job: &mut JobHandle,
        timeout: Duration,
    ) -> OrchestratorResult<CompletionReport> {
        let repoll = job.phase() == JobPhase::TimedOut;
        if !repoll {
            job.phase.transition(JobPhase::Polling, self.clock.now())?;
        }

        let job_id = job.job_id.clone();
        let expected = job.tasks.clone();
        tracing::info!(
            job = %job_id,
            tasks = expected.len(),
            timeout_secs = timeout.as_secs(),
            "waiting for tasks"
        );

        let polled = poll_until(
            self.clock.as_ref(),
            &self.cancel,
            self.poll_interval,
            timeout,
            || {
                let statuses = self.batch.list_tasks(&job_id)?;
                let incomplete = incomplete_tasks(&expected, &statuses);
                tracing::debug!(job = %job_id, incomplete = incomplete.len(), "polled task states");
                Ok::<_, ServiceError>(if incomplete.is_empty() {
                    Probe::Ready(statuses)
                } else {
                    Probe::Pending(statuses)
                })
            },
        );
        let (outcome, stats) = match polled {
            Ok(polled) => polled,
            Err(e) => {
                // Polling stopped with tasks outstanding; the caller may
                // re-poll, collect partial outputs or tear down.
                if !repoll {
                    job.phase.transition(JobPhase::TimedOut, self.clock.now())?;
                }
                tracing::warn!(job = %job_id, error = %e, "polling failed");
                return Err(e.into());
            }
        };

        let now = self.clock.now();
        let incomplete_of = |last: &Option<Vec<TaskStatus>>| match last {
            Some(statuses) => incomplete_tasks(&expected, statuses),
            None => expected.iter().cloned().collect(),
        };

        match outcome {
            WaitOutcome::Ready(statuses) => {
                job.phase.transition(JobPhase::Completed, now)?;
                job.statuses = statuses.clone();
                let elapsed = (now - stats.started_at).to_std().unwrap_or_default();
                tracing::info!(job = %job_id, polls = stats.polls, "all tasks completed");
                Ok(CompletionReport {
                    statuses,
                    polls: stats.polls,
                    elapsed,
                })
            }
            WaitOutcome::TimedOut(last) => {
                let incomplete = incomplete_of(&last);
                if !repoll {
                    job.phase.transition(JobPhase::TimedOut, now)?;
                }
                job.statuses = last.unwrap_or_default();
                tracing::warn!(job = %job_id, incomplete = incomplete.len(), "timed out waiting for tasks");
                Err(OrchestratorError::Timeout {
                    job_id,
                    timeout,
                    incomplete,
                })
            }
            WaitOutcome::Cancelled(last) => {
                let incomplete = incomplete_of(&last);
                job.phase.transition(JobPhase::Cancelled, now)?;
                job.statuses = last.unwrap_or_default();
                tracing::warn!(job = %job_id, "wait cancelled");
                Err(OrchestratorError::Cancelled { job_id, incomplete })
            }
        }
    }

    /// Fetch both output streams of every task
    ///
    /// Allowed once polling has stopped, so a timed-out or cancelled job
    /// yields whatever its tasks have written so far.
    pub fn collect_outputs(&self, job: &JobHandle) -> OrchestratorResult<TaskOutputs> {
        if !job.phase().allows_output_collection() {
            return Err(job.wrong_phase("collect outputs of"));
        }

        let mut outputs = TaskOutputs::new();
        for task_id in &job.tasks {
            let streams = fetch_streams(self.batch.as_ref(), &job.job_id, task_id);
            for e in streams.errors() {
                tracing::warn!(job = %job.job_id, task = %task_id, error = %e, "output collection failed");
            }
            outputs.insert(task_id.clone(), streams);
        }
        Ok(outputs)
    }

    /// [`collect_outputs`](Self::collect_outputs), saving each stream under `dir`
    pub fn collect_outputs_to(
        &self,
        job: &JobHandle,
        dir: &Path,
    ) -> OrchestratorResult<(TaskOutputs, Vec<PathBuf>)> {
        let outputs = self.collect_outputs(job)?;
        let stamp = self.clock.now().timestamp();
        let files = persist_outputs(&outputs, &job.job_id, stamp, dir)?;
        tracing::info!(dir = %dir.display(), files = files.len(), "output streams saved");
        Ok((outputs, files))
    }

    /// Download every blob of `container` into `dir`
    pub fn download_container(&self, container: &str, dir: &Path) -> OrchestratorResult<Vec<PathBuf>> {
        fs::create_dir_all(dir)?;
        let store = self.store();
        let mut written = Vec::new();
        for blob in store.list_blobs(container)? {
            let path = dir.join(&blob.name);
            store.get_blob_to_path(container, &blob.name, &path)?;
            tracing::debug!(container, blob = %blob.name, path = %path.display(), "downloaded");
            written.push(path);
        }
        tracing::info!(container, blobs = written.len(), "container downloaded");
        Ok(written)
    }

    /// Delete the job, then the pool
    pub fn teardown(&self, job: &mut JobHandle, pool: &PoolHandle) -> OrchestratorResult<()> {
        if job.phase().is_torn_down() {
            return Err(job.wrong_phase("tear down"));
        }
        delete_job_and_pool(self.batch.as_ref(), &job.job_id, &pool.pool_id)?;
        job.phase.transition(JobPhase::TornDown, self.clock.now())?;
        Ok(())
    }

    /// Stage, provision, submit, wait, collect and optionally tear down
    ///
    /// Outputs are collected even when the wait times out or is cancelled.
    /// With `plan.teardown` the job and pool are deleted whatever the
    /// outcome, once the pool exists.
    pub fn execute(
        &self,
        plan: &ExecutionPlan,
        generator: &dyn TaskGenerator,
        log: &mut RunLog,
    ) -> OrchestratorResult<ExecutionReport> {
        let containers = &plan.settings.containers;
        for name in containers.all() {
            self.stager.ensure_container(name)?;
        }
        log.record(self.clock.now(), "containers_ready", json!({ "containers": containers.all() }));

        let task_resources = self.stager.upload_batch(&containers.tasks, &plan.task_files)?;
        let inputs = self.stage_inputs(plan)?;
        log.record(
            self.clock.now(),
            "inputs_staged",
            json!({
                "task_files": task_resources.iter().map(|r| &r.file_path).collect::<Vec<_>>(),
                "inputs": inputs.iter().map(|r| &r.file_path).collect::<Vec<_>>(),
            }),
        );

        let pool = self.provision(&plan.pool_config(task_resources)?)?;
        log.record(self.clock.now(), "pool_created", serde_json::to_value(&pool)?);

        let mut job = match self.submit_job(&pool, &JobConfig::new(&plan.job_id)) {
            Ok(job) => job,
            Err(e) => {
                if plan.teardown {
                    if let Err(pool_error) = self.batch.delete_pool(&pool.pool_id) {
                        tracing::warn!(pool = %pool.pool_id, error = %pool_error, "pool delete failed");
                    }
                }
                return Err(e);
            }
        };
        log.set_job(&job.job_id, &pool.pool_id);

        let outcome = self.run_tasks(plan, generator, &inputs, &pool, &mut job);
        log.record_statuses(job.last_statuses());
        log.record(
            self.clock.now(),
            "wait_finished",
            json!({ "phase": job.phase(), "tasks": job.tasks.len() }),
        );

        let mut outputs = TaskOutputs::new();
        let mut output_files = Vec::new();
        let mut collect_error = None;
        if job.phase().allows_output_collection() {
            let collected = match &plan.output_dir {
                Some(dir) => self.collect_outputs_to(&job, dir),
                None => self.collect_outputs(&job).map(|o| (o, Vec::new())),
            };
            match collected {
                Ok((o, files)) => {
                    outputs = o;
                    output_files = files;
                }
                Err(e) => collect_error = Some(e),
            }
            log.record_outputs(&outputs);
        }

        let mut teardown_error = None;
        if plan.teardown {
            match self.teardown(&mut job, &pool) {
                Ok(()) => log.record(self.clock.now(), "torn_down", json!({})),
                Err(e) => {
                    tracing::warn!(error = %e, "teardown failed");
                    teardown_error = Some(e);
                }
            }
        }

        let completion = outcome?;
        if let Some(e) = collect_error.or(teardown_error) {
            return Err(e);
        }
        Ok(ExecutionReport {
            pool,
            job,
            completion,
            outputs,
            output_files,
        })
    }

    fn stage_inputs(&self, plan: &ExecutionPlan) -> OrchestratorResult<Vec<ResourceFile>> {
        let container = &plan.settings.containers.inputs;
        let mut inputs = self.stager.upload_batch(container, &plan.inputs)?;
        if let Some(filter) = &plan.existing_inputs {
            for resource in self.stager.stage_existing(container, filter)? {
                if !inputs.iter().any(|i| i.file_path == resource.file_path) {
                    inputs.push(resource);
                }
            }
        }
        Ok(inputs)
    }

    fn job_context(&self, plan: &ExecutionPlan, pool: &PoolHandle) -> JobContext {
        let store = self.store();
        let settings = &plan.settings;
        let containers = &settings.containers;
        JobContext {
            job_id: plan.job_id.clone(),
            pool_id: pool.pool_id.clone(),
            task_file: settings.task.file.clone(),
            task_command: settings.task.command.clone(),
            storage_account: store.account_name().to_string(),
            storage_endpoint: store.endpoint().to_string(),
            containers: containers.clone(),
            input_token: self
                .stager
                .container_access_grant(&containers.inputs, Permissions::READ),
            output_token: self
                .stager
                .container_access_grant(&containers.outputs, Permissions::all()),
            logging_token: self
                .stager
                .container_access_grant(&containers.logs, Permissions::all()),
            dev: plan.dev,
            extras: settings.task.extra_params(),
        }
    }

    fn run_tasks(
        &self,
        plan: &ExecutionPlan,
        generator: &dyn TaskGenerator,
        inputs: &[ResourceFile],
        pool: &PoolHandle,
        job: &mut JobHandle,
    ) -> OrchestratorResult<CompletionReport> {
        let ctx = self.job_context(plan, pool);
        let tasks = generate_tasks(generator, inputs, &ctx, plan.settings.job.task_id_base)?;
        self.enqueue_tasks(job, &tasks)?;
        self.await_completion(job, plan.settings.job.timeout_config().timeout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::config::BuiltinDefaults;
    use crate::mock::{BatchOp, MemoryBatchService, MemoryBlobStore, TaskScript};

    struct Fixture {
        clock: Arc<FakeClock>,
        batch: Arc<MemoryBatchService>,
        orchestrator: Orchestrator,
    }

    fn fixture(batch: MemoryBatchService) -> Fixture {
        let clock = Arc::new(FakeClock::at_epoch_seconds(1_700_000_000));
        let batch = Arc::new(batch);
        let store = Arc::new(MemoryBlobStore::new("acct", "key", clock.clone()));
        let orchestrator = Orchestrator::new(batch.clone(), store, clock.clone())
            .with_poll_interval(Duration::from_secs(10));
        Fixture {
            clock,
            batch,
            orchestrator,
        }
    }

    fn selector(sku: &str) -> ImageSelector {
        ImageSelector {
            publisher: "canonical".to_string(),
            offer: "UbuntuServer".to_string(),
            sku: sku.to_string(),
        }
    }

    fn pool_config(id: &str) -> PoolConfig {
        PoolConfig {
            pool_id: id.to_string(),
            vm_size: "Standard_DS3_v2".to_string(),
            node_count: 2,
            platform: Platform::Linux,
            image: selector("16"),
            start_task: None,
        }
    }

    fn tasks(n: usize) -> Vec<TaskSpec> {
        (0..n)
            .map(|i| TaskSpec {
                id: format!("task{}", i),
                command_line: "true".to_string(),
                resource_files: vec![],
            })
            .collect()
    }

    fn submitted(f: &Fixture, n: usize) -> (PoolHandle, JobHandle) {
        let pool = f.orchestrator.provision(&pool_config("p_1")).unwrap();
        let mut job = f
            .orchestrator
            .submit_job(&pool, &JobConfig::new("j-1"))
            .unwrap();
        f.orchestrator.enqueue_tasks(&mut job, &tasks(n)).unwrap();
        (pool, job)
    }

    #[test]
    fn test_select_image_picks_latest_match() {
        let batch = MemoryBatchService::new();
        let skus = batch.list_node_agent_skus().unwrap();

        let (sku_id, image) = select_image(&skus, Platform::Linux, &selector("1")).unwrap();
        assert_eq!(sku_id, "batch.node.ubuntu 16.04");
        assert_eq!(image.sku, "16.04-LTS");

        let (_, image) = select_image(&skus, Platform::Linux, &selector("14")).unwrap();
        assert_eq!(image.sku, "14.04.5-LTS");

        assert!(select_image(&skus, Platform::Windows, &selector("16")).is_none());
        assert!(select_image(&skus, Platform::Linux, &selector("22")).is_none());
    }

    #[test]
    fn test_provision_without_matching_image() {
        let f = fixture(MemoryBatchService::new());
        let mut config = pool_config("p_1");
        config.image = selector("22");
        let err = f.orchestrator.provision(&config).unwrap_err();
        assert!(matches!(err, OrchestratorError::Provisioning { .. }));
        assert!(f.batch.pool_ids().is_empty());
    }

    #[test]
    fn test_provision_rejected_by_service() {
        let f = fixture(MemoryBatchService::new());
        f.batch.inject_error(BatchOp::AddPool, "quota exceeded");
        let err = f.orchestrator.provision(&pool_config("p_1")).unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
        assert_eq!(err.exit_code(), exit::PROVISIONING);
    }

    #[test]
    fn test_duplicate_job() {
        let f = fixture(MemoryBatchService::new());
        let pool = f.orchestrator.provision(&pool_config("p_1")).unwrap();
        f.orchestrator
            .submit_job(&pool, &JobConfig::new("j-1"))
            .unwrap();
        let err = f
            .orchestrator
            .submit_job(&pool, &JobConfig::new("j-1"))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateJob(id) if id == "j-1"));
    }

    #[test]
    fn test_partial_submission_names_rejected_ids() {
        let batch = MemoryBatchService::new();
        batch.reject_task("task1", "command too long");
        let f = fixture(batch);
        let pool = f.orchestrator.provision(&pool_config("p_1")).unwrap();
        let mut job = f
            .orchestrator
            .submit_job(&pool, &JobConfig::new("j-1"))
            .unwrap();

        let err = f.orchestrator.enqueue_tasks(&mut job, &tasks(3)).unwrap_err();
        match err {
            OrchestratorError::PartialSubmission { rejected, submitted, .. } => {
                assert_eq!(submitted, 3);
                assert_eq!(rejected.len(), 1);
                assert_eq!(rejected[0].task_id, "task1");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(job.task_ids(), ["task0", "task2"]);
    }

    #[test]
    fn test_await_completion_success() {
        let batch = MemoryBatchService::new().with_default_polls(3);
        let f = fixture(batch);
        let (_, mut job) = submitted(&f, 2);

        let report = f
            .orchestrator
            .await_completion(&mut job, Duration::from_secs(300))
            .unwrap();
        assert_eq!(report.polls, 3);
        assert_eq!(report.statuses.len(), 2);
        assert!(report.failed_tasks().is_empty());
        assert_eq!(report.elapsed, Duration::from_secs(20));
        assert_eq!(job.phase(), JobPhase::Completed);
    }

    #[test]
    fn test_await_completion_timeout_reports_exact_incomplete_set() {
        let batch = MemoryBatchService::new();
        batch.hold_task("task1");
        let f = fixture(batch);
        let (_, mut job) = submitted(&f, 3);

        let err = f
            .orchestrator
            .await_completion(&mut job, Duration::from_secs(60))
            .unwrap_err();
        let expected: BTreeSet<String> = ["task1".to_string()].into();
        assert_eq!(err.incomplete_tasks(), Some(&expected));
        assert_eq!(job.phase(), JobPhase::TimedOut);
        assert_eq!(f.clock.total_slept(), Duration::from_secs(60));
    }

    #[test]
    fn test_repoll_after_timeout_completes() {
        let batch = MemoryBatchService::new();
        batch.hold_task("task0");
        let f = fixture(batch);
        let (_, mut job) = submitted(&f, 1);

        assert!(f
            .orchestrator
            .await_completion(&mut job, Duration::from_secs(30))
            .is_err());
        assert_eq!(job.phase(), JobPhase::TimedOut);

        // Still held: stays timed out
        assert!(f
            .orchestrator
            .await_completion(&mut job, Duration::from_secs(30))
            .is_err());
        assert_eq!(job.phase(), JobPhase::TimedOut);

        f.batch.release_task("task0");
        f.orchestrator
            .await_completion(&mut job, Duration::from_secs(30))
            .unwrap();
        assert_eq!(job.phase(), JobPhase::Completed);
        assert!(!job
            .phase_history()
            .iter()
            .skip_while(|c| c.phase != JobPhase::TimedOut)
            .any(|c| c.phase == JobPhase::Polling));
    }

    #[test]
    fn test_list_failure_leaves_job_recoverable() {
        let batch = MemoryBatchService::new();
        batch.inject_error(BatchOp::ListTasks, "503 transient");
        let f = fixture(batch);
        let (_, mut job) = submitted(&f, 2);

        let err = f
            .orchestrator
            .await_completion(&mut job, Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Service(_)));
        assert_eq!(job.phase(), JobPhase::TimedOut);
        assert!(f.orchestrator.collect_outputs(&job).is_ok());

        f.batch.clear_failures();
        f.orchestrator
            .await_completion(&mut job, Duration::from_secs(60))
            .unwrap();
        assert_eq!(job.phase(), JobPhase::Completed);
    }

    #[test]
    fn test_cancelled_before_first_poll() {
        let f = fixture(MemoryBatchService::new());
        let (_, mut job) = submitted(&f, 2);
        f.orchestrator.cancel_token().cancel();

        let err = f
            .orchestrator
            .await_completion(&mut job, Duration::from_secs(60))
            .unwrap_err();
        assert_eq!(err.exit_code(), exit::CANCELLED);
        assert_eq!(err.incomplete_tasks().map(|s| s.len()), Some(2));
        assert_eq!(job.phase(), JobPhase::Cancelled);
    }

    #[test]
    fn test_collect_outputs_isolates_failures() {
        let batch = MemoryBatchService::new();
        batch.script_task("task1", TaskScript::succeed_after(1).with_stdout(vec![0xc3, 0x28]));
        let f = fixture(batch);
        let (_, mut job) = submitted(&f, 3);

        assert!(matches!(
            f.orchestrator.collect_outputs(&job),
            Err(OrchestratorError::WrongPhase { .. })
        ));

        f.orchestrator
            .await_completion(&mut job, Duration::from_secs(60))
            .unwrap();
        let outputs = f.orchestrator.collect_outputs(&job).unwrap();
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs["task0"].stdout.as_deref().unwrap(), "task0 finished\n");
        assert!(matches!(outputs["task1"].stdout, Err(OutputError::Decode { .. })));
        assert!(outputs["task1"].stderr.is_ok());
        assert!(outputs["task2"].is_complete());
    }

    #[test]
    fn test_teardown_attempts_pool_after_job_failure() {
        let f = fixture(MemoryBatchService::new());
        let (pool, mut job) = submitted(&f, 1);
        f.batch.inject_error(BatchOp::DeleteJob, "busy");

        let err = f.orchestrator.teardown(&mut job, &pool).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Teardown {
                job_error: Some(_),
                pool_error: None,
                ..
            }
        ));
        assert_eq!(f.batch.deleted_pools(), vec!["p_1"]);
        assert_ne!(job.phase(), JobPhase::TornDown);
    }

    #[test]
    fn test_teardown_once() {
        let f = fixture(MemoryBatchService::new());
        let (pool, mut job) = submitted(&f, 1);
        f.orchestrator.teardown(&mut job, &pool).unwrap();
        assert_eq!(job.phase(), JobPhase::TornDown);
        assert_eq!(f.batch.deleted_jobs(), vec!["j-1"]);
        assert!(f.orchestrator.teardown(&mut job, &pool).is_err());
    }

    #[test]
    fn test_pool_config_start_task() {
        let settings = Settings::from_value(&BuiltinDefaults::default().to_value()).unwrap();
        let plan = ExecutionPlan::new("j-1", "p_1", settings);
        let config = plan.pool_config(vec![]).unwrap();
        let start = config.start_task.unwrap();
        assert_eq!(
            start.command_line,
            "/bin/bash -c 'set -e; set -o pipefail; cp -p batchlane-task $AZ_BATCH_NODE_SHARED_DIR;chmod +x $AZ_BATCH_NODE_SHARED_DIR/batchlane-task; wait'"
        );
        assert!(start.wait_for_success);
        assert_eq!(config.node_count, 1);
    }
}
