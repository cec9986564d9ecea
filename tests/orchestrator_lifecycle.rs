//! Full submit cycle against the in-memory services
//!
//! Stage, provision, submit, wait, collect and tear down with a fake clock,
//! so every wait is instantaneous and every sleep is recorded.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use batchlane::config::{BuiltinDefaults, Settings};
use batchlane::mock::{BatchOp, MemoryBatchService, MemoryBlobStore};
use batchlane::orchestrator::{exit, ExecutionPlan, JobPhase, Orchestrator, OrchestratorError};
use batchlane::runlog::{RunLog, RunStatus};
use batchlane::service::BlobStore;
use batchlane::stager::BlobFilter;
use batchlane::taskgen::TemplateTaskGenerator;
use batchlane::{Clock, FakeClock};

struct Harness {
    dir: TempDir,
    clock: Arc<FakeClock>,
    batch: Arc<MemoryBatchService>,
    store: Arc<MemoryBlobStore>,
    orchestrator: Orchestrator,
    settings: Settings,
}

impl Harness {
    fn new(batch: MemoryBatchService) -> Self {
        let settings = Settings::from_value(&BuiltinDefaults::default().to_value()).unwrap();
        let clock = Arc::new(FakeClock::at_epoch_seconds(1_700_000_000));
        let batch = Arc::new(batch);
        let store = Arc::new(MemoryBlobStore::new("acct", "key", clock.clone()));
        let orchestrator =
            Orchestrator::from_settings(batch.clone(), store.clone(), clock.clone(), &settings);
        Self {
            dir: TempDir::new().unwrap(),
            clock,
            batch,
            store,
            orchestrator,
            settings,
        }
    }

    fn file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn plan(&self, inputs: &[&str]) -> ExecutionPlan {
        let mut plan = ExecutionPlan::new("states-1", "states_1", self.settings.clone());
        plan.task_files = vec![self.file("batchlane-task", "#!/bin/sh\n")];
        plan.inputs = inputs
            .iter()
            .map(|name| self.file(name, "id,latitude,longitude\n1,41.0,-72.0\n"))
            .collect();
        plan.output_dir = Some(self.dir.path().join("out"));
        plan.teardown = true;
        plan
    }

    fn generator(&self) -> TemplateTaskGenerator {
        TemplateTaskGenerator::new(self.settings.pool.platform, self.settings.task.template.clone())
    }
}

#[test]
fn test_execute_happy_path() {
    let h = Harness::new(MemoryBatchService::new().with_default_polls(2));
    let plan = h.plan(&["ct.csv", "fl.csv", "nc.csv"]);
    let mut log = RunLog::new(h.clock.now());

    let report = h.orchestrator.execute(&plan, &h.generator(), &mut log).unwrap();

    // One task per input, in input order, each carrying its own input
    let tasks = h.batch.submitted_tasks("states-1");
    let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, ["task0", "task1", "task2"]);
    for (task, input) in tasks.iter().zip(["ct.csv", "fl.csv", "nc.csv"]) {
        assert_eq!(task.resource_files.len(), 1);
        assert_eq!(task.resource_files[0].file_path, input);
        assert!(task.command_line.starts_with("/bin/bash -c '"));
        assert!(task.command_line.contains(&format!("--filepath {}", input)));
    }

    let staged: Vec<String> = h
        .store
        .list_blobs(&h.settings.containers.inputs)
        .unwrap()
        .into_iter()
        .map(|b| b.name)
        .collect();
    assert_eq!(staged, ["ct.csv", "fl.csv", "nc.csv"]);

    assert_eq!(report.completion.statuses.len(), 3);
    assert!(report.completion.failed_tasks().is_empty());
    assert_eq!(report.outputs["task1"].stdout.as_deref().unwrap(), "task1 finished\n");
    assert_eq!(report.output_files.len(), 6);
    assert!(report.output_files.iter().all(|p| p.exists()));

    assert_eq!(report.job.phase(), JobPhase::TornDown);
    assert_eq!(h.batch.deleted_jobs(), ["states-1"]);
    assert_eq!(h.batch.deleted_pools(), ["states_1"]);

    let kinds: Vec<&str> = log.events.iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(
        kinds,
        ["containers_ready", "inputs_staged", "pool_created", "wait_finished", "torn_down"]
    );
    assert_eq!(log.job_id.as_deref(), Some("states-1"));
    assert_eq!(log.tasks.len(), 3);
}

#[test]
fn test_execute_timeout_still_collects_and_tears_down() {
    let batch = MemoryBatchService::new();
    batch.hold_task("task1");
    let mut h = Harness::new(batch);
    h.settings.job.timeout_minutes = 1;
    let plan = h.plan(&["ct.csv", "fl.csv"]);
    let mut log = RunLog::new(h.clock.now());

    let err = h.orchestrator.execute(&plan, &h.generator(), &mut log).unwrap_err();

    let expected: BTreeSet<String> = ["task1".to_string()].into();
    assert_eq!(err.incomplete_tasks(), Some(&expected));
    assert_eq!(err.exit_code(), exit::TIMEOUT);
    assert_eq!(h.clock.total_slept(), Duration::from_secs(60));

    // Outputs were collected before teardown
    assert!(log.tasks["task0"].stdout_bytes.is_some());
    assert_eq!(h.batch.deleted_pools(), ["states_1"]);

    log.finish(h.clock.now(), Err(&err));
    assert_eq!(log.status, RunStatus::TimedOut);
    assert_eq!(log.exit_code, Some(exit::TIMEOUT));
}

#[test]
fn test_job_submit_failure_removes_pool() {
    let batch = MemoryBatchService::new();
    batch.inject_error(BatchOp::AddJob, "service busy");
    let h = Harness::new(batch);
    let plan = h.plan(&["ct.csv"]);
    let mut log = RunLog::new(h.clock.now());

    let err = h.orchestrator.execute(&plan, &h.generator(), &mut log).unwrap_err();
    assert!(matches!(err, OrchestratorError::Service(_)));
    assert_eq!(h.batch.deleted_pools(), ["states_1"]);
    assert!(h.batch.job_ids().is_empty());
}

#[test]
fn test_existing_inputs_follow_uploaded_ones() {
    let h = Harness::new(MemoryBatchService::new());
    let inputs = h.settings.containers.inputs.clone();
    h.store.create_container(&inputs, false).unwrap();
    h.store.put_blob_from_text(&inputs, "tx.csv", "id\n").unwrap();
    h.store.put_blob_from_text(&inputs, "notes.txt", "skip me").unwrap();

    let mut plan = h.plan(&["ct.csv"]);
    plan.existing_inputs = Some(BlobFilter::Suffix(".csv".to_string()));
    let mut log = RunLog::new(h.clock.now());
    h.orchestrator.execute(&plan, &h.generator(), &mut log).unwrap();

    let files: Vec<String> = h
        .batch
        .submitted_tasks("states-1")
        .into_iter()
        .map(|t| t.resource_files[0].file_path.clone())
        .collect();
    assert_eq!(files, ["ct.csv", "tx.csv"]);
}

#[test]
fn test_task_ids_can_start_at_one() {
    let mut h = Harness::new(MemoryBatchService::new());
    h.settings.job.task_id_base = 1;
    let plan = h.plan(&["ct.csv", "fl.csv"]);
    let mut log = RunLog::new(h.clock.now());
    h.orchestrator.execute(&plan, &h.generator(), &mut log).unwrap();

    let ids: Vec<String> = h
        .batch
        .submitted_tasks("states-1")
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ids, ["task1", "task2"]);
}

#[test]
fn test_keep_pool_without_teardown() {
    let h = Harness::new(MemoryBatchService::new());
    let mut plan = h.plan(&["ct.csv"]);
    plan.teardown = false;
    let mut log = RunLog::new(h.clock.now());

    let mut report = h.orchestrator.execute(&plan, &h.generator(), &mut log).unwrap();
    assert_eq!(report.job.phase(), JobPhase::Completed);
    assert!(h.batch.deleted_pools().is_empty());

    // A later explicit teardown still works
    h.orchestrator.teardown(&mut report.job, &report.pool).unwrap();
    assert_eq!(h.batch.deleted_jobs(), ["states-1"]);
}
