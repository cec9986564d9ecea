//! Task generation
//!
//! A [`TaskGenerator`] maps one staged input plus the job context to the
//! command line of the task that processes it. [`generate_tasks`] applies a
//! generator to every input and assigns ids `task<base + i>`, so task order
//! always follows input order and each task carries exactly its own input as
//! a resource file.

use crate::command::{build_command, CommandError, CommandTemplate, Platform, TaskParams};
use crate::config::ContainerSettings;
use crate::ids;
use crate::service::batch::{ResourceFile, TaskSpec};

/// Everything a generator may put on a command line besides the input itself
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub pool_id: String,
    pub task_file: String,
    pub task_command: String,
    pub storage_account: String,
    pub storage_endpoint: String,
    pub containers: ContainerSettings,
    pub input_token: String,
    pub output_token: String,
    pub logging_token: String,
    pub dev: bool,
    /// Free-form parameters from configuration
    pub extras: TaskParams,
}

impl JobContext {
    /// Parameters shared by every task of the job
    pub fn base_params(&self) -> TaskParams {
        let mut params = TaskParams::new()
            .set("job_id", &self.job_id)
            .set("pool_id", &self.pool_id)
            .set("task_file", &self.task_file)
            .set("task_command", &self.task_command)
            .set("storage_account", &self.storage_account)
            .set("storage_endpoint", &self.storage_endpoint)
            .set("input_container", &self.containers.inputs)
            .set("input_token", &self.input_token)
            .set("output_container", &self.containers.outputs)
            .set("output_token", &self.output_token)
            .set("logging_container", &self.containers.logs)
            .set("logging_token", &self.logging_token)
            .set("dev", self.dev);
        params.extend(&self.extras);
        params
    }
}

/// Maps one input to the command line of its task
pub trait TaskGenerator {
    /// `index` is the input's position, starting at 0
    fn command_line(
        &self,
        input: &ResourceFile,
        index: usize,
        ctx: &JobContext,
    ) -> Result<String, CommandError>;
}

impl<F> TaskGenerator for F
where
    F: Fn(&ResourceFile, usize, &JobContext) -> Result<String, CommandError>,
{
    fn command_line(
        &self,
        input: &ResourceFile,
        index: usize,
        ctx: &JobContext,
    ) -> Result<String, CommandError> {
        self(input, index, ctx)
    }
}

/// Renders one template per task, adding `file_path` and `idx`
#[derive(Debug, Clone)]
pub struct TemplateTaskGenerator {
    platform: Platform,
    template: CommandTemplate,
}

impl TemplateTaskGenerator {
    pub fn new(platform: Platform, template: CommandTemplate) -> Self {
        Self { platform, template }
    }
}

impl TaskGenerator for TemplateTaskGenerator {
    fn command_line(
        &self,
        input: &ResourceFile,
        index: usize,
        ctx: &JobContext,
    ) -> Result<String, CommandError> {
        let params = ctx
            .base_params()
            .set("file_path", &input.file_path)
            .set("idx", index);
        build_command(self.platform.as_str(), &self.template, &params)
    }
}

/// One task per input, ids `task<base>..`, in input order
pub fn generate_tasks(
    generator: &dyn TaskGenerator,
    inputs: &[ResourceFile],
    ctx: &JobContext,
    base: usize,
) -> Result<Vec<TaskSpec>, CommandError> {
    inputs
        .iter()
        .enumerate()
        .map(|(i, input)| {
            Ok(TaskSpec {
                id: ids::task_id(base, i),
                command_line: generator.command_line(input, i, ctx)?,
                resource_files: vec![input.clone()],
            })
        })
        .collect()
}
