//! Built-in defaults (layer 1)

use serde::{Deserialize, Serialize};

/// Shell template every generated task runs
pub const DEFAULT_TASK_TEMPLATE: &str = "$AZ_BATCH_NODE_SHARED_DIR/{task_file} {task_command} \
--filepath {file_path} --storage-account {storage_account} --storage-endpoint {storage_endpoint} \
--output-container {output_container} --output-token {output_token} \
--logging-container {logging_container} --logging-token {logging_token} --idx {idx} --dev {dev}";

/// Built-in default configuration values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinDefaults {
    /// Job budget in minutes (default: 30)
    pub timeout_minutes: u64,

    /// Delay between completion polls (default: 10)
    pub poll_interval_seconds: u64,

    /// First task number, 0 or 1 (default: 0)
    pub task_id_base: usize,

    /// Pool size (default: 1)
    pub node_count: u32,

    /// Node VM size (default: "Standard_DS3_v2")
    pub vm_size: String,

    pub image_publisher: String,
    pub image_offer: String,
    /// Matched as a prefix of the image sku (default: "16")
    pub image_sku: String,

    /// Node OS shell family (default: "linux")
    pub platform: String,

    /// Commands run once per node before any task
    pub start_task_commands: Vec<String>,

    pub task_template: String,

    /// Task binary uploaded to the task container
    pub task_file: String,

    /// Subcommand the task binary runs
    pub task_command: String,

    pub container_tasks: String,
    pub container_inputs: String,
    pub container_outputs: String,
    pub container_logs: String,

    /// Access-grant lifetime (default: 120)
    pub grant_ttl_minutes: u64,

    /// Added to the job timeout when that outlives the ttl (default: 15)
    pub grant_margin_minutes: u64,

    /// Where task output streams are saved (default: "tmp")
    pub output_dir: String,

    /// Service backend, "local" or "memory" (default: "local")
    pub backend: String,

    /// Local emulator state directory (default: ".batchlane")
    pub local_root: String,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            timeout_minutes: 30,
            poll_interval_seconds: 10,
            task_id_base: 0,
            node_count: 1,
            vm_size: "Standard_DS3_v2".to_string(),
            image_publisher: "Canonical".to_string(),
            image_offer: "UbuntuServer".to_string(),
            image_sku: "16".to_string(),
            platform: "linux".to_string(),
            start_task_commands: vec![
                "cp -p {task_file} $AZ_BATCH_NODE_SHARED_DIR".to_string(),
                "chmod +x $AZ_BATCH_NODE_SHARED_DIR/{task_file}".to_string(),
            ],
            task_template: DEFAULT_TASK_TEMPLATE.to_string(),
            task_file: "batchlane-task".to_string(),
            task_command: "state-center".to_string(),
            container_tasks: "batchtask".to_string(),
            container_inputs: "batchcsv".to_string(),
            container_outputs: "batchlog".to_string(),
            container_logs: "batchlog".to_string(),
            grant_ttl_minutes: 120,
            grant_margin_minutes: 15,
            output_dir: "tmp".to_string(),
            backend: "local".to_string(),
            local_root: ".batchlane".to_string(),
        }
    }
}

impl BuiltinDefaults {
    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "job": {
                "timeout_minutes": self.timeout_minutes,
                "poll_interval_seconds": self.poll_interval_seconds,
                "task_id_base": self.task_id_base,
            },
            "pool": {
                "node_count": self.node_count,
                "vm_size": self.vm_size,
                "platform": self.platform,
                "image": {
                    "publisher": self.image_publisher,
                    "offer": self.image_offer,
                    "sku": self.image_sku,
                },
                "start_task": self.start_task_commands,
            },
            "task": {
                "template": self.task_template,
                "file": self.task_file,
                "command": self.task_command,
                "extras": {},
            },
            "containers": {
                "tasks": self.container_tasks,
                "inputs": self.container_inputs,
                "outputs": self.container_outputs,
                "logs": self.container_logs,
            },
            "grants": {
                "ttl_minutes": self.grant_ttl_minutes,
                "margin_minutes": self.grant_margin_minutes,
            },
            "output": {
                "dir": self.output_dir,
            },
            "backend": {
                "kind": self.backend,
                "root": self.local_root,
            },
        })
    }
}
