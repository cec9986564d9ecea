//! batchlane - batch job orchestration over compute, blob and document services
//!
//! Stages task scripts and inputs in blob storage, provisions a compute pool,
//! runs one task per input, waits for completion and collects the results.
//! The services are traits; `mock` holds in-memory doubles and `local` an
//! emulator that runs everything on one machine.

pub mod clock;
pub mod command;
pub mod config;
pub mod grant;
pub mod ids;
pub mod local;
pub mod logging;
pub mod mock;
pub mod orchestrator;
pub mod runlog;
pub mod service;
pub mod signal;
pub mod stager;
pub mod taskgen;
pub mod timeout;

pub use clock::{Clock, FakeClock, SystemClock};
pub use command::{build_command, wrap_commands_in_shell, CommandError, CommandTemplate, Platform, TaskParams};
pub use config::{Credentials, EffectiveConfig, Settings};
pub use grant::{AccessGrant, GrantError, GrantSigner, Permissions};
pub use orchestrator::{
    ExecutionPlan, ExecutionReport, JobHandle, JobPhase, Orchestrator, OrchestratorError, PoolHandle,
};
pub use runlog::RunLog;
pub use service::{BatchService, BlobStore, DocumentStore};
pub use signal::{CancelToken, SignalHandler};
pub use stager::{BlobFilter, ResourceStager};
pub use taskgen::{generate_tasks, JobContext, TaskGenerator, TemplateTaskGenerator};
