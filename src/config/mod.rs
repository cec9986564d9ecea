//! Configuration
//!
//! Settings are merged from four layers:
//! 1. Built-in defaults
//! 2. Host/user config (~/.config/batchlane/config.toml)
//! 3. Repo config (./batchlane.toml)
//! 4. CLI overrides (`--set dotted.key=value` and dedicated flags)
//!
//! Service credentials never live in these files; they come from the
//! environment through [`Credentials`].

mod credentials;
mod defaults;
mod effective;
mod merge;
mod settings;

pub use credentials::{
    env_listing, Credentials, DocDbCredentials, EnvEntry, OPTIONAL_VARS, REQUIRED_VARS,
};
pub use defaults::{BuiltinDefaults, DEFAULT_TASK_TEMPLATE};
pub use effective::{
    host_config_path, is_secret_key, ConfigError, ConfigOrigin, ConfigSource, EffectiveConfig,
    REPO_CONFIG_FILE,
};
pub use merge::{deep_merge, merge_layers, overlay_from_assignments, parse_assignment, set_path};
pub use settings::{
    BackendKind, BackendSettings, ContainerSettings, GrantSettings, ImageSelector, JobSettings,
    OutputSettings, PoolSettings, Settings, TaskSettings,
};
