//! Effective configuration with provenance
//!
//! Captures the merged configuration plus where each layer came from. The
//! serialized form has secrets redacted; typed [`Settings`] are read from the
//! unredacted merge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use super::defaults::BuiltinDefaults;
use super::merge::merge_layers;
use super::settings::Settings;

pub const SCHEMA_VERSION: u32 = 1;

pub const SCHEMA_ID: &str = "batchlane/effective_config@1";

/// Repo-level config file name, looked up in the working directory
pub const REPO_CONFIG_FILE: &str = "batchlane.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    Host,
    Repo,
    Cli,
}

/// A contributing config source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    /// File path (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 of the raw file bytes (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub schema_version: u32,

    pub schema_id: String,

    pub created_at: DateTime<Utc>,

    /// Job the config was used for (set once known)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    /// Merged configuration, secrets redacted
    pub config: Value,

    /// Contributing sources in precedence order
    pub sources: Vec<ConfigSource>,

    /// Redacted key paths
    pub redactions: Vec<String>,

    #[serde(skip)]
    resolved: Value,
}

/// Key fragments whose values are never written out
const SECRET_KEYS: &[&str] = &["key", "token", "secret", "password", "credential"];

/// `$XDG_CONFIG_HOME/batchlane/config.toml`, falling back to `~/.config`
pub fn host_config_path() -> Option<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(xdg).join("batchlane").join("config.toml"));
    }
    std::env::var_os("HOME")
        .filter(|v| !v.is_empty())
        .map(|home| PathBuf::from(home).join(".config").join("batchlane").join("config.toml"))
}

impl EffectiveConfig {
    /// Merge built-in defaults, host file, repo file and CLI overrides
    ///
    /// Missing files are skipped; unreadable or invalid ones are errors.
    pub fn build(
        host_config_path: Option<&Path>,
        repo_config_path: Option<&Path>,
        cli_overrides: Option<Value>,
    ) -> Result<Self, ConfigError> {
        let mut layers = Vec::new();
        let mut sources = Vec::new();

        layers.push(BuiltinDefaults::default().to_value());
        sources.push(ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        });

        for (origin, path) in [
            (ConfigOrigin::Host, host_config_path),
            (ConfigOrigin::Repo, repo_config_path),
        ] {
            let Some(path) = path.filter(|p| p.exists()) else {
                continue;
            };
            let (value, digest) = Self::load_toml_file(path)?;
            tracing::debug!(origin = ?origin, path = %path.display(), "loaded config layer");
            layers.push(value);
            sources.push(ConfigSource {
                origin,
                path: Some(path.to_string_lossy().to_string()),
                digest: Some(digest),
            });
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let resolved = merge_layers(layers);
        Settings::from_value(&resolved)?.validate()?;

        let mut config = resolved.clone();
        let redactions = Self::redact_secrets(&mut config);

        Ok(Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            job_id: None,
            config,
            sources,
            redactions,
            resolved,
        })
    }

    /// Typed settings from the unredacted merge
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        Settings::from_value(&self.resolved)
    }

    fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
        let bytes = fs::read(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;

        let digest = hex::encode(Sha256::digest(&bytes));

        let contents = String::from_utf8(bytes)
            .map_err(|e| ConfigError::ParseError(format!("{}: invalid UTF-8: {}", path.display(), e)))?;

        let toml_value: toml::Value = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))?;

        Ok((Self::toml_to_json(toml_value), digest))
    }

    fn toml_to_json(toml: toml::Value) -> Value {
        match toml {
            toml::Value::String(s) => Value::String(s),
            toml::Value::Integer(i) => Value::Number(i.into()),
            toml::Value::Float(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            toml::Value::Boolean(b) => Value::Bool(b),
            toml::Value::Datetime(dt) => Value::String(dt.to_string()),
            toml::Value::Array(arr) => Value::Array(arr.into_iter().map(Self::toml_to_json).collect()),
            toml::Value::Table(table) => Value::Object(
                table
                    .into_iter()
                    .map(|(k, v)| (k, Self::toml_to_json(v)))
                    .collect(),
            ),
        }
    }

    fn redact_secrets(value: &mut Value) -> Vec<String> {
        let mut redactions = Vec::new();
        Self::redact_recursive(value, String::new(), &mut redactions);
        redactions
    }

    fn redact_recursive(value: &mut Value, path: String, redactions: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    let current_path = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", path, key)
                    };

                    if is_secret_key(key) && !val.is_object() && !val.is_array() {
                        *val = Value::String("[REDACTED]".to_string());
                        redactions.push(current_path);
                    } else {
                        Self::redact_recursive(val, current_path, redactions);
                    }
                }
            }
            Value::Array(arr) => {
                for (i, val) in arr.iter_mut().enumerate() {
                    Self::redact_recursive(val, format!("{}[{}]", path, i), redactions);
                }
            }
            _ => {}
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Redacted value at a dotted path
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current = &self.config;
        for part in path.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    pub fn get_u64(&self, path: &str) -> Option<u64> {
        self.get(path).and_then(Value::as_u64)
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }
}

/// Whether a config or environment key names a secret
///
/// Matches on underscore-separated words so `task_id_base` is not caught by
/// `key` while `storage_key` and `AZURE_BATCH_KEY` are.
pub fn is_secret_key(key: &str) -> bool {
    key.to_ascii_lowercase()
        .split(|c: char| c == '_' || c == '-' || c == '.')
        .any(|word| SECRET_KEYS.contains(&word))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("invalid override '{0}': expected dotted.key=value")]
    InvalidOverride(String),

    #[error("missing required environment variables: {}", .0.join(", "))]
    MissingEnv(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_build_with_defaults_only() {
        let config = EffectiveConfig::build(None, None, None).unwrap();

        assert_eq!(config.schema_version, SCHEMA_VERSION);
        assert_eq!(config.get_u64("job.timeout_minutes"), Some(30));
        assert_eq!(config.get_str("containers.tasks"), Some("batchtask"));
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].origin, ConfigOrigin::Builtin);
    }

    #[test]
    fn test_cli_override_wins() {
        let cli = serde_json::json!({"job": {"timeout_minutes": 5}});
        let config = EffectiveConfig::build(None, None, Some(cli)).unwrap();

        assert_eq!(config.get_u64("job.timeout_minutes"), Some(5));
        assert_eq!(config.settings().unwrap().job.timeout_minutes, 5);
        assert_eq!(config.sources.last().unwrap().origin, ConfigOrigin::Cli);
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let cli = serde_json::json!({"job": {"timeout_minutes": 0}});
        let err = EffectiveConfig::build(None, None, Some(cli)).unwrap_err();
        assert!(err.to_string().contains("timeout_minutes"));
    }

    #[test]
    fn test_secret_redaction_keeps_settings_usable() {
        let cli = serde_json::json!({
            "task": {"extras": {"docdb_key": "s3cr3t", "state": "ct"}}
        });
        let config = EffectiveConfig::build(None, None, Some(cli)).unwrap();

        assert_eq!(config.get_str("task.extras.docdb_key"), Some("[REDACTED]"));
        assert_eq!(config.get_str("task.extras.state"), Some("ct"));
        assert!(config.redactions.contains(&"task.extras.docdb_key".to_string()));

        let settings = config.settings().unwrap();
        assert_eq!(settings.task.extras["docdb_key"], "s3cr3t");
        assert!(!config.to_json().unwrap().contains("s3cr3t"));
    }

    #[test]
    fn test_secret_key_matching() {
        assert!(is_secret_key("AZURE_BATCH_KEY"));
        assert!(is_secret_key("output_token"));
        assert!(!is_secret_key("task_id_base"));
        assert!(!is_secret_key("keyboard"));
    }

    #[test]
    fn test_host_and_repo_layers() {
        let mut host = NamedTempFile::new().unwrap();
        writeln!(host, "[job]").unwrap();
        writeln!(host, "timeout_minutes = 90").unwrap();
        writeln!(host, "poll_interval_seconds = 5").unwrap();

        let mut repo = NamedTempFile::new().unwrap();
        writeln!(repo, "[job]").unwrap();
        writeln!(repo, "timeout_minutes = 45").unwrap();
        writeln!(repo, "[containers]").unwrap();
        writeln!(repo, "inputs = \"zips\"").unwrap();

        let config = EffectiveConfig::build(Some(host.path()), Some(repo.path()), None).unwrap();

        assert_eq!(config.get_u64("job.timeout_minutes"), Some(45));
        assert_eq!(config.get_u64("job.poll_interval_seconds"), Some(5));
        assert_eq!(config.get_str("containers.inputs"), Some("zips"));
        assert_eq!(config.sources.len(), 3);
        assert_eq!(config.sources[2].origin, ConfigOrigin::Repo);
        assert_eq!(config.sources[1].digest.as_ref().unwrap().len(), 64);
    }

    #[test]
    fn test_missing_files_are_skipped() {
        let config = EffectiveConfig::build(
            Some(Path::new("/nonexistent/batchlane/config.toml")),
            None,
            None,
        )
        .unwrap();
        assert_eq!(config.sources.len(), 1);
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let mut repo = NamedTempFile::new().unwrap();
        writeln!(repo, "[job").unwrap();
        let err = EffectiveConfig::build(None, Some(repo.path()), None).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_resolved_not_serialized() {
        let config = EffectiveConfig::build(None, None, None)
            .unwrap()
            .with_job_id("states-1");
        let json: Value = serde_json::from_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(json["job_id"], "states-1");
        assert!(json.get("resolved").is_none());
    }
}
