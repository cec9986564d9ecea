//! Service credentials from the environment
//!
//! Read once at startup. Every required variable is checked before any
//! remote call so a half-configured shell fails with the full list of what
//! is missing.

use std::fmt;

use super::effective::{is_secret_key, ConfigError};

pub const BATCH_ACCOUNT: &str = "AZURE_BATCH_ACCOUNT";
pub const BATCH_KEY: &str = "AZURE_BATCH_KEY";
pub const BATCH_URL: &str = "AZURE_BATCH_URL";
pub const STORAGE_ACCOUNT: &str = "AZURE_STORAGE_ACCOUNT";
pub const STORAGE_KEY: &str = "AZURE_STORAGE_KEY";
pub const DOCDB_URI: &str = "AZURE_COSMOSDB_DOCDB_URI";
pub const DOCDB_KEY: &str = "AZURE_COSMOSDB_DOCDB_KEY";

pub const REQUIRED_VARS: &[&str] = &[
    BATCH_ACCOUNT,
    BATCH_KEY,
    BATCH_URL,
    STORAGE_ACCOUNT,
    STORAGE_KEY,
];

pub const OPTIONAL_VARS: &[&str] = &[DOCDB_URI, DOCDB_KEY];

#[derive(Clone, PartialEq, Eq)]
pub struct DocDbCredentials {
    pub uri: String,
    pub key: String,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub batch_account: String,
    pub batch_key: String,
    pub batch_url: String,
    pub storage_account: String,
    pub storage_key: String,
    /// Present only when both document-db variables are set
    pub docdb: Option<DocDbCredentials>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("batch_account", &self.batch_account)
            .field("batch_key", &"<redacted>")
            .field("batch_url", &self.batch_url)
            .field("storage_account", &self.storage_account)
            .field("storage_key", &"<redacted>")
            .field("docdb_uri", &self.docdb.as_ref().map(|d| d.uri.as_str()))
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read credentials through `lookup`; empty values count as missing
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let missing: Vec<String> = REQUIRED_VARS
            .iter()
            .filter(|name| get(name).is_none())
            .map(|name| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingEnv(missing));
        }

        let required = |name: &str| get(name).unwrap_or_default();
        let docdb = match (get(DOCDB_URI), get(DOCDB_KEY)) {
            (Some(uri), Some(key)) => Some(DocDbCredentials { uri, key }),
            _ => None,
        };

        Ok(Self {
            batch_account: required(BATCH_ACCOUNT),
            batch_key: required(BATCH_KEY),
            batch_url: required(BATCH_URL),
            storage_account: required(STORAGE_ACCOUNT),
            storage_key: required(STORAGE_KEY),
            docdb,
        })
    }

    /// Document-db credentials, or an error naming the missing variables
    pub fn require_docdb(&self) -> Result<&DocDbCredentials, ConfigError> {
        self.docdb
            .as_ref()
            .ok_or_else(|| ConfigError::MissingEnv(OPTIONAL_VARS.iter().map(|s| s.to_string()).collect()))
    }
}

/// One line of `batchlane env` output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvEntry {
    pub name: String,
    pub value: Option<String>,
}

impl EnvEntry {
    /// `export NAME=value`, secrets masked unless `reveal`
    pub fn render(&self, reveal: bool) -> String {
        match &self.value {
            None => format!("# {} is not set", self.name),
            Some(_) if is_secret_key(&self.name) && !reveal => {
                format!("export {}='<redacted>'", self.name)
            }
            Some(v) => format!("export {}='{}'", self.name, v.replace('\'', r"'\''")),
        }
    }
}

/// Required then optional variables with their current values
pub fn env_listing<F>(lookup: F) -> Vec<EnvEntry>
where
    F: Fn(&str) -> Option<String>,
{
    REQUIRED_VARS
        .iter()
        .chain(OPTIONAL_VARS)
        .map(|name| EnvEntry {
            name: name.to_string(),
            value: lookup(name),
        })
        .collect()
}
