//! Blob-storage service contract
//!
//! Backends implement the raw container/blob operations plus
//! [`BlobStore::endpoint`], [`BlobStore::signer`] and [`BlobStore::clock`];
//! grant-authorized access, URL building and file helpers are provided
//! methods shared by every backend.

use std::fs;
use std::io;
use std::path::Path;
use std::string::FromUtf8Error;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::grant::{AccessGrant, GrantError, GrantSigner, Permissions};

/// One entry of a container listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobItem {
    pub name: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("container already exists: {0}")]
    ContainerExists(String),

    #[error("blob not found: {container}/{blob}")]
    BlobNotFound { container: String, blob: String },

    #[error("invalid name '{0}'")]
    InvalidName(String),

    #[error("invalid blob URL '{0}'")]
    InvalidUrl(String),

    #[error("authorization failed: {0}")]
    Authorization(#[from] GrantError),

    #[error("blob {container}/{blob} is not valid UTF-8: {source}")]
    Decode {
        container: String,
        blob: String,
        #[source]
        source: FromUtf8Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// True when the presented grant had expired
    pub fn is_authorization_expired(&self) -> bool {
        matches!(self, StorageError::Authorization(e) if e.is_expired())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Parsed `<endpoint>/<container>/<blob>?<token>` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobUrl {
    pub endpoint: String,
    pub container: String,
    pub blob: String,
    pub token: Option<String>,
}

impl BlobUrl {
    pub fn parse(url: &str) -> StorageResult<Self> {
        let (path, token) = match url.split_once('?') {
            Some((p, t)) => (p, Some(t.to_string())),
            None => (url, None),
        };

        let (rest, blob) = path
            .rsplit_once('/')
            .ok_or_else(|| StorageError::InvalidUrl(url.to_string()))?;
        let (endpoint, container) = rest
            .rsplit_once('/')
            .ok_or_else(|| StorageError::InvalidUrl(url.to_string()))?;

        if endpoint.is_empty() || container.is_empty() || blob.is_empty() {
            return Err(StorageError::InvalidUrl(url.to_string()));
        }

        Ok(Self {
            endpoint: endpoint.to_string(),
            container: container.to_string(),
            blob: blob.to_string(),
            token,
        })
    }
}

/// Reject names that would escape a container or collide with metadata
pub fn validate_name(name: &str) -> StorageResult<()> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('?')
        || name.contains("..");
    if bad {
        Err(StorageError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

/// Blob-storage service for one account
pub trait BlobStore: Send + Sync {
    /// Base URL blobs are addressed under
    fn endpoint(&self) -> &str;

    /// Signer holding the account key
    fn signer(&self) -> &GrantSigner;

    /// Time source used for grant expiry
    fn clock(&self) -> &dyn Clock;

    /// Create a container; returns false if it already existed
    fn create_container(&self, name: &str, fail_on_exist: bool) -> StorageResult<bool>;

    fn delete_container(&self, name: &str) -> StorageResult<()>;

    fn list_containers(&self) -> StorageResult<Vec<String>>;

    /// Blobs in a container, ordered by name
    fn list_blobs(&self, container: &str) -> StorageResult<Vec<BlobItem>>;

    fn put_blob(&self, container: &str, blob: &str, content: &[u8]) -> StorageResult<()>;

    fn get_blob(&self, container: &str, blob: &str) -> StorageResult<Vec<u8>>;

    fn delete_blob(&self, container: &str, blob: &str) -> StorageResult<()>;

    fn account_name(&self) -> &str {
        self.signer().account()
    }

    /// URL of a blob without any token
    fn blob_url(&self, container: &str, blob: &str) -> String {
        format!("{}/{}/{}", self.endpoint(), container, blob)
    }

    /// URL of a blob with a grant token appended
    fn blob_url_with_token(&self, container: &str, blob: &str, token: &str) -> String {
        format!("{}?{}", self.blob_url(container, blob), token)
    }

    fn put_blob_from_path(&self, container: &str, blob: &str, path: &Path) -> StorageResult<()> {
        let content = fs::read(path)?;
        self.put_blob(container, blob, &content)
    }

    fn put_blob_from_text(&self, container: &str, blob: &str, text: &str) -> StorageResult<()> {
        self.put_blob(container, blob, text.as_bytes())
    }

    fn get_blob_to_path(&self, container: &str, blob: &str, path: &Path) -> StorageResult<()> {
        let content = self.get_blob(container, blob)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, content)?;
        Ok(())
    }

    fn get_blob_to_text(&self, container: &str, blob: &str) -> StorageResult<String> {
        let content = self.get_blob(container, blob)?;
        String::from_utf8(content).map_err(|source| StorageError::Decode {
            container: container.to_string(),
            blob: blob.to_string(),
            source,
        })
    }

    /// Read a blob through a tokenized URL
    fn get_with_grant(&self, url: &str) -> StorageResult<Vec<u8>> {
        let parsed = BlobUrl::parse(url)?;
        self.authorize(&parsed, Permissions::READ)?;
        self.get_blob(&parsed.container, &parsed.blob)
    }

    /// Write a blob using a container-scoped write grant
    fn put_with_grant(
        &self,
        container: &str,
        blob: &str,
        token: &str,
        content: &[u8],
    ) -> StorageResult<()> {
        let url = self.blob_url_with_token(container, blob, token);
        let parsed = BlobUrl::parse(&url)?;
        self.authorize(&parsed, Permissions::WRITE)?;
        self.put_blob(container, blob, content)
    }

    /// Verify the token carried by `url` for `needed`
    fn authorize(&self, url: &BlobUrl, needed: Permissions) -> StorageResult<()> {
        if url.endpoint != self.endpoint() {
            return Err(StorageError::InvalidUrl(format!(
                "endpoint {} does not belong to account {}",
                url.endpoint,
                self.account_name()
            )));
        }
        let token = url
            .token
            .as_deref()
            .ok_or_else(|| GrantError::Malformed("no access token".to_string()))?;
        let grant = AccessGrant::parse_token(token)?;
        self.signer().verify(
            &grant,
            &url.container,
            Some(&url.blob),
            needed,
            self.clock().now(),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_blob_url_with_token() {
        let url = BlobUrl::parse("memory://acct/batchcsv/postal_codes_ct.csv?sr=b&sp=r").unwrap();
        assert_eq!(url.endpoint, "memory://acct");
        assert_eq!(url.container, "batchcsv");
        assert_eq!(url.blob, "postal_codes_ct.csv");
        assert_eq!(url.token.as_deref(), Some("sr=b&sp=r"));
    }

    #[test]
    fn test_parse_blob_url_rejects_short_paths() {
        assert!(BlobUrl::parse("just-a-name").is_err());
        assert!(BlobUrl::parse("/container/").is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("NC1.tar").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name(".account").is_err());
    }
}
