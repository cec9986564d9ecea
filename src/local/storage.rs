//! Filesystem blob storage
//!
//! Layout under the storage root:
//!
//! ```text
//! <root>/.account            account name and key (JSON)
//! <root>/<container>/<blob>
//! ```
//!
//! The endpoint is `file://<canonical root>`. Task processes reopen the same
//! root from the endpoint and read `.account` to verify grants, which is how
//! the emulator stands in for a remote account.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::clock::{Clock, SystemClock};
use crate::grant::GrantSigner;
use crate::service::storage::{validate_name, BlobItem, BlobStore, StorageError, StorageResult};

const ACCOUNT_FILE: &str = ".account";

pub const FILE_SCHEME: &str = "file://";

#[derive(Serialize, Deserialize)]
struct AccountRecord {
    account: String,
    key: String,
}

pub struct LocalBlobStore {
    root: PathBuf,
    endpoint: String,
    signer: GrantSigner,
    clock: Arc<dyn Clock>,
}

impl LocalBlobStore {
    /// Open or initialize a storage root for `account`
    ///
    /// A root already initialized for another account or key is refused.
    pub fn open(root: &Path, account: &str, key: &str, clock: Arc<dyn Clock>) -> StorageResult<Self> {
        fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        let account_path = root.join(ACCOUNT_FILE);

        if account_path.exists() {
            let record = read_account(&account_path)?;
            if record.account != account || record.key != key {
                return Err(StorageError::Backend(format!(
                    "{} is initialized for another account or key",
                    root.display()
                )));
            }
        } else {
            let record = AccountRecord {
                account: account.to_string(),
                key: key.to_string(),
            };
            let json = serde_json::to_vec_pretty(&record)
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            write_atomic(&account_path, &json)?;
            tracing::debug!(root = %root.display(), account, "initialized local storage root");
        }

        Ok(Self::from_parts(root, account, key, clock))
    }

    /// Reopen an initialized root from its `file://` endpoint
    pub fn from_endpoint(endpoint: &str, clock: Arc<dyn Clock>) -> StorageResult<Self> {
        let path = endpoint
            .strip_prefix(FILE_SCHEME)
            .ok_or_else(|| StorageError::InvalidUrl(endpoint.to_string()))?;
        let root = PathBuf::from(path);
        let record = read_account(&root.join(ACCOUNT_FILE))?;
        Ok(Self::from_parts(root, &record.account, &record.key, clock))
    }

    pub fn with_system_clock(root: &Path, account: &str, key: &str) -> StorageResult<Self> {
        Self::open(root, account, key, Arc::new(SystemClock))
    }

    fn from_parts(root: PathBuf, account: &str, key: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            endpoint: format!("{}{}", FILE_SCHEME, root.display()),
            root,
            signer: GrantSigner::new(account, key),
            clock,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, container: &str) -> StorageResult<PathBuf> {
        validate_name(container)?;
        let dir = self.root.join(container);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(StorageError::ContainerNotFound(container.to_string()))
        }
    }

    fn blob_path(&self, container: &str, blob: &str) -> StorageResult<PathBuf> {
        validate_name(blob)?;
        Ok(self.container_dir(container)?.join(blob))
    }
}

fn read_account(path: &Path) -> StorageResult<AccountRecord> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| {
        StorageError::Backend(format!("unreadable account file {}: {}", path.display(), e))
    })
}

/// Write-then-rename so readers never see a partial file
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.tmp", name));
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, path)
}

impl BlobStore for LocalBlobStore {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn signer(&self) -> &GrantSigner {
        &self.signer
    }

    fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    fn create_container(&self, name: &str, fail_on_exist: bool) -> StorageResult<bool> {
        validate_name(name)?;
        let dir = self.root.join(name);
        match fs::create_dir(&dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if fail_on_exist {
                    Err(StorageError::ContainerExists(name.to_string()))
                } else {
                    Ok(false)
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete_container(&self, name: &str) -> StorageResult<()> {
        let dir = self.container_dir(name)?;
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    fn list_containers(&self) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn list_blobs(&self, container: &str) -> StorageResult<Vec<BlobItem>> {
        let dir = self.container_dir(container)?;
        let mut items = Vec::new();

        for entry in WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        {
            let entry = entry.map_err(io::Error::from)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !entry.file_type().is_file() || name.starts_with('.') {
                continue;
            }
            let metadata = entry.metadata().map_err(io::Error::from)?;
            items.push(BlobItem {
                name,
                size: metadata.len(),
                last_modified: metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| self.clock.now()),
            });
        }

        Ok(items)
    }

    fn put_blob(&self, container: &str, blob: &str, content: &[u8]) -> StorageResult<()> {
        let path = self.blob_path(container, blob)?;
        write_atomic(&path, content)?;
        Ok(())
    }

    fn get_blob(&self, container: &str, blob: &str) -> StorageResult<Vec<u8>> {
        let path = self.blob_path(container, blob)?;
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::BlobNotFound {
                container: container.to_string(),
                blob: blob.to_string(),
            },
            _ => e.into(),
        })
    }

    fn delete_blob(&self, container: &str, blob: &str) -> StorageResult<()> {
        let path = self.blob_path(container, blob)?;
        fs::remove_file(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::BlobNotFound {
                container: container.to_string(),
                blob: blob.to_string(),
            },
            _ => e.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::grant::Permissions;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> LocalBlobStore {
        LocalBlobStore::with_system_clock(dir.path(), "acct", "key").unwrap()
    }

    #[test]
    fn test_containers_and_blobs() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        assert!(store.create_container("batchcsv", false).unwrap());
        assert!(!store.create_container("batchcsv", false).unwrap());
        store.put_blob_from_text("batchcsv", "b.csv", "2").unwrap();
        store.put_blob_from_text("batchcsv", "a.csv", "11").unwrap();

        assert_eq!(store.list_containers().unwrap(), vec!["batchcsv"]);
        let blobs = store.list_blobs("batchcsv").unwrap();
        assert_eq!(blobs.len(), 2);
        assert_eq!(blobs[0].name, "a.csv");
        assert_eq!(blobs[0].size, 2);
        assert_eq!(store.get_blob_to_text("batchcsv", "b.csv").unwrap(), "2");

        store.delete_blob("batchcsv", "b.csv").unwrap();
        assert!(matches!(
            store.get_blob("batchcsv", "b.csv"),
            Err(StorageError::BlobNotFound { .. })
        ));
    }

    #[test]
    fn test_account_file_hidden_and_enforced() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.create_container("c", false).unwrap();
        assert_eq!(store.list_containers().unwrap(), vec!["c"]);

        assert!(LocalBlobStore::with_system_clock(dir.path(), "acct", "other-key").is_err());
    }

    #[test]
    fn test_reopen_from_endpoint_verifies_grants() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(FakeClock::at_epoch_seconds(1_700_000_000));
        let store = LocalBlobStore::open(dir.path(), "acct", "key", clock.clone()).unwrap();
        store.create_container("out", false).unwrap();

        let token = store
            .signer()
            .issue_container("out", Permissions::all(), clock.now() + chrono::Duration::hours(1))
            .to_token();

        let task_side = LocalBlobStore::from_endpoint(store.endpoint(), clock.clone()).unwrap();
        task_side.put_with_grant("out", "result.txt", &token, b"ok").unwrap();
        assert_eq!(store.get_blob("out", "result.txt").unwrap(), b"ok");
    }

    #[test]
    fn test_missing_container() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        assert!(matches!(
            store.list_blobs("nope"),
            Err(StorageError::ContainerNotFound(_))
        ));
    }
}
