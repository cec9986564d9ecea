//! In-memory blob storage

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::clock::{Clock, SystemClock};
use crate::grant::GrantSigner;
use crate::service::storage::{validate_name, BlobItem, BlobStore, StorageError, StorageResult};

use super::failure::{FailureConfig, FailureInjector};
use super::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOp {
    CreateContainer,
    DeleteContainer,
    ListBlobs,
    PutBlob,
    GetBlob,
    DeleteBlob,
}

#[derive(Debug, Clone)]
struct StoredBlob {
    content: Vec<u8>,
    last_modified: DateTime<Utc>,
}

type Containers = BTreeMap<String, BTreeMap<String, StoredBlob>>;

/// Blob store held in memory, addressed as `memory://<account>`
pub struct MemoryBlobStore {
    endpoint: String,
    signer: GrantSigner,
    clock: Arc<dyn Clock>,
    containers: Mutex<Containers>,
    failures: Mutex<FailureInjector<StorageOp>>,
}

impl MemoryBlobStore {
    pub fn new(account: &str, key: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            endpoint: format!("memory://{}", account),
            signer: GrantSigner::new(account, key),
            clock,
            containers: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(FailureInjector::new()),
        }
    }

    pub fn with_system_clock(account: &str, key: &str) -> Self {
        Self::new(account, key, Arc::new(SystemClock))
    }

    pub fn inject_failure(&self, op: StorageOp, config: FailureConfig) {
        lock(&self.failures).inject(op, config);
    }

    pub fn inject_error(&self, op: StorageOp, message: &str) {
        lock(&self.failures).inject_error(op, message);
    }

    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    /// Number of blobs across all containers
    pub fn blob_count(&self) -> usize {
        lock(&self.containers).values().map(BTreeMap::len).sum()
    }

    fn check_failure(&self, op: StorageOp) -> StorageResult<()> {
        match lock(&self.failures).check(&op) {
            Some(message) => Err(StorageError::Backend(message)),
            None => Ok(()),
        }
    }
}

impl BlobStore for MemoryBlobStore {
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
        self.check_failure(StorageOp::CreateContainer)?;
        validate_name(name)?;
        let mut containers = lock(&self.containers);
        if containers.contains_key(name) {
            if fail_on_exist {
                return Err(StorageError::ContainerExists(name.to_string()));
            }
            return Ok(false);
        }
        containers.insert(name.to_string(), BTreeMap::new());
        Ok(true)
    }

    fn delete_container(&self, name: &str) -> StorageResult<()> {
        self.check_failure(StorageOp::DeleteContainer)?;
        lock(&self.containers)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::ContainerNotFound(name.to_string()))
    }

    fn list_containers(&self) -> StorageResult<Vec<String>> {
        Ok(lock(&self.containers).keys().cloned().collect())
    }

    fn list_blobs(&self, container: &str) -> StorageResult<Vec<BlobItem>> {
        self.check_failure(StorageOp::ListBlobs)?;
        let containers = lock(&self.containers);
        let blobs = containers
            .get(container)
            .ok_or_else(|| StorageError::ContainerNotFound(container.to_string()))?;
        Ok(blobs
            .iter()
            .map(|(name, blob)| BlobItem {
                name: name.clone(),
                size: blob.content.len() as u64,
                last_modified: blob.last_modified,
            })
            .collect())
    }

    fn put_blob(&self, container: &str, blob: &str, content: &[u8]) -> StorageResult<()> {
        self.check_failure(StorageOp::PutBlob)?;
        validate_name(blob)?;
        let now = self.clock.now();
        let mut containers = lock(&self.containers);
        let blobs = containers
            .get_mut(container)
            .ok_or_else(|| StorageError::ContainerNotFound(container.to_string()))?;
        blobs.insert(
            blob.to_string(),
            StoredBlob {
                content: content.to_vec(),
                last_modified: now,
            },
        );
        Ok(())
    }

    fn get_blob(&self, container: &str, blob: &str) -> StorageResult<Vec<u8>> {
        self.check_failure(StorageOp::GetBlob)?;
        let containers = lock(&self.containers);
        containers
            .get(container)
            .ok_or_else(|| StorageError::ContainerNotFound(container.to_string()))?
            .get(blob)
            .map(|b| b.content.clone())
            .ok_or_else(|| StorageError::BlobNotFound {
                container: container.to_string(),
                blob: blob.to_string(),
            })
    }

    fn delete_blob(&self, container: &str, blob: &str) -> StorageResult<()> {
        self.check_failure(StorageOp::DeleteBlob)?;
        let mut containers = lock(&self.containers);
        containers
            .get_mut(container)
            .ok_or_else(|| StorageError::ContainerNotFound(container.to_string()))?
            .remove(blob)
            .map(|_| ())
            .ok_or_else(|| StorageError::BlobNotFound {
                container: container.to_string(),
                blob: blob.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::grant::Permissions;
    use std::time::Duration;

    fn store() -> (Arc<FakeClock>, MemoryBlobStore) {
        let clock = Arc::new(FakeClock::at_epoch_seconds(1_700_000_000));
        let store = MemoryBlobStore::new("acct", "key", clock.clone());
        (clock, store)
    }

    #[test]
    fn test_create_container_idempotent() {
        let (_, store) = store();
        assert!(store.create_container("batchcsv", false).unwrap());
        assert!(!store.create_container("batchcsv", false).unwrap());
        assert!(matches!(
            store.create_container("batchcsv", true),
            Err(StorageError::ContainerExists(_))
        ));
    }

    #[test]
    fn test_blobs_listed_by_name() {
        let (_, store) = store();
        store.create_container("c", false).unwrap();
        store.put_blob_from_text("c", "b.csv", "2").unwrap();
        store.put_blob_from_text("c", "a.csv", "1").unwrap();

        let names: Vec<String> = store.list_blobs("c").unwrap().into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["a.csv", "b.csv"]);
        assert_eq!(store.get_blob_to_text("c", "a.csv").unwrap(), "1");
    }

    #[test]
    fn test_put_into_missing_container() {
        let (_, store) = store();
        assert!(matches!(
            store.put_blob("nope", "x", b"1"),
            Err(StorageError::ContainerNotFound(_))
        ));
    }

    #[test]
    fn test_get_with_grant_until_expiry() {
        let (clock, store) = store();
        store.create_container("c", false).unwrap();
        store.put_blob("c", "data.csv", b"x,y").unwrap();

        let expires = clock.now() + chrono::Duration::minutes(5);
        let token = store
            .signer()
            .issue_blob("c", "data.csv", Permissions::READ, expires)
            .to_token();
        let url = store.blob_url_with_token("c", "data.csv", &token);

        assert_eq!(store.get_with_grant(&url).unwrap(), b"x,y");

        clock.advance(Duration::from_secs(5 * 60));
        let err = store.get_with_grant(&url).unwrap_err();
        assert!(err.is_authorization_expired());
    }

    #[test]
    fn test_put_with_read_grant_denied() {
        let (clock, store) = store();
        store.create_container("out", false).unwrap();
        let token = store
            .signer()
            .issue_container("out", Permissions::READ, clock.now() + chrono::Duration::hours(1))
            .to_token();

        let err = store.put_with_grant("out", "r.txt", &token, b"1").unwrap_err();
        assert!(matches!(err, StorageError::Authorization(_)));
        assert!(!err.is_authorization_expired());
    }

    #[test]
    fn test_failure_injection() {
        let (_, store) = store();
        store.create_container("c", false).unwrap();
        store.inject_error(StorageOp::PutBlob, "throttled");
        assert!(matches!(
            store.put_blob("c", "x", b"1"),
            Err(StorageError::Backend(m)) if m == "throttled"
        ));
        assert_eq!(store.blob_count(), 0);
    }
}
