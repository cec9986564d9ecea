//! Resource staging
//!
//! Uploads local files into storage containers and turns blobs into
//! [`ResourceFile`] descriptors: a blob URL carrying a read-only grant that
//! stays valid for the configured lifetime. Holders of a descriptor need no
//! account key.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};

use crate::grant::Permissions;
use crate::service::batch::ResourceFile;
use crate::service::storage::{validate_name, BlobStore, StorageError};

/// Default grant lifetime: two hours
pub const DEFAULT_GRANT_LIFETIME: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("cannot stage {0}: no usable file name")]
    InvalidPath(PathBuf),

    #[error("invalid blob pattern: {0}")]
    Pattern(#[from] globset::Error),
}

pub type StageResult<T> = Result<T, StageError>;

/// Which existing blobs to stage
#[derive(Debug, Clone)]
pub enum BlobFilter {
    All,
    /// Names ending with this suffix, e.g. `.csv`
    Suffix(String),
    /// Exactly these names; absent ones are skipped
    Names(BTreeSet<String>),
    /// Shell-style pattern, e.g. `postal_codes_*.csv`
    Glob(String),
}

enum CompiledFilter<'a> {
    All,
    Suffix(&'a str),
    Names(&'a BTreeSet<String>),
    Glob(GlobMatcher),
}

impl BlobFilter {
    fn compile(&self) -> StageResult<CompiledFilter<'_>> {
        Ok(match self {
            BlobFilter::All => CompiledFilter::All,
            BlobFilter::Suffix(s) => CompiledFilter::Suffix(s),
            BlobFilter::Names(names) => CompiledFilter::Names(names),
            BlobFilter::Glob(pattern) => CompiledFilter::Glob(Glob::new(pattern)?.compile_matcher()),
        })
    }
}

impl CompiledFilter<'_> {
    fn matches(&self, name: &str) -> bool {
        match self {
            CompiledFilter::All => true,
            CompiledFilter::Suffix(s) => name.ends_with(s),
            CompiledFilter::Names(names) => names.contains(name),
            CompiledFilter::Glob(m) => m.is_match(name),
        }
    }
}

/// `now + lifetime`, saturating at the latest representable instant
pub fn expiry_after(now: DateTime<Utc>, lifetime: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lifetime)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub struct ResourceStager {
    store: Arc<dyn BlobStore>,
    grant_lifetime: Duration,
}

impl ResourceStager {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            grant_lifetime: DEFAULT_GRANT_LIFETIME,
        }
    }

    pub fn with_grant_lifetime(mut self, lifetime: Duration) -> Self {
        self.grant_lifetime = lifetime;
        self
    }

    pub fn grant_lifetime(&self) -> Duration {
        self.grant_lifetime
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    fn expires_at(&self) -> DateTime<Utc> {
        expiry_after(self.store.clock().now(), self.grant_lifetime)
    }

    /// Create the container if missing; true if it was created
    pub fn ensure_container(&self, name: &str) -> StageResult<bool> {
        let created = self.store.create_container(name, false)?;
        if created {
            tracing::info!(container = name, "created container");
        }
        Ok(created)
    }

    /// Create the container, failing if it already exists
    pub fn ensure_container_strict(&self, name: &str) -> StageResult<()> {
        self.store.create_container(name, true)?;
        Ok(())
    }

    /// Upload `path` under its basename and return a read descriptor
    pub fn upload_file(&self, container: &str, path: &Path) -> StageResult<ResourceFile> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StageError::InvalidPath(path.to_path_buf()))?;
        validate_name(name).map_err(|_| StageError::InvalidPath(path.to_path_buf()))?;

        self.store.put_blob_from_path(container, name, path)?;
        tracing::info!(container, blob = name, "uploaded");
        Ok(self.blob_resource(container, name))
    }

    /// Upload in order; a failure leaves earlier uploads in place
    pub fn upload_batch(&self, container: &str, paths: &[PathBuf]) -> StageResult<Vec<ResourceFile>> {
        paths
            .iter()
            .map(|path| self.upload_file(container, path))
            .collect()
    }

    /// Token granting `permissions` on every blob in `container`
    pub fn container_access_grant(&self, container: &str, permissions: Permissions) -> String {
        self.store
            .signer()
            .issue_container(container, permissions, self.expires_at())
            .to_token()
    }

    /// Read descriptor for a blob already in storage
    pub fn blob_resource(&self, container: &str, blob: &str) -> ResourceFile {
        let grant = self
            .store
            .signer()
            .issue_blob(container, blob, Permissions::READ, self.expires_at());
        ResourceFile {
            file_path: blob.to_string(),
            blob_source: self.store.blob_url_with_token(container, blob, &grant.to_token()),
            expires_at: Some(grant.expires_at),
        }
    }

    /// Descriptors for existing blobs matching `filter`, in name order
    pub fn stage_existing(&self, container: &str, filter: &BlobFilter) -> StageResult<Vec<ResourceFile>> {
        let compiled = filter.compile()?;
        Ok(self
            .store
            .list_blobs(container)?
            .into_iter()
            .filter(|b| compiled.matches(&b.name))
            .map(|b| self.blob_resource(container, &b.name))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, FakeClock};
    use crate::mock::MemoryBlobStore;
    use tempfile::TempDir;

    fn stager() -> (Arc<FakeClock>, Arc<MemoryBlobStore>, ResourceStager) {
        let clock = Arc::new(FakeClock::at_epoch_seconds(1_700_000_000));
        let store = Arc::new(MemoryBlobStore::new("acct", "key", clock.clone()));
        let stager = ResourceStager::new(store.clone());
        (clock, store, stager)
    }

    #[test]
    fn test_upload_file_uses_basename() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("postal_codes_ct.csv");
        std::fs::write(&path, "id,city_name\n1,Hartford\n").unwrap();

        let (clock, store, stager) = stager();
        stager.ensure_container("batchcsv").unwrap();
        let resource = stager.upload_file("batchcsv", &path).unwrap();

        assert_eq!(resource.file_path, "postal_codes_ct.csv");
        assert!(resource
            .blob_source
            .starts_with("memory://acct/batchcsv/postal_codes_ct.csv?"));
        assert_eq!(
            resource.expires_at,
            Some(clock.now() + chrono::Duration::hours(2))
        );
        assert_eq!(
            store.get_with_grant(&resource.blob_source).unwrap(),
            b"id,city_name\n1,Hartford\n"
        );
    }

    #[test]
    fn test_upload_batch_keeps_order_without_rollback() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.csv");
        let b = dir.path().join("b.csv");
        std::fs::write(&a, "1").unwrap();
        std::fs::write(&b, "2").unwrap();
        let missing = dir.path().join("missing.csv");

        let (_, store, stager) = stager();
        stager.ensure_container("c").unwrap();

        let staged = stager.upload_batch("c", &[b.clone(), a.clone()]).unwrap();
        assert_eq!(staged[0].file_path, "b.csv");
        assert_eq!(staged[1].file_path, "a.csv");

        stager.ensure_container("d").unwrap();
        assert!(stager.upload_batch("d", &[a, missing]).is_err());
        assert_eq!(store.list_blobs("d").unwrap().len(), 1);
    }

    #[test]
    fn test_stage_existing_filters() {
        let (_, store, stager) = stager();
        stager.ensure_container("in").unwrap();
        for name in ["postal_codes_ct.csv", "postal_codes_nc.csv", "readme.txt"] {
            store.put_blob_from_text("in", name, "x").unwrap();
        }

        let names = |filter: BlobFilter| -> Vec<String> {
            stager
                .stage_existing("in", &filter)
                .unwrap()
                .into_iter()
                .map(|r| r.file_path)
                .collect()
        };

        assert_eq!(names(BlobFilter::All).len(), 3);
        assert_eq!(
            names(BlobFilter::Suffix(".csv".into())),
            vec!["postal_codes_ct.csv", "postal_codes_nc.csv"]
        );
        assert_eq!(
            names(BlobFilter::Names(
                ["postal_codes_nc.csv".to_string(), "gone.csv".to_string()].into()
            )),
            vec!["postal_codes_nc.csv"]
        );
        assert_eq!(
            names(BlobFilter::Glob("*_ct.*".into())),
            vec!["postal_codes_ct.csv"]
        );
    }

    #[test]
    fn test_container_grant_allows_writes() {
        let (_, store, stager) = stager();
        stager.ensure_container("out").unwrap();
        let token = stager.container_access_grant("out", Permissions::all());
        store.put_with_grant("out", "result.txt", &token, b"done").unwrap();
        assert_eq!(store.get_blob_to_text("out", "result.txt").unwrap(), "done");
    }

    #[test]
    fn test_strict_container() {
        let (_, _, stager) = stager();
        assert!(stager.ensure_container("c").unwrap());
        assert!(!stager.ensure_container("c").unwrap());
        assert!(stager.ensure_container_strict("c").is_err());
    }
}
