//! Filesystem document collection
//!
//! One directory per collection, one JSON file per document. File names are
//! a digest of (partition key, id), so creating an existing document fails
//! atomically even when several task processes insert at once.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::service::docdb::{
    partition_value, Document, DocumentError, DocumentResult, DocumentStore, Query,
};

use super::storage::{write_atomic, FILE_SCHEME};

const COLLECTION_FILE: &str = ".collection.json";

#[derive(Serialize, Deserialize)]
struct CollectionRecord {
    partition_key: String,
    key_sha256: String,
}

pub struct LocalDocumentStore {
    dir: PathBuf,
    partition_key: String,
}

fn key_digest(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

impl LocalDocumentStore {
    /// Open or create a collection guarded by `master_key`
    pub fn open(dir: &Path, partition_key: &str, master_key: &str) -> DocumentResult<Self> {
        fs::create_dir_all(dir)?;
        let record_path = dir.join(COLLECTION_FILE);

        let partition_key = if record_path.exists() {
            let record: CollectionRecord = serde_json::from_slice(&fs::read(&record_path)?)?;
            if record.key_sha256 != key_digest(master_key) {
                return Err(DocumentError::Unauthorized);
            }
            if record.partition_key != partition_key {
                return Err(DocumentError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "collection is partitioned by '{}', not '{}'",
                        record.partition_key, partition_key
                    ),
                )));
            }
            record.partition_key
        } else {
            let record = CollectionRecord {
                partition_key: partition_key.to_string(),
                key_sha256: key_digest(master_key),
            };
            write_atomic(&record_path, &serde_json::to_vec_pretty(&record)?)?;
            partition_key.to_string()
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            partition_key,
        })
    }

    /// Open from a `file://` URI
    pub fn from_uri(uri: &str, partition_key: &str, master_key: &str) -> DocumentResult<Self> {
        let path = uri.strip_prefix(FILE_SCHEME).ok_or_else(|| {
            DocumentError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported document store URI '{}'", uri),
            ))
        })?;
        Self::open(Path::new(path), partition_key, master_key)
    }

    fn doc_path(&self, id: &str, partition_key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(partition_key.as_bytes());
        hasher.update(b"\n");
        hasher.update(id.as_bytes());
        self.dir.join(format!("{}.json", hex::encode(hasher.finalize())))
    }
}

impl DocumentStore for LocalDocumentStore {
    fn partition_key_field(&self) -> &str {
        &self.partition_key
    }

    fn create(&self, mut doc: Document) -> DocumentResult<Document> {
        let pk = partition_value(&doc, &self.partition_key)?;
        let id = match doc.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let id = uuid::Uuid::new_v4().to_string();
                doc.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };

        let path = self.doc_path(&id, &pk);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(DocumentError::Conflict {
                    id,
                    partition_key: pk,
                })
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&serde_json::to_vec(&doc)?)?;
        Ok(doc)
    }

    fn query(&self, query: &Query, max_items: Option<usize>) -> DocumentResult<Vec<Document>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.extension().is_some_and(|ext| ext == "json")
                    && !p
                        .file_name()
                        .is_some_and(|n| n.to_string_lossy().starts_with('.'))
            })
            .collect();
        paths.sort();

        let limit = max_items.unwrap_or(usize::MAX);
        let mut docs = Vec::new();
        for path in paths {
            if docs.len() >= limit {
                break;
            }
            let doc: Document = serde_json::from_slice(&fs::read(&path)?)?;
            if query.matches(&doc) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    fn delete(&self, id: &str, partition_key: &str) -> DocumentResult<()> {
        fs::remove_file(self.doc_path(id, partition_key)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => DocumentError::NotFound {
                id: id.to_string(),
                partition_key: partition_key.to_string(),
            },
            _ => e.into(),
        })
    }
}
