//! In-memory document collection

use std::sync::Mutex;

use serde_json::Value;

use crate::service::docdb::{partition_value, Document, DocumentError, DocumentResult, DocumentStore, Query};

use super::lock;

pub struct MemoryDocumentStore {
    partition_key: String,
    docs: Mutex<Vec<Document>>,
}

impl MemoryDocumentStore {
    pub fn new(partition_key: &str) -> Self {
        Self {
            partition_key: partition_key.to_string(),
            docs: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.docs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn doc_id(doc: &Document) -> &str {
    doc.get("id").and_then(Value::as_str).unwrap_or_default()
}

impl DocumentStore for MemoryDocumentStore {
    fn partition_key_field(&self) -> &str {
        &self.partition_key
    }

    fn create(&self, mut doc: Document) -> DocumentResult<Document> {
        let pk = partition_value(&doc, &self.partition_key)?;
        if doc_id(&doc).is_empty() {
            doc.insert("id".to_string(), Value::String(uuid::Uuid::new_v4().to_string()));
        }

        let mut docs = lock(&self.docs);
        let id = doc_id(&doc).to_string();
        let exists = docs.iter().any(|d| {
            doc_id(d) == id && partition_value(d, &self.partition_key).ok().as_deref() == Some(pk.as_str())
        });
        if exists {
            return Err(DocumentError::Conflict { id, partition_key: pk });
        }
        docs.push(doc.clone());
        Ok(doc)
    }

    fn query(&self, query: &Query, max_items: Option<usize>) -> DocumentResult<Vec<Document>> {
        let docs = lock(&self.docs);
        Ok(docs
            .iter()
            .filter(|d| query.matches(d))
            .take(max_items.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn delete(&self, id: &str, partition_key: &str) -> DocumentResult<()> {
        let mut docs = lock(&self.docs);
        let position = docs.iter().position(|d| {
            doc_id(d) == id
                && partition_value(d, &self.partition_key).ok().as_deref() == Some(partition_key)
        });
        match position {
            Some(i) => {
                docs.remove(i);
                Ok(())
            }
            None => Err(DocumentError::NotFound {
                id: id.to_string(),
                partition_key: partition_key.to_string(),
            }),
        }
    }
}
