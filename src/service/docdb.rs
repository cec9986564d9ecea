//! Document database contract
//!
//! One [`DocumentStore`] is one collection with a configured partition key
//! field. Documents are JSON objects; `id` is assigned on create when absent.

use std::io;

use serde_json::{Map, Value};

pub type Document = Map<String, Value>;

/// Query over a collection; always cross-partition
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    All,
    FieldEquals { field: String, value: Value },
}

impl Query {
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Query::All => true,
            Query::FieldEquals { field, value } => doc.get(field) == Some(value),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("document {id} already exists in partition {partition_key}")]
    Conflict { id: String, partition_key: String },

    #[error("document {id} not found in partition {partition_key}")]
    NotFound { id: String, partition_key: String },

    #[error("document has no string partition key field '{0}'")]
    MissingPartitionKey(String),

    #[error("unauthorized: master key rejected")]
    Unauthorized,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type DocumentResult<T> = Result<T, DocumentError>;

/// Partition value of `doc`, or an error if the field is missing
pub fn partition_value(doc: &Document, field: &str) -> DocumentResult<String> {
    doc.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DocumentError::MissingPartitionKey(field.to_string()))
}

/// A document collection
pub trait DocumentStore: Send + Sync {
    fn partition_key_field(&self) -> &str;

    /// Insert a document, returning it with `id` populated
    fn create(&self, doc: Document) -> DocumentResult<Document>;

    /// Matching documents, at most `max_items` if given
    fn query(&self, query: &Query, max_items: Option<usize>) -> DocumentResult<Vec<Document>>;

    fn delete(&self, id: &str, partition_key: &str) -> DocumentResult<()>;

    /// Delete every document, returning how many were removed
    fn delete_all(&self) -> DocumentResult<usize> {
        let field = self.partition_key_field().to_string();
        let docs = self.query(&Query::All, None)?;
        let mut removed = 0;
        for doc in docs {
            let id = doc
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let pk = partition_value(&doc, &field)?;
            self.delete(&id, &pk)?;
            removed += 1;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_query_matching() {
        let d = doc(json!({"city_name": "Cary", "pk": "Cary"}));
        assert!(Query::All.matches(&d));
        assert!(Query::FieldEquals {
            field: "city_name".into(),
            value: json!("Cary")
        }
        .matches(&d));
        assert!(!Query::FieldEquals {
            field: "city_name".into(),
            value: json!("Apex")
        }
        .matches(&d));
    }

    #[test]
    fn test_partition_value() {
        let d = doc(json!({"pk": "Cary", "n": 1}));
        assert_eq!(partition_value(&d, "pk").unwrap(), "Cary");
        assert!(matches!(
            partition_value(&d, "n"),
            Err(DocumentError::MissingPartitionKey(_))
        ));
    }
}
