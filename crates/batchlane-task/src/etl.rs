//! CSV to document store loader
//!
//! Each data row becomes one document. The city name is the partition key,
//! the CSV `id` moves to `seq` so the store assigns its own id, and the
//! coordinates are added as a GeoJSON point.

use std::fs;
use std::path::Path;

use serde_json::{json, Map, Value};

use batchlane::service::{Document, DocumentStore};

use crate::csv::{parse_number, CsvTable};
use crate::error::{TaskError, TaskResult};
use crate::node::{BlobSink, LogData, TaskEnv};

pub const PARTITION_FIELD: &str = "pk";
pub const CITY_COLUMN: &str = "city_name";

/// Shape one CSV record into a document. `line` is used in errors.
pub fn row_to_document(mut record: Map<String, Value>, line: usize) -> TaskResult<Document> {
    let city = record
        .get(CITY_COLUMN)
        .cloned()
        .ok_or_else(|| TaskError::MissingColumn(CITY_COLUMN.to_string()))?;
    record.insert(PARTITION_FIELD.to_string(), city);

    let seq = record
        .remove("id")
        .ok_or_else(|| TaskError::MissingColumn("id".to_string()))?;
    record.insert("seq".to_string(), seq);

    let coordinate = |column: &str| -> TaskResult<f64> {
        match record.get(column) {
            Some(Value::String(s)) => parse_number(s, column, line),
            _ => Err(TaskError::MissingColumn(column.to_string())),
        }
    };
    let lat = coordinate("latitude")?;
    let lng = coordinate("longitude")?;
    record.insert(
        "location".to_string(),
        json!({ "type": "Point", "coordinates": [lng, lat] }),
    );
    Ok(record)
}

/// Load every row of the input into `store`
///
/// Returns the created documents. With a `sink` the log data is written to
/// `<job>-<task>-log_data.json` in its container and in `workdir`.
pub fn run(
    text: &str,
    env: &TaskEnv,
    store: &dyn DocumentStore,
    sink: Option<&BlobSink>,
    workdir: &Path,
    log: &mut LogData,
) -> TaskResult<Vec<Document>> {
    let table = CsvTable::parse(text)?;
    let mut created = Vec::with_capacity(table.rows.len());

    for (i, record) in table.records().enumerate() {
        let doc = row_to_document(record, i + 2)?;
        let doc = store.create(doc)?;
        println!("{}", serde_json::to_string_pretty(&doc)?);
        created.push(doc);
    }
    log.set("documents_created", created.len());
    log.event(format!("loaded {} row(s)", created.len()));
    tracing::info!(rows = created.len(), job = %env.job_id, task = %env.task_id, "documents created");

    if let Some(sink) = sink {
        let name = env.scoped_name("log_data.json");
        let json = log.to_json()?;
        fs::write(workdir.join(&name), &json)?;
        sink.put_text(&name, &json)?;
    }
    Ok(created)
}
