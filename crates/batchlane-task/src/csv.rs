//! Minimal CSV reader for the task inputs
//!
//! Comma separated, first line is the header. Fields may be double-quoted;
//! a doubled quote inside a quoted field is a literal quote. Quoted fields
//! cannot span lines.

use serde_json::{Map, Value};

use crate::error::{TaskError, TaskResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

fn split_line(line: &str, line_no: usize) -> TaskResult<Vec<String>> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut chars = line.chars().peekable();
    let mut quoted = false;

    while let Some(c) = chars.next() {
        match (quoted, c) {
            (true, '"') if chars.peek() == Some(&'"') => {
                chars.next();
                field.push('"');
            }
            (true, '"') => quoted = false,
            (true, c) => field.push(c),
            (false, '"') if field.is_empty() => quoted = true,
            (false, ',') => fields.push(std::mem::take(&mut field)),
            (false, c) => field.push(c),
        }
    }
    if quoted {
        return Err(TaskError::Csv {
            line: line_no,
            message: "unterminated quoted field".to_string(),
        });
    }
    fields.push(field);
    Ok(fields)
}

impl CsvTable {
    pub fn parse(text: &str) -> TaskResult<Self> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l.trim_end_matches('\r')))
            .filter(|(_, l)| !l.trim().is_empty());

        let (first, header_line) = lines.next().ok_or(TaskError::Empty)?;
        let header = split_line(header_line, first)?
            .into_iter()
            .map(|h| h.trim().to_string())
            .collect::<Vec<_>>();

        let mut rows = Vec::new();
        for (line_no, line) in lines {
            let row = split_line(line, line_no)?;
            if row.len() != header.len() {
                return Err(TaskError::Csv {
                    line: line_no,
                    message: format!("expected {} fields, found {}", header.len(), row.len()),
                });
            }
            rows.push(row);
        }
        Ok(Self { header, rows })
    }

    pub fn column(&self, name: &str) -> TaskResult<usize> {
        self.header
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| TaskError::MissingColumn(name.to_string()))
    }

    /// Arithmetic mean of a numeric column
    pub fn mean(&self, name: &str) -> TaskResult<f64> {
        let idx = self.column(name)?;
        if self.rows.is_empty() {
            return Err(TaskError::Empty);
        }
        let mut sum = 0.0;
        for (i, row) in self.rows.iter().enumerate() {
            sum += parse_number(&row[idx], name, i + 2)?;
        }
        Ok(sum / self.rows.len() as f64)
    }

    /// Rows as JSON objects keyed by header, values kept as strings
    pub fn records(&self) -> impl Iterator<Item = Map<String, Value>> + '_ {
        self.rows.iter().map(|row| {
            self.header
                .iter()
                .cloned()
                .zip(row.iter().map(|v| Value::String(v.clone())))
                .collect()
        })
    }
}

/// `line` is 1-based and counts the header
pub fn parse_number(value: &str, column: &str, line: usize) -> TaskResult<f64> {
    value.trim().parse::<f64>().map_err(|_| TaskError::InvalidNumber {
        column: column.to_string(),
        line,
        value: value.to_string(),
    })
}
