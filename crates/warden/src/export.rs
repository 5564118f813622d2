//! CSV export of a query page's records.
//!
//! Columns come from the first record's keys in wire order. Later records
//! fill those columns by name: missing keys become empty cells and keys the
//! first record lacks are dropped.

use serde_json::Value;
use thiserror::Error;

/// Leads the file so spreadsheet tools read it as UTF-8
pub const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("record {index} is not a JSON object")]
    NotAnObject { index: usize },

    #[error("failed to write CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("failed to flush CSV: {0}")]
    Flush(String),
}

/// Encode `records` as BOM-prefixed CSV. Returns `None` when there is
/// nothing to export.
pub fn records_to_csv(records: &[Value]) -> Result<Option<Vec<u8>>, ExportError> {
    let Some(first) = records.first() else {
        return Ok(None);
    };
    let columns: Vec<&str> = first
        .as_object()
        .ok_or(ExportError::NotAnObject { index: 0 })?
        .keys()
        .map(String::as_str)
        .collect();

    let mut writer = csv::Writer::from_writer(UTF8_BOM.to_vec());
    writer.write_record(&columns)?;

    for (index, record) in records.iter().enumerate() {
        let fields = record.as_object().ok_or(ExportError::NotAnObject { index })?;
        writer.write_record(columns.iter().map(|column| cell(fields.get(*column))))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| ExportError::Flush(e.error().to_string()))?;
    Ok(Some(bytes))
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
