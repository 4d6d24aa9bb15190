//! Row types and helpers for row sequences.

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;

use crate::error::ConnectorError;
use crate::location::FileFormat;

/// A single row: column name to JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Lazy, finite sequence of rows. Calling `read` again restarts it.
pub type RowStream = BoxStream<'static, Result<Row, ConnectorError>>;

/// A row about to be written, together with the source record it was
/// derived from so rules can refer to source columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteRecord {
    pub output: Row,
    #[serde(default)]
    pub source: Row,
}

impl WriteRecord {
    pub fn new(output: Row, source: Row) -> Self {
        Self { output, source }
    }
}

/// How a write treats rows already stored at the location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// The written rows become the whole content of the location.
    #[default]
    Replace,
    /// Stored rows are kept and the written rows follow them.
    Append,
}

/// Outcome of a successful write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSummary {
    pub rows_written: u64,
}

/// Build a row stream that does no I/O until first polled.
pub fn deferred<F>(fetch: F) -> RowStream
where
    F: Future<Output = Result<Vec<Row>, ConnectorError>> + Send + 'static,
{
    stream::once(fetch)
        .map(|result| match result {
            Ok(rows) => stream::iter(rows.into_iter().map(Ok)).boxed(),
            Err(e) => stream::iter(std::iter::once(Err(e))).boxed(),
        })
        .flatten()
        .boxed()
}

/// Decode file contents into rows.
pub fn decode(bytes: &[u8], format: FileFormat) -> Result<Vec<Row>, ConnectorError> {
    match format {
        FileFormat::Jsonl => {
            let text = std::str::from_utf8(bytes)
                .map_err(|e| ConnectorError::MalformedData(format!("Invalid UTF-8: {}", e)))?;
            text.lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .map(|(n, line)| parse_object(line).map_err(|e| at_line(e, n + 1)))
                .collect()
        }
        FileFormat::Json => {
            let value: serde_json::Value = serde_json::from_slice(bytes)?;
            match value {
                serde_json::Value::Array(items) => items.into_iter().map(expect_object).collect(),
                other => Err(ConnectorError::MalformedData(format!(
                    "Expected a JSON array of objects, got {}",
                    type_name(&other)
                ))),
            }
        }
    }
}

/// Encode rows for a file-like store.
pub fn encode(rows: &[Row], format: FileFormat) -> Result<Vec<u8>, ConnectorError> {
    match format {
        FileFormat::Jsonl => {
            let mut out = Vec::new();
            for row in rows {
                serde_json::to_writer(&mut out, row)?;
                out.push(b'\n');
            }
            Ok(out)
        }
        FileFormat::Json => Ok(serde_json::to_vec(rows)?),
    }
}

/// Encode `rows` for a file-like store, keeping the rows already stored
/// (`existing`) in front of them when appending.
pub fn encode_write(
    mode: WriteMode,
    existing: Option<&[u8]>,
    rows: &[Row],
    format: FileFormat,
) -> Result<Vec<u8>, ConnectorError> {
    match (mode, existing) {
        (WriteMode::Append, Some(bytes)) => {
            let mut all = decode(bytes, format)?;
            all.extend_from_slice(rows);
            encode(&all, format)
        }
        _ => encode(rows, format),
    }
}

fn parse_object(line: &str) -> Result<Row, ConnectorError> {
    expect_object(serde_json::from_str(line)?)
}

fn expect_object(value: serde_json::Value) -> Result<Row, ConnectorError> {
    match value {
        serde_json::Value::Object(row) => Ok(row),
        other => Err(ConnectorError::MalformedData(format!(
            "Expected a JSON object, got {}",
            type_name(&other)
        ))),
    }
}

fn at_line(e: ConnectorError, line: usize) -> ConnectorError {
    match e {
        ConnectorError::MalformedData(msg) => {
            ConnectorError::MalformedData(format!("line {}: {}", line, msg))
        }
        other => other,
    }
}

fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_decode_jsonl_skips_blank_lines() {
        let data = b"{\"id\":1}\n\n{\"id\":2}\n";
        let rows = decode(data, FileFormat::Jsonl).unwrap();
        assert_eq!(rows, vec![row(json!({"id": 1})), row(json!({"id": 2}))]);
    }

    #[test]
    fn test_decode_jsonl_reports_line() {
        let data = b"{\"id\":1}\n[1,2]\n";
        let err = decode(data, FileFormat::Jsonl).unwrap_err();
        assert!(matches!(err, ConnectorError::MalformedData(ref m) if m.starts_with("line 2")));
    }

    #[test]
    fn test_decode_json_array() {
        let rows = decode(br#"[{"a":"x"},{"a":"y"}]"#, FileFormat::Json).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(decode(br#"{"a":"x"}"#, FileFormat::Json).is_err());
    }

    #[test]
    fn test_encode_jsonl() {
        let rows = vec![row(json!({"id": 1})), row(json!({"id": 2}))];
        let bytes = encode(&rows, FileFormat::Jsonl).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "{\"id\":1}\n{\"id\":2}\n");
    }

    #[test]
    fn test_encode_write_appends_after_stored_rows() {
        let stored = encode(&[row(json!({"id": 1}))], FileFormat::Json).unwrap();
        let new = vec![row(json!({"id": 2}))];

        let appended = encode_write(WriteMode::Append, Some(&stored), &new, FileFormat::Json).unwrap();
        assert_eq!(
            decode(&appended, FileFormat::Json).unwrap(),
            vec![row(json!({"id": 1})), row(json!({"id": 2}))]
        );

        let replaced = encode_write(WriteMode::Replace, Some(&stored), &new, FileFormat::Json).unwrap();
        assert_eq!(decode(&replaced, FileFormat::Json).unwrap(), new);

        let fresh = encode_write(WriteMode::Append, None, &new, FileFormat::Jsonl).unwrap();
        assert_eq!(String::from_utf8(fresh).unwrap(), "{\"id\":2}\n");
    }

    #[tokio::test]
    async fn test_deferred_stream_yields_rows_and_errors() {
        let rows: Vec<Row> = deferred(async { Ok(vec![row(json!({"id": 1}))]) })
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        let result: Result<Vec<Row>, _> =
            deferred(async { Err(ConnectorError::Timeout("slow".into())) })
                .try_collect()
                .await;
        assert!(matches!(result, Err(ConnectorError::Timeout(_))));
    }
}
