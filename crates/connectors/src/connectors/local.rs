//! Local filesystem connector.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConnectorError;
use crate::location::{select_new_arrivals, Arrival, ConnectionKind, Location, Watermark};
use crate::registry::{Capability, Connector};
use crate::row::{decode, deferred, encode_write, Row, RowStream, WriteMode, WriteRecord, WriteSummary};
use crate::rules::{RuleApplier, RuleSet};

/// Local filesystem connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Directory that location paths are resolved against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

/// Reads and writes JSON files on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    root: PathBuf,
}

impl LocalConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &serde_json::Value) -> Result<Self, ConnectorError> {
        let config: LocalConfig = serde_json::from_value(config.clone()).map_err(|e| {
            ConnectorError::Configuration(format!("Invalid local-filesystem config: {}", e))
        })?;
        Ok(Self::new(config.root.unwrap_or_else(|| PathBuf::from("."))))
    }

    fn resolve(&self, location: &Location) -> Result<PathBuf, ConnectorError> {
        let relative = Path::new(location.path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(ConnectorError::Configuration(format!(
                "Path '{}' escapes the connection root",
                location.path
            )));
        }
        Ok(self.root.join(relative))
    }

    fn relative_name(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

/// Suffix of files still being written.
const STAGING_SUFFIX: &str = ".partial";

fn is_staging(path: &Path) -> bool {
    path.to_string_lossy().ends_with(STAGING_SUFFIX)
}

/// All regular files below `dir` except staging files, sorted by path.
async fn walk_files(dir: &Path) -> Result<Vec<PathBuf>, ConnectorError> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() && !is_staging(&entry.path()) {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

async fn read_rows(path: PathBuf, location: Location) -> Result<Vec<Row>, ConnectorError> {
    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|e| with_location(e.into(), &location))?;

    let files = if metadata.is_dir() {
        walk_files(&path).await?
    } else {
        vec![path]
    };

    let mut rows = Vec::new();
    for file in files {
        let bytes = tokio::fs::read(&file).await?;
        rows.extend(decode(&bytes, location.file_format())?);
    }
    Ok(rows)
}

fn with_location(e: ConnectorError, location: &Location) -> ConnectorError {
    match e {
        ConnectorError::NotFound(_) => ConnectorError::NotFound(location.to_string()),
        other => other,
    }
}

#[async_trait]
impl Connector for LocalConnector {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::LocalFilesystem
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[
            Capability::Read,
            Capability::Write,
            Capability::ListArrivals,
            Capability::Exists,
        ]
    }

    async fn read(&self, location: &Location) -> Result<RowStream, ConnectorError> {
        let path = self.resolve(location)?;
        Ok(deferred(read_rows(path, location.clone())))
    }

    async fn write(
        &self,
        location: &Location,
        rules: &RuleSet,
        records: &[WriteRecord],
        mode: WriteMode,
    ) -> Result<WriteSummary, ConnectorError> {
        let path = self.resolve(location)?;
        let rows = RuleApplier::new(rules, Utc::now())?.apply_all(records)?;
        let existing = match mode {
            WriteMode::Append if tokio::fs::try_exists(&path).await? => {
                Some(tokio::fs::read(&path).await?)
            }
            _ => None,
        };
        let bytes = encode_write(mode, existing.as_deref(), &rows, location.file_format())?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write beside the target and rename so readers never see half a file.
        let mut staging = path.clone().into_os_string();
        staging.push(STAGING_SUFFIX);
        let staging = PathBuf::from(staging);
        tokio::fs::write(&staging, &bytes).await?;
        tokio::fs::rename(&staging, &path).await?;

        tracing::debug!(path = %path.display(), rows = rows.len(), "Wrote local file");

        Ok(WriteSummary {
            rows_written: rows.len() as u64,
        })
    }

    async fn list_new_arrivals(
        &self,
        location: &Location,
        watermark: Option<&Watermark>,
    ) -> Result<Vec<Arrival>, ConnectorError> {
        let dir = self.resolve(location)?;
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut arrivals = Vec::new();
        for file in walk_files(&dir).await? {
            let metadata = tokio::fs::metadata(&file).await?;
            let modified: DateTime<Utc> = metadata.modified()?.into();
            arrivals.push(Arrival {
                path: self.relative_name(&file),
                modified,
                token: metadata.len().to_string(),
            });
        }

        Ok(select_new_arrivals(arrivals, watermark))
    }

    async fn exists(&self, location: &Location) -> Result<bool, ConnectorError> {
        let path = self.resolve(location)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::FileFormat;
    use crate::rules::RuleExpr;
    use futures::TryStreamExt;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_config_defaults_to_cwd() {
        let conn = LocalConnector::from_config(&json!({})).unwrap();
        assert_eq!(conn.root, PathBuf::from("."));
    }

    #[test]
    fn test_parent_dir_rejected() {
        let conn = LocalConnector::new("/data");
        let result = conn.resolve(&Location::new("files", "../etc/passwd"));
        assert!(matches!(result, Err(ConnectorError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let conn = LocalConnector::new(dir.path());
        let loc = Location::new("files", "out/orders.jsonl");

        let mut rules = RuleSet::new();
        rules.insert("source_id".to_string(), RuleExpr::from("source.id"));
        let records = vec![WriteRecord::new(row(json!({"n": 1})), row(json!({"id": "a"})))];
        conn.write(&loc, &rules, &records, WriteMode::Replace)
            .await
            .unwrap();

        let rows: Vec<Row> = conn.read(&loc).await.unwrap().try_collect().await.unwrap();
        assert_eq!(rows, vec![row(json!({"n": 1, "source_id": "a"}))]);
        assert!(conn.exists(&loc).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_directory_and_json_format() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("in")).await.unwrap();
        tokio::fs::write(dir.path().join("in/a.json"), br#"[{"id":1}]"#)
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("in/b.json"), br#"[{"id":2}]"#)
            .await
            .unwrap();

        let conn = LocalConnector::new(dir.path());
        let loc = Location::new("files", "in").with_format(FileFormat::Json);
        let rows: Vec<Row> = conn.read(&loc).await.unwrap().try_collect().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], json!(1));
    }

    #[tokio::test]
    async fn test_directory_read_skips_staging_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("in")).await.unwrap();
        tokio::fs::write(dir.path().join("in/a.jsonl"), b"{\"id\":1}\n")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("in/b.jsonl.partial"), b"{\"id\":2}\n")
            .await
            .unwrap();

        let conn = LocalConnector::new(dir.path());
        let loc = Location::new("files", "in");
        let rows: Vec<Row> = conn.read(&loc).await.unwrap().try_collect().await.unwrap();
        assert_eq!(rows, vec![row(json!({"id": 1}))]);
        assert_eq!(conn.list_new_arrivals(&loc, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_append_write_keeps_file_rows() {
        let dir = tempfile::tempdir().unwrap();
        let conn = LocalConnector::new(dir.path());
        let loc = Location::new("files", "out/t.jsonl");
        let rules = RuleSet::new();

        let first = [WriteRecord::new(row(json!({"id": 1})), Row::new())];
        let second = [WriteRecord::new(row(json!({"id": 2})), Row::new())];
        conn.write(&loc, &rules, &first, WriteMode::Append).await.unwrap();
        conn.write(&loc, &rules, &second, WriteMode::Append).await.unwrap();

        let rows: Vec<Row> = conn.read(&loc).await.unwrap().try_collect().await.unwrap();
        assert_eq!(rows, vec![row(json!({"id": 1})), row(json!({"id": 2}))]);
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let conn = LocalConnector::new(dir.path());
        let result: Result<Vec<Row>, _> = conn
            .read(&Location::new("files", "nope.jsonl"))
            .await
            .unwrap()
            .try_collect()
            .await;
        assert!(matches!(result, Err(ConnectorError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_new_arrivals() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("inbox")).await.unwrap();
        tokio::fs::write(dir.path().join("inbox/1.jsonl"), b"{}\n")
            .await
            .unwrap();

        let conn = LocalConnector::new(dir.path());
        let loc = Location::new("files", "inbox");
        let arrivals = conn.list_new_arrivals(&loc, None).await.unwrap();
        assert_eq!(arrivals.len(), 1);
        assert_eq!(arrivals[0].path, "inbox/1.jsonl");

        let wm = Watermark::from(&arrivals[0]);
        assert!(conn.list_new_arrivals(&loc, Some(&wm)).await.unwrap().is_empty());

        let missing = Location::new("files", "absent");
        assert!(conn.list_new_arrivals(&missing, None).await.unwrap().is_empty());
    }
}
