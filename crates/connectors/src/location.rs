//! Connection and location descriptors shared by every connector.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of data store a connection points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionKind {
    /// Relational database (PostgreSQL).
    Database,
    /// Object storage (S3, GCS, Azure Blob, file://).
    ObjectStore,
    /// FTP endpoint.
    Ftp,
    /// Local filesystem.
    LocalFilesystem,
    /// In-process tables, for tests and dry runs.
    Memory,
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database => write!(f, "database"),
            Self::ObjectStore => write!(f, "object-store"),
            Self::Ftp => write!(f, "ftp"),
            Self::LocalFilesystem => write!(f, "local-filesystem"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// A named connection. The configuration blob is only interpreted by the
/// connector registered for `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub kind: ConnectionKind,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Connection {
    pub fn new(id: impl Into<String>, kind: ConnectionKind, config: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            kind,
            config,
        }
    }
}

/// Encoding of rows in file-like stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    /// One JSON object per line.
    #[default]
    Jsonl,
    /// A single JSON array of objects.
    Json,
}

/// Physical location of a table: a connection plus a table name or path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub connection: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<FileFormat>,
}

impl Location {
    pub fn new(connection: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            path: path.into(),
            format: None,
        }
    }

    pub fn with_format(mut self, format: FileFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn file_format(&self) -> FileFormat {
        self.format.unwrap_or_default()
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.connection, self.path)
    }
}

/// An item observed at a watched location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arrival {
    pub path: String,
    pub modified: DateTime<Utc>,
    /// Store-specific change token (etag, size, mtime).
    #[serde(default)]
    pub token: String,
}

/// Last-seen arrival marker for a watched location.
///
/// Arrivals are totally ordered by `(modified, path)`; anything strictly
/// greater than the watermark is new.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub modified: DateTime<Utc>,
    pub path: String,
    #[serde(default)]
    pub token: String,
}

impl Watermark {
    /// Whether `arrival` comes after this watermark.
    pub fn admits(&self, arrival: &Arrival) -> bool {
        (arrival.modified, arrival.path.as_str()) > (self.modified, self.path.as_str())
    }
}

impl From<&Arrival> for Watermark {
    fn from(arrival: &Arrival) -> Self {
        Self {
            modified: arrival.modified,
            path: arrival.path.clone(),
            token: arrival.token.clone(),
        }
    }
}

/// Keep the arrivals newer than `watermark`, ordered oldest first.
pub fn select_new_arrivals(mut arrivals: Vec<Arrival>, watermark: Option<&Watermark>) -> Vec<Arrival> {
    if let Some(watermark) = watermark {
        arrivals.retain(|a| watermark.admits(a));
    }
    arrivals.sort_by(|a, b| (a.modified, &a.path).cmp(&(b.modified, &b.path)));
    arrivals
}
