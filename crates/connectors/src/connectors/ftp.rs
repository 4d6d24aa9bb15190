//! FTP connector.
//!
//! The FTP client is blocking; every operation opens a session on the
//! blocking thread pool, does its work and quits.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use suppaftp::types::FileType;
use suppaftp::FtpStream;

use crate::error::ConnectorError;
use crate::location::{select_new_arrivals, Arrival, ConnectionKind, Location, Watermark};
use crate::registry::{Capability, Connector};
use crate::row::{decode, deferred, encode_write, RowStream, WriteMode, WriteRecord, WriteSummary};
use crate::rules::{RuleApplier, RuleSet};

/// FTP connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Directory that location paths are resolved against.
    #[serde(default)]
    pub root: String,
}

fn default_port() -> u16 {
    21
}

fn default_user() -> String {
    "anonymous".to_string()
}

/// Connector for files on an FTP server.
#[derive(Debug, Clone)]
pub struct FtpConnector {
    config: FtpConfig,
}

impl FtpConnector {
    pub fn new(config: FtpConfig) -> Self {
        Self { config }
    }

    pub fn from_config(config: &serde_json::Value) -> Result<Self, ConnectorError> {
        let config: FtpConfig = serde_json::from_value(config.clone())
            .map_err(|e| ConnectorError::Configuration(format!("Invalid ftp config: {}", e)))?;
        if config.host.is_empty() {
            return Err(ConnectorError::Configuration("ftp host is empty".to_string()));
        }
        Ok(Self::new(config))
    }

    fn remote_path(&self, location: &Location) -> String {
        join_remote(&self.config.root, &location.path)
    }

    /// Run `op` inside a logged-in session on the blocking pool.
    async fn with_session<T, F>(&self, op: F) -> Result<T, ConnectorError>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> Result<T, ConnectorError> + Send + 'static,
    {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let mut ftp = FtpStream::connect((config.host.as_str(), config.port))?;
            ftp.login(&config.user, &config.password)?;
            ftp.transfer_type(FileType::Binary)?;
            let result = op(&mut ftp);
            if let Err(e) = ftp.quit() {
                tracing::debug!(error = %e, host = %config.host, "FTP quit failed");
            }
            result
        })
        .await?
    }
}

fn join_remote(root: &str, path: &str) -> String {
    let root = root.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if root.is_empty() {
        format!("/{}", path)
    } else {
        format!("{}/{}", root, path)
    }
}

fn strip_root<'a>(root: &str, path: &'a str) -> &'a str {
    let root = root.trim_end_matches('/');
    path.strip_prefix(root)
        .unwrap_or(path)
        .trim_start_matches('/')
}

#[async_trait]
impl Connector for FtpConnector {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Ftp
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
        let this = self.clone();
        let path = self.remote_path(location);
        let format = location.file_format();
        Ok(deferred(async move {
            let bytes = this
                .with_session(move |ftp| Ok(ftp.retr_as_buffer(&path)?.into_inner()))
                .await?;
            decode(&bytes, format)
        }))
    }

    async fn write(
        &self,
        location: &Location,
        rules: &RuleSet,
        records: &[WriteRecord],
        mode: WriteMode,
    ) -> Result<WriteSummary, ConnectorError> {
        let rows = RuleApplier::new(rules, Utc::now())?.apply_all(records)?;
        let rows_written = rows.len() as u64;
        let format = location.file_format();
        let path = self.remote_path(location);
        let staging = format!("{}.partial", path);

        self.with_session(move |ftp| {
            let existing = match mode {
                WriteMode::Replace => None,
                WriteMode::Append => match ftp.retr_as_buffer(&path) {
                    Ok(buffer) => Some(buffer.into_inner()),
                    Err(e) => match ConnectorError::from(e) {
                        ConnectorError::NotFound(_) => None,
                        other => return Err(other),
                    },
                },
            };
            let bytes = encode_write(mode, existing.as_deref(), &rows, format)?;
            ftp.put_file(&staging, &mut Cursor::new(bytes))?;
            ftp.rename(&staging, &path)?;
            Ok(())
        })
        .await?;

        Ok(WriteSummary { rows_written })
    }

    async fn list_new_arrivals(
        &self,
        location: &Location,
        watermark: Option<&Watermark>,
    ) -> Result<Vec<Arrival>, ConnectorError> {
        let dir = self.remote_path(location);
        let root = self.config.root.clone();

        let arrivals = self
            .with_session(move |ftp| {
                let names = match ftp.nlst(Some(&dir)) {
                    Ok(names) => names,
                    Err(e) => match ConnectorError::from(e) {
                        ConnectorError::NotFound(_) => return Ok(Vec::new()),
                        other => return Err(other),
                    },
                };

                let mut arrivals = Vec::new();
                for name in names {
                    let full = if name.starts_with('/') {
                        name
                    } else {
                        join_remote(&dir, &name)
                    };
                    if full.ends_with(".partial") {
                        continue;
                    }
                    // Directories have no modification time.
                    let Ok(modified) = ftp.mdtm(&full) else {
                        continue;
                    };
                    let size = ftp.size(&full).unwrap_or_default();
                    arrivals.push(Arrival {
                        path: strip_root(&root, &full).to_string(),
                        modified: modified.and_utc(),
                        token: size.to_string(),
                    });
                }
                Ok(arrivals)
            })
            .await?;

        Ok(select_new_arrivals(arrivals, watermark))
    }

    async fn exists(&self, location: &Location) -> Result<bool, ConnectorError> {
        let path = self.remote_path(location);
        self.with_session(move |ftp| match ftp.size(&path) {
            Ok(_) => Ok(true),
            Err(e) => match ConnectorError::from(e) {
                ConnectorError::NotFound(_) => Ok(ftp.cwd(&path).is_ok()),
                other => Err(other),
            },
        })
        .await
    }
}
