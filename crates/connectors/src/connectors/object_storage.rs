//! Object storage connector (S3, GCS, Azure Blob, file://).

use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use object_store::{path::Path, ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ConnectorError;
use crate::location::{select_new_arrivals, Arrival, ConnectionKind, Location, Watermark};
use crate::registry::{Capability, Connector};
use crate::row::{decode, deferred, encode_write, Row, RowStream, WriteMode, WriteRecord, WriteSummary};
use crate::rules::{RuleApplier, RuleSet};

/// Object store connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// Store URL, e.g. `s3://bucket/prefix` or `file:///data`.
    pub url: String,

    /// Builder options passed to the store (region, credentials, endpoint).
    #[serde(default)]
    pub options: HashMap<String, String>,
}

/// Connector over any `object_store` backend.
pub struct ObjectStoreConnector {
    store: Arc<dyn ObjectStore>,
    prefix: Path,
}

impl ObjectStoreConnector {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: Path) -> Self {
        Self { store, prefix }
    }

    pub fn from_config(config: &serde_json::Value) -> Result<Self, ConnectorError> {
        let config: ObjectStoreConfig = serde_json::from_value(config.clone()).map_err(|e| {
            ConnectorError::Configuration(format!("Invalid object-store config: {}", e))
        })?;
        let url = url::Url::parse(&config.url)
            .map_err(|e| ConnectorError::Configuration(format!("Invalid store URL: {}", e)))?;
        let (store, prefix) = object_store::parse_url_opts(&url, config.options)?;
        Ok(Self::new(Arc::from(store), prefix))
    }

    fn object_path(&self, location: &Location) -> Path {
        let relative = location.path.trim_matches('/');
        if relative.is_empty() {
            return self.prefix.clone();
        }
        let mut path = self.prefix.clone();
        for part in relative.split('/').filter(|p| !p.is_empty()) {
            path = path.child(part);
        }
        path
    }

    fn relative_name(&self, path: &Path) -> String {
        match path.prefix_match(&self.prefix) {
            Some(parts) => parts.map(|p| p.as_ref().to_string()).collect::<Vec<_>>().join("/"),
            None => path.to_string(),
        }
    }
}

impl std::fmt::Debug for ObjectStoreConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreConnector")
            .field("store", &self.store.to_string())
            .field("prefix", &self.prefix)
            .finish()
    }
}

async fn read_objects(
    store: Arc<dyn ObjectStore>,
    path: Path,
    location: Location,
) -> Result<Vec<Row>, ConnectorError> {
    let format = location.file_format();
    match store.get(&path).await {
        Ok(result) => {
            let bytes = result.bytes().await?;
            return decode(&bytes, format);
        }
        Err(object_store::Error::NotFound { .. }) => {}
        Err(e) => return Err(e.into()),
    }

    // Not a single object: treat the location as a prefix.
    let mut objects: Vec<_> = store.list(Some(&path)).try_collect().await?;
    if objects.is_empty() {
        return Err(ConnectorError::NotFound(location.to_string()));
    }
    objects.sort_by(|a, b| a.location.cmp(&b.location));

    let mut rows = Vec::new();
    for meta in objects {
        let bytes = store.get(&meta.location).await?.bytes().await?;
        rows.extend(decode(&bytes, format)?);
    }
    Ok(rows)
}

#[async_trait]
impl Connector for ObjectStoreConnector {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::ObjectStore
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
        Ok(deferred(read_objects(
            self.store.clone(),
            self.object_path(location),
            location.clone(),
        )))
    }

    async fn write(
        &self,
        location: &Location,
        rules: &RuleSet,
        records: &[WriteRecord],
        mode: WriteMode,
    ) -> Result<WriteSummary, ConnectorError> {
        let rows = RuleApplier::new(rules, Utc::now())?.apply_all(records)?;
        let path = self.object_path(location);
        let existing = match mode {
            WriteMode::Replace => None,
            WriteMode::Append => match self.store.get(&path).await {
                Ok(result) => Some(result.bytes().await?),
                Err(object_store::Error::NotFound { .. }) => None,
                Err(e) => return Err(e.into()),
            },
        };
        let bytes = encode_write(mode, existing.as_deref(), &rows, location.file_format())?;

        self.store.put(&path, PutPayload::from(bytes)).await?;

        tracing::debug!(path = %path, rows = rows.len(), "Wrote object");

        Ok(WriteSummary {
            rows_written: rows.len() as u64,
        })
    }

    async fn list_new_arrivals(
        &self,
        location: &Location,
        watermark: Option<&Watermark>,
    ) -> Result<Vec<Arrival>, ConnectorError> {
        let prefix = self.object_path(location);
        let objects: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;

        let arrivals = objects
            .into_iter()
            .map(|meta| Arrival {
                path: self.relative_name(&meta.location),
                modified: meta.last_modified,
                token: meta.e_tag.unwrap_or_else(|| meta.size.to_string()),
            })
            .collect();

        Ok(select_new_arrivals(arrivals, watermark))
    }

    async fn exists(&self, location: &Location) -> Result<bool, ConnectorError> {
        let path = self.object_path(location);
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => {
                let mut listing = self.store.list(Some(&path));
                Ok(listing.try_next().await?.is_some())
            }
            Err(e) => Err(e.into()),
        }
    }
}
