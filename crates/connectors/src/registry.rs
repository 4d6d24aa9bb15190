//! Connector trait, capabilities and the registry that builds connectors
//! from connection records.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::ConnectorError;
use crate::location::{Arrival, Connection, ConnectionKind, Location, Watermark};
use crate::row::{RowStream, WriteMode, WriteRecord, WriteSummary};
use crate::rules::RuleSet;

/// Operations a connector may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Read,
    Write,
    ListArrivals,
    Exists,
}

/// A data store adapter bound to one connection.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Kind of store this connector talks to.
    fn kind(&self) -> ConnectionKind;

    /// Capabilities this connector implements.
    fn capabilities(&self) -> &'static [Capability];

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Read the rows at `location`.
    async fn read(&self, location: &Location) -> Result<RowStream, ConnectorError>;

    /// Apply `rules` to each record and persist the result at `location`.
    /// `mode` says whether rows already stored there survive.
    async fn write(
        &self,
        location: &Location,
        rules: &RuleSet,
        records: &[WriteRecord],
        mode: WriteMode,
    ) -> Result<WriteSummary, ConnectorError>;

    /// Items at `location` newer than `watermark`, oldest first.
    async fn list_new_arrivals(
        &self,
        location: &Location,
        _watermark: Option<&Watermark>,
    ) -> Result<Vec<Arrival>, ConnectorError> {
        Err(ConnectorError::Unsupported(format!(
            "{} connector cannot list arrivals at {}",
            self.kind(),
            location
        )))
    }

    /// Whether anything exists at `location`.
    async fn exists(&self, location: &Location) -> Result<bool, ConnectorError>;
}

/// Builds a connector from a connection record.
pub type ConnectorFactory =
    Arc<dyn Fn(&Connection) -> Result<Arc<dyn Connector>, ConnectorError> + Send + Sync>;

/// Registry of connector factories, with built connectors cached per
/// connection identity.
pub struct ConnectorRegistry {
    factories: HashMap<ConnectionKind, ConnectorFactory>,
    bound: HashMap<String, Arc<dyn Connector>>,
    cache: RwLock<HashMap<String, (serde_json::Value, Arc<dyn Connector>)>>,
}

impl ConnectorRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            bound: HashMap::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the built-in database, object-store, ftp and
    /// local-filesystem connectors.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        crate::connectors::register_builtin(&mut registry);
        registry
    }

    /// Register a factory for a connection kind, replacing any previous one.
    pub fn register<F>(&mut self, kind: ConnectionKind, factory: F)
    where
        F: Fn(&Connection) -> Result<Arc<dyn Connector>, ConnectorError> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Arc::new(factory));
    }

    /// Bind a ready-made connector to a connection identity.
    pub fn bind(&mut self, connection_id: impl Into<String>, connector: Arc<dyn Connector>) {
        self.bound.insert(connection_id.into(), connector);
    }

    /// Check if a factory is registered for `kind`.
    pub fn has(&self, kind: ConnectionKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// List all kinds with a registered factory.
    pub fn kinds(&self) -> Vec<ConnectionKind> {
        self.factories.keys().copied().collect()
    }

    /// Get the connector for `connection`, building it on first use.
    pub async fn connect(&self, connection: &Connection) -> Result<Arc<dyn Connector>, ConnectorError> {
        if let Some(connector) = self.bound.get(&connection.id) {
            return Ok(connector.clone());
        }

        {
            let cache = self.cache.read().await;
            if let Some((config, connector)) = cache.get(&connection.id) {
                if *config == connection.config {
                    return Ok(connector.clone());
                }
            }
        }

        let factory = self.factories.get(&connection.kind).ok_or_else(|| {
            ConnectorError::Unsupported(format!("No connector registered for kind '{}'", connection.kind))
        })?;
        let connector = factory(connection)?;

        tracing::debug!(
            connection = %connection.id,
            kind = %connection.kind,
            "Connector created"
        );

        let mut cache = self.cache.write().await;
        cache.insert(
            connection.id.clone(),
            (connection.config.clone(), connector.clone()),
        );
        Ok(connector)
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .field("bound", &self.bound.keys().collect::<Vec<_>>())
            .finish()
    }
}
