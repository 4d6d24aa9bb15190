//! Connector implementations.

pub mod ftp;
pub mod local;
pub mod memory;
pub mod object_storage;
pub mod postgres;

use std::sync::Arc;

pub use ftp::FtpConnector;
pub use local::LocalConnector;
pub use memory::MemoryConnector;
pub use object_storage::ObjectStoreConnector;
pub use postgres::PostgresConnector;

use crate::location::ConnectionKind;
use crate::registry::{Connector, ConnectorRegistry};

/// Register factories for the four store kinds.
pub fn register_builtin(registry: &mut ConnectorRegistry) {
    registry.register(ConnectionKind::Database, |conn| {
        Ok(Arc::new(PostgresConnector::from_config(&conn.config)?) as Arc<dyn Connector>)
    });
    registry.register(ConnectionKind::ObjectStore, |conn| {
        Ok(Arc::new(ObjectStoreConnector::from_config(&conn.config)?) as Arc<dyn Connector>)
    });
    registry.register(ConnectionKind::Ftp, |conn| {
        Ok(Arc::new(FtpConnector::from_config(&conn.config)?) as Arc<dyn Connector>)
    });
    registry.register(ConnectionKind::LocalFilesystem, |conn| {
        Ok(Arc::new(LocalConnector::from_config(&conn.config)?) as Arc<dyn Connector>)
    });
}
