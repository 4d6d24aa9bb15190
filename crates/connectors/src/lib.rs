//! Tessera Connectors
//!
//! Capability-based adapters for the stores a flow reads from and writes to:
//!
//! - **database**: PostgreSQL tables, transactional writes
//! - **object-store**: S3, GCS, Azure Blob or `file://` via `object_store`
//! - **ftp**: plain FTP servers
//! - **local-filesystem**: JSON files under a root directory
//!
//! Every connector reads lazily, applies the resolved update rules to each
//! row on write, and classifies its errors as transient or terminal.

pub mod connectors;
pub mod error;
pub mod location;
pub mod registry;
pub mod row;
pub mod rules;

pub use connectors::MemoryConnector;
pub use error::ConnectorError;
pub use location::{Arrival, Connection, ConnectionKind, FileFormat, Location, Watermark};
pub use registry::{Capability, Connector, ConnectorFactory, ConnectorRegistry};
pub use row::{Row, RowStream, WriteMode, WriteRecord, WriteSummary};
pub use rules::{RuleExpr, RuleSet};
