//! Configuration for the Tessera engine.
//!
//! Loaded from environment variables with `envy`.

mod app;
mod database;

pub use app::{EngineConfig, MetadataBackend};
pub use database::DatabaseConfig;
