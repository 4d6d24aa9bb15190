//! Tessera Engine Library
//!
//! Definitions-first ETL orchestration:
//!
//! - **Entity Model**: tables, mappings, steps, flows and connections that
//!   reference each other by id
//! - **Override Resolution**: a mapping's update rules merged over its
//!   target's defaults, with the origin of each rule
//! - **Dependency Planning**: step ordering derived from data dependencies
//!   plus explicit `after` edges, with cycle detection
//! - **Execution**: bounded parallel step execution with retry, cancellation
//!   and upstream-failure propagation
//! - **Run Ledger**: event-sourced execution records, idempotent trigger
//!   fires and watch watermarks
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables
//! - [`metadata`]: Definition storage and run snapshots
//! - [`resolver`]: Effective update rules
//! - [`graph`]: Dependency graph and execution plan
//! - [`engine`]: Run orchestration
//! - [`ledger`]: Execution records
//! - [`handlers`]: HTTP route handlers
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tessera_connectors::ConnectorRegistry;
//! use tessera_engine::{
//!     config::EngineConfig, engine::Engine, ledger::MemoryLedger,
//!     metadata::MemoryMetadataStore, model::RunRequest,
//! };
//!
//! let store = MemoryMetadataStore::from_yaml(&std::fs::read_to_string("project.yaml")?)?;
//! let engine = Arc::new(Engine::new(
//!     Arc::new(store),
//!     Arc::new(MemoryLedger::new()),
//!     ConnectorRegistry::with_builtin(),
//!     &EngineConfig::default(),
//! ));
//! let started = engine.request_run(RunRequest::manual("nightly")).await?;
//! let execution = engine.await_completion(started.execution_id()).await?;
//! ```

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod graph;
pub mod handlers;
pub mod ledger;
pub mod logic;
pub mod metadata;
pub mod model;
pub mod resolver;
pub mod result_ext;
pub mod state;
pub mod validate;

pub use error::{AppError, AppResult};
pub use result_ext::ResultExt;
