//! Application state shared by the HTTP handlers.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::db::DbPool;
use crate::engine::Engine;

/// Shared application state.
///
/// Cloned into every handler through Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,

    pub config: Arc<EngineConfig>,

    /// Present when definitions and executions live in PostgreSQL.
    pub db: Option<DbPool>,

    /// Server start time for uptime calculation
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, config: EngineConfig, db: Option<DbPool>) -> Self {
        Self {
            engine,
            config: Arc::new(config),
            db,
            start_time: std::time::Instant::now(),
        }
    }

    /// Get the server uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
