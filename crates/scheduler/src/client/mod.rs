//! How the scheduler reaches the engine.

pub mod http;
pub mod local;

pub use http::HttpRequester;
pub use local::LocalRequester;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tessera_connectors::Arrival;
use tessera_engine::model::{ExecutionStatus, Flow, RunRequest};
use thiserror::Error;
use uuid::Uuid;

/// Engine's answer to a run request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResponse {
    Started(Uuid),
    /// The flow is running; the request was not accepted.
    AlreadyRunning(Uuid),
    /// The trigger already produced this execution.
    AlreadyFired(Uuid),
}

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Engine returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Engine error: {0}")]
    Engine(String),
}

/// Engine operations the scheduler depends on.
#[async_trait]
pub trait RunRequester: Send + Sync {
    async fn list_flows(&self) -> Result<Vec<Flow>, RequestError>;

    async fn last_fired_instant(&self, flow_id: &str) -> Result<Option<DateTime<Utc>>, RequestError>;

    /// Arrivals beyond the flow's watermark, oldest first.
    async fn new_arrivals(&self, flow_id: &str) -> Result<Vec<Arrival>, RequestError>;

    async fn request_run(&self, request: &RunRequest) -> Result<RunResponse, RequestError>;

    async fn execution_status(&self, execution_id: Uuid) -> Result<ExecutionStatus, RequestError>;
}
