//! In-process requester over an embedded engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tessera_connectors::Arrival;
use tessera_engine::engine::{Engine, RunStart};
use tessera_engine::model::{ExecutionStatus, Flow, RunRequest};
use tessera_engine::AppError;
use uuid::Uuid;

use super::{RequestError, RunRequester, RunResponse};

#[derive(Clone)]
pub struct LocalRequester {
    engine: Arc<Engine>,
}

impl LocalRequester {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

fn engine_error(e: AppError) -> RequestError {
    RequestError::Engine(e.to_string())
}

#[async_trait]
impl RunRequester for LocalRequester {
    async fn list_flows(&self) -> Result<Vec<Flow>, RequestError> {
        self.engine.list_flows().await.map_err(engine_error)
    }

    async fn last_fired_instant(&self, flow_id: &str) -> Result<Option<DateTime<Utc>>, RequestError> {
        self.engine
            .last_fired_instant(flow_id)
            .await
            .map_err(engine_error)
    }

    async fn new_arrivals(&self, flow_id: &str) -> Result<Vec<Arrival>, RequestError> {
        self.engine.new_arrivals(flow_id).await.map_err(engine_error)
    }

    async fn request_run(&self, request: &RunRequest) -> Result<RunResponse, RequestError> {
        match self.engine.request_run(request.clone()).await {
            Ok(RunStart::Started { execution_id }) => Ok(RunResponse::Started(execution_id)),
            Ok(RunStart::Duplicate { execution_id }) => Ok(RunResponse::AlreadyFired(execution_id)),
            Err(AppError::AlreadyRunning { execution_id, .. }) => {
                Ok(RunResponse::AlreadyRunning(execution_id))
            }
            Err(e) => Err(engine_error(e)),
        }
    }

    async fn execution_status(&self, execution_id: Uuid) -> Result<ExecutionStatus, RequestError> {
        self.engine
            .get_execution_status(execution_id)
            .await
            .map(|execution| execution.status)
            .map_err(engine_error)
    }
}
