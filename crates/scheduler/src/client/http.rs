//! Engine HTTP client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tessera_connectors::Arrival;
use tessera_engine::engine::RunStart;
use tessera_engine::model::{Execution, ExecutionStatus, Flow, RunRequest};
use uuid::Uuid;

use super::{RequestError, RunRequester, RunResponse};

#[derive(Debug, Deserialize)]
struct ConflictBody {
    execution_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct LastFiredBody {
    instant: Option<DateTime<Utc>>,
}

/// HTTP client for the engine API.
#[derive(Clone)]
pub struct HttpRequester {
    client: reqwest::Client,
    engine_url: String,
    max_retries: u32,
}

impl HttpRequester {
    pub fn new(engine_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            engine_url: engine_url.trim_end_matches('/').to_string(),
            max_retries: 3,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.engine_url, path)
    }

    /// Retry connection-level failures. Status errors are returned as is.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, RequestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        let mut delay = Duration::from_millis(500);

        for attempt in 0..self.max_retries {
            match call().await {
                Err(RequestError::Http(e)) if e.is_connect() || e.is_timeout() => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        error = %e,
                        what,
                        "Engine request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, Duration::from_secs(10));
                }
                other => return other,
            }
        }

        call().await
    }

    async fn get_json<T: DeserializeOwned + Send>(&self, path: &str) -> Result<T, RequestError> {
        let this = self;
        self.with_retry(path, move || async move {
            let response = this.client.get(this.url(path)).send().await?;
            if !response.status().is_success() {
                return Err(status_error(response).await);
            }
            Ok(response.json().await?)
        })
        .await
    }
}

async fn status_error(response: reqwest::Response) -> RequestError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    RequestError::Status { status, body }
}

#[async_trait]
impl RunRequester for HttpRequester {
    async fn list_flows(&self) -> Result<Vec<Flow>, RequestError> {
        self.get_json("/api/flows").await
    }

    async fn last_fired_instant(&self, flow_id: &str) -> Result<Option<DateTime<Utc>>, RequestError> {
        let body: LastFiredBody = self
            .get_json(&format!("/api/flows/{}/last-fired", flow_id))
            .await?;
        Ok(body.instant)
    }

    async fn new_arrivals(&self, flow_id: &str) -> Result<Vec<Arrival>, RequestError> {
        self.get_json(&format!("/api/flows/{}/arrivals", flow_id)).await
    }

    async fn request_run(&self, request: &RunRequest) -> Result<RunResponse, RequestError> {
        let url = self.url(&format!("/api/flows/{}/runs", request.flow_id));
        let body = serde_json::json!({
            "trigger": request.trigger,
            "params": request.params,
        });

        let client = &self.client;
        let (url, body) = (&url, &body);
        self.with_retry("request_run", move || async move {
            let response = client.post(url).json(body).send().await?;
            match response.status() {
                StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED => {
                    Ok(match response.json::<RunStart>().await? {
                        RunStart::Started { execution_id } => RunResponse::Started(execution_id),
                        RunStart::Duplicate { execution_id } => {
                            RunResponse::AlreadyFired(execution_id)
                        }
                    })
                }
                StatusCode::CONFLICT => {
                    let conflict: ConflictBody = response.json().await?;
                    Ok(RunResponse::AlreadyRunning(conflict.execution_id))
                }
                _ => Err(status_error(response).await),
            }
        })
        .await
    }

    async fn execution_status(&self, execution_id: Uuid) -> Result<ExecutionStatus, RequestError> {
        let execution: Execution = self
            .get_json(&format!("/api/executions/{}", execution_id))
            .await?;
        Ok(execution.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_slash_trimmed() {
        let requester = HttpRequester::new("http://engine:8090/", Duration::from_secs(1));
        assert_eq!(requester.url("/api/flows"), "http://engine:8090/api/flows");
    }

    #[tokio::test]
    async fn test_unreachable_engine_is_http_error() {
        let mut requester = HttpRequester::new("http://127.0.0.1:9", Duration::from_millis(200));
        requester.max_retries = 0;
        let result = requester.list_flows().await;
        assert!(matches!(result, Err(RequestError::Http(_))));
    }
}
