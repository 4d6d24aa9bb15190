//! In-process run ledger. A single mutex makes `begin_execution` atomic.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tessera_connectors::{Location, Watermark};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{advance, BeginOutcome, EventKind, ExecutionEvent, RunLedger};
use crate::error::{AppError, AppResult};
use crate::model::{ConcurrencyPolicy, Execution, RunRequest};

#[derive(Default)]
struct Inner {
    events: HashMap<Uuid, Vec<ExecutionEvent>>,
    executions: HashMap<Uuid, Execution>,
    /// Creation order.
    order: Vec<Uuid>,
    /// Serialized flows with an active execution.
    active: HashMap<String, Uuid>,
    fires: HashMap<(String, String), Uuid>,
    last_fired: HashMap<String, DateTime<Utc>>,
    watermarks: HashMap<(String, Location), Watermark>,
}

#[derive(Default)]
pub struct MemoryLedger {
    inner: Mutex<Inner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw event log of an execution, oldest first.
    pub async fn events(&self, id: Uuid) -> Vec<ExecutionEvent> {
        self.inner
            .lock()
            .await
            .events
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of executions ever recorded.
    pub async fn execution_count(&self) -> usize {
        self.inner.lock().await.order.len()
    }
}

impl Inner {
    fn append(&mut self, event: ExecutionEvent) -> AppResult<()> {
        let execution = self
            .executions
            .get_mut(&event.execution_id)
            .ok_or_else(|| AppError::NotFound(format!("execution {}", event.execution_id)))?;

        execution.apply_event(&event);
        if execution.status.is_terminal() {
            let flow_id = execution.flow_id.clone();
            if self.active.get(&flow_id) == Some(&event.execution_id) {
                self.active.remove(&flow_id);
            }
        }
        self.events.entry(event.execution_id).or_default().push(event);
        Ok(())
    }
}

#[async_trait]
impl RunLedger for MemoryLedger {
    async fn begin_execution(
        &self,
        request: &RunRequest,
        policy: ConcurrencyPolicy,
        step_ids: &[String],
    ) -> AppResult<BeginOutcome> {
        let mut inner = self.inner.lock().await;
        let flow_id = request.flow_id.clone();

        if let Some(key) = &request.trigger.dedup_key {
            if let Some(id) = inner.fires.get(&(flow_id.clone(), key.clone())) {
                return Ok(BeginOutcome::AlreadyFired(*id));
            }
        }
        if policy == ConcurrencyPolicy::Serialize {
            if let Some(id) = inner.active.get(&flow_id) {
                return Ok(BeginOutcome::AlreadyRunning(*id));
            }
        }

        let id = Uuid::new_v4();
        let created = ExecutionEvent::new(
            id,
            EventKind::ExecutionCreated {
                flow_id: flow_id.clone(),
                trigger: request.trigger.clone(),
                params: request.params.clone(),
                steps: step_ids.to_vec(),
            },
        );
        let execution = Execution::from_events(std::slice::from_ref(&created))
            .ok_or_else(|| AppError::Internal("execution_created did not replay".into()))?;

        inner.executions.insert(id, execution.clone());
        inner.events.insert(id, vec![created]);
        inner.order.push(id);
        if policy == ConcurrencyPolicy::Serialize {
            inner.active.insert(flow_id.clone(), id);
        }

        if let Some(key) = &request.trigger.dedup_key {
            inner.fires.insert((flow_id.clone(), key.clone()), id);
        }
        if let Some(instant) = request.trigger.instant {
            let last = inner.last_fired.entry(flow_id.clone()).or_insert(instant);
            if instant > *last {
                *last = instant;
            }
        }
        if let Some(advance_to) = &request.trigger.watermark {
            let key = (flow_id.clone(), advance_to.location.clone());
            if advance(inner.watermarks.get(&key), &advance_to.watermark) {
                inner.watermarks.insert(key, advance_to.watermark.clone());
            }
        }

        Ok(BeginOutcome::Started(execution))
    }

    async fn record_event(&self, event: ExecutionEvent) -> AppResult<()> {
        self.inner.lock().await.append(event)
    }

    async fn get_execution(&self, id: Uuid) -> AppResult<Option<Execution>> {
        Ok(self.inner.lock().await.executions.get(&id).cloned())
    }

    async fn active_execution(&self, flow_id: &str) -> AppResult<Option<Uuid>> {
        Ok(self.inner.lock().await.active.get(flow_id).copied())
    }

    async fn list_active(&self) -> AppResult<Vec<Execution>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.executions.get(id))
            .filter(|e| e.status.is_active())
            .cloned()
            .collect())
    }

    async fn list_executions(&self, flow_id: &str) -> AppResult<Vec<Execution>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.executions.get(id))
            .filter(|e| e.flow_id == flow_id)
            .cloned()
            .collect())
    }

    async fn watermark(&self, flow_id: &str, location: &Location) -> AppResult<Option<Watermark>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .watermarks
            .get(&(flow_id.to_string(), location.clone()))
            .cloned())
    }

    async fn last_fired_instant(&self, flow_id: &str) -> AppResult<Option<DateTime<Utc>>> {
        Ok(self.inner.lock().await.last_fired.get(flow_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionStatus, TriggerInfo};
    use chrono::TimeZone;
    use tessera_connectors::Arrival;

    fn steps() -> Vec<String> {
        vec!["s1".to_string()]
    }

    #[tokio::test]
    async fn test_serialized_flow_rejects_second_run() {
        let ledger = MemoryLedger::new();
        let request = RunRequest::manual("nightly");

        let BeginOutcome::Started(first) = ledger
            .begin_execution(&request, ConcurrencyPolicy::Serialize, &steps())
            .await
            .unwrap()
        else {
            panic!("first run should start");
        };
        assert_eq!(first.status, ExecutionStatus::Pending);

        let second = ledger
            .begin_execution(&request, ConcurrencyPolicy::Serialize, &steps())
            .await
            .unwrap();
        assert_eq!(second, BeginOutcome::AlreadyRunning(first.id));
        assert_eq!(ledger.execution_count().await, 1);

        ledger
            .record_event(ExecutionEvent::new(first.id, EventKind::ExecutionSucceeded))
            .await
            .unwrap();
        assert!(ledger.active_execution("nightly").await.unwrap().is_none());
        assert!(matches!(
            ledger
                .begin_execution(&request, ConcurrencyPolicy::Serialize, &steps())
                .await
                .unwrap(),
            BeginOutcome::Started(_)
        ));
    }

    #[tokio::test]
    async fn test_parallel_flow_allows_overlap() {
        let ledger = MemoryLedger::new();
        let request = RunRequest::manual("adhoc");
        for _ in 0..2 {
            assert!(matches!(
                ledger
                    .begin_execution(&request, ConcurrencyPolicy::Parallel, &steps())
                    .await
                    .unwrap(),
                BeginOutcome::Started(_)
            ));
        }
        assert_eq!(ledger.list_active().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dedup_key_fires_once() {
        let ledger = MemoryLedger::new();
        let instant = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let request = RunRequest {
            flow_id: "nightly".into(),
            trigger: TriggerInfo::schedule("nightly", instant),
            params: Default::default(),
        };

        let BeginOutcome::Started(first) = ledger
            .begin_execution(&request, ConcurrencyPolicy::Parallel, &steps())
            .await
            .unwrap()
        else {
            panic!("first fire should start");
        };
        let again = ledger
            .begin_execution(&request, ConcurrencyPolicy::Parallel, &steps())
            .await
            .unwrap();
        assert_eq!(again, BeginOutcome::AlreadyFired(first.id));
        assert_eq!(ledger.last_fired_instant("nightly").await.unwrap(), Some(instant));
    }

    #[tokio::test]
    async fn test_watermark_committed_with_start() {
        let ledger = MemoryLedger::new();
        let location = Location::new("landing", "inbox/");
        let arrival = Arrival {
            path: "inbox/a.jsonl".into(),
            modified: Utc.timestamp_opt(100, 0).unwrap(),
            token: "etag-1".into(),
        };
        let trigger = TriggerInfo::watch("ingest", &location, vec![arrival]).unwrap();
        let request = RunRequest {
            flow_id: "ingest".into(),
            trigger,
            params: Default::default(),
        };

        assert!(ledger.watermark("ingest", &location).await.unwrap().is_none());
        ledger
            .begin_execution(&request, ConcurrencyPolicy::Serialize, &steps())
            .await
            .unwrap();
        let watermark = ledger.watermark("ingest", &location).await.unwrap().unwrap();
        assert_eq!(watermark.path, "inbox/a.jsonl");
        assert_eq!(watermark.token, "etag-1");
    }

    #[tokio::test]
    async fn test_materialized_view_matches_replay() {
        let ledger = MemoryLedger::new();
        let BeginOutcome::Started(execution) = ledger
            .begin_execution(&RunRequest::manual("f"), ConcurrencyPolicy::Serialize, &steps())
            .await
            .unwrap()
        else {
            panic!("should start");
        };
        for kind in [
            EventKind::ExecutionStarted,
            EventKind::StepStarted { step_id: "s1".into() },
            EventKind::StepSucceeded {
                step_id: "s1".into(),
                attempts: 1,
                rows_read: 3,
                rows_written: 3,
            },
            EventKind::ExecutionSucceeded,
        ] {
            ledger
                .record_event(ExecutionEvent::new(execution.id, kind))
                .await
                .unwrap();
        }

        let stored = ledger.get_execution(execution.id).await.unwrap().unwrap();
        let replayed = Execution::from_events(&ledger.events(execution.id).await).unwrap();
        assert_eq!(stored, replayed);
        assert_eq!(stored.status, ExecutionStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_event_for_unknown_execution() {
        let ledger = MemoryLedger::new();
        let err = ledger
            .record_event(ExecutionEvent::new(Uuid::new_v4(), EventKind::ExecutionStarted))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
