#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tessera_connectors::{ConnectorRegistry, MemoryConnector, Row};
use tessera_engine::config::EngineConfig;
use tessera_engine::engine::Engine;
use tessera_engine::ledger::MemoryLedger;
use tessera_engine::metadata::MemoryMetadataStore;
use tessera_engine::model::{Execution, StepStatus};
use uuid::Uuid;

pub const PROJECT: &str = r#"
connections:
  - { id: mem, kind: memory }
tables:
  - id: raw_orders
    kind: source
    schema: [{ name: id }, { name: amount }, { name: modified_ts }]
    location: { connection: mem, path: raw_orders }
  - id: orders
    kind: target
    schema: [{ name: id }, { name: amount }, { name: modified_ts }, { name: updated_at }]
    default_rules: { updated_at: now }
    location: { connection: mem, path: orders }
  - id: stage
    kind: target
    schema: [{ name: id }, { name: amount }, { name: modified_ts }]
    location: { connection: mem, path: stage }
  - id: mart
    kind: target
    schema: [{ name: id }, { name: amount }, { name: modified_ts }]
    location: { connection: mem, path: mart }
  - id: log
    kind: target
    schema: [{ name: id }, { name: amount }, { name: modified_ts }]
    location: { connection: mem, path: log }
mappings:
  - { id: m1, sources: [{ table: raw_orders }], target: orders }
  - id: m2
    sources: [{ table: raw_orders }]
    target: orders
    overrides: { updated_at: source.modified_ts }
  - { id: to_stage, sources: [{ table: raw_orders }], target: stage }
  - { id: stage_to_mart, sources: [{ table: stage }], target: mart }
  - { id: to_log, sources: [{ table: raw_orders }], target: log }
steps:
  - { id: s1, mapping: to_stage }
  - { id: s2, mapping: stage_to_mart }
  - { id: s3, mapping: to_log }
  - { id: load_orders, mapping: m2 }
flows:
  - { id: pipeline, steps: [s1, s2, s3] }
  - { id: orders_flow, steps: [load_orders] }
  - { id: parallel_orders, steps: [load_orders], concurrency: parallel }
  - id: watch_flow
    steps: [s3]
    trigger: { type: watch, location: { connection: mem, path: "incoming/" } }
"#;

pub struct Harness {
    pub engine: Arc<Engine>,
    pub ledger: Arc<MemoryLedger>,
    pub store: Arc<MemoryMetadataStore>,
    pub memory: Arc<MemoryConnector>,
}

pub fn test_config(workers: usize) -> EngineConfig {
    EngineConfig {
        workers,
        retry_max_attempts: 3,
        retry_initial_delay_ms: 1,
        retry_max_delay_ms: 5,
        ..EngineConfig::default()
    }
}

pub fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

pub fn raw_orders() -> Vec<Row> {
    vec![
        row(json!({ "id": 1, "amount": 5, "modified_ts": "2024-01-01T00:00:00Z" })),
        row(json!({ "id": 2, "amount": 50, "modified_ts": "2024-01-02T00:00:00Z" })),
    ]
}

impl Harness {
    pub async fn new(workers: usize) -> Self {
        let store = Arc::new(MemoryMetadataStore::from_yaml(PROJECT).unwrap());
        let ledger = Arc::new(MemoryLedger::new());
        let memory = Arc::new(MemoryConnector::new());
        memory.insert_table("raw_orders", raw_orders()).await;
        let engine = Self::engine_over(store.clone(), ledger.clone(), memory.clone(), workers);
        Self {
            engine,
            ledger,
            store,
            memory,
        }
    }

    /// A second engine over the same stores, as after a process restart.
    pub fn restarted(&self) -> Arc<Engine> {
        Self::engine_over(
            self.store.clone(),
            self.ledger.clone(),
            self.memory.clone(),
            4,
        )
    }

    fn engine_over(
        store: Arc<MemoryMetadataStore>,
        ledger: Arc<MemoryLedger>,
        memory: Arc<MemoryConnector>,
        workers: usize,
    ) -> Arc<Engine> {
        let mut registry = ConnectorRegistry::new();
        registry.bind("mem", memory);
        Arc::new(Engine::new(store, ledger, registry, &test_config(workers)))
    }

    pub async fn finish(&self, id: Uuid) -> Execution {
        tokio::time::timeout(Duration::from_secs(10), self.engine.await_completion(id))
            .await
            .expect("execution did not finish")
            .unwrap()
    }

    /// Poll until some step of `id` is running.
    pub async fn wait_for_running_step(&self, id: Uuid) -> String {
        for _ in 0..500 {
            let execution = self.engine.get_execution_status(id).await.unwrap();
            if let Some(step) = execution
                .steps
                .iter()
                .find(|s| s.status == StepStatus::Running)
            {
                return step.step_id.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no step started");
    }
}

pub fn status_of(execution: &Execution, step_id: &str) -> StepStatus {
    execution.step(step_id).map(|s| s.status).unwrap()
}
