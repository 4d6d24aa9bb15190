//! Single-step execution: resolve rules, read sources, apply the mapping
//! logic and write the target.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::{json, Map, Value};
use tessera_connectors::{Connector, ConnectorError, ConnectorRegistry, Location, Row, WriteMode};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::retry::{AttemptObserver, RetryPolicy};
use crate::error::DefinitionError;
use crate::ledger::{EventKind, ExecutionEvent, RunLedger};
use crate::logic::template::{is_template, TemplateEngine};
use crate::logic::{CompiledLogic, LogicError};
use crate::metadata::Snapshot;
use crate::model::{Step, StepError, TriggerInfo};
use crate::resolver::resolve_for;
use crate::result_ext::ResultExt;

/// Row counts of a successful step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepTotals {
    pub rows_read: u64,
    pub rows_written: u64,
}

/// Everything a step needs from its execution. Shared by the step tasks of
/// one run.
pub struct StepRunner {
    snapshot: Arc<Snapshot>,
    connectors: Arc<ConnectorRegistry>,
    templates: Arc<TemplateEngine>,
    retry: RetryPolicy,
    /// Template context shared by every step of the run.
    base_context: Map<String, Value>,
    /// Tables written by several steps of the flow, each flagged once a
    /// step of this run has written it. Writes to one of them are
    /// serialized: the first replaces the table, later ones append.
    shared_targets: HashMap<String, Mutex<bool>>,
}

fn shared_targets(snapshot: &Snapshot) -> HashMap<String, Mutex<bool>> {
    let mut writers: HashMap<&str, usize> = HashMap::new();
    for step in snapshot.steps.values() {
        if let Ok(mapping) = snapshot.mapping(&step.mapping) {
            *writers.entry(mapping.target.as_str()).or_default() += 1;
        }
    }
    writers
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(table, _)| (table.to_string(), Mutex::new(false)))
        .collect()
}

impl StepRunner {
    pub fn new(
        snapshot: Arc<Snapshot>,
        connectors: Arc<ConnectorRegistry>,
        templates: Arc<TemplateEngine>,
        retry: RetryPolicy,
        execution_id: Uuid,
        trigger: &TriggerInfo,
        params: &std::collections::BTreeMap<String, Value>,
    ) -> Self {
        let mut base_context: Map<String, Value> =
            params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        base_context.insert("execution_id".into(), json!(execution_id.to_string()));
        base_context.insert("flow_id".into(), json!(snapshot.flow.id));
        base_context.insert("trigger".into(), trigger.to_context());

        Self {
            shared_targets: shared_targets(&snapshot),
            snapshot,
            connectors,
            templates,
            retry,
            base_context,
        }
    }

    /// Template context of `step`: run parameters overlaid with the step's
    /// own. Templated step parameters are rendered against the run context.
    pub fn context_for(&self, step: &Step) -> Result<Value, LogicError> {
        let base = Value::Object(self.base_context.clone());
        let mut context = self.base_context.clone();
        for (key, value) in &step.params {
            let value = match value {
                Value::String(s) if is_template(s) => self.templates.render_to_value(s, &base)?,
                other => other.clone(),
            };
            context.insert(key.clone(), value);
        }
        context.insert("step_id".into(), json!(step.id));
        Ok(Value::Object(context))
    }

    pub async fn run(
        &self,
        step_id: &str,
        observer: &dyn AttemptObserver,
    ) -> Result<StepTotals, StepError> {
        let step = self.snapshot.step(step_id).map_err(definition_error)?;
        let mapping = self.snapshot.mapping(&step.mapping).map_err(definition_error)?;
        let target = self.snapshot.table(&mapping.target).map_err(definition_error)?;
        let rules = resolve_for(mapping, target).map_err(definition_error)?;

        let context = self.context_for(step).map_err(logic_error)?;
        let logic = CompiledLogic::compile(mapping, &self.templates, &context).map_err(logic_error)?;

        let mut sources = Vec::with_capacity(mapping.sources.len());
        let mut rows_read = 0u64;
        for source in &mapping.sources {
            let table = self.snapshot.table(&source.table).map_err(definition_error)?;
            let connector = self.connect(&table.location.connection).await?;
            let connector = connector.as_ref();
            let location = &table.location;

            let rows = self
                .retry
                .run(&format!("read {}", table.id), observer, move || {
                    read_all(connector, location)
                })
                .await
                .map_err(|e| StepError::from(&e))?;

            tracing::debug!(step_id, source = %table.id, rows = rows.len(), "Source read");
            rows_read += rows.len() as u64;
            sources.push(rows);
        }

        let records = logic.apply(sources).map_err(logic_error)?;

        let connector = self.connect(&target.location.connection).await?;
        let connector = connector.as_ref();
        let location = &target.location;
        let rule_set = rules.rule_set();
        let rule_set = &rule_set;
        let batch = records.as_slice();
        let operation = format!("write {}", target.id);
        let operation = operation.as_str();
        let write = move |mode: WriteMode| {
            self.retry.run(operation, observer, move || {
                connector.write(location, rule_set, batch, mode)
            })
        };

        let summary = match self.shared_targets.get(&target.id) {
            Some(slot) => {
                let mut written = slot.lock().await;
                let mode = if *written {
                    WriteMode::Append
                } else {
                    WriteMode::Replace
                };
                let summary = write(mode).await.map_err(|e| StepError::from(&e))?;
                *written = true;
                summary
            }
            None => write(WriteMode::Replace)
                .await
                .map_err(|e| StepError::from(&e))?,
        };

        tracing::debug!(
            step_id,
            target = %target.id,
            rows_written = summary.rows_written,
            "Target written"
        );

        Ok(StepTotals {
            rows_read,
            rows_written: summary.rows_written,
        })
    }

    async fn connect(&self, connection_id: &str) -> Result<Arc<dyn Connector>, StepError> {
        let connection = self
            .snapshot
            .connection(connection_id)
            .map_err(definition_error)?;
        self.connectors
            .connect(connection)
            .await
            .map_err(|e| StepError::from(&e))
    }
}

async fn read_all(connector: &dyn Connector, location: &Location) -> Result<Vec<Row>, ConnectorError> {
    connector.read(location).await?.try_collect().await
}

fn definition_error(e: DefinitionError) -> StepError {
    StepError::new(e.code(), e.to_string())
}

fn logic_error(e: LogicError) -> StepError {
    StepError::new(e.kind(), e.to_string())
}

/// Records retried attempts of one step on the ledger and counts them.
pub struct StepRecorder {
    ledger: Arc<dyn RunLedger>,
    execution_id: Uuid,
    step_id: String,
    retries: AtomicU32,
}

impl StepRecorder {
    pub fn new(ledger: Arc<dyn RunLedger>, execution_id: Uuid, step_id: impl Into<String>) -> Self {
        Self {
            ledger,
            execution_id,
            step_id: step_id.into(),
            retries: AtomicU32::new(0),
        }
    }

    /// Attempts made so far: one plus every retry.
    pub fn attempts(&self) -> u32 {
        self.retries.load(Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl AttemptObserver for StepRecorder {
    async fn attempt_failed(&self, _operation: &str, error: &ConnectorError) {
        let attempt = self.retries.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self
            .ledger
            .record_event(ExecutionEvent::new(
                self.execution_id,
                EventKind::StepAttemptFailed {
                    step_id: self.step_id.clone(),
                    attempt,
                    error: StepError::from(error),
                },
            ))
            .await
            .log("recording failed attempt");
    }
}
