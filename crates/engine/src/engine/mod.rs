//! Execution engine.
//!
//! Plans a flow from an immutable snapshot, records the execution in the
//! run ledger and walks the plan with a bounded pool of step tasks. A step
//! starts once every predecessor has succeeded; when a predecessor failed
//! or was cancelled the step is recorded `cancelled` without running.

pub mod retry;
pub mod runner;

pub use retry::{AttemptObserver, RetryPolicy};
pub use runner::{StepRecorder, StepRunner, StepTotals};

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tessera_connectors::{Arrival, ConnectorRegistry};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{AppError, AppResult, Violation};
use crate::graph::ExecutionPlan;
use crate::ledger::{BeginOutcome, EventKind, ExecutionEvent, RunLedger};
use crate::logic::template::TemplateEngine;
use crate::metadata::{MetadataStore, Snapshot};
use crate::model::{
    Entity, Execution, ExecutionStatus, Flow, RunRequest, StepError, StepStatus, Trigger,
};
use crate::resolver::{resolve_for, EffectiveRules};
use crate::result_ext::ResultExt;
use crate::validate;

/// Accepted run request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunStart {
    /// A new execution was started.
    Started { execution_id: Uuid },
    /// The trigger had already fired; this is the execution it produced.
    #[serde(rename = "already_fired")]
    Duplicate { execution_id: Uuid },
}

impl RunStart {
    pub fn execution_id(&self) -> Uuid {
        match self {
            Self::Started { execution_id } | Self::Duplicate { execution_id } => *execution_id,
        }
    }
}

struct RunHandle {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

pub struct Engine {
    metadata: Arc<dyn MetadataStore>,
    ledger: Arc<dyn RunLedger>,
    connectors: Arc<ConnectorRegistry>,
    templates: Arc<TemplateEngine>,
    retry: RetryPolicy,
    step_timeout: Option<Duration>,
    /// Bounds concurrently executing steps across all runs.
    permits: Arc<Semaphore>,
    runs: Mutex<HashMap<Uuid, RunHandle>>,
}

impl Engine {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        ledger: Arc<dyn RunLedger>,
        connectors: ConnectorRegistry,
        config: &EngineConfig,
    ) -> Self {
        Self {
            metadata,
            ledger,
            connectors: Arc::new(connectors),
            templates: Arc::new(TemplateEngine::new()),
            retry: config.retry_policy(),
            step_timeout: config.step_timeout(),
            permits: Arc::new(Semaphore::new(config.workers.max(1))),
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn ledger(&self) -> &Arc<dyn RunLedger> {
        &self.ledger
    }

    pub fn connectors(&self) -> &ConnectorRegistry {
        &self.connectors
    }

    /// Check `entity` against the stored definitions without persisting it.
    pub async fn validate(&self, entity: &Entity) -> AppResult<Vec<Violation>> {
        validate::validate_entity(self.metadata.as_ref(), &self.connectors, entity).await
    }

    /// Validate and store `entity`. Nothing is stored when violations are
    /// found.
    pub async fn save_definition(&self, entity: Entity) -> AppResult<Vec<Violation>> {
        let violations = self.validate(&entity).await?;
        if violations.is_empty() {
            tracing::info!(kind = %entity.kind(), id = entity.id(), "Definition saved");
            self.metadata.put(entity).await?;
        } else {
            tracing::debug!(
                kind = %entity.kind(),
                id = entity.id(),
                violations = violations.len(),
                "Definition rejected"
            );
        }
        Ok(violations)
    }

    /// Execution plan the flow would run with under the current definitions.
    pub async fn plan_flow(&self, flow_id: &str) -> AppResult<ExecutionPlan> {
        let snapshot = Snapshot::load(self.metadata.as_ref(), flow_id).await?;
        Ok(snapshot.plan()?)
    }

    /// Effective rules of a mapping against its target.
    pub async fn preview_effective_rules(&self, mapping_id: &str) -> AppResult<EffectiveRules> {
        let mapping = self
            .metadata
            .get_mapping(mapping_id)
            .await?
            .ok_or_else(|| crate::error::DefinitionError::unknown("mapping", mapping_id))?;
        let target = self
            .metadata
            .get_table(&mapping.target)
            .await?
            .ok_or_else(|| crate::error::DefinitionError::unknown("table", &mapping.target))?;
        Ok(resolve_for(&mapping, &target)?)
    }

    /// Start a run of `request.flow_id`.
    ///
    /// A serialized flow with an active execution is rejected with
    /// `AlreadyRunning` carrying that execution's id; a trigger that already
    /// fired returns its execution as a duplicate. Definition errors,
    /// including ones introduced by edits made after the flow was saved, are
    /// reported before anything is recorded.
    pub async fn request_run(self: &Arc<Self>, request: RunRequest) -> AppResult<RunStart> {
        let snapshot = Snapshot::load(self.metadata.as_ref(), &request.flow_id).await?;
        let plan = validate::check_runnable(&snapshot)?;

        let outcome = self
            .ledger
            .begin_execution(&request, snapshot.flow.concurrency, &plan.order)
            .await?;

        match outcome {
            BeginOutcome::Started(execution) => {
                let execution_id = execution.id;
                tracing::info!(
                    execution_id = %execution_id,
                    flow_id = %request.flow_id,
                    trigger = %request.trigger.kind,
                    steps = plan.order.len(),
                    "Execution started"
                );
                self.spawn_run(execution, snapshot, plan).await;
                Ok(RunStart::Started { execution_id })
            }
            BeginOutcome::AlreadyRunning(execution_id) => {
                tracing::info!(
                    flow_id = %request.flow_id,
                    execution_id = %execution_id,
                    "Flow already running, request rejected"
                );
                Err(AppError::AlreadyRunning {
                    flow_id: request.flow_id,
                    execution_id,
                })
            }
            BeginOutcome::AlreadyFired(execution_id) => {
                tracing::debug!(
                    flow_id = %request.flow_id,
                    execution_id = %execution_id,
                    "Trigger already fired"
                );
                Ok(RunStart::Duplicate { execution_id })
            }
        }
    }

    /// Request cooperative cancellation. Running steps finish; steps not yet
    /// started are recorded `cancelled`.
    pub async fn cancel_run(&self, execution_id: Uuid) -> AppResult<Execution> {
        let execution = self.get_execution_status(execution_id).await?;
        if execution.status.is_terminal() {
            return Ok(execution);
        }

        let cancel = self
            .runs
            .lock()
            .await
            .get(&execution_id)
            .map(|handle| handle.cancel.clone());
        match cancel {
            Some(cancel) => {
                if !execution.cancel_requested {
                    self.ledger
                        .record_event(ExecutionEvent::new(execution_id, EventKind::CancelRequested))
                        .await?;
                }
                cancel.cancel();
                tracing::info!(execution_id = %execution_id, "Cancellation requested");
            }
            None => {
                // Active in the ledger but not driven by this process.
                self.ledger
                    .record_event(ExecutionEvent::new(execution_id, EventKind::CancelRequested))
                    .await?;
                self.ledger
                    .record_event(ExecutionEvent::new(execution_id, EventKind::ExecutionCancelled))
                    .await?;
                tracing::warn!(execution_id = %execution_id, "Cancelled execution with no live run");
            }
        }

        self.get_execution_status(execution_id).await
    }

    pub async fn get_execution_status(&self, execution_id: Uuid) -> AppResult<Execution> {
        self.ledger
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Execution {} not found", execution_id)))
    }

    /// Wait until the execution reaches a terminal status.
    pub async fn await_completion(&self, execution_id: Uuid) -> AppResult<Execution> {
        let done = self
            .runs
            .lock()
            .await
            .get(&execution_id)
            .map(|handle| handle.done.clone());
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.get_execution_status(execution_id).await
    }

    /// Mark executions left active by a previous process as failed so their
    /// flows are not blocked.
    pub async fn recover(&self) -> AppResult<usize> {
        let live: Vec<Uuid> = self.runs.lock().await.keys().copied().collect();
        let mut recovered = 0;
        for execution in self.ledger.list_active().await? {
            if live.contains(&execution.id) {
                continue;
            }
            self.close_active(
                execution.id,
                StepError::new("interrupted", "engine stopped while the execution was active"),
                "engine restarted",
            )
            .await?;
            tracing::warn!(
                execution_id = %execution.id,
                flow_id = %execution.flow_id,
                "Interrupted execution marked failed"
            );
            recovered += 1;
        }
        Ok(recovered)
    }

    pub async fn list_flows(&self) -> AppResult<Vec<Flow>> {
        self.metadata.list_flows().await
    }

    pub async fn last_fired_instant(&self, flow_id: &str) -> AppResult<Option<DateTime<Utc>>> {
        self.ledger.last_fired_instant(flow_id).await
    }

    /// Items at a watch-triggered flow's location beyond its watermark,
    /// oldest first.
    pub async fn new_arrivals(&self, flow_id: &str) -> AppResult<Vec<Arrival>> {
        let flow = self
            .metadata
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| crate::error::DefinitionError::unknown("flow", flow_id))?;
        let Trigger::Watch { location } = &flow.trigger else {
            return Err(AppError::BadRequest(format!(
                "Flow '{}' does not have a watch trigger",
                flow_id
            )));
        };
        let connection = self
            .metadata
            .get_connection(&location.connection)
            .await?
            .ok_or_else(|| crate::error::DefinitionError::unknown("connection", &location.connection))?;

        let watermark = self.ledger.watermark(flow_id, location).await?;
        let connector = self
            .connectors
            .connect(&connection)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        connector
            .list_new_arrivals(location, watermark.as_ref())
            .await
            .map_err(|e| AppError::Internal(format!("listing {}: {}", location, e)))
    }

    async fn spawn_run(self: &Arc<Self>, execution: Execution, snapshot: Arc<Snapshot>, plan: ExecutionPlan) {
        let execution_id = execution.id;
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        self.runs.lock().await.insert(
            execution_id,
            RunHandle {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let driven = AssertUnwindSafe(Arc::clone(&engine).drive(execution, snapshot, plan, cancel))
                .catch_unwind()
                .await;
            let failure = match driven {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("run task panicked".to_string()),
            };
            if let Some(detail) = failure {
                tracing::error!(execution_id = %execution_id, error = %detail, "Execution aborted");
                let _ = engine
                    .close_active(execution_id, StepError::new("internal", detail), "execution aborted")
                    .await
                    .log("closing aborted execution");
            }
            engine.runs.lock().await.remove(&execution_id);
            let _ = done_tx.send(true);
        });
    }

    async fn drive(
        self: Arc<Self>,
        execution: Execution,
        snapshot: Arc<Snapshot>,
        plan: ExecutionPlan,
        cancel: CancellationToken,
    ) -> AppResult<ExecutionStatus> {
        let execution_id = execution.id;
        self.record(execution_id, EventKind::ExecutionStarted).await?;

        let runner = Arc::new(StepRunner::new(
            snapshot,
            self.connectors.clone(),
            self.templates.clone(),
            self.retry.clone(),
            execution_id,
            &execution.trigger,
            &execution.params,
        ));
        let states = plan
            .order
            .iter()
            .map(|id| (id.clone(), StepStatus::Pending))
            .collect();

        RunDriver {
            engine: self,
            execution_id,
            plan,
            runner,
            halt: cancel.child_token(),
            cancel,
            states,
            tasks: JoinSet::new(),
        }
        .run()
        .await
    }

    /// Append an event to the execution's log, retrying failed writes a few
    /// times before giving up.
    async fn record(&self, execution_id: Uuid, kind: EventKind) -> AppResult<()> {
        let mut attempt = 1;
        loop {
            match self
                .ledger
                .record_event(ExecutionEvent::new(execution_id, kind.clone()))
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if attempt < LEDGER_WRITE_ATTEMPTS => {
                    tracing::warn!(
                        execution_id = %execution_id,
                        event_type = kind.event_type(),
                        attempt,
                        error = %e,
                        "Ledger write failed, retrying"
                    );
                    tokio::time::sleep(LEDGER_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn record_cancelled(&self, execution_id: Uuid, step_id: &str, reason: String) -> AppResult<()> {
        tracing::debug!(execution_id = %execution_id, step_id, reason = %reason, "Step cancelled");
        self.record(
            execution_id,
            EventKind::StepCancelled {
                step_id: step_id.to_string(),
                reason,
            },
        )
        .await
    }

    /// Fail an execution nobody will drive any further. Steps the ledger
    /// still shows as pending or running are recorded `cancelled` first.
    async fn close_active(&self, execution_id: Uuid, error: StepError, reason: &str) -> AppResult<()> {
        let open_steps: Vec<String> = match self.ledger.get_execution(execution_id).await {
            Ok(Some(execution)) => execution
                .steps
                .iter()
                .filter(|s| !s.status.is_terminal())
                .map(|s| s.step_id.clone())
                .collect(),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(execution_id = %execution_id, error = %e, "Could not read steps to close");
                Vec::new()
            }
        };
        for step_id in &open_steps {
            self.record_cancelled(execution_id, step_id, reason.to_string())
                .await?;
        }
        self.record(execution_id, EventKind::ExecutionFailed { error: Some(error) })
            .await
    }

    /// One step task: wait for a worker permit, run, record the outcome.
    async fn execute_step(
        self: Arc<Self>,
        runner: Arc<StepRunner>,
        execution_id: Uuid,
        step_id: String,
        halt: CancellationToken,
    ) -> StepReport {
        let permit = tokio::select! {
            biased;
            _ = halt.cancelled() => None,
            permit = self.permits.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            let recorded = self
                .record_cancelled(execution_id, &step_id, "execution cancelled".into())
                .await;
            return StepReport::new(step_id, StepStatus::Cancelled, recorded);
        };

        let started = self
            .record(
                execution_id,
                EventKind::StepStarted {
                    step_id: step_id.clone(),
                },
            )
            .await;
        if started.is_err() {
            // Never run a step the ledger does not show as started.
            return StepReport::new(step_id, StepStatus::Pending, started);
        }
        tracing::info!(execution_id = %execution_id, step_id = %step_id, "Step started");

        let recorder = StepRecorder::new(self.ledger.clone(), execution_id, step_id.clone());
        let run = AssertUnwindSafe(runner.run(&step_id, &recorder)).catch_unwind();
        let result = match self.step_timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => Ok(Err(StepError::new(
                    "timeout",
                    format!("step exceeded {}s", limit.as_secs_f64()),
                )
                .transient())),
            },
            None => run.await,
        };
        let result = result.unwrap_or_else(|_| Err(StepError::new("internal", "step panicked")));
        drop(permit);

        let (status, event) = match result {
            Ok(totals) => {
                tracing::info!(
                    execution_id = %execution_id,
                    step_id = %step_id,
                    rows_read = totals.rows_read,
                    rows_written = totals.rows_written,
                    attempts = recorder.attempts(),
                    "Step succeeded"
                );
                (
                    StepStatus::Succeeded,
                    EventKind::StepSucceeded {
                        step_id: step_id.clone(),
                        attempts: recorder.attempts(),
                        rows_read: totals.rows_read,
                        rows_written: totals.rows_written,
                    },
                )
            }
            Err(error) => {
                tracing::warn!(
                    execution_id = %execution_id,
                    step_id = %step_id,
                    error = %error,
                    attempts = recorder.attempts(),
                    "Step failed"
                );
                (
                    StepStatus::Failed,
                    EventKind::StepFailed {
                        step_id: step_id.clone(),
                        attempts: recorder.attempts(),
                        error,
                    },
                )
            }
        };

        let recorded = self.record(execution_id, event).await;
        StepReport::new(step_id, status, recorded)
    }
}

/// Attempts per ledger write made while driving a run.
const LEDGER_WRITE_ATTEMPTS: u32 = 3;
const LEDGER_RETRY_DELAY: Duration = Duration::from_millis(50);

/// What a step task hands back to the driver.
struct StepReport {
    step_id: String,
    status: StepStatus,
    /// Whether the step's events reached the ledger.
    recorded: AppResult<()>,
}

impl StepReport {
    fn new(step_id: String, status: StepStatus, recorded: AppResult<()>) -> Self {
        Self {
            step_id,
            status,
            recorded,
        }
    }
}

/// Walks one execution's plan.
///
/// When a ledger write fails the driver stops starting steps, lets the
/// running ones finish and only then reports the error, so no step task is
/// dropped mid-write.
struct RunDriver {
    engine: Arc<Engine>,
    execution_id: Uuid,
    plan: ExecutionPlan,
    runner: Arc<StepRunner>,
    /// Cancelled by `cancel_run`.
    cancel: CancellationToken,
    /// Child of `cancel`, also cancelled when the run is being aborted.
    halt: CancellationToken,
    states: BTreeMap<String, StepStatus>,
    tasks: JoinSet<StepReport>,
}

impl RunDriver {
    async fn run(mut self) -> AppResult<ExecutionStatus> {
        let mut failure: Option<AppError> = None;

        loop {
            if failure.is_none() {
                if let Err(e) = self.settle().await {
                    failure = Some(e);
                }
            }
            if failure.is_some() {
                self.halt.cancel();
            }

            match self.tasks.join_next().await {
                Some(Ok(report)) => {
                    if let Err(e) = report.recorded {
                        tracing::error!(
                            execution_id = %self.execution_id,
                            step_id = %report.step_id,
                            error = %e,
                            "Step outcome not recorded, stopping run"
                        );
                        failure.get_or_insert(e);
                    }
                    self.states.insert(report.step_id, report.status);
                }
                Some(Err(e)) => {
                    failure.get_or_insert(AppError::Internal(format!("step task failed: {}", e)));
                }
                None => break,
            }
        }

        match failure {
            Some(e) => Err(e),
            None => self.finish().await,
        }
    }

    /// Settle every pending step whose predecessors are all terminal: start
    /// it, or record it `cancelled` when a predecessor did not succeed or
    /// the run was cancelled.
    async fn settle(&mut self) -> AppResult<()> {
        let mut progressed = true;
        while progressed {
            progressed = false;
            for step_id in &self.plan.order {
                if self.states[step_id] != StepStatus::Pending {
                    continue;
                }
                let blocker = self
                    .plan
                    .predecessors_of(step_id)
                    .find(|p| matches!(self.states[*p], StepStatus::Failed | StepStatus::Cancelled))
                    .map(str::to_string);
                let ready = self
                    .plan
                    .predecessors_of(step_id)
                    .all(|p| self.states[p] == StepStatus::Succeeded);

                if let Some(blocker) = blocker {
                    let reason = format!("upstream step '{}' did not succeed", blocker);
                    self.engine
                        .record_cancelled(self.execution_id, step_id, reason)
                        .await?;
                    self.states.insert(step_id.clone(), StepStatus::Cancelled);
                    progressed = true;
                } else if ready && self.cancel.is_cancelled() {
                    self.engine
                        .record_cancelled(self.execution_id, step_id, "execution cancelled".into())
                        .await?;
                    self.states.insert(step_id.clone(), StepStatus::Cancelled);
                    progressed = true;
                } else if ready {
                    self.states.insert(step_id.clone(), StepStatus::Running);
                    self.tasks.spawn(Arc::clone(&self.engine).execute_step(
                        Arc::clone(&self.runner),
                        self.execution_id,
                        step_id.clone(),
                        self.halt.clone(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Record the execution's final status once every step is terminal.
    async fn finish(self) -> AppResult<ExecutionStatus> {
        let failed: Vec<&str> = self
            .states
            .iter()
            .filter(|(_, s)| **s == StepStatus::Failed)
            .map(|(id, _)| id.as_str())
            .collect();
        let any_cancelled = self.states.values().any(|s| *s == StepStatus::Cancelled);

        let (status, event) = if self.cancel.is_cancelled() && any_cancelled {
            (ExecutionStatus::Cancelled, EventKind::ExecutionCancelled)
        } else if !failed.is_empty() {
            (
                ExecutionStatus::Failed,
                EventKind::ExecutionFailed {
                    error: Some(StepError::new(
                        "step_failed",
                        format!("failed steps: {}", failed.join(", ")),
                    )),
                },
            )
        } else {
            (ExecutionStatus::Succeeded, EventKind::ExecutionSucceeded)
        };

        self.engine.record(self.execution_id, event).await?;
        tracing::info!(execution_id = %self.execution_id, status = %status, "Execution finished");
        Ok(status)
    }
}
