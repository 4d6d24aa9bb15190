//! Poll loop driving every flow's trigger state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tessera_engine::model::{RunRequest, Trigger, TriggerInfo};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::{RequestError, RunRequester, RunResponse};
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::trigger::{FlowTrigger, Phase};

/// What one evaluation pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub detected: usize,
    pub started: Vec<(String, Uuid)>,
    pub duplicates: Vec<(String, Uuid)>,
    /// Flows holding a request until their current run ends.
    pub queued: Vec<String>,
    pub coalesced: usize,
    pub errors: usize,
}

impl TickReport {
    pub fn is_quiet(&self) -> bool {
        self.detected == 0 && self.started.is_empty() && self.errors == 0
    }
}

impl RequestError {
    /// Whether sending the same request again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RequestError::Http(_) => true,
            RequestError::Status { status, .. } => *status >= 500,
            RequestError::Engine(_) => false,
        }
    }
}

pub struct Scheduler {
    requester: Arc<dyn RunRequester>,
    clock: Arc<dyn Clock>,
    scheduler_id: String,
    poll_interval: Duration,
    triggers: BTreeMap<String, FlowTrigger>,
}

impl Scheduler {
    pub fn new(
        requester: Arc<dyn RunRequester>,
        clock: Arc<dyn Clock>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            requester,
            clock,
            scheduler_id: config.scheduler_id.clone(),
            poll_interval: config.poll_interval,
            triggers: BTreeMap::new(),
        }
    }

    pub fn trigger(&self, flow_id: &str) -> Option<&FlowTrigger> {
        self.triggers.get(flow_id)
    }

    /// Evaluate every flow once.
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();
        let now = self.clock.now();

        self.refresh_flows(now, &mut report).await;

        let flow_ids: Vec<String> = self.triggers.keys().cloned().collect();
        for flow_id in flow_ids {
            self.evaluate(&flow_id, now, &mut report).await;
        }

        report
    }

    /// Track new flows, update changed ones and forget removed ones.
    async fn refresh_flows(&mut self, now: DateTime<Utc>, report: &mut TickReport) {
        let flows = match self.requester.list_flows().await {
            Ok(flows) => flows,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list flows");
                report.errors += 1;
                return;
            }
        };

        let listed: BTreeSet<String> = flows.iter().map(|f| f.id.clone()).collect();
        self.triggers.retain(|id, _| listed.contains(id));

        for flow in flows {
            if let Some(trigger) = self.triggers.get_mut(&flow.id) {
                if trigger.flow() != &flow {
                    tracing::info!(flow_id = %flow.id, "Flow definition changed");
                    trigger.update_definition(flow);
                }
                continue;
            }

            let cursor = match &flow.trigger {
                Trigger::Schedule { .. } => {
                    match self.requester.last_fired_instant(&flow.id).await {
                        Ok(last) => Some(last.unwrap_or(now)),
                        Err(e) => {
                            tracing::warn!(flow_id = %flow.id, error = %e, "Failed to read last fired instant");
                            report.errors += 1;
                            continue;
                        }
                    }
                }
                _ => None,
            };

            tracing::debug!(flow_id = %flow.id, cursor = ?cursor, "Tracking flow");
            self.triggers
                .insert(flow.id.clone(), FlowTrigger::new(flow, cursor));
        }
    }

    async fn evaluate(&mut self, flow_id: &str, now: DateTime<Utc>, report: &mut TickReport) {
        let Some(trigger) = self.triggers.get_mut(flow_id) else {
            return;
        };

        if let Phase::RunRequested(execution_id) = trigger.phase() {
            match self.requester.execution_status(execution_id).await {
                Ok(status) if status.is_terminal() => {
                    tracing::debug!(flow_id, execution_id = %execution_id, status = %status, "Run ended");
                    trigger.run_finished();
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(flow_id, execution_id = %execution_id, error = %e, "Failed to read run status");
                    report.errors += 1;
                }
            }
        }

        let detection = match trigger.flow().trigger.clone() {
            Trigger::Manual => None,
            Trigger::Schedule { .. } => trigger.due(now),
            Trigger::Watch { location } => match self.requester.new_arrivals(flow_id).await {
                Ok(arrivals) => TriggerInfo::watch(flow_id, &location, arrivals).map(|trigger| {
                    RunRequest {
                        flow_id: flow_id.to_string(),
                        trigger,
                        params: BTreeMap::new(),
                    }
                }),
                Err(e) => {
                    tracing::warn!(flow_id, location = %location, error = %e, "Failed to list arrivals");
                    report.errors += 1;
                    None
                }
            },
        };

        if let Some(request) = detection {
            let unchanged = trigger
                .pending()
                .is_some_and(|p| p.trigger.dedup_key == request.trigger.dedup_key);
            if !unchanged {
                tracing::info!(
                    flow_id,
                    trigger = %request.trigger.kind,
                    key = request.trigger.dedup_key.as_deref().unwrap_or_default(),
                    "Trigger detected"
                );
                report.detected += 1;
                if trigger.detect(request) {
                    tracing::debug!(flow_id, "Waiting request replaced by newer trigger");
                    report.coalesced += 1;
                }
            }
        }

        if trigger.ready_to_request() {
            if let Some(request) = trigger.take_pending() {
                match self.requester.request_run(&request).await {
                    Ok(response) => {
                        match response {
                            RunResponse::Started(execution_id) => {
                                tracing::info!(flow_id, execution_id = %execution_id, "Run requested");
                                report.started.push((flow_id.to_string(), execution_id));
                            }
                            RunResponse::AlreadyRunning(execution_id) => {
                                tracing::info!(flow_id, execution_id = %execution_id, "Flow running, request held");
                            }
                            RunResponse::AlreadyFired(execution_id) => {
                                tracing::debug!(flow_id, execution_id = %execution_id, "Trigger already fired");
                                report.duplicates.push((flow_id.to_string(), execution_id));
                            }
                        }
                        trigger.on_response(request, response);
                    }
                    Err(e) if e.is_retryable() => {
                        tracing::warn!(flow_id, error = %e, "Run request failed, will retry");
                        report.errors += 1;
                        trigger.on_failed_request(request);
                    }
                    Err(e) => {
                        tracing::error!(flow_id, error = %e, "Run request rejected, dropping trigger");
                        report.errors += 1;
                        trigger.on_rejected();
                    }
                }
            }
        }

        if trigger.pending().is_some() {
            report.queued.push(flow_id.to_string());
        }
    }

    /// Evaluate triggers every poll interval until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            scheduler_id = %self.scheduler_id,
            poll_interval_secs = self.poll_interval.as_secs(),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if !report.is_quiet() {
                        tracing::info!(
                            flows = self.triggers.len(),
                            detected = report.detected,
                            started = report.started.len(),
                            queued = report.queued.len(),
                            errors = report.errors,
                            "Scheduler tick"
                        );
                    }
                }
            }
        }

        tracing::info!(scheduler_id = %self.scheduler_id, "Scheduler stopped");
    }
}
