//! Per-flow trigger state: `idle` → `trigger-detected` → `run-requested`
//! → `idle`.
//!
//! At most one detected request waits per flow. A newer detection replaces
//! the waiting one instead of queueing behind it.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tessera_engine::model::{ConcurrencyPolicy, Flow, RunRequest, Schedule, Trigger, TriggerInfo};
use uuid::Uuid;

use crate::client::RunResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    TriggerDetected,
    /// A run was accepted or found in flight; waiting for it to end.
    RunRequested(Uuid),
}

#[derive(Debug)]
pub struct FlowTrigger {
    flow: Flow,
    schedule: Option<Schedule>,
    phase: Phase,
    pending: Option<RunRequest>,
    /// Latest scheduled instant already evaluated. Only moves forward.
    cursor: Option<DateTime<Utc>>,
}

fn parse_schedule(flow: &Flow) -> Option<Schedule> {
    let Trigger::Schedule { expression } = &flow.trigger else {
        return None;
    };
    match Schedule::parse(expression) {
        Ok(schedule) => Some(schedule),
        Err(e) => {
            tracing::warn!(flow_id = %flow.id, expression = %expression, error = %e, "Invalid schedule, flow will not fire");
            None
        }
    }
}

impl FlowTrigger {
    /// `cursor` is where schedule evaluation resumes: the last fired instant,
    /// or the current time for a flow that never fired.
    pub fn new(flow: Flow, cursor: Option<DateTime<Utc>>) -> Self {
        Self {
            schedule: parse_schedule(&flow),
            flow,
            phase: Phase::Idle,
            pending: None,
            cursor,
        }
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn pending(&self) -> Option<&RunRequest> {
        self.pending.as_ref()
    }

    pub fn cursor(&self) -> Option<DateTime<Utc>> {
        self.cursor
    }

    /// Replace the flow definition, keeping run state.
    pub fn update_definition(&mut self, flow: Flow) {
        if flow.trigger != self.flow.trigger {
            self.schedule = parse_schedule(&flow);
        }
        self.flow = flow;
    }

    /// Run request for the latest scheduled instant due at `now`, if any.
    /// Earlier missed instants are skipped.
    pub fn due(&mut self, now: DateTime<Utc>) -> Option<RunRequest> {
        let schedule = self.schedule.as_ref()?;
        let after = *self.cursor.get_or_insert(now);
        let instant = schedule.latest_due(after, now)?;
        self.cursor = Some(instant);
        Some(RunRequest {
            flow_id: self.flow.id.clone(),
            trigger: TriggerInfo::schedule(&self.flow.id, instant),
            params: BTreeMap::new(),
        })
    }

    /// Record a detected trigger. Returns `true` when it replaced a
    /// different waiting request.
    pub fn detect(&mut self, request: RunRequest) -> bool {
        let coalesced = self
            .pending
            .as_ref()
            .is_some_and(|p| p.trigger.dedup_key != request.trigger.dedup_key);
        self.pending = Some(request);
        if self.phase == Phase::Idle {
            self.phase = Phase::TriggerDetected;
        }
        coalesced
    }

    /// Whether the waiting request may be sent now. A serialized flow waits
    /// for its in-flight run to end.
    pub fn ready_to_request(&self) -> bool {
        self.pending.is_some()
            && (!matches!(self.phase, Phase::RunRequested(_))
                || self.flow.concurrency == ConcurrencyPolicy::Parallel)
    }

    pub fn take_pending(&mut self) -> Option<RunRequest> {
        self.pending.take()
    }

    /// Apply the engine's answer to `request`.
    pub fn on_response(&mut self, request: RunRequest, response: RunResponse) {
        match response {
            RunResponse::Started(execution_id) => {
                self.phase = Phase::RunRequested(execution_id);
            }
            RunResponse::AlreadyRunning(execution_id) => {
                if self.pending.is_none() {
                    self.pending = Some(request);
                }
                self.phase = Phase::RunRequested(execution_id);
            }
            RunResponse::AlreadyFired(_) => {
                if !matches!(self.phase, Phase::RunRequested(_)) {
                    self.phase = if self.pending.is_some() {
                        Phase::TriggerDetected
                    } else {
                        Phase::Idle
                    };
                }
            }
        }
    }

    /// Put back a request that could not be delivered.
    pub fn on_failed_request(&mut self, request: RunRequest) {
        if self.pending.is_none() {
            self.pending = Some(request);
        }
    }

    /// The engine refused `request` for good. A run still in flight stays
    /// tracked; otherwise the flow goes back to idle.
    pub fn on_rejected(&mut self) {
        if self.phase == Phase::TriggerDetected && self.pending.is_none() {
            self.phase = Phase::Idle;
        }
    }

    /// The tracked run reached a terminal status.
    pub fn run_finished(&mut self) {
        if matches!(self.phase, Phase::RunRequested(_)) {
            self.phase = if self.pending.is_some() {
                Phase::TriggerDetected
            } else {
                Phase::Idle
            };
        }
    }
}
