//! Execution events and state reconstruction.
//!
//! The ledger is append-only: every state transition of an execution is an
//! [`ExecutionEvent`], and the current view is rebuilt by replaying them.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{
    Execution, ExecutionStatus, StepError, StepOutcome, StepStatus, TriggerInfo,
};

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventKind {
    /// First event of every execution; carries everything replay needs.
    ExecutionCreated {
        flow_id: String,
        #[serde(default)]
        trigger: TriggerInfo,
        #[serde(default)]
        params: BTreeMap<String, serde_json::Value>,
        /// Step ids in plan order.
        steps: Vec<String>,
    },
    ExecutionStarted,
    StepStarted {
        step_id: String,
    },
    StepAttemptFailed {
        step_id: String,
        attempt: u32,
        error: StepError,
    },
    StepSucceeded {
        step_id: String,
        attempts: u32,
        rows_read: u64,
        rows_written: u64,
    },
    StepFailed {
        step_id: String,
        attempts: u32,
        error: StepError,
    },
    StepCancelled {
        step_id: String,
        reason: String,
    },
    CancelRequested,
    ExecutionSucceeded,
    ExecutionFailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<StepError>,
    },
    ExecutionCancelled,
}

impl EventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ExecutionCreated { .. } => "execution_created",
            Self::ExecutionStarted => "execution_started",
            Self::StepStarted { .. } => "step_started",
            Self::StepAttemptFailed { .. } => "step_attempt_failed",
            Self::StepSucceeded { .. } => "step_succeeded",
            Self::StepFailed { .. } => "step_failed",
            Self::StepCancelled { .. } => "step_cancelled",
            Self::CancelRequested => "cancel_requested",
            Self::ExecutionSucceeded => "execution_succeeded",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::ExecutionCancelled => "execution_cancelled",
        }
    }

    /// Execution status this event moves to, if any.
    pub fn status_change(&self) -> Option<ExecutionStatus> {
        match self {
            Self::ExecutionCreated { .. } => Some(ExecutionStatus::Pending),
            Self::ExecutionStarted => Some(ExecutionStatus::Running),
            Self::ExecutionSucceeded => Some(ExecutionStatus::Succeeded),
            Self::ExecutionFailed { .. } => Some(ExecutionStatus::Failed),
            Self::ExecutionCancelled => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::StepStarted { step_id }
            | Self::StepAttemptFailed { step_id, .. }
            | Self::StepSucceeded { step_id, .. }
            | Self::StepFailed { step_id, .. }
            | Self::StepCancelled { step_id, .. } => Some(step_id),
            _ => None,
        }
    }
}

/// One entry of an execution's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub execution_id: Uuid,
    #[serde(flatten)]
    pub kind: EventKind,
    pub created_at: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn new(execution_id: Uuid, kind: EventKind) -> Self {
        Self {
            execution_id,
            kind,
            created_at: Utc::now(),
        }
    }
}

impl Execution {
    /// Rebuild an execution from its event log. The first event must be
    /// `ExecutionCreated`.
    pub fn from_events(events: &[ExecutionEvent]) -> Option<Self> {
        let start = Instant::now();
        let first = events.first()?;
        let EventKind::ExecutionCreated { flow_id, .. } = &first.kind else {
            tracing::warn!(
                execution_id = %first.execution_id,
                event_type = first.kind.event_type(),
                "Event log does not start with execution_created"
            );
            return None;
        };

        let mut execution = Execution {
            id: first.execution_id,
            flow_id: flow_id.clone(),
            status: ExecutionStatus::Pending,
            trigger: TriggerInfo::default(),
            params: BTreeMap::new(),
            created_at: first.created_at,
            started_at: None,
            finished_at: None,
            steps: Vec::new(),
            error: None,
            cancel_requested: false,
        };
        for event in events {
            execution.apply_event(event);
        }

        tracing::trace!(
            execution_id = %execution.id,
            event_count = events.len(),
            duration_us = start.elapsed().as_micros() as u64,
            "Execution reconstructed from events"
        );
        Some(execution)
    }

    /// Apply one event. Events after a terminal status are ignored.
    pub fn apply_event(&mut self, event: &ExecutionEvent) {
        if self.status.is_terminal() {
            return;
        }
        let at = event.created_at;

        match &event.kind {
            EventKind::ExecutionCreated {
                flow_id,
                trigger,
                params,
                steps,
            } => {
                self.flow_id = flow_id.clone();
                self.trigger = trigger.clone();
                self.params = params.clone();
                self.steps = steps.iter().map(StepOutcome::pending).collect();
                self.created_at = at;
            }
            EventKind::ExecutionStarted => {
                self.status = ExecutionStatus::Running;
                self.started_at = Some(at);
            }
            EventKind::StepStarted { step_id } => {
                let step = self.step_mut(step_id);
                step.status = StepStatus::Running;
                step.started_at.get_or_insert(at);
            }
            EventKind::StepAttemptFailed {
                step_id,
                attempt,
                error,
            } => {
                let step = self.step_mut(step_id);
                step.attempts = step.attempts.max(*attempt);
                step.error = Some(error.clone());
            }
            EventKind::StepSucceeded {
                step_id,
                attempts,
                rows_read,
                rows_written,
            } => {
                let step = self.step_mut(step_id);
                step.status = StepStatus::Succeeded;
                step.attempts = *attempts;
                step.rows_read = *rows_read;
                step.rows_written = *rows_written;
                step.finished_at = Some(at);
                step.error = None;
            }
            EventKind::StepFailed {
                step_id,
                attempts,
                error,
            } => {
                let step = self.step_mut(step_id);
                step.status = StepStatus::Failed;
                step.attempts = *attempts;
                step.finished_at = Some(at);
                step.error = Some(error.clone());
            }
            EventKind::StepCancelled { step_id, reason } => {
                let step = self.step_mut(step_id);
                step.status = StepStatus::Cancelled;
                step.finished_at = Some(at);
                step.error = Some(StepError::new("cancelled", reason.clone()));
            }
            EventKind::CancelRequested => {
                self.cancel_requested = true;
            }
            EventKind::ExecutionSucceeded => {
                self.status = ExecutionStatus::Succeeded;
                self.finished_at = Some(at);
            }
            EventKind::ExecutionFailed { error } => {
                self.status = ExecutionStatus::Failed;
                self.finished_at = Some(at);
                self.error = error.clone();
            }
            EventKind::ExecutionCancelled => {
                self.status = ExecutionStatus::Cancelled;
                self.finished_at = Some(at);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(id: Uuid) -> ExecutionEvent {
        ExecutionEvent::new(
            id,
            EventKind::ExecutionCreated {
                flow_id: "nightly".into(),
                trigger: TriggerInfo::manual(),
                params: BTreeMap::new(),
                steps: vec!["s1".into(), "s2".into()],
            },
        )
    }

    #[test]
    fn test_from_events_requires_created_first() {
        let id = Uuid::new_v4();
        assert!(Execution::from_events(&[]).is_none());
        assert!(Execution::from_events(&[ExecutionEvent::new(id, EventKind::ExecutionStarted)]).is_none());
    }

    #[test]
    fn test_replay_step_lifecycle() {
        let id = Uuid::new_v4();
        let error = StepError::new("timeout", "read timed out").transient();
        let events = vec![
            created(id),
            ExecutionEvent::new(id, EventKind::ExecutionStarted),
            ExecutionEvent::new(id, EventKind::StepStarted { step_id: "s1".into() }),
            ExecutionEvent::new(
                id,
                EventKind::StepAttemptFailed { step_id: "s1".into(), attempt: 1, error },
            ),
            ExecutionEvent::new(
                id,
                EventKind::StepSucceeded {
                    step_id: "s1".into(),
                    attempts: 2,
                    rows_read: 10,
                    rows_written: 8,
                },
            ),
            ExecutionEvent::new(
                id,
                EventKind::StepCancelled { step_id: "s2".into(), reason: "upstream failed".into() },
            ),
            ExecutionEvent::new(id, EventKind::ExecutionFailed { error: None }),
        ];

        let execution = Execution::from_events(&events).unwrap();
        assert_eq!(execution.flow_id, "nightly");
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.started_at.is_some());

        let s1 = execution.step("s1").unwrap();
        assert_eq!(s1.status, StepStatus::Succeeded);
        assert_eq!(s1.attempts, 2);
        assert_eq!(s1.rows_written, 8);
        assert!(s1.error.is_none());

        let s2 = execution.step("s2").unwrap();
        assert_eq!(s2.status, StepStatus::Cancelled);
        assert_eq!(s2.error.as_ref().unwrap().kind, "cancelled");
    }

    #[test]
    fn test_events_after_terminal_are_ignored() {
        let id = Uuid::new_v4();
        let events = vec![
            created(id),
            ExecutionEvent::new(id, EventKind::ExecutionCancelled),
            ExecutionEvent::new(id, EventKind::ExecutionSucceeded),
        ];
        let execution = Execution::from_events(&events).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = ExecutionEvent::new(
            Uuid::nil(),
            EventKind::StepStarted { step_id: "s1".into() },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "step_started");
        assert_eq!(json["step_id"], "s1");

        let back: ExecutionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
