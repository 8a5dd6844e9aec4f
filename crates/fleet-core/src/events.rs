//! The closed catalog of lifecycle events the dispatcher can fan out.
//!
//! Kept as a single enum so both the dispatcher's route matcher and the
//! route-creation validator consume the same
//! [`TriggerEvent::as_str`]/[`TriggerEvent::from_str`] pair, so drift
//! between "events routes can subscribe to" and "events the system actually
//! emits" is a compile error rather than a runtime mismatch.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    TaskAssigned,
    TaskStatusChanged,
    TaskCompleted,
    TaskExecutionFailed,
    DeliverableSubmitted,
    DeliverableApproved,
    DeliverableRevisionRequested,
    DeliverableRejected,
    AgentRegistered,
    ProjectCreated,
}

impl TriggerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskAssigned => "task.assigned",
            Self::TaskStatusChanged => "task.status_changed",
            Self::TaskCompleted => "task.completed",
            Self::TaskExecutionFailed => "task.execution_failed",
            Self::DeliverableSubmitted => "deliverable.submitted",
            Self::DeliverableApproved => "deliverable.approved",
            Self::DeliverableRevisionRequested => "deliverable.revision_requested",
            Self::DeliverableRejected => "deliverable.rejected",
            Self::AgentRegistered => "agent.registered",
            Self::ProjectCreated => "project.created",
        }
    }
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerEventParseError(pub String);

impl fmt::Display for TriggerEventParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown trigger event: {:?}", self.0)
    }
}

impl std::error::Error for TriggerEventParseError {}

impl FromStr for TriggerEvent {
    type Err = TriggerEventParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task.assigned" => Ok(Self::TaskAssigned),
            "task.status_changed" => Ok(Self::TaskStatusChanged),
            "task.completed" => Ok(Self::TaskCompleted),
            "task.execution_failed" => Ok(Self::TaskExecutionFailed),
            "deliverable.submitted" => Ok(Self::DeliverableSubmitted),
            "deliverable.approved" => Ok(Self::DeliverableApproved),
            "deliverable.revision_requested" => Ok(Self::DeliverableRevisionRequested),
            "deliverable.rejected" => Ok(Self::DeliverableRejected),
            "agent.registered" => Ok(Self::AgentRegistered),
            "project.created" => Ok(Self::ProjectCreated),
            other => Err(TriggerEventParseError(other.to_owned())),
        }
    }
}

/// A fired event, ready to be matched against routes and logged. Carries its
/// own snapshot of `payload` so later mutation of the source entity does not
/// change what a delivery log recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: TriggerEvent,
    pub project_id: Option<Uuid>,
    pub deliverable_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub occurred_at: chrono::DateTime<chrono::Utc>,
}

impl Event {
    pub fn new(kind: TriggerEvent, project_id: Option<Uuid>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            project_id,
            deliverable_id: None,
            payload,
            occurred_at: chrono::Utc::now(),
        }
    }

    pub fn with_deliverable(mut self, deliverable_id: Uuid) -> Self {
        self.deliverable_id = Some(deliverable_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_round_trips_through_its_wire_string() {
        let all = [
            TriggerEvent::TaskAssigned,
            TriggerEvent::TaskStatusChanged,
            TriggerEvent::TaskCompleted,
            TriggerEvent::TaskExecutionFailed,
            TriggerEvent::DeliverableSubmitted,
            TriggerEvent::DeliverableApproved,
            TriggerEvent::DeliverableRevisionRequested,
            TriggerEvent::DeliverableRejected,
            TriggerEvent::AgentRegistered,
            TriggerEvent::ProjectCreated,
        ];
        for v in all {
            let parsed: TriggerEvent = v.as_str().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn unknown_event_name_is_rejected() {
        assert!("task.deleted".parse::<TriggerEvent>().is_err());
    }
}
