use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Availability of an agent, independent of its capacity counters. Only
/// `Active` agents are eligible for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Paused,
    Disabled,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentStatus {
    type Err = AgentStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "disabled" => Ok(Self::Disabled),
            other => Err(AgentStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentStatus`] string.
#[derive(Debug, Clone)]
pub struct AgentStatusParseError(pub String);

impl fmt::Display for AgentStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent status: {:?}", self.0)
    }
}

impl std::error::Error for AgentStatusParseError {}

// ---------------------------------------------------------------------------

/// Lifecycle state of a task. Six states, transitions enforced by
/// `fleet_core::lifecycle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Review,
    Completed,
    Cancelled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "in_progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// How a rule picks among agents qualified by `assign_to_capability`. Not
/// consulted when the rule sets `assign_to` directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignStrategy {
    LeastBusy,
    RoundRobin,
    FirstAvailable,
    Random,
}

impl fmt::Display for AssignStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LeastBusy => "least_busy",
            Self::RoundRobin => "round_robin",
            Self::FirstAvailable => "first_available",
            Self::Random => "random",
        };
        f.write_str(s)
    }
}

impl FromStr for AssignStrategy {
    type Err = AssignStrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "least_busy" => Ok(Self::LeastBusy),
            "round_robin" => Ok(Self::RoundRobin),
            "first_available" => Ok(Self::FirstAvailable),
            "random" => Ok(Self::Random),
            other => Err(AssignStrategyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AssignStrategy`] string.
#[derive(Debug, Clone)]
pub struct AssignStrategyParseError(pub String);

impl fmt::Display for AssignStrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid assign strategy: {:?}", self.0)
    }
}

impl std::error::Error for AssignStrategyParseError {}

// ---------------------------------------------------------------------------

/// Delivery state of a single (route, event) dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Retrying,
    Delivered,
    Failed,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for DeliveryStatus {
    type Err = DeliveryStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "retrying" => Ok(Self::Retrying),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            other => Err(DeliveryStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`DeliveryStatus`] string.
#[derive(Debug, Clone)]
pub struct DeliveryStatusParseError(pub String);

impl fmt::Display for DeliveryStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid delivery status: {:?}", self.0)
    }
}

impl std::error::Error for DeliveryStatusParseError {}

// ---------------------------------------------------------------------------

/// Review state of a submitted deliverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverableStatus {
    Pending,
    Approved,
    RevisionRequested,
    Revised,
    Rejected,
}

impl fmt::Display for DeliverableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::RevisionRequested => "revision_requested",
            Self::Revised => "revised",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

impl FromStr for DeliverableStatus {
    type Err = DeliverableStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "revision_requested" => Ok(Self::RevisionRequested),
            "revised" => Ok(Self::Revised),
            "rejected" => Ok(Self::Rejected),
            other => Err(DeliverableStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`DeliverableStatus`] string.
#[derive(Debug, Clone)]
pub struct DeliverableStatusParseError(pub String);

impl fmt::Display for DeliverableStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid deliverable status: {:?}", self.0)
    }
}

impl std::error::Error for DeliverableStatusParseError {}

// ---------------------------------------------------------------------------

/// How an agent is driven -- whether it polls for work, runs unattended, or
/// needs a human in the loop. Purely descriptive; does not affect routing
/// eligibility beyond `AgentStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Manual,
    Auto,
    Polling,
    Human,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
            Self::Polling => "polling",
            Self::Human => "human",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionMode {
    type Err = ExecutionModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "auto" => Ok(Self::Auto),
            "polling" => Ok(Self::Polling),
            "human" => Ok(Self::Human),
            other => Err(ExecutionModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExecutionMode`] string.
#[derive(Debug, Clone)]
pub struct ExecutionModeParseError(pub String);

impl fmt::Display for ExecutionModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid execution mode: {:?}", self.0)
    }
}

impl std::error::Error for ExecutionModeParseError {}

// ---------------------------------------------------------------------------

/// Destination kind a route dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    Webhook,
    Email,
    Storage,
    Chat,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Webhook => "webhook",
            Self::Email => "email",
            Self::Storage => "storage",
            Self::Chat => "chat",
        };
        f.write_str(s)
    }
}

impl FromStr for DestinationKind {
    type Err = DestinationKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook" => Ok(Self::Webhook),
            "email" => Ok(Self::Email),
            "storage" => Ok(Self::Storage),
            "chat" => Ok(Self::Chat),
            other => Err(DestinationKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`DestinationKind`] string.
#[derive(Debug, Clone)]
pub struct DestinationKindParseError(pub String);

impl fmt::Display for DestinationKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid destination kind: {:?}", self.0)
    }
}

impl std::error::Error for DestinationKindParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A project -- the owner of routing rules, routes, and tasks.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub default_agent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// An agent that can be assigned tasks -- carries a capacity budget
/// reserved atomically at assignment time. `capacity_max = NULL` means
/// unlimited concurrency.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub status: String,
    pub capabilities: serde_json::Value,
    pub capacity_max: Option<i32>,
    pub capacity_in_use: i32,
    pub execution_mode: String,
    pub owner_user_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn status(&self) -> Result<AgentStatus, AgentStatusParseError> {
        self.status.parse()
    }

    pub fn execution_mode(&self) -> Result<ExecutionMode, ExecutionModeParseError> {
        self.execution_mode.parse()
    }

    /// Capability tags, decoded from the `capabilities` JSON array.
    pub fn capability_list(&self) -> Vec<String> {
        self.capabilities
            .as_array()
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A unit of work assigned (or assignable) to an agent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub description: String,
    pub status: String,
    pub assigned_agent_id: Option<Uuid>,
    pub capacity_cost: i32,
    pub version: i32,
    pub priority: i32,
    pub tags: serde_json::Value,
    pub context: serde_json::Value,
    pub routing_rule_id: Option<Uuid>,
    pub routing_decision: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn status(&self) -> Result<TaskStatus, TaskStatusParseError> {
        self.status.parse()
    }

    pub fn tag_list(&self) -> Vec<String> {
        self.tags
            .as_array()
            .map(|values| values.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
            .unwrap_or_default()
    }

    /// Whether the status counts toward the assigned agent's
    /// `active_task_count` (assigned, in_progress, review).
    pub fn counts_toward_capacity(&self) -> bool {
        matches!(
            self.status.as_str(),
            "assigned" | "in_progress" | "review"
        )
    }
}

/// An append-only progress note on a task. Does not affect `Task::status`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProgressEntry {
    pub id: Uuid,
    pub task_id: Uuid,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

/// A versioned artifact produced against a task. `(task_id, version)` is
/// unique; versions are dense and monotonically increasing per task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Deliverable {
    pub id: Uuid,
    pub task_id: Option<Uuid>,
    pub version: i32,
    pub file_path: String,
    pub size_bytes: i64,
    pub status: String,
    pub content_type: String,
    pub parent_id: Option<Uuid>,
    pub files: serde_json::Value,
    pub actions: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Deliverable {
    pub fn status(&self) -> Result<DeliverableStatus, DeliverableStatusParseError> {
        self.status.parse()
    }
}

/// The last agent a `round_robin` rule assigned, per (project, capability),
/// so the next evaluation picks up after it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RoutingCursor {
    pub project_id: Uuid,
    pub capability: String,
    pub last_agent_id: Uuid,
    pub updated_at: DateTime<Utc>,
}

/// A rule that auto-assigns newly created tasks to an agent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RoutingRule {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub rule_priority: i32,
    pub conditions: serde_json::Value,
    pub assign_to: Option<Uuid>,
    pub assign_to_capability: Option<String>,
    pub assign_strategy: String,
    pub fallback_to: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl RoutingRule {
    pub fn assign_strategy(&self) -> Result<AssignStrategy, AssignStrategyParseError> {
        self.assign_strategy.parse()
    }
}

/// A subscription from a trigger event to a delivery destination.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Route {
    pub id: Uuid,
    pub project_id: Option<Uuid>,
    pub name: String,
    pub trigger_event: String,
    pub destination_kind: String,
    pub destination_config: serde_json::Value,
    pub enabled: bool,
    pub trigger_conditions: Option<serde_json::Value>,
    pub field_mapping: Option<serde_json::Value>,
    pub retry_policy: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Route {
    pub fn destination_kind(&self) -> Result<DestinationKind, DestinationKindParseError> {
        self.destination_kind.parse()
    }
}

/// One delivery attempt record for a `(route, event)` pair -- the unit the
/// retry sweeper schedules and advances.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeliveryLog {
    pub id: Uuid,
    pub route_id: Uuid,
    pub event: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempt: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub deliverable_id: Option<Uuid>,
    pub response_status: Option<i32>,
    pub response_body: Option<String>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryLog {
    pub fn status(&self) -> Result<DeliveryStatus, DeliveryStatusParseError> {
        self.status.parse()
    }
}

/// An append-only audit trail entry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ActivityLogEntry {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub action: String,
    pub actor: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A human operator account.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

/// An API key bound to a [`User`]. Only the SHA-256 hash of the secret
/// portion is stored, alongside the unhashed lookup prefix.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserKey {
    pub id: Uuid,
    pub user_id: Uuid,
    pub prefix: String,
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// An API key bound to an [`Agent`], scoped to that agent's own tasks.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentKey {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub prefix: String,
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_status_display_roundtrip() {
        for v in [AgentStatus::Active, AgentStatus::Paused, AgentStatus::Disabled] {
            let parsed: AgentStatus = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn agent_status_invalid() {
        assert!("sleeping".parse::<AgentStatus>().is_err());
    }

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::Assigned,
            TaskStatus::InProgress,
            TaskStatus::Review,
            TaskStatus::Completed,
            TaskStatus::Cancelled,
        ];
        for v in variants {
            let parsed: TaskStatus = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        assert!("blocked".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn assign_strategy_display_roundtrip() {
        for v in [
            AssignStrategy::LeastBusy,
            AssignStrategy::RoundRobin,
            AssignStrategy::FirstAvailable,
            AssignStrategy::Random,
        ] {
            let parsed: AssignStrategy = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn delivery_status_display_roundtrip() {
        for v in [
            DeliveryStatus::Pending,
            DeliveryStatus::Retrying,
            DeliveryStatus::Delivered,
            DeliveryStatus::Failed,
        ] {
            let parsed: DeliveryStatus = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn destination_kind_display_roundtrip() {
        for v in [
            DestinationKind::Webhook,
            DestinationKind::Email,
            DestinationKind::Storage,
            DestinationKind::Chat,
        ] {
            let parsed: DestinationKind = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn agent_capability_list_extracts_strings() {
        let agent = Agent {
            id: Uuid::nil(),
            name: "a".into(),
            status: "idle".into(),
            capabilities: serde_json::json!(["rust", "python"]),
            capacity_max: Some(3),
            capacity_in_use: 0,
            execution_mode: "auto".into(),
            owner_user_id: None,
            created_at: Utc::now(),
        };
        assert_eq!(agent.capability_list(), vec!["rust", "python"]);
    }

    #[test]
    fn agent_capability_list_empty_when_not_array() {
        let agent = Agent {
            id: Uuid::nil(),
            name: "a".into(),
            status: "idle".into(),
            capabilities: serde_json::json!(null),
            capacity_max: Some(1),
            capacity_in_use: 0,
            execution_mode: "auto".into(),
            owner_user_id: None,
            created_at: Utc::now(),
        };
        assert!(agent.capability_list().is_empty());
    }
}
