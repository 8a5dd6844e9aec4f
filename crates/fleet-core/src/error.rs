//! Typed errors for the core coordination operations. These compose with
//! [`fleet_db::DbError`] via `#[from]` so a `fleet_db::Db::tx` callback can
//! return `Result<T, CoreError>` directly and still propagate storage
//! failures with `?`.

use uuid::Uuid;

use fleet_db::DbError;

/// The reason a capacity reservation was refused, surfaced verbatim into a
/// task's `routing_decision`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReservationError {
    #[error("agent not found")]
    AgentNotFound,
    #[error("agent not active")]
    AgentNotActive,
    #[error("at capacity")]
    AtCapacity,
}

impl From<fleet_db::queries::agents::ReservationFailure> for ReservationError {
    fn from(f: fleet_db::queries::agents::ReservationFailure) -> Self {
        match f {
            fleet_db::queries::agents::ReservationFailure::AgentNotFound => Self::AgentNotFound,
            fleet_db::queries::agents::ReservationFailure::AgentNotActive => Self::AgentNotActive,
            fleet_db::queries::agents::ReservationFailure::AtCapacity => Self::AtCapacity,
        }
    }
}

/// Errors from task lifecycle, router, and deliverable operations. Each
/// variant maps to one arm of a small error taxonomy (validation /
/// authorization / not-found / conflict / dependency / invariant); the HTTP
/// layer owns the actual status-code mapping.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("task {0} not found")]
    TaskNotFound(Uuid),
    #[error("agent {0} not found")]
    AgentNotFound(Uuid),
    #[error("project {0} not found")]
    ProjectNotFound(Uuid),
    #[error("deliverable {0} not found")]
    DeliverableNotFound(Uuid),
    #[error("route {0} not found")]
    RouteNotFound(Uuid),

    #[error("task {task_id} is in status {from:?}, which cannot transition to {to:?}")]
    InvalidTransition {
        task_id: Uuid,
        from: String,
        to: String,
    },

    #[error("task {0} was modified concurrently; retry with the latest version")]
    VersionConflict(Uuid),

    #[error("claim on task {0} lost a race to another agent")]
    ClaimConflict(Uuid),

    #[error("deliverable version assignment for task {0} lost the race too many times")]
    DeliverableVersionConflict(Uuid),

    #[error("capacity reservation on agent {agent_id} failed: {source}")]
    Reservation {
        agent_id: Uuid,
        source: ReservationError,
    },

    #[error("file {name:?} is {size} bytes, exceeding the {limit}-byte per-file limit")]
    FileTooLarge { name: String, size: u64, limit: u64 },

    #[error("deliverable submission totals {total} bytes, exceeding the {limit}-byte limit")]
    SubmissionTooLarge { total: u64, limit: u64 },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
