//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::db::{Db, DbError, DbTx};
use crate::models::Task;
use crate::params;

#[allow(clippy::too_many_arguments)]
pub async fn insert_task_in_tx(
    tx: &mut DbTx<'_>,
    project_id: Uuid,
    title: &str,
    description: &str,
    capacity_cost: i32,
    priority: i32,
    tags: &[String],
    context: serde_json::Value,
) -> Result<Task> {
    tx.one(
        "INSERT INTO tasks \
            (id, project_id, title, description, status, assigned_agent_id, \
             capacity_cost, version, priority, tags, context, routing_rule_id, routing_decision, \
             created_at, updated_at) \
         VALUES (?, ?, ?, ?, 'pending', NULL, ?, 1, ?, ?, ?, NULL, NULL, datetime('now'), datetime('now')) \
         RETURNING *",
        &params!(
            Uuid::new_v4(),
            project_id,
            title,
            description,
            capacity_cost,
            priority,
            serde_json::to_value(tags).unwrap_or_default(),
            context
        ),
    )
    .await
    .context("failed to insert task")
}

pub async fn get_task(db: &Db, id: Uuid) -> Result<Option<Task>> {
    match db.one("SELECT * FROM tasks WHERE id = ?", &params!(id)).await {
        Ok(task) => Ok(Some(task)),
        Err(DbError::NotFound) => Ok(None),
        Err(e) => Err(e).context("failed to fetch task"),
    }
}

pub async fn get_task_in_tx(tx: &mut DbTx<'_>, id: Uuid) -> Result<Option<Task>> {
    match tx.one("SELECT * FROM tasks WHERE id = ?", &params!(id)).await {
        Ok(task) => Ok(Some(task)),
        Err(DbError::NotFound) => Ok(None),
        Err(e) => Err(e).context("failed to fetch task"),
    }
}

pub async fn list_tasks_for_project(db: &Db, project_id: Uuid) -> Result<Vec<Task>> {
    db.many(
        "SELECT * FROM tasks WHERE project_id = ? ORDER BY created_at ASC",
        &params!(project_id),
    )
    .await
    .context("failed to list tasks for project")
}

/// Atomic self-assignment (`claim`): zero rows changed means a
/// race was lost and the caller should surface a conflict, not retry the
/// UPDATE themselves.
pub async fn claim_task(tx: &mut DbTx<'_>, task_id: Uuid, agent_id: Uuid) -> Result<u64> {
    tx.exec(
        "UPDATE tasks \
         SET status = 'assigned', assigned_agent_id = ?, version = version + 1, \
             updated_at = datetime('now') \
         WHERE id = ? AND status IN ('pending', 'assigned') \
           AND (assigned_agent_id IS NULL OR assigned_agent_id = ?)",
        &params!(agent_id, task_id, agent_id),
    )
    .await
    .context("failed to claim task")
}

/// Assign a pending (or unassigned) task to an agent chosen by the router.
/// Optimistic locking on `version`; must run in the same transaction as
/// `agents::reserve_capacity` so a task is never left assigned without a
/// matching capacity reservation.
pub async fn assign_task(
    tx: &mut DbTx<'_>,
    task_id: Uuid,
    agent_id: Uuid,
    routing_rule_id: Option<Uuid>,
    routing_decision: &str,
    expected_version: i32,
) -> Result<u64> {
    tx.exec(
        "UPDATE tasks \
         SET status = 'assigned', assigned_agent_id = ?, routing_rule_id = ?, \
             routing_decision = ?, version = version + 1, updated_at = datetime('now') \
         WHERE id = ? AND version = ?",
        &params!(agent_id, routing_rule_id, routing_decision, task_id, expected_version),
    )
    .await
    .context("failed to assign task")
}

/// Record why routing did not assign a task (all rules exhausted, no
/// fallback, or the default agent had no headroom either) without
/// changing its status.
pub async fn record_routing_decision(
    tx: &mut DbTx<'_>,
    task_id: Uuid,
    routing_decision: &str,
    expected_version: i32,
) -> Result<u64> {
    tx.exec(
        "UPDATE tasks SET routing_decision = ?, version = version + 1, updated_at = datetime('now') \
         WHERE id = ? AND version = ?",
        &params!(routing_decision, task_id, expected_version),
    )
    .await
    .context("failed to record routing decision")
}

/// Atomically transition a task's status. Optimistic locking via the
/// current `version`.
pub async fn transition_task_status_in_tx(
    tx: &mut DbTx<'_>,
    task_id: Uuid,
    to: &str,
    expected_version: i32,
) -> Result<u64> {
    tx.exec(
        "UPDATE tasks \
         SET status = ?, version = version + 1, updated_at = datetime('now') \
         WHERE id = ? AND version = ?",
        &params!(to, task_id, expected_version),
    )
    .await
    .context("failed to transition task status")
}

/// Reassign a task to a different agent without changing its status (the
/// fallback path when an assignment's chosen agent later turns out to have
/// no spare capacity, or a direct admin reassignment).
pub async fn reassign_task(
    tx: &mut DbTx<'_>,
    task_id: Uuid,
    new_agent_id: Option<Uuid>,
    expected_version: i32,
) -> Result<u64> {
    tx.exec(
        "UPDATE tasks SET assigned_agent_id = ?, version = version + 1, updated_at = datetime('now') \
         WHERE id = ? AND version = ?",
        &params!(new_agent_id, task_id, expected_version),
    )
    .await
    .context("failed to reassign task")
}

/// Clear a task's assignment and drop it back to `pending` in one
/// statement, recording why. Used when a reassignment's chosen agent loses
/// the capacity race, so the row is never left `assigned` with no agent.
pub async fn unassign_to_pending(
    tx: &mut DbTx<'_>,
    task_id: Uuid,
    routing_decision: &str,
    expected_version: i32,
) -> Result<u64> {
    tx.exec(
        "UPDATE tasks \
         SET assigned_agent_id = NULL, status = 'pending', routing_decision = ?, \
             version = version + 1, updated_at = datetime('now') \
         WHERE id = ? AND version = ?",
        &params!(routing_decision, task_id, expected_version),
    )
    .await
    .context("failed to unassign task")
}

/// Edit mutable task fields (priority / tags / description). Only valid on
/// non-terminal statuses; the caller enforces that.
pub async fn update_task_fields(
    db: &Db,
    task_id: Uuid,
    title: Option<&str>,
    description: Option<&str>,
    priority: Option<i32>,
    tags: Option<&[String]>,
    expected_version: i32,
) -> Result<u64> {
    db.exec(
        "UPDATE tasks \
         SET title = COALESCE(?, title), \
             description = COALESCE(?, description), \
             priority = COALESCE(?, priority), \
             tags = COALESCE(?, tags), \
             version = version + 1, updated_at = datetime('now') \
         WHERE id = ? AND version = ?",
        &params!(
            title,
            description,
            priority,
            tags.map(|t| serde_json::to_value(t).unwrap_or_default()),
            task_id,
            expected_version
        ),
    )
    .await
    .context("failed to update task fields")
}

pub async fn delete_task(db: &Db, task_id: Uuid) -> Result<u64> {
    db.exec("DELETE FROM tasks WHERE id = ?", &params!(task_id))
        .await
        .context("failed to delete task")
}
