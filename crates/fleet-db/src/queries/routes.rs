//! Database query functions for the `routes` table.

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::db::{Db, DbError};
use crate::models::Route;
use crate::params;

/// `project_id = None` subscribes the route to the event globally, across
/// every project.
#[allow(clippy::too_many_arguments)]
pub async fn insert_route(
    db: &Db,
    project_id: Option<Uuid>,
    name: &str,
    trigger_event: &str,
    destination_kind: &str,
    destination_config: serde_json::Value,
    trigger_conditions: Option<serde_json::Value>,
    field_mapping: Option<serde_json::Value>,
    retry_policy: serde_json::Value,
) -> Result<Route> {
    db.one(
        "INSERT INTO routes \
            (id, project_id, name, trigger_event, destination_kind, destination_config, \
             enabled, trigger_conditions, field_mapping, retry_policy, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, TRUE, ?, ?, ?, datetime('now')) \
         RETURNING *",
        &params!(
            Uuid::new_v4(),
            project_id,
            name,
            trigger_event,
            destination_kind,
            destination_config,
            trigger_conditions,
            field_mapping,
            retry_policy
        ),
    )
    .await
    .context("failed to insert route")
}

pub async fn get_route(db: &Db, id: Uuid) -> Result<Option<Route>> {
    match db.one("SELECT * FROM routes WHERE id = ?", &params!(id)).await {
        Ok(route) => Ok(Some(route)),
        Err(DbError::NotFound) => Ok(None),
        Err(e) => Err(e).context("failed to fetch route"),
    }
}

/// Routes subscribed to a given event: enabled, matching the event's
/// project, or global (`project_id IS NULL`).
pub async fn list_routes_for_event(db: &Db, project_id: Uuid, trigger_event: &str) -> Result<Vec<Route>> {
    db.many(
        "SELECT * FROM routes \
         WHERE (project_id = ? OR project_id IS NULL) AND trigger_event = ? AND enabled = TRUE",
        &params!(project_id, trigger_event),
    )
    .await
    .context("failed to list routes for event")
}
