//! Database query functions for the `routing_cursors` table -- round-robin
//! state for the router's `round_robin` assign strategy, keyed by
//! `(project_id, capability)`.

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::db::DbError;
use crate::db::Db;
use crate::models::RoutingCursor;
use crate::params;

pub async fn get_cursor(db: &Db, project_id: Uuid, capability: &str) -> Result<Option<RoutingCursor>> {
    match db
        .one(
            "SELECT * FROM routing_cursors WHERE project_id = ? AND capability = ?",
            &params!(project_id, capability),
        )
        .await
    {
        Ok(cursor) => Ok(Some(cursor)),
        Err(DbError::NotFound) => Ok(None),
        Err(e) => Err(e).context("failed to fetch routing cursor"),
    }
}

/// Upsert the cursor's `last_agent_id`. SQLite and Postgres both accept the
/// `INSERT ... ON CONFLICT` form, so no dialect rewrite is needed here.
pub async fn set_cursor(db: &Db, project_id: Uuid, capability: &str, last_agent_id: Uuid) -> Result<()> {
    db.exec(
        "INSERT INTO routing_cursors (project_id, capability, last_agent_id, updated_at) \
         VALUES (?, ?, ?, datetime('now')) \
         ON CONFLICT (project_id, capability) \
         DO UPDATE SET last_agent_id = excluded.last_agent_id, updated_at = excluded.updated_at",
        &params!(project_id, capability, last_agent_id),
    )
    .await
    .context("failed to upsert routing cursor")?;
    Ok(())
}
