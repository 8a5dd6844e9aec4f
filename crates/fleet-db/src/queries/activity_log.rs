//! Database query functions for the append-only `activity_log` table.

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::db::Db;
use crate::models::ActivityLogEntry;
use crate::params;

pub async fn insert_activity_entry(
    db: &Db,
    entity_type: &str,
    entity_id: Uuid,
    action: &str,
    actor: &str,
    metadata: serde_json::Value,
) -> Result<ActivityLogEntry> {
    db.one(
        "INSERT INTO activity_log (entity_type, entity_id, action, actor, metadata, created_at) \
         VALUES (?, ?, ?, ?, ?, datetime('now')) \
         RETURNING *",
        &params!(entity_type, entity_id, action, actor, metadata),
    )
    .await
    .context("failed to insert activity log entry")
}

pub async fn list_for_entity(db: &Db, entity_type: &str, entity_id: Uuid) -> Result<Vec<ActivityLogEntry>> {
    db.many(
        "SELECT * FROM activity_log WHERE entity_type = ? AND entity_id = ? ORDER BY created_at DESC",
        &params!(entity_type, entity_id),
    )
    .await
    .context("failed to list activity log entries")
}
