//! Database query functions for the append-only `progress_entries` table.

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::db::Db;
use crate::models::ProgressEntry;
use crate::params;

pub async fn insert_progress_entry(db: &Db, task_id: Uuid, note: &str) -> Result<ProgressEntry> {
    db.one(
        "INSERT INTO progress_entries (id, task_id, note, created_at) \
         VALUES (?, ?, ?, datetime('now')) \
         RETURNING *",
        &params!(Uuid::new_v4(), task_id, note),
    )
    .await
    .context("failed to insert progress entry")
}

pub async fn list_progress_entries(db: &Db, task_id: Uuid) -> Result<Vec<ProgressEntry>> {
    db.many(
        "SELECT * FROM progress_entries WHERE task_id = ? ORDER BY created_at ASC",
        &params!(task_id),
    )
    .await
    .context("failed to list progress entries")
}
