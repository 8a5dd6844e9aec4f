//! Database query functions for the `projects` table.

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::db::Db;
use crate::models::Project;
use crate::params;

pub async fn insert_project(db: &Db, name: &str, default_agent_id: Option<Uuid>) -> Result<Project> {
    db.one(
        "INSERT INTO projects (id, name, default_agent_id, created_at) \
         VALUES (?, ?, ?, datetime('now')) \
         RETURNING *",
        &params!(Uuid::new_v4(), name, default_agent_id),
    )
    .await
    .context("failed to insert project")
}

pub async fn get_project(db: &Db, id: Uuid) -> Result<Option<Project>> {
    match db.one("SELECT * FROM projects WHERE id = ?", &params!(id)).await {
        Ok(project) => Ok(Some(project)),
        Err(crate::db::DbError::NotFound) => Ok(None),
        Err(e) => Err(e).context("failed to fetch project"),
    }
}

pub async fn list_projects(db: &Db) -> Result<Vec<Project>> {
    db.many("SELECT * FROM projects ORDER BY created_at ASC", &[])
        .await
        .context("failed to list projects")
}
