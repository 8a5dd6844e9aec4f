//! Database query functions for the `deliverables` table.
//!
//! Versions are assigned by reading the current max version for the task
//! and inserting `max + 1`. Two concurrent submissions can read the same
//! max and race on the `(task_id, version)` unique constraint; the insert
//! function retries by re-reading the max and trying again, bounded to
//! three attempts total.
//!
//! File attachment I/O happens outside the transaction: the row here is
//! always written with an empty `files` array, and the caller (fleet-core,
//! after validating and writing files to disk) patches the row via
//! [`attach_files`]. A failed disk write never leaves the row pointing at
//! files that don't exist, because the row simply never gets patched.

use anyhow::{Context, Result, bail};
use uuid::Uuid;

use crate::db::{Db, DbError};
use crate::models::Deliverable;
use crate::params;

const MAX_VERSION_RETRIES: u32 = 3;

async fn max_version(db: &Db, task_id: Uuid) -> Result<i32> {
    #[derive(sqlx::FromRow)]
    struct MaxVersion {
        max_version: Option<i32>,
    }
    let row: MaxVersion = db
        .one(
            "SELECT MAX(version) AS max_version FROM deliverables WHERE task_id = ?",
            &params!(task_id),
        )
        .await
        .context("failed to read max deliverable version")?;
    Ok(row.max_version.unwrap_or(0))
}

/// Insert a new deliverable version, assigning the next version number.
/// Retries up to [`MAX_VERSION_RETRIES`] times on a unique constraint
/// violation (a concurrent submission took the version first). `parent_id`
/// should be the prior version's row when this is a revision.
///
/// Standalone deliverables (`task_id = None`) fall outside the
/// `(task_id, version)` partial unique index, so there is no race to retry
/// against; they are always inserted as version 1.
pub async fn insert_deliverable_version(
    db: &Db,
    task_id: Option<Uuid>,
    content_type: &str,
    parent_id: Option<Uuid>,
) -> Result<Deliverable> {
    let Some(task_id) = task_id else {
        return db
            .one(
                "INSERT INTO deliverables \
                    (id, task_id, version, file_path, size_bytes, status, content_type, \
                     parent_id, files, actions, created_at) \
                 VALUES (?, NULL, 1, '', 0, 'pending', ?, ?, '[]', '[]', datetime('now')) \
                 RETURNING *",
                &params!(Uuid::new_v4(), content_type, parent_id),
            )
            .await
            .context("failed to insert standalone deliverable");
    };

    let mut attempt = 0;
    loop {
        attempt += 1;
        let next_version = max_version(db, task_id).await? + 1;

        let result = db
            .one::<Deliverable>(
                "INSERT INTO deliverables \
                    (id, task_id, version, file_path, size_bytes, status, content_type, \
                     parent_id, files, actions, created_at) \
                 VALUES (?, ?, ?, '', 0, 'pending', ?, ?, '[]', '[]', datetime('now')) \
                 RETURNING *",
                &params!(Uuid::new_v4(), task_id, next_version, content_type, parent_id),
            )
            .await;

        match result {
            Ok(deliverable) => return Ok(deliverable),
            Err(DbError::Sql(sqlx::Error::Database(e))) if e.is_unique_violation() => {
                if attempt >= MAX_VERSION_RETRIES {
                    bail!(
                        "deliverable version assignment for task {task_id} lost the race \
                         {MAX_VERSION_RETRIES} times in a row"
                    );
                }
                continue;
            }
            Err(e) => return Err(e).context("failed to insert deliverable"),
        }
    }
}

pub async fn list_deliverables_for_task(db: &Db, task_id: Uuid) -> Result<Vec<Deliverable>> {
    db.many(
        "SELECT * FROM deliverables WHERE task_id = ? ORDER BY version ASC",
        &params!(task_id),
    )
    .await
    .context("failed to list deliverables")
}

pub async fn get_deliverable(db: &Db, id: Uuid) -> Result<Option<Deliverable>> {
    match db.one("SELECT * FROM deliverables WHERE id = ?", &params!(id)).await {
        Ok(d) => Ok(Some(d)),
        Err(DbError::NotFound) => Ok(None),
        Err(e) => Err(e).context("failed to fetch deliverable"),
    }
}

pub async fn get_latest_deliverable(db: &Db, task_id: Uuid) -> Result<Option<Deliverable>> {
    match db
        .one(
            "SELECT * FROM deliverables WHERE task_id = ? ORDER BY version DESC LIMIT 1",
            &params!(task_id),
        )
        .await
    {
        Ok(d) => Ok(Some(d)),
        Err(DbError::NotFound) => Ok(None),
        Err(e) => Err(e).context("failed to fetch latest deliverable"),
    }
}

/// Patch a deliverable row with the file references and sizes once the
/// corresponding disk writes have completed. Called once, shortly after
/// [`insert_deliverable_version`], never inside the same transaction.
pub async fn attach_files(
    db: &Db,
    id: Uuid,
    file_path: &str,
    size_bytes: i64,
    files: serde_json::Value,
) -> Result<u64> {
    db.exec(
        "UPDATE deliverables SET file_path = ?, size_bytes = ?, files = ? WHERE id = ?",
        &params!(file_path, size_bytes, files, id),
    )
    .await
    .context("failed to attach deliverable files")
}

/// Move a deliverable through the review cycle (`pending` ->
/// `approved`/`revision_requested`/`rejected`, or `revision_requested` ->
/// `revised` once a new version has been submitted against it). Reviewer
/// actions accumulate in `actions` as an audit trail.
pub async fn set_deliverable_status(
    db: &Db,
    id: Uuid,
    status: &str,
    actions: serde_json::Value,
) -> Result<u64> {
    db.exec(
        "UPDATE deliverables SET status = ?, actions = ? WHERE id = ?",
        &params!(status, actions, id),
    )
    .await
    .context("failed to update deliverable status")
}
