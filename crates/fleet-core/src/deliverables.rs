//! Deliverable submission, revision, and review.
//!
//! File size validation happens before any transaction opens, so a
//! rejected upload never produces an orphaned row. File I/O itself also
//! happens outside the transaction: [`fleet_db::queries::deliverables::insert_deliverable_version`]
//! writes the row with an empty `files` array, the caller then writes the
//! bytes to disk, and [`fleet_db::queries::deliverables::attach_files`]
//! patches the row afterward. A disk-write failure simply leaves the row
//! pointing at no files rather than at files that don't exist.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use fleet_db::db::Db;
use fleet_db::models::{Deliverable, DeliverableStatus};
use fleet_db::queries::{deliverables, tasks};

use crate::error::CoreError;
use crate::events::{Event, TriggerEvent};

/// Per-file upload limit.
pub const MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;
/// Whole-submission upload limit.
pub const MAX_TOTAL_BYTES: u64 = 50 * 1024 * 1024;

/// A file attached to a deliverable submission, held in memory until it
/// has cleared size validation and the row exists to attach it to.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Replace everything outside `[A-Za-z0-9._-]` with `_`, matching the
/// on-disk upload path convention.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect()
}

fn validate_files(files: &[FileUpload]) -> Result<u64, CoreError> {
    let mut total = 0u64;
    for file in files {
        let size = file.bytes.len() as u64;
        if size > MAX_FILE_BYTES {
            return Err(CoreError::FileTooLarge {
                name: file.name.clone(),
                size,
                limit: MAX_FILE_BYTES,
            });
        }
        total += size;
    }
    if total > MAX_TOTAL_BYTES {
        return Err(CoreError::SubmissionTooLarge {
            total,
            limit: MAX_TOTAL_BYTES,
        });
    }
    Ok(total)
}

async fn write_files(upload_root: &Path, deliverable_id: Uuid, files: &[FileUpload]) -> Result<(PathBuf, serde_json::Value), CoreError> {
    let dir = upload_root.join("deliverables").join(deliverable_id.to_string());
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| CoreError::Other(anyhow::anyhow!(e).context("failed to create upload directory")))?;

    let mut manifest = Vec::with_capacity(files.len());
    for file in files {
        let safe_name = sanitize_filename(&file.name);
        let path = dir.join(&safe_name);
        tokio::fs::write(&path, &file.bytes)
            .await
            .map_err(|e| CoreError::Other(anyhow::anyhow!(e).context("failed to write deliverable file")))?;
        manifest.push(serde_json::json!({"name": safe_name, "size": file.bytes.len()}));
    }
    Ok((dir, serde_json::Value::Array(manifest)))
}

/// A new deliverable submission -- either against a task, or standalone.
#[derive(Debug, Clone)]
pub struct Submission {
    pub task_id: Option<Uuid>,
    pub content_type: String,
    pub files: Vec<FileUpload>,
}

/// Submit a deliverable. Validates file sizes, inserts the versioned row
/// (retrying internally on a lost version race when task-linked), writes
/// files to disk, then patches the row with their references.
pub async fn submit(db: &Db, upload_root: &Path, input: Submission) -> Result<(Deliverable, Vec<Event>), CoreError> {
    let total = validate_files(&input.files)?;

    let mut project_id = None;
    if let Some(task_id) = input.task_id {
        let task = tasks::get_task(db, task_id)
            .await?
            .ok_or(CoreError::TaskNotFound(task_id))?;
        project_id = Some(task.project_id);
    }

    let row = deliverables::insert_deliverable_version(db, input.task_id, &input.content_type, None).await?;

    let (dir, manifest) = write_files(upload_root, row.id, &input.files).await?;
    deliverables::attach_files(db, row.id, &dir.to_string_lossy(), total as i64, manifest).await?;

    let deliverable = deliverables::get_deliverable(db, row.id)
        .await?
        .ok_or(CoreError::DeliverableNotFound(row.id))?;

    let events = vec![Event::new(
        TriggerEvent::DeliverableSubmitted,
        project_id,
        serde_json::json!({"deliverable_id": deliverable.id, "task_id": deliverable.task_id}),
    )];
    Ok((deliverable, events))
}

/// Submit a revision against a deliverable previously sent back with
/// `revision_requested`. The new row's `parent_id` points at `parent_id`;
/// the parent itself flips to `revised` so it stops showing up as the
/// task's pending review item.
pub async fn submit_revision(
    db: &Db,
    upload_root: &Path,
    parent_id: Uuid,
    content_type: &str,
    files: Vec<FileUpload>,
) -> Result<(Deliverable, Vec<Event>), CoreError> {
    let parent = deliverables::get_deliverable(db, parent_id)
        .await?
        .ok_or(CoreError::DeliverableNotFound(parent_id))?;
    let parent_status = parent
        .status()
        .map_err(|e| CoreError::Validation(e.to_string()))?;
    if parent_status != DeliverableStatus::RevisionRequested {
        return Err(CoreError::Validation(format!(
            "deliverable {parent_id} is {parent_status}, not revision_requested"
        )));
    }

    let total = validate_files(&files)?;
    let project_id = match parent.task_id {
        Some(task_id) => tasks::get_task(db, task_id).await?.map(|t| t.project_id),
        None => None,
    };

    let row = deliverables::insert_deliverable_version(db, parent.task_id, content_type, Some(parent_id)).await?;
    let (dir, manifest) = write_files(upload_root, row.id, &files).await?;
    deliverables::attach_files(db, row.id, &dir.to_string_lossy(), total as i64, manifest).await?;

    deliverables::set_deliverable_status(db, parent_id, "revised", parent.actions.clone()).await?;

    let deliverable = deliverables::get_deliverable(db, row.id)
        .await?
        .ok_or(CoreError::DeliverableNotFound(row.id))?;

    let events = vec![Event::new(
        TriggerEvent::DeliverableSubmitted,
        project_id,
        serde_json::json!({"deliverable_id": deliverable.id, "task_id": deliverable.task_id, "revision_of": parent_id}),
    )];
    Ok((deliverable, events))
}

/// A reviewer's decision on a `pending` deliverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approve,
    RequestRevision,
    Reject,
}

impl ReviewDecision {
    fn target_status(self) -> DeliverableStatus {
        match self {
            Self::Approve => DeliverableStatus::Approved,
            Self::RequestRevision => DeliverableStatus::RevisionRequested,
            Self::Reject => DeliverableStatus::Rejected,
        }
    }

    fn trigger_event(self) -> TriggerEvent {
        match self {
            Self::Approve => TriggerEvent::DeliverableApproved,
            Self::RequestRevision => TriggerEvent::DeliverableRevisionRequested,
            Self::Reject => TriggerEvent::DeliverableRejected,
        }
    }
}

/// Record a reviewer's decision against a deliverable, appending it to the
/// `actions` audit trail.
pub async fn review(
    db: &Db,
    deliverable_id: Uuid,
    decision: ReviewDecision,
    reviewer: &str,
    comment: Option<&str>,
) -> Result<(Deliverable, Vec<Event>), CoreError> {
    let before = deliverables::get_deliverable(db, deliverable_id)
        .await?
        .ok_or(CoreError::DeliverableNotFound(deliverable_id))?;
    let status = before.status().map_err(|e| CoreError::Validation(e.to_string()))?;
    if status != DeliverableStatus::Pending {
        return Err(CoreError::Validation(format!(
            "deliverable {deliverable_id} is {status}, not pending review"
        )));
    }

    let mut actions = before.actions.as_array().cloned().unwrap_or_default();
    actions.push(serde_json::json!({
        "decision": decision.target_status().to_string(),
        "reviewer": reviewer,
        "comment": comment,
    }));

    deliverables::set_deliverable_status(
        db,
        deliverable_id,
        &decision.target_status().to_string(),
        serde_json::Value::Array(actions),
    )
    .await?;

    let deliverable = deliverables::get_deliverable(db, deliverable_id)
        .await?
        .ok_or(CoreError::DeliverableNotFound(deliverable_id))?;

    let project_id = match deliverable.task_id {
        Some(task_id) => tasks::get_task(db, task_id).await?.map(|t| t.project_id),
        None => None,
    };

    let events = vec![Event::new(
        decision.trigger_event(),
        project_id,
        serde_json::json!({"deliverable_id": deliverable.id, "task_id": deliverable.task_id}),
    )];
    Ok((deliverable, events))
}

pub async fn list_for_task(db: &Db, task_id: Uuid) -> Result<Vec<Deliverable>, CoreError> {
    Ok(deliverables::list_deliverables_for_task(db, task_id).await?)
}

pub async fn get(db: &Db, id: Uuid) -> Result<Deliverable, CoreError> {
    deliverables::get_deliverable(db, id).await?.ok_or(CoreError::DeliverableNotFound(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_db::queries::{projects, tasks as task_queries};

    async fn setup_task(db: &Db) -> Uuid {
        let project = projects::insert_project(db, "p", None).await.unwrap();
        let task = db
            .tx(|tx| {
                let project_id = project.id;
                async move {
                    task_queries::insert_task_in_tx(tx, project_id, "t", "d", 1, 2, &[], serde_json::json!({})).await
                }
            })
            .await
            .unwrap();
        task.id
    }

    fn submission(task_id: Uuid) -> Submission {
        Submission {
            task_id: Some(task_id),
            content_type: "text".into(),
            files: vec![],
        }
    }

    /// Scenario: one existing deliverable (version 1) on a task, two
    /// concurrent submissions. Both succeed; the resulting versions are
    /// exactly {1, 2, 3}, with no duplicate and no gap.
    #[tokio::test]
    async fn concurrent_submissions_against_the_same_task_never_collide_on_version() {
        let (db, tmp) = fleet_test_utils::sqlite_test_db().await;
        let task_id = setup_task(&db).await;
        let upload_root = tmp.path();

        let (first, _) = submit(&db, upload_root, submission(task_id)).await.unwrap();
        assert_eq!(first.version, 1);

        let (r1, r2) = tokio::join!(
            submit(&db, upload_root, submission(task_id)),
            submit(&db, upload_root, submission(task_id)),
        );
        let (d1, _) = r1.unwrap();
        let (d2, _) = r2.unwrap();

        let mut versions = vec![first.version, d1.version, d2.version];
        versions.sort();
        assert_eq!(versions, vec![1, 2, 3]);

        let all = list_for_task(&db, task_id).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn standalone_deliverables_are_always_version_one() {
        let (db, tmp) = fleet_test_utils::sqlite_test_db().await;
        let (d1, _) = submit(
            &db,
            tmp.path(),
            Submission {
                task_id: None,
                content_type: "markdown".into(),
                files: vec![],
            },
        )
        .await
        .unwrap();
        assert_eq!(d1.version, 1);
        assert_eq!(d1.task_id, None);
    }

    #[tokio::test]
    async fn revision_chain_tracks_parent_and_flips_parent_status() {
        let (db, tmp) = fleet_test_utils::sqlite_test_db().await;
        let task_id = setup_task(&db).await;
        let (v1, _) = submit(&db, tmp.path(), submission(task_id)).await.unwrap();

        review(&db, v1.id, ReviewDecision::RequestRevision, "reviewer", Some("needs more detail"))
            .await
            .unwrap();

        let (v2, _) = submit_revision(&db, tmp.path(), v1.id, "text", vec![]).await.unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.parent_id, Some(v1.id));

        let parent = get(&db, v1.id).await.unwrap();
        assert_eq!(parent.status, "revised");
    }

    #[tokio::test]
    async fn file_over_the_per_file_limit_is_rejected_before_any_row_is_written() {
        let (db, tmp) = fleet_test_utils::sqlite_test_db().await;
        let task_id = setup_task(&db).await;
        let oversized = FileUpload {
            name: "big.bin".into(),
            bytes: vec![0u8; (MAX_FILE_BYTES + 1) as usize],
        };
        let result = submit(
            &db,
            tmp.path(),
            Submission {
                task_id: Some(task_id),
                content_type: "code".into(),
                files: vec![oversized],
            },
        )
        .await;
        assert!(matches!(result, Err(CoreError::FileTooLarge { .. })));
        assert!(list_for_task(&db, task_id).await.unwrap().is_empty());
    }
}
