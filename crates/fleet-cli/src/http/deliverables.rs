//! Deliverable endpoints: submit, submit a revision, and review.
//! Submission arrives as `multipart/form-data` -- a `task_id` field (absent
//! for a standalone deliverable), a `content_type` field, and one or more
//! `file` fields carrying the actual bytes.

use axum::extract::{Multipart, Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use fleet_auth::{authorize, Action, Entity};
use fleet_core::deliverables::{self, FileUpload, ReviewDecision, Submission};
use fleet_core::events::Event;
use fleet_db::queries::{agents as agent_queries, deliverables as deliverable_queries, tasks as task_queries};

use super::auth::{actor_label, resolve_identity};
use super::{created, ok, require_allowed, AppError, AppState};

/// Resolve the [`Entity`] a deliverable's authorization check runs
/// against: if it is task-linked, ownership follows the task's assigned
/// agent (the submitter); a standalone deliverable carries
/// no owning agent, so only the role matrix applies.
async fn task_linked_entity(state: &AppState, task_id: Option<Uuid>) -> Result<Entity, AppError> {
    let Some(task_id) = task_id else {
        return Ok(Entity::ProjectScoped);
    };
    let task = task_queries::get_task(&state.db, task_id)
        .await
        .map_err(fleet_core::CoreError::from)?
        .ok_or(fleet_core::CoreError::TaskNotFound(task_id))?;
    let owner_agent_owner_user_id = match task.assigned_agent_id {
        Some(agent_id) => agent_queries::get_agent(&state.db, agent_id)
            .await
            .map_err(fleet_core::CoreError::from)?
            .and_then(|a| a.owner_user_id),
        None => None,
    };
    Ok(Entity::Deliverable {
        owner_agent_id: task.assigned_agent_id,
        owner_agent_owner_user_id,
    })
}

async fn deliverable_entity(state: &AppState, deliverable_id: Uuid) -> Result<Entity, AppError> {
    let deliverable = deliverable_queries::get_deliverable(&state.db, deliverable_id)
        .await
        .map_err(fleet_core::CoreError::from)?
        .ok_or(fleet_core::CoreError::DeliverableNotFound(deliverable_id))?;
    task_linked_entity(state, deliverable.task_id).await
}

async fn dispatch_all(state: &AppState, events: &[Event]) {
    for event in events {
        if let Err(e) = fleet_dispatch::emit(&state.db, &state.http_client, event).await {
            tracing::warn!(error = %e, kind = %event.kind, "failed to dispatch event");
        }
    }
}

struct ParsedSubmission {
    task_id: Option<Uuid>,
    content_type: String,
    files: Vec<FileUpload>,
}

async fn parse_multipart(mut multipart: Multipart) -> Result<ParsedSubmission, AppError> {
    let mut task_id = None;
    let mut content_type = String::from("application/octet-stream");
    let mut files = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::validation(format!("invalid multipart body: {e}")))?
    {
        match field.name().unwrap_or("") {
            "task_id" => {
                let text = field.text().await.map_err(|e| AppError::validation(e.to_string()))?;
                if !text.is_empty() {
                    task_id = Some(Uuid::parse_str(&text).map_err(|e| AppError::validation(format!("invalid task_id: {e}")))?);
                }
            }
            "content_type" => {
                content_type = field.text().await.map_err(|e| AppError::validation(e.to_string()))?;
            }
            "file" => {
                let name = field.file_name().unwrap_or("upload.bin").to_string();
                let bytes = field.bytes().await.map_err(|e| AppError::validation(e.to_string()))?;
                files.push(FileUpload {
                    name,
                    bytes: bytes.to_vec(),
                });
            }
            _ => {}
        }
    }

    if files.is_empty() {
        return Err(AppError::validation("at least one file field is required"));
    }

    Ok(ParsedSubmission { task_id, content_type, files })
}

pub async fn submit(State(state): State<AppState>, headers: HeaderMap, multipart: Multipart) -> Result<Response, AppError> {
    let identity = resolve_identity(&state, &headers).await?;
    let parsed = parse_multipart(multipart).await?;
    let entity = task_linked_entity(&state, parsed.task_id).await?;
    require_allowed(authorize(&identity, Action::SubmitDeliverable, entity))?;

    let (deliverable, events) = deliverables::submit(
        &state.db,
        &state.upload_root,
        Submission {
            task_id: parsed.task_id,
            content_type: parsed.content_type,
            files: parsed.files,
        },
    )
    .await?;
    dispatch_all(&state, &events).await;
    Ok(created(deliverable))
}

pub async fn submit_revision(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(parent_id): Path<Uuid>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let identity = resolve_identity(&state, &headers).await?;
    let entity = deliverable_entity(&state, parent_id).await?;
    require_allowed(authorize(&identity, Action::SubmitDeliverable, entity))?;

    let parsed = parse_multipart(multipart).await?;
    let (deliverable, events) =
        deliverables::submit_revision(&state.db, &state.upload_root, parent_id, &parsed.content_type, parsed.files).await?;
    dispatch_all(&state, &events).await;
    Ok(created(deliverable))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ReviewDecisionInput {
    Approve,
    RequestRevision,
    Reject,
}

impl From<ReviewDecisionInput> for ReviewDecision {
    fn from(v: ReviewDecisionInput) -> Self {
        match v {
            ReviewDecisionInput::Approve => ReviewDecision::Approve,
            ReviewDecisionInput::RequestRevision => ReviewDecision::RequestRevision,
            ReviewDecisionInput::Reject => ReviewDecision::Reject,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReviewRequest {
    decision: ReviewDecisionInput,
    comment: Option<String>,
}

pub async fn review(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(deliverable_id): Path<Uuid>,
    Json(body): Json<ReviewRequest>,
) -> Result<Response, AppError> {
    let identity = resolve_identity(&state, &headers).await?;
    let entity = deliverable_entity(&state, deliverable_id).await?;
    require_allowed(authorize(&identity, Action::ReviewDeliverable, entity))?;

    let reviewer = actor_label(&identity);
    let (deliverable, events) = deliverables::review(
        &state.db,
        deliverable_id,
        body.decision.into(),
        &reviewer,
        body.comment.as_deref(),
    )
    .await?;
    dispatch_all(&state, &events).await;
    Ok(ok(deliverable))
}
