//! Task endpoints: create, bulk create, edit, claim, status
//! transitions, and progress notes. Every mutation dispatches the events
//! `fleet_core` hands back before the response is sent.

use std::str::FromStr;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use fleet_auth::{authorize, Action, Entity};
use fleet_core::events::Event;
use fleet_core::lifecycle::{self, Assignment, NewTask};
use fleet_db::models::TaskStatus;
use fleet_db::queries::{agents as agent_queries, tasks as task_queries};

use super::auth::{actor_label, resolve_identity};
use super::{created, ok, require_allowed, AppError, AppState};

async fn dispatch_all(state: &AppState, events: &[Event]) {
    for event in events {
        if let Err(e) = fleet_dispatch::emit(&state.db, &state.http_client, event).await {
            tracing::warn!(error = %e, kind = %event.kind, "failed to dispatch event");
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
enum AssignmentInput {
    None,
    Auto,
    Agent { agent_id: Uuid },
}

impl From<AssignmentInput> for Assignment {
    fn from(v: AssignmentInput) -> Self {
        match v {
            AssignmentInput::None => Assignment::None,
            AssignmentInput::Auto => Assignment::Auto,
            AssignmentInput::Agent { agent_id } => Assignment::Agent(agent_id),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    project_id: Uuid,
    title: String,
    description: String,
    #[serde(default = "default_capacity_cost")]
    capacity_cost: i32,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default = "default_context")]
    context: serde_json::Value,
    #[serde(default = "default_assignment")]
    assignment: AssignmentInput,
}

fn default_capacity_cost() -> i32 {
    1
}

fn default_context() -> serde_json::Value {
    serde_json::json!({})
}

fn default_assignment() -> AssignmentInput {
    AssignmentInput::None
}

impl CreateTaskRequest {
    fn into_new_task(self) -> NewTask {
        NewTask {
            title: self.title,
            description: self.description,
            capacity_cost: self.capacity_cost,
            priority: self.priority,
            tags: self.tags,
            context: self.context,
            assignment: self.assignment.into(),
        }
    }
}

pub async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateTaskRequest>,
) -> Result<Response, AppError> {
    let identity = resolve_identity(&state, &headers).await?;
    require_allowed(authorize(&identity, Action::CreateTask, Entity::ProjectScoped))?;

    let project_id = body.project_id;
    let (task, events) = lifecycle::create_task(&state.db, project_id, body.into_new_task()).await?;
    dispatch_all(&state, &events).await;
    Ok(created(task))
}

#[derive(Debug, Deserialize)]
struct CreateTasksBulkRequest {
    project_id: Uuid,
    tasks: Vec<CreateTaskRequest>,
}

pub async fn create_tasks_bulk(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateTasksBulkRequest>,
) -> Result<Response, AppError> {
    let identity = resolve_identity(&state, &headers).await?;
    require_allowed(authorize(&identity, Action::CreateTask, Entity::ProjectScoped))?;

    let inputs = body.tasks.into_iter().map(CreateTaskRequest::into_new_task).collect();
    let tasks = lifecycle::create_tasks_bulk(&state.db, body.project_id, inputs).await?;
    Ok(created(tasks))
}

async fn task_entity(state: &AppState, task_id: Uuid) -> Result<Entity, AppError> {
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
    Ok(Entity::Task {
        owner_agent_id: task.assigned_agent_id,
        owner_agent_owner_user_id,
    })
}

#[derive(Debug, Deserialize)]
struct EditTaskRequest {
    title: Option<String>,
    description: Option<String>,
    priority: Option<i32>,
    tags: Option<Vec<String>>,
}

pub async fn edit_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<Uuid>,
    Json(body): Json<EditTaskRequest>,
) -> Result<Response, AppError> {
    let identity = resolve_identity(&state, &headers).await?;
    let entity = task_entity(&state, task_id).await?;
    require_allowed(authorize(&identity, Action::EditTask, entity))?;

    let task = lifecycle::edit_task(
        &state.db,
        task_id,
        body.title.as_deref(),
        body.description.as_deref(),
        body.priority,
        body.tags.as_deref(),
    )
    .await?;
    Ok(ok(task))
}

#[derive(Debug, Deserialize, Default)]
struct ClaimTaskRequest {
    agent_id: Option<Uuid>,
}

/// An agent key claims on its own behalf; any other identity must name the
/// agent explicitly and pass the same ownership check any other edit to
/// that agent's task would.
fn resolve_claimant(identity: &fleet_auth::Identity, body: &ClaimTaskRequest) -> Result<Uuid, AppError> {
    match identity {
        fleet_auth::Identity::AgentKey { agent_id, .. } => Ok(body.agent_id.unwrap_or(*agent_id)),
        _ => body.agent_id.ok_or_else(|| AppError::validation("agent_id is required for this identity")),
    }
}

pub async fn claim_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<Uuid>,
    Json(body): Json<ClaimTaskRequest>,
) -> Result<Response, AppError> {
    let identity = resolve_identity(&state, &headers).await?;
    let agent_id = resolve_claimant(&identity, &body)?;
    let owner_agent_owner_user_id = agent_queries::get_agent(&state.db, agent_id)
        .await
        .map_err(fleet_core::CoreError::from)?
        .and_then(|a| a.owner_user_id);
    require_allowed(authorize(
        &identity,
        Action::ClaimTask,
        Entity::Task {
            owner_agent_id: Some(agent_id),
            owner_agent_owner_user_id,
        },
    ))?;

    let (task, events) = lifecycle::claim_task(&state.db, task_id, agent_id).await?;
    dispatch_all(&state, &events).await;
    Ok(ok(task))
}

#[derive(Debug, Deserialize)]
struct TransitionStatusRequest {
    to: String,
}

pub async fn transition_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<Uuid>,
    Json(body): Json<TransitionStatusRequest>,
) -> Result<Response, AppError> {
    let identity = resolve_identity(&state, &headers).await?;
    let entity = task_entity(&state, task_id).await?;
    require_allowed(authorize(&identity, Action::EditTask, entity))?;

    let to = TaskStatus::from_str(&body.to).map_err(|e| AppError::validation(e.to_string()))?;
    let actor = actor_label(&identity);
    let (task, events) = lifecycle::transition_status(&state.db, task_id, to, &actor).await?;
    dispatch_all(&state, &events).await;
    Ok(ok(task))
}

#[derive(Debug, Deserialize)]
struct AddProgressRequest {
    note: String,
}

pub async fn add_progress(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<Uuid>,
    Json(body): Json<AddProgressRequest>,
) -> Result<Response, AppError> {
    let identity = resolve_identity(&state, &headers).await?;
    let entity = task_entity(&state, task_id).await?;
    require_allowed(authorize(&identity, Action::EditTask, entity))?;

    let entry = lifecycle::add_progress(&state.db, task_id, &body.note).await?;
    Ok(created(entry))
}
