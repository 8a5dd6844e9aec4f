//! Routing-rule endpoints: list a project's auto-assignment
//! rules, replace the whole list, and dry-run the router against a
//! hypothetical task without persisting anything.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use fleet_auth::{authorize, Action, Entity};
use fleet_core::router::{self, NewRule, TaskDescriptor};
use fleet_db::queries::routing_rules;

use super::auth::resolve_identity;
use super::{ok, require_allowed, AppError, AppState};

pub async fn list_rules(State(state): State<AppState>, headers: HeaderMap, Path(project_id): Path<Uuid>) -> Result<Response, AppError> {
    let identity = resolve_identity(&state, &headers).await?;
    require_allowed(authorize(&identity, Action::Read, Entity::ProjectScoped))?;

    let rules = routing_rules::list_rules_for_project(&state.db, project_id)
        .await
        .map_err(fleet_core::CoreError::Other)?;
    Ok(ok(rules))
}

#[derive(Debug, Deserialize)]
struct NewRuleRequest {
    name: String,
    #[serde(default = "default_conditions")]
    conditions: serde_json::Value,
    assign_to: Option<Uuid>,
    assign_to_capability: Option<String>,
    #[serde(default = "default_strategy")]
    assign_strategy: String,
    fallback_to: Option<Uuid>,
}

fn default_conditions() -> serde_json::Value {
    serde_json::json!({})
}

fn default_strategy() -> String {
    "least_busy".to_string()
}

impl From<NewRuleRequest> for NewRule {
    fn from(v: NewRuleRequest) -> Self {
        NewRule {
            name: v.name,
            conditions: v.conditions,
            assign_to: v.assign_to,
            assign_to_capability: v.assign_to_capability,
            assign_strategy: v.assign_strategy,
            fallback_to: v.fallback_to,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReplaceRulesRequest {
    rules: Vec<NewRuleRequest>,
}

pub async fn replace_rules(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
    Json(body): Json<ReplaceRulesRequest>,
) -> Result<Response, AppError> {
    let identity = resolve_identity(&state, &headers).await?;
    require_allowed(authorize(&identity, Action::ManageRouting, Entity::ProjectScoped))?;

    let rules = body.rules.into_iter().map(NewRule::from).collect();
    let replaced = router::replace_rules(&state.db, project_id, rules).await?;
    Ok(ok(replaced))
}

#[derive(Debug, Deserialize)]
struct DryRunRequest {
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default = "default_conditions")]
    context: serde_json::Value,
}

pub async fn dry_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(project_id): Path<Uuid>,
    Json(body): Json<DryRunRequest>,
) -> Result<Response, AppError> {
    let identity = resolve_identity(&state, &headers).await?;
    require_allowed(authorize(&identity, Action::Read, Entity::ProjectScoped))?;

    let descriptor = TaskDescriptor {
        priority: body.priority,
        tags: body.tags,
        context: body.context,
    };
    let decision = router::decide(&state.db, project_id, &descriptor).await?;
    Ok(ok(decision))
}
