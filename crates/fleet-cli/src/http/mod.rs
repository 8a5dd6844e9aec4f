//! The HTTP surface: thin axum handlers over `fleet-core`'s
//! business logic, enveloping every response as `{ success, data?, error? }`
//! and fanning emitted events out to `fleet-dispatch` after each mutation
//! commits.

mod auth;
mod deliverables;
mod routing;
mod tasks;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, patch, post, put};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use fleet_auth::Decision;
use fleet_core::CoreError;
use fleet_db::Db;

/// Shared state every handler closes over. `Arc`-wrapped so cloning it per
/// request (axum's `with_state` requires `Clone`) is cheap; `Db` itself is
/// already a cheap `Clone` over a pooled connection handle.
#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub http_client: reqwest::Client,
    pub upload_root: Arc<PathBuf>,
}

// ---------------------------------------------------------------------------
// Envelope and error mapping
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct Envelope<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

pub fn ok<T: Serialize>(data: T) -> axum::response::Response {
    (
        StatusCode::OK,
        Json(Envelope {
            success: true,
            data: Some(data),
            error: None,
        }),
    )
        .into_response()
}

pub(crate) fn created<T: Serialize>(data: T) -> axum::response::Response {
    (
        StatusCode::CREATED,
        Json(Envelope {
            success: true,
            data: Some(data),
            error: None,
        }),
    )
        .into_response()
}

/// The error taxonomy, reduced to the one field the envelope needs:
/// the status code. `fleet-core`'s `CoreError` and `fleet-auth`'s errors map
/// onto this at the boundary; nothing below this module deals in HTTP.
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    pub fn forbidden() -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: "not permitted".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status,
            Json(Envelope::<()> {
                success: false,
                data: None,
                error: Some(ErrorBody { message: self.message }),
            }),
        )
            .into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::TaskNotFound(_)
            | CoreError::AgentNotFound(_)
            | CoreError::ProjectNotFound(_)
            | CoreError::DeliverableNotFound(_)
            | CoreError::RouteNotFound(_) => StatusCode::NOT_FOUND,

            CoreError::VersionConflict(_) | CoreError::ClaimConflict(_) | CoreError::DeliverableVersionConflict(_) => {
                StatusCode::CONFLICT
            }

            CoreError::InvalidTransition { .. } | CoreError::Validation(_) => StatusCode::BAD_REQUEST,

            CoreError::FileTooLarge { .. } | CoreError::SubmissionTooLarge { .. } => StatusCode::BAD_REQUEST,

            CoreError::Reservation { .. } => StatusCode::CONFLICT,

            CoreError::Db(_) | CoreError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<fleet_auth::AuthError> for AppError {
    fn from(err: fleet_auth::AuthError) -> Self {
        match err {
            fleet_auth::AuthError::NoCredentials | fleet_auth::AuthError::Unresolved => {
                Self::unauthorized(err.to_string())
            }
            other => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: other.to_string(),
            },
        }
    }
}

pub(crate) fn require_allowed(decision: Decision) -> Result<(), AppError> {
    if decision.is_allowed() {
        Ok(())
    } else {
        Err(AppError::forbidden())
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/tasks", post(tasks::create_task))
        .route("/tasks/bulk", post(tasks::create_tasks_bulk))
        .route("/tasks/{id}", patch(tasks::edit_task))
        .route("/tasks/{id}/claim", post(tasks::claim_task))
        .route("/tasks/{id}/status", patch(tasks::transition_status))
        .route("/tasks/{id}/progress", post(tasks::add_progress))
        .route("/deliverables", post(deliverables::submit))
        .route("/deliverables/{id}/revision", post(deliverables::submit_revision))
        .route("/deliverables/{id}/review", patch(deliverables::review))
        .route(
            "/projects/{id}/routing-rules",
            get(routing::list_rules).put(routing::replace_rules),
        )
        .route("/projects/{id}/routing-rules/test", post(routing::dry_run))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_serve(state: AppState, bind: &str, port: u16) -> anyhow::Result<()> {
    let app = build_router(state);
    let addr = format!("{bind}:{port}");
    tracing::info!("fleet serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    tracing::info!("fleet serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    /// Both temp dirs must stay alive for the test's duration: dropping
    /// either deletes the sqlite file or the upload root out from under a
    /// request in flight.
    struct TestFixture {
        state: AppState,
        _db_dir: tempfile::TempDir,
        _upload_dir: tempfile::TempDir,
    }

    async fn test_state() -> TestFixture {
        let (db, db_dir) = fleet_test_utils::sqlite_test_db().await;
        let upload_dir = tempfile::TempDir::new().unwrap();
        let state = AppState {
            db,
            http_client: reqwest::Client::new(),
            upload_root: Arc::new(upload_dir.path().to_path_buf()),
        };
        TestFixture {
            state,
            _db_dir: db_dir,
            _upload_dir: upload_dir,
        }
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let fixture = test_state().await;
        let app = build_router(fixture.state);
        let resp = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
