//! The dispatcher entry point: given a fired [`Event`], gather
//! the routes that subscribe to it, log and attempt a delivery per route in
//! parallel, and leave each attempt's outcome in `delivery_logs` for the
//! sweeper to pick up on failure.

use chrono::Utc;
use fleet_core::events::Event;
use fleet_db::db::Db;
use fleet_db::models::Route;
use fleet_db::queries::delivery_logs;

use crate::adapters::{self, AttemptResult};
use crate::matching::gather_routes;
use crate::retry::{self, Outcome, RetryPolicy};
use crate::templates::apply_field_mapping;

/// Events carrying no `project_id` still reach global routes; the matching
/// query keys on project id so a nil sentinel stands in for "no project"
/// without widening `list_routes_for_event`'s signature.
fn project_key(event: &Event) -> uuid::Uuid {
    event.project_id.unwrap_or(uuid::Uuid::nil())
}

/// Fan out `event` to every matching, enabled route and attempt delivery on
/// each concurrently. Errors gathering routes propagate; a single route's
/// delivery failure does not fail the others or this call -- it is recorded
/// in `delivery_logs` and left for the sweeper.
pub async fn emit(db: &Db, client: &reqwest::Client, event: &Event) -> anyhow::Result<()> {
    let routes = gather_routes(db, project_key(event), event.kind, &event.payload).await?;
    if routes.is_empty() {
        return Ok(());
    }

    let attempts = routes
        .into_iter()
        .map(|route| dispatch_route(db, client, route, event));
    futures::future::join_all(attempts).await;
    Ok(())
}

async fn dispatch_route(db: &Db, client: &reqwest::Client, route: Route, event: &Event) {
    let route_id = route.id;
    if let Err(e) = attempt_route(db, client, route, event).await {
        tracing::warn!(route_id = %route_id, error = %e, "route dispatch attempt failed before an outcome could be recorded");
    }
}

async fn attempt_route(db: &Db, client: &reqwest::Client, route: Route, event: &Event) -> anyhow::Result<()> {
    let destination_kind = route.destination_kind()?;
    let policy = RetryPolicy::from_json(Some(&route.retry_policy));
    let projected = apply_field_mapping(route.field_mapping.as_ref(), &event.payload);

    let log = delivery_logs::insert_delivery_log(db, route.id, event.deliverable_id, event.kind.as_str(), projected.clone()).await?;
    delivery_logs::mark_dispatching(db, log.id).await?;

    let started = Utc::now();
    let AttemptResult {
        response_status,
        response_body,
        error,
    } = adapters::dispatch(client, destination_kind, &route.destination_config, &projected).await;
    let duration_ms = (Utc::now() - started).num_milliseconds().clamp(0, i32::MAX as i64) as i32;

    let outcome = retry::classify(response_status);
    let attempt_number = (log.attempt + 1) as u32;

    match outcome {
        Outcome::Delivered => {
            delivery_logs::mark_delivered(db, log.id, response_status.map(i32::from), response_body.as_deref(), duration_ms).await?;
        }
        Outcome::Transient if retry::should_retry(policy, attempt_number) => {
            let retry_delay_ms = retry::retry_delay_ms(policy, attempt_number);
            let message = error.as_deref().unwrap_or("destination returned a transient failure");
            delivery_logs::mark_retry(
                db,
                log.id,
                retry_delay_ms,
                response_status.map(i32::from),
                response_body.as_deref(),
                message,
                duration_ms,
            )
            .await?;
        }
        Outcome::Transient | Outcome::Hard => {
            let message = error.as_deref().unwrap_or("destination returned a hard failure");
            delivery_logs::mark_failed(db, log.id, response_status.map(i32::from), response_body.as_deref(), message, duration_ms).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_db::config::{Dialect, DbConfig};
    use fleet_db::pool;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::sweeper::sweep_once;

    async fn test_db() -> (Db, tempfile::TempDir) {
        let tmp = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite://{}", tmp.path().join("test.db").display());
        let config = DbConfig::new(Dialect::Sqlite, url);
        let any_pool = pool::create_pool(&config).await.unwrap();
        let db = Db::new(any_pool, &config);
        fleet_db::run_migrations(&db, &pool::default_migrations_path(Dialect::Sqlite))
            .await
            .unwrap();
        (db, tmp)
    }

    /// Scenario: a route with `max_retries = 3` whose endpoint returns 500
    /// on every call. The initial dispatch plus three sweeper-driven
    /// retries exhaust the budget; the fourth attempt lands on `failed`
    /// with `next_retry_at` cleared.
    #[tokio::test]
    async fn retry_budget_exhausts_into_a_failed_terminal_state() {
        let (db, _tmp) = test_db().await;
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(500)).mount(&server).await;

        let route = fleet_db::queries::routes::insert_route(
            &db,
            None,
            "notify",
            "task.completed",
            "webhook",
            serde_json::json!({"url": server.uri()}),
            None,
            None,
            serde_json::json!({"max_retries": 3, "initial_delay_ms": 1}),
        )
        .await
        .unwrap();

        let client = reqwest::Client::new();
        let event = Event::new(fleet_core::TriggerEvent::TaskCompleted, None, serde_json::json!({}));
        emit(&db, &client, &event).await.unwrap();

        let logs = delivery_logs::list_for_route(&db, route.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "retrying");
        assert_eq!(logs[0].attempt, 1);
        let log_id = logs[0].id;

        // initial_delay_ms=1 means the row is immediately due again after a
        // short sleep, well inside sqlite's second-level datetime precision.
        for expected_attempt in 2..=4 {
            tokio::time::sleep(std::time::Duration::from_millis(1_100)).await;
            sweep_once(&db, &client, 10).await.unwrap();
            let log = delivery_logs::get_delivery_log(&db, log_id).await.unwrap().unwrap();
            if expected_attempt <= 3 {
                assert_eq!(log.status, "retrying");
                assert_eq!(log.attempt, expected_attempt);
                assert!(log.next_retry_at.is_some());
            } else {
                assert_eq!(log.status, "failed");
                assert_eq!(log.next_retry_at, None);
            }
        }
    }

    /// Disabled routes never get a delivery-log row, even when every other
    /// clause matches.
    #[tokio::test]
    async fn disabled_routes_are_never_dispatched() {
        let (db, _tmp) = test_db().await;
        let route = fleet_db::queries::routes::insert_route(
            &db,
            None,
            "notify",
            "task.completed",
            "webhook",
            serde_json::json!({"url": "http://example.invalid"}),
            None,
            None,
            serde_json::json!({}),
        )
        .await
        .unwrap();
        db.exec("UPDATE routes SET enabled = FALSE WHERE id = ?", &fleet_db::params!(route.id))
            .await
            .unwrap();

        let client = reqwest::Client::new();
        let event = Event::new(fleet_core::TriggerEvent::TaskCompleted, None, serde_json::json!({}));
        emit(&db, &client, &event).await.unwrap();

        assert!(delivery_logs::list_due_delivery_logs(&db, 10).await.unwrap().is_empty());
    }
}
