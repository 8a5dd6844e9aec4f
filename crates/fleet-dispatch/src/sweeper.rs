//! The retry sweeper: the sole crash-recovery mechanism for deliveries.
//! No timer is ever armed for a specific retry; instead this loop wakes on
//! an interval, polls `delivery_logs` for rows past their `next_retry_at`
//! (or never attempted), and re-runs each one. A crash between marking a
//! row `retrying` and it actually firing just means the next sweep tick
//! picks it up, rather than relying on an in-memory timer surviving.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use fleet_db::db::Db;
use fleet_db::models::Route;
use fleet_db::queries::{delivery_logs, routes};

use crate::adapters::{self, AttemptResult};
use crate::retry::{self, Outcome, RetryPolicy};

/// Sweeper tuning, sourced from configuration
/// (`DISPATCH_SWEEP_INTERVAL_MS` / `DISPATCH_SWEEP_BATCH_SIZE`).
#[derive(Debug, Clone, Copy)]
pub struct SweeperConfig {
    pub interval: Duration,
    pub batch_size: i64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 50,
        }
    }
}

/// Run the sweeper until `cancel` fires. Intended to be spawned as a
/// background task alongside the HTTP server.
pub async fn run_sweeper(db: Db, client: reqwest::Client, config: SweeperConfig, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(config.interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("dispatch sweeper cancelled, exiting");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = sweep_once(&db, &client, config.batch_size).await {
                    tracing::warn!(error = %e, "dispatch sweep iteration failed");
                }
            }
        }
    }
}

/// One sweep: fetch due rows and retry each, independently of the others.
pub async fn sweep_once(db: &Db, client: &reqwest::Client, batch_size: i64) -> anyhow::Result<usize> {
    let due = delivery_logs::list_due_delivery_logs(db, batch_size).await?;
    let count = due.len();
    for log in due {
        let Some(route) = routes::get_route(db, log.route_id).await? else {
            tracing::warn!(delivery_log_id = %log.id, route_id = %log.route_id, "delivery log references a deleted route, marking failed");
            delivery_logs::mark_failed(db, log.id, None, None, "route no longer exists", 0).await?;
            continue;
        };
        if let Err(e) = retry_delivery(db, client, &route, log.id, log.attempt, log.payload).await {
            tracing::warn!(delivery_log_id = %log.id, error = %e, "retry attempt failed before an outcome could be recorded");
        }
    }
    Ok(count)
}

async fn retry_delivery(
    db: &Db,
    client: &reqwest::Client,
    route: &Route,
    delivery_log_id: uuid::Uuid,
    prior_attempt: i32,
    payload: serde_json::Value,
) -> anyhow::Result<()> {
    let destination_kind = route.destination_kind()?;
    let policy = RetryPolicy::from_json(Some(&route.retry_policy));

    delivery_logs::mark_dispatching(db, delivery_log_id).await?;
    let started = chrono::Utc::now();
    let AttemptResult {
        response_status,
        response_body,
        error,
    } = adapters::dispatch(client, destination_kind, &route.destination_config, &payload).await;
    let duration_ms = (chrono::Utc::now() - started).num_milliseconds().clamp(0, i32::MAX as i64) as i32;

    let outcome = retry::classify(response_status);
    let attempt_number = (prior_attempt + 1) as u32;

    match outcome {
        Outcome::Delivered => {
            delivery_logs::mark_delivered(db, delivery_log_id, response_status.map(i32::from), response_body.as_deref(), duration_ms).await?;
        }
        Outcome::Transient if retry::should_retry(policy, attempt_number) => {
            let retry_delay_ms = retry::retry_delay_ms(policy, attempt_number);
            let message = error.as_deref().unwrap_or("destination returned a transient failure");
            delivery_logs::mark_retry(
                db,
                delivery_log_id,
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
            delivery_logs::mark_failed(db, delivery_log_id, response_status.map(i32::from), response_body.as_deref(), message, duration_ms).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_db::config::{Dialect, DbConfig};
    use fleet_db::db::Db;
    use fleet_db::{params, pool};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

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

    #[tokio::test]
    async fn sweep_retries_a_due_row_and_marks_it_delivered() {
        let (db, _tmp) = test_db().await;
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let route = routes::insert_route(
            &db,
            None,
            "notify",
            "task.completed",
            "webhook",
            serde_json::json!({"url": server.uri()}),
            None,
            None,
            serde_json::json!({}),
        )
        .await
        .expect("insert route");

        let log = delivery_logs::insert_delivery_log(&db, route.id, None, "task.completed", serde_json::json!({}))
            .await
            .expect("insert delivery log");

        let client = reqwest::Client::new();
        let count = sweep_once(&db, &client, 10).await.expect("sweep");
        assert_eq!(count, 1);

        let updated = delivery_logs::get_delivery_log(&db, log.id).await.expect("get").expect("exists");
        assert_eq!(updated.status, "delivered");
    }

    #[tokio::test]
    async fn sweep_marks_failed_when_route_was_deleted() {
        let (db, _tmp) = test_db().await;
        let route = routes::insert_route(
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
        .expect("insert route");
        let log = delivery_logs::insert_delivery_log(&db, route.id, None, "task.completed", serde_json::json!({}))
            .await
            .expect("insert delivery log");

        db.exec("DELETE FROM routes WHERE id = ?", &params!(route.id))
            .await
            .expect("delete route");

        let client = reqwest::Client::new();
        sweep_once(&db, &client, 10).await.expect("sweep");

        let updated = delivery_logs::get_delivery_log(&db, log.id).await.expect("get").expect("exists");
        assert_eq!(updated.status, "failed");
    }
}
