//! Database query functions for the `delivery_logs` table -- the durable
//! record the dispatch sweeper polls and advances. One row per (route,
//! event) dispatch attempt; the row is created before the first attempt
//! and updated in place as the attempt resolves, so a crash mid-attempt
//! leaves a `pending`/`retrying` row the sweeper will pick back up.

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::db::{Db, DbError};
use crate::models::DeliveryLog;
use crate::params;

#[allow(clippy::too_many_arguments)]
pub async fn insert_delivery_log(
    db: &Db,
    route_id: Uuid,
    deliverable_id: Option<Uuid>,
    event: &str,
    payload: serde_json::Value,
) -> Result<DeliveryLog> {
    db.one(
        "INSERT INTO delivery_logs \
            (id, route_id, deliverable_id, event, payload, status, attempt, \
             next_retry_at, last_error, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, 'pending', 0, NULL, NULL, datetime('now'), datetime('now')) \
         RETURNING *",
        &params!(Uuid::new_v4(), route_id, deliverable_id, event, payload),
    )
    .await
    .context("failed to insert delivery log")
}

/// Rows due for an attempt: newly created (`pending`) or `retrying` with
/// `next_retry_at` at or before now, oldest first, capped at `batch_size`.
pub async fn list_due_delivery_logs(db: &Db, batch_size: i64) -> Result<Vec<DeliveryLog>> {
    db.many(
        "SELECT * FROM delivery_logs \
         WHERE status = 'pending' \
            OR (status = 'retrying' AND next_retry_at <= datetime('now')) \
         ORDER BY next_retry_at ASC \
         LIMIT ?",
        &params!(batch_size),
    )
    .await
    .context("failed to list due delivery logs")
}

pub async fn get_delivery_log(db: &Db, id: Uuid) -> Result<Option<DeliveryLog>> {
    match db.one("SELECT * FROM delivery_logs WHERE id = ?", &params!(id)).await {
        Ok(log) => Ok(Some(log)),
        Err(DbError::NotFound) => Ok(None),
        Err(e) => Err(e).context("failed to fetch delivery log"),
    }
}

/// Record the start of an attempt: bumps `attempt` and stamps
/// `dispatched_at`, before the destination adapter is actually called.
pub async fn mark_dispatching(db: &Db, id: Uuid) -> Result<u64> {
    db.exec(
        "UPDATE delivery_logs \
         SET attempt = attempt + 1, dispatched_at = datetime('now'), updated_at = datetime('now') \
         WHERE id = ?",
        &params!(id),
    )
    .await
    .context("failed to mark delivery log dispatching")
}

#[allow(clippy::too_many_arguments)]
pub async fn mark_delivered(
    db: &Db,
    id: Uuid,
    response_status: Option<i32>,
    response_body: Option<&str>,
    duration_ms: i32,
) -> Result<u64> {
    db.exec(
        "UPDATE delivery_logs \
         SET status = 'delivered', response_status = ?, response_body = ?, \
             duration_ms = ?, completed_at = datetime('now'), updated_at = datetime('now') \
         WHERE id = ?",
        &params!(response_status, response_body, duration_ms, id),
    )
    .await
    .context("failed to mark delivery log delivered")
}

/// Record a transient-failure attempt and schedule the next retry per the
/// route's backoff policy.
///
/// `next_retry_at` is computed by the database itself from `retry_delay_ms`
/// rather than bound as a `DateTime<Utc>`: sqlx-sqlite encodes a bound
/// `DateTime<Utc>` as RFC3339 (`T`-separated), while `datetime('now')` and
/// every other timestamp column here use the space-separated form. Binding
/// the Rust-computed value would make the due-check in
/// `list_due_delivery_logs` a lexical comparison between two different
/// formats, which never matches for a same-day timestamp. Scheduling via
/// `datetime('now', '+N seconds')` keeps `next_retry_at` in the same format
/// as everything it gets compared against, on both dialects.
#[allow(clippy::too_many_arguments)]
pub async fn mark_retry(
    db: &Db,
    id: Uuid,
    retry_delay_ms: i64,
    response_status: Option<i32>,
    response_body: Option<&str>,
    error: &str,
    duration_ms: i32,
) -> Result<u64> {
    let delay_secs = retry_delay_ms.max(0) as f64 / 1000.0;
    let sql = format!(
        "UPDATE delivery_logs \
         SET status = 'retrying', next_retry_at = datetime('now', '+{delay_secs:.3} seconds'), \
             response_status = ?, response_body = ?, \
             last_error = ?, duration_ms = ?, completed_at = datetime('now'), updated_at = datetime('now') \
         WHERE id = ?"
    );
    db.exec(&sql, &params!(response_status, response_body, error, duration_ms, id))
        .await
        .context("failed to mark delivery log retry")
}

/// Mark a row as hard-failed: a 4xx (other than 429) response, or the
/// retry budget is exhausted. No further retry is scheduled.
#[allow(clippy::too_many_arguments)]
pub async fn mark_failed(
    db: &Db,
    id: Uuid,
    response_status: Option<i32>,
    response_body: Option<&str>,
    error: &str,
    duration_ms: i32,
) -> Result<u64> {
    db.exec(
        "UPDATE delivery_logs \
         SET status = 'failed', next_retry_at = NULL, response_status = ?, response_body = ?, \
             last_error = ?, duration_ms = ?, completed_at = datetime('now'), updated_at = datetime('now') \
         WHERE id = ?",
        &params!(response_status, response_body, error, duration_ms, id),
    )
    .await
    .context("failed to mark delivery log failed")
}

pub async fn list_for_route(db: &Db, route_id: Uuid) -> Result<Vec<DeliveryLog>> {
    db.many(
        "SELECT * FROM delivery_logs WHERE route_id = ? ORDER BY created_at DESC",
        &params!(route_id),
    )
    .await
    .context("failed to list delivery logs for route")
}
