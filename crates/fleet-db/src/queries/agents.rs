//! Database query functions for the `agents` table, including the atomic
//! capacity reservation primitive the router depends on.

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::db::{Db, DbError, DbTx};
use crate::models::Agent;
use crate::params;

pub async fn insert_agent(
    db: &Db,
    name: &str,
    capabilities: &[String],
    capacity_max: Option<i32>,
) -> Result<Agent> {
    db.one(
        "INSERT INTO agents \
            (id, name, status, capabilities, capacity_max, capacity_in_use, execution_mode, owner_user_id, created_at) \
         VALUES (?, ?, 'active', ?, ?, 0, 'auto', NULL, datetime('now')) \
         RETURNING *",
        &params!(
            Uuid::new_v4(),
            name,
            serde_json::to_value(capabilities).unwrap_or_default(),
            capacity_max
        ),
    )
    .await
    .context("failed to insert agent")
}

pub async fn get_agent(db: &Db, id: Uuid) -> Result<Option<Agent>> {
    match db.one("SELECT * FROM agents WHERE id = ?", &params!(id)).await {
        Ok(agent) => Ok(Some(agent)),
        Err(DbError::NotFound) => Ok(None),
        Err(e) => Err(e).context("failed to fetch agent"),
    }
}

pub async fn get_agent_in_tx(tx: &mut DbTx<'_>, id: Uuid) -> Result<Option<Agent>> {
    match tx.one("SELECT * FROM agents WHERE id = ?", &params!(id)).await {
        Ok(agent) => Ok(Some(agent)),
        Err(DbError::NotFound) => Ok(None),
        Err(e) => Err(e).context("failed to fetch agent"),
    }
}

pub async fn list_agents(db: &Db) -> Result<Vec<Agent>> {
    db.many("SELECT * FROM agents ORDER BY created_at ASC", &[])
        .await
        .context("failed to list agents")
}

/// List agents carrying the given capability tag, regardless of current
/// spare capacity — eligibility (status + headroom) is filtered by the
/// router after strategy selection.
pub async fn list_agents_with_capability(db: &Db, capability: &str) -> Result<Vec<Agent>> {
    db.many(
        "SELECT * FROM agents \
         WHERE status = 'active' \
           AND capabilities LIKE '%' || ? || '%' \
         ORDER BY id ASC",
        &params!(format!("\"{capability}\"")),
    )
    .await
    .context("failed to list agents by capability")
}

/// The reason a capacity reservation did not succeed, surfaced into a
/// task's `routing_decision` so operators can see why routing fell back to
/// unassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationFailure {
    AgentNotFound,
    AgentNotActive,
    AtCapacity,
}

impl ReservationFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::AgentNotFound => "agent not found",
            Self::AgentNotActive => "agent not active",
            Self::AtCapacity => "at capacity",
        }
    }
}

/// Atomically reserve one unit of capacity on an agent: the compare-and-
/// increment --
///
/// ```sql
/// UPDATE agents SET active_task_count = active_task_count + 1
/// WHERE id = ? AND status = 'active'
///   AND (max_concurrent_tasks IS NULL OR active_task_count < max_concurrent_tasks)
/// ```
///
/// (`active_task_count` / `max_concurrent_tasks` are this crate's
/// `capacity_in_use` / `capacity_max` columns.)
///
/// Must run inside the same transaction as the task row's INSERT/UPDATE
/// that assigns it to this agent (see `fleet_core::router`), so a
/// subsequent rollback releases the reservation automatically.
pub async fn reserve_capacity(tx: &mut DbTx<'_>, agent_id: Uuid) -> Result<Result<(), ReservationFailure>> {
    let rows = tx
        .exec(
            "UPDATE agents \
             SET capacity_in_use = capacity_in_use + 1 \
             WHERE id = ? AND status = 'active' \
               AND (capacity_max IS NULL OR capacity_in_use < capacity_max)",
            &params!(agent_id),
        )
        .await
        .context("failed to reserve agent capacity")?;
    if rows == 1 {
        return Ok(Ok(()));
    }

    let failure = match get_agent_in_tx(tx, agent_id).await? {
        None => ReservationFailure::AgentNotFound,
        Some(a) if !matches!(a.status(), Ok(crate::models::AgentStatus::Active)) => {
            ReservationFailure::AgentNotActive
        }
        Some(_) => ReservationFailure::AtCapacity,
    };
    Ok(Err(failure))
}

/// Release one unit of previously reserved capacity (task completed,
/// cancelled, or reassigned away from this agent). Guarded against
/// underflow with a `MAX(0, ...)` floor, since this is the only mutable
/// cross-request counter updated outside the row it describes.
pub async fn release_capacity(tx: &mut DbTx<'_>, agent_id: Uuid) -> Result<()> {
    tx.exec(
        "UPDATE agents SET capacity_in_use = MAX(0, capacity_in_use - 1) WHERE id = ?",
        &params!(agent_id),
    )
    .await
    .context("failed to release agent capacity")?;
    Ok(())
}

/// Unconditional reassignment, bypassing the capacity check (admin
/// override, a direct admin reassignment). Still guarded by
/// `MAX(0, ...)` in [`release_capacity`] on the old agent so counts never
/// go negative even when paired with a failed reservation on the new one.
pub async fn force_increment_capacity(tx: &mut DbTx<'_>, agent_id: Uuid) -> Result<()> {
    tx.exec(
        "UPDATE agents SET capacity_in_use = capacity_in_use + 1 WHERE id = ?",
        &params!(agent_id),
    )
    .await
    .context("failed to force-increment agent capacity")?;
    Ok(())
}

pub async fn set_agent_status(db: &Db, id: Uuid, status: &str) -> Result<u64> {
    db.exec("UPDATE agents SET status = ? WHERE id = ?", &params!(status, id))
        .await
        .context("failed to set agent status")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Dialect, DbConfig};
    use crate::pool;

    async fn test_db() -> (Db, tempfile::TempDir) {
        let tmp = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite://{}", tmp.path().join("test.db").display());
        let config = DbConfig::new(Dialect::Sqlite, url);
        let any_pool = pool::create_pool(&config).await.unwrap();
        let db = Db::new(any_pool, &config);
        crate::migrate::run_migrations(&db, &pool::default_migrations_path(Dialect::Sqlite))
            .await
            .unwrap();
        (db, tmp)
    }

    #[tokio::test]
    async fn reservation_succeeds_under_headroom() {
        let (db, _tmp) = test_db().await;
        let agent = insert_agent(&db, "a", &[], Some(2)).await.unwrap();

        let outcome = db
            .tx(|tx| async move { Ok(reserve_capacity(tx, agent.id).await?) })
            .await
            .unwrap();
        assert_eq!(outcome, Ok(()));

        let reloaded = get_agent(&db, agent.id).await.unwrap().unwrap();
        assert_eq!(reloaded.capacity_in_use, 1);
    }

    #[tokio::test]
    async fn reservation_fails_at_capacity() {
        let (db, _tmp) = test_db().await;
        let agent = insert_agent(&db, "a", &[], Some(1)).await.unwrap();
        db.tx(|tx| async move { Ok(reserve_capacity(tx, agent.id).await?) })
            .await
            .unwrap()
            .unwrap();

        let outcome = db
            .tx(|tx| async move { Ok(reserve_capacity(tx, agent.id).await?) })
            .await
            .unwrap();
        assert_eq!(outcome, Err(ReservationFailure::AtCapacity));
    }

    #[tokio::test]
    async fn reservation_succeeds_when_unlimited() {
        let (db, _tmp) = test_db().await;
        let agent = insert_agent(&db, "a", &[], None).await.unwrap();
        for _ in 0..50 {
            let outcome = db
                .tx(|tx| async move { Ok(reserve_capacity(tx, agent.id).await?) })
                .await
                .unwrap();
            assert_eq!(outcome, Ok(()));
        }
    }

    #[tokio::test]
    async fn reservation_fails_when_not_active() {
        let (db, _tmp) = test_db().await;
        let agent = insert_agent(&db, "a", &[], Some(5)).await.unwrap();
        set_agent_status(&db, agent.id, "paused").await.unwrap();

        let outcome = db
            .tx(|tx| async move { Ok(reserve_capacity(tx, agent.id).await?) })
            .await
            .unwrap();
        assert_eq!(outcome, Err(ReservationFailure::AgentNotActive));
    }

    #[tokio::test]
    async fn release_never_goes_negative() {
        let (db, _tmp) = test_db().await;
        let agent = insert_agent(&db, "a", &[], Some(5)).await.unwrap();
        db.tx(|tx| async move {
            release_capacity(tx, agent.id).await?;
            release_capacity(tx, agent.id).await?;
            Ok(())
        })
        .await
        .unwrap();

        let reloaded = get_agent(&db, agent.id).await.unwrap().unwrap();
        assert_eq!(reloaded.capacity_in_use, 0);
    }
}
