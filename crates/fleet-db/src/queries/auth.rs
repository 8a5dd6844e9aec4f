//! Database query functions backing the auth gate: `users`, `user_keys`,
//! and `agent_keys`. Key secrets are never stored; only `(prefix,
//! key_hash)` pairs, matching the format described for the external API.

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::db::Db;
use crate::models::{AgentKey, User, UserKey};
use crate::params;

pub async fn insert_user(db: &Db, username: &str, role: &str) -> Result<User> {
    db.one(
        "INSERT INTO users (id, username, role, created_at) \
         VALUES (?, ?, ?, datetime('now')) \
         RETURNING *",
        &params!(Uuid::new_v4(), username, role),
    )
    .await
    .context("failed to insert user")
}

pub async fn get_user(db: &Db, id: Uuid) -> Result<Option<User>> {
    match db.one("SELECT * FROM users WHERE id = ?", &params!(id)).await {
        Ok(user) => Ok(Some(user)),
        Err(crate::db::DbError::NotFound) => Ok(None),
        Err(e) => Err(e).context("failed to fetch user"),
    }
}

pub async fn insert_user_key(db: &Db, user_id: Uuid, prefix: &str, key_hash: &str) -> Result<UserKey> {
    db.one(
        "INSERT INTO user_keys (id, user_id, prefix, key_hash, created_at, revoked_at) \
         VALUES (?, ?, ?, ?, datetime('now'), NULL) \
         RETURNING *",
        &params!(Uuid::new_v4(), user_id, prefix, key_hash),
    )
    .await
    .context("failed to insert user key")
}

pub async fn find_active_user_key_by_prefix(db: &Db, prefix: &str) -> Result<Option<UserKey>> {
    match db
        .one(
            "SELECT * FROM user_keys WHERE prefix = ? AND revoked_at IS NULL",
            &params!(prefix),
        )
        .await
    {
        Ok(key) => Ok(Some(key)),
        Err(crate::db::DbError::NotFound) => Ok(None),
        Err(e) => Err(e).context("failed to look up user key"),
    }
}

pub async fn revoke_user_key(db: &Db, id: Uuid) -> Result<u64> {
    db.exec(
        "UPDATE user_keys SET revoked_at = datetime('now') WHERE id = ? AND revoked_at IS NULL",
        &params!(id),
    )
    .await
    .context("failed to revoke user key")
}

pub async fn insert_agent_key(db: &Db, agent_id: Uuid, prefix: &str, key_hash: &str) -> Result<AgentKey> {
    db.one(
        "INSERT INTO agent_keys (id, agent_id, prefix, key_hash, created_at, revoked_at) \
         VALUES (?, ?, ?, ?, datetime('now'), NULL) \
         RETURNING *",
        &params!(Uuid::new_v4(), agent_id, prefix, key_hash),
    )
    .await
    .context("failed to insert agent key")
}

pub async fn find_active_agent_key_by_prefix(db: &Db, prefix: &str) -> Result<Option<AgentKey>> {
    match db
        .one(
            "SELECT * FROM agent_keys WHERE prefix = ? AND revoked_at IS NULL",
            &params!(prefix),
        )
        .await
    {
        Ok(key) => Ok(Some(key)),
        Err(crate::db::DbError::NotFound) => Ok(None),
        Err(e) => Err(e).context("failed to look up agent key"),
    }
}

pub async fn revoke_agent_key(db: &Db, id: Uuid) -> Result<u64> {
    db.exec(
        "UPDATE agent_keys SET revoked_at = datetime('now') WHERE id = ? AND revoked_at IS NULL",
        &params!(id),
    )
    .await
    .context("failed to revoke agent key")
}
