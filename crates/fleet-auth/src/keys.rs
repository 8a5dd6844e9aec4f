//! API-key minting, hashing, and lookup.
//!
//! Keys are `{prefix}{random token}` where `prefix` is one of the two fixed
//! strings below. Only `(prefix, sha256_hex(full key))` is ever persisted;
//! the plaintext exists solely in the mint response.

use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use fleet_db::db::Db;
use fleet_db::queries::auth;

use crate::identity::{Identity, Role};

/// Prefix identifying an agent-scoped key.
pub const AGENT_KEY_PREFIX: &str = "cav_ak_";
/// Prefix identifying a user-scoped key.
pub const USER_KEY_PREFIX: &str = "cav_uk_";
/// Characters of the prefix (including the random-token start) used as the
/// indexed lookup column, matching `user_keys.prefix` / `agent_keys.prefix`.
const LOOKUP_PREFIX_LEN: usize = 12;

fn random_token() -> String {
    let mut bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// SHA-256 of the full key, hex-encoded. Lookup compares two hashes, not
/// the raw secret, and does so in constant time via [`hashes_match`].
pub fn hash_key(full_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(full_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compare two hex-encoded hashes in constant time, so a presented key
/// that differs from the stored hash only in its last byte takes no less
/// time to reject than one that differs in its first.
fn hashes_match(stored: &str, presented: &str) -> bool {
    stored.as_bytes().ct_eq(presented.as_bytes()).into()
}

fn lookup_prefix(full_key: &str) -> &str {
    let end = full_key.len().min(LOOKUP_PREFIX_LEN);
    &full_key[..end]
}

/// A freshly minted key: the plaintext (shown once) plus the two columns
/// that get stored.
pub struct MintedKey {
    pub plaintext: String,
    pub prefix: String,
    pub key_hash: String,
}

fn mint(prefix: &str) -> MintedKey {
    let full_key = format!("{prefix}{}", random_token());
    let key_hash = hash_key(&full_key);
    let prefix = lookup_prefix(&full_key).to_owned();
    MintedKey {
        plaintext: full_key,
        prefix,
        key_hash,
    }
}

pub fn mint_user_key() -> MintedKey {
    mint(USER_KEY_PREFIX)
}

pub fn mint_agent_key() -> MintedKey {
    mint(AGENT_KEY_PREFIX)
}

/// Resolve a presented key to an [`Identity`], distinguishing the two
/// flavors by prefix before touching the database.
pub async fn resolve_api_key(db: &Db, presented: &str) -> anyhow::Result<Option<Identity>> {
    if presented.starts_with(AGENT_KEY_PREFIX) {
        return resolve_agent_key(db, presented).await;
    }
    if presented.starts_with(USER_KEY_PREFIX) {
        return resolve_user_key(db, presented).await;
    }
    Ok(None)
}

async fn resolve_user_key(db: &Db, presented: &str) -> anyhow::Result<Option<Identity>> {
    let prefix = lookup_prefix(presented);
    let Some(key) = auth::find_active_user_key_by_prefix(db, prefix).await? else {
        return Ok(None);
    };
    if !hashes_match(&key.key_hash, &hash_key(presented)) {
        return Ok(None);
    }
    let Some(user) = auth::get_user(db, key.user_id).await? else {
        return Ok(None);
    };
    let role: Role = user.role.parse().map_err(|e: crate::identity::RoleParseError| anyhow::anyhow!(e))?;
    let owned_agent_ids = fleet_db::queries::agents::list_agents(db)
        .await?
        .into_iter()
        .filter(|a| a.owner_user_id == Some(user.id))
        .map(|a| a.id)
        .collect();
    Ok(Some(Identity::UserKey {
        user_id: user.id,
        role,
        owned_agent_ids,
    }))
}

async fn resolve_agent_key(db: &Db, presented: &str) -> anyhow::Result<Option<Identity>> {
    let prefix = lookup_prefix(presented);
    let Some(key) = auth::find_active_agent_key_by_prefix(db, prefix).await? else {
        return Ok(None);
    };
    if !hashes_match(&key.key_hash, &hash_key(presented)) {
        return Ok(None);
    }
    let agent = match fleet_db::queries::agents::get_agent(db, key.agent_id).await? {
        Some(agent) => agent,
        None => return Ok(None),
    };
    Ok(Some(Identity::AgentKey {
        agent_id: agent.id,
        owner_user_id: agent.owner_user_id,
    }))
}

/// Resolve a session's user id straight to an [`Identity::User`]. Session
/// cookie verification itself is out of scope; callers hand in
/// the already-authenticated user id.
pub async fn resolve_session_user(db: &Db, user_id: Uuid) -> anyhow::Result<Option<Identity>> {
    let Some(user) = auth::get_user(db, user_id).await? else {
        return Ok(None);
    };
    let role: Role = user.role.parse().map_err(|e: crate::identity::RoleParseError| anyhow::anyhow!(e))?;
    Ok(Some(Identity::User { id: user.id, role }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_user_key_has_expected_prefix() {
        let key = mint_user_key();
        assert!(key.plaintext.starts_with(USER_KEY_PREFIX));
        assert_eq!(key.key_hash, hash_key(&key.plaintext));
    }

    #[test]
    fn mint_agent_key_has_expected_prefix() {
        let key = mint_agent_key();
        assert!(key.plaintext.starts_with(AGENT_KEY_PREFIX));
    }

    #[test]
    fn two_mints_produce_different_keys() {
        let a = mint_user_key();
        let b = mint_user_key();
        assert_ne!(a.plaintext, b.plaintext);
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash_key("abc"), hash_key("abc"));
        assert_ne!(hash_key("abc"), hash_key("abd"));
    }

    #[test]
    fn hashes_match_agrees_with_equality() {
        let h = hash_key("abc");
        assert!(hashes_match(&h, &hash_key("abc")));
        assert!(!hashes_match(&h, &hash_key("abd")));
    }

    #[test]
    fn lookup_prefix_is_stable_prefix_of_full_key() {
        let key = mint_agent_key();
        assert!(key.plaintext.starts_with(&key.prefix));
        assert_eq!(key.prefix.len(), LOOKUP_PREFIX_LEN);
    }
}
