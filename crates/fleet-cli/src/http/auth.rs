//! Identity resolution from request headers.
//!
//! Every handler resolves its caller the same way: an `Authorization:
//! Bearer <key>` or `X-Api-Key: <key>` header carrying one of the two API
//! key flavors `fleet_auth::keys` mints. Session-cookie auth
//! (`Identity::User`) is out of scope for this surface -- see
//! `fleet_auth::keys::resolve_session_user` for the primitive a cookie
//! layer would call.

use axum::http::HeaderMap;
use fleet_auth::Identity;

use super::{AppError, AppState};

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        let value = value.to_str().ok()?;
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token);
        }
    }
    headers.get("x-api-key").and_then(|v| v.to_str().ok())
}

/// Resolve the caller's [`Identity`] from an incoming request's headers.
/// Missing or unrecognized credentials are both an `unauthorized` error --
/// this surface does not distinguish "no key" from "bad key" to callers.
pub async fn resolve_identity(state: &AppState, headers: &HeaderMap) -> Result<Identity, AppError> {
    let presented = presented_key(headers).ok_or_else(|| AppError::unauthorized("missing API key"))?;
    fleet_auth::keys::resolve_api_key(&state.db, presented)
        .await
        .map_err(|e| AppError {
            status: axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        })?
        .ok_or_else(|| AppError::unauthorized("invalid API key"))
}

/// A human-readable actor label for `activity_log` entries, since that
/// table stores a free-form string rather than a typed identity.
pub fn actor_label(identity: &Identity) -> String {
    match identity {
        Identity::User { id, .. } => format!("user:{id}"),
        Identity::UserKey { user_id, .. } => format!("user:{user_id}"),
        Identity::AgentKey { agent_id, .. } => format!("agent:{agent_id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_prefix_is_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer cav_uk_abc".parse().unwrap());
        assert_eq!(presented_key(&headers), Some("cav_uk_abc"));
    }

    #[test]
    fn x_api_key_header_is_read_when_no_bearer_present() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "cav_ak_abc".parse().unwrap());
        assert_eq!(presented_key(&headers), Some("cav_ak_abc"));
    }

    #[test]
    fn missing_credentials_yield_none() {
        assert_eq!(presented_key(&HeaderMap::new()), None);
    }
}
