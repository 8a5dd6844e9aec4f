//! The resolved caller of a request: a session user, a user-scoped API key,
//! or an agent-scoped API key.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// A user's static permission tier. Scopes are derived from this, not
/// carried per-user, per the role->scope mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Reviewer,
    Viewer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Admin => "admin",
            Self::Reviewer => "reviewer",
            Self::Viewer => "viewer",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct RoleParseError(pub String);

impl fmt::Display for RoleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid role: {:?}", self.0)
    }
}

impl std::error::Error for RoleParseError {}

impl FromStr for Role {
    type Err = RoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "reviewer" => Ok(Self::Reviewer),
            "viewer" => Ok(Self::Viewer),
            other => Err(RoleParseError(other.to_owned())),
        }
    }
}

/// The closed set of resolved callers: a variant identity rather than a
/// polymorphic "request" object threaded through every predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// A human operator authenticated by session cookie.
    User { id: Uuid, role: Role },
    /// An API key bound to a user; carries the same role as the user plus
    /// the set of agents that user owns, so key-scoped requests can still
    /// reach entities those agents own.
    UserKey {
        user_id: Uuid,
        role: Role,
        owned_agent_ids: Vec<Uuid>,
    },
    /// An API key bound to an agent, scoped to that agent's own work and
    /// to sibling agents sharing its `owner_user_id`.
    AgentKey {
        agent_id: Uuid,
        owner_user_id: Option<Uuid>,
    },
}
