//! Identity resolution and authorization. Resolves a session
//! user or API key to a closed [`Identity`] and exposes a pure
//! [`authorize`] predicate the other crates consult before any mutation.

pub mod authorize;
pub mod identity;
pub mod keys;

pub use authorize::{authorize, Action, Decision, Entity};
pub use identity::{Identity, Role, RoleParseError};

/// Errors from identity resolution, kept distinct from [`Decision::Deny`]:
/// a `Deny` is an authorization outcome the caller maps to 403, while
/// these are resolution failures the caller maps to 401 or 500.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no credentials presented")]
    NoCredentials,
    #[error("credentials did not resolve to a known identity")]
    Unresolved,
    #[error(transparent)]
    Db(#[from] fleet_db::DbError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
