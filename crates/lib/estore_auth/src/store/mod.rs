//! Storage seams.
//!
//! The session core never talks to a database directly; it goes through the
//! backend traits below. Each backend method is a single atomic record
//! operation, which is all the rotation and single-use invariants rely on.
//!
//! Two implementations ship with the crate: [`postgres`] (sqlx) and
//! [`memory`] (DashMap, for tests and embedders).

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::auth::{
    ActionTokenClaim, ActionTokenKind, RefreshToken, RevocationEntry, Role, User,
};

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            _ => StoreError::Unavailable(e.to_string()),
        }
    }
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a field-targeted user update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserUpdate<T> {
    NotFound,
    /// The field already held the requested value.
    Unchanged(User),
    /// The field changed from `previous`.
    Changed { user: User, previous: T },
}

/// User records (external collaborator).
///
/// Emails are passed already normalized; implementations compare exactly.
/// There is no whole-record write: every mutation touches only its own
/// columns in one atomic update, so concurrent changes to other fields are
/// never lost.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>>;

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<User>>;

    /// Create a user. Fails with [`StoreError::Conflict`] if the email exists.
    async fn insert(&self, user: &User) -> StoreResult<()>;

    /// Store the digest and expiry of a new `kind` token, replacing any
    /// outstanding one. Returns `false` if the user does not exist.
    async fn set_action_token(
        &self,
        user_id: &str,
        kind: ActionTokenKind,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Atomically find the user holding an unexpired token of the claim's
    /// kind with this digest, clear the token and apply the claim's change.
    /// Returns the user as stored afterwards.
    ///
    /// At most one caller can claim a given digest. On error nothing changes.
    async fn claim_action_token(
        &self,
        claim: &ActionTokenClaim,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<User>>;

    async fn set_active(&self, user_id: &str, active: bool) -> StoreResult<UserUpdate<bool>>;

    async fn set_role(&self, user_id: &str, role: Role) -> StoreResult<UserUpdate<Role>>;
}

/// Refresh token records.
#[async_trait]
pub trait RefreshTokenBackend: Send + Sync {
    async fn insert(&self, token: &RefreshToken) -> StoreResult<()>;

    async fn find(&self, token: &str) -> StoreResult<Option<RefreshToken>>;

    /// Set `revoked_at` / `revoked_by_ip` / `replaced_by_token` only if the
    /// token is not already revoked. Returns whether this call revoked it.
    async fn revoke_if_unrevoked(
        &self,
        token: &str,
        at: DateTime<Utc>,
        ip: &str,
        replacement: Option<&str>,
    ) -> StoreResult<bool>;

    /// Unconditionally remove a record.
    async fn delete(&self, token: &str) -> StoreResult<bool>;

    /// Remove a record only if it has expired at `now`.
    async fn delete_if_expired(&self, token: &str, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Remove every record expired at `now`. Returns the number removed.
    async fn delete_all_expired(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    /// Revoke every unrevoked token of a user. Returns the number revoked.
    async fn revoke_all_for_user(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
        ip: &str,
    ) -> StoreResult<u64>;
}

/// Blacklisted access tokens.
#[async_trait]
pub trait RevocationBackend: Send + Sync {
    /// Idempotent insert.
    async fn insert(&self, entry: &RevocationEntry) -> StoreResult<()>;

    async fn contains(&self, token: &str) -> StoreResult<bool>;

    /// Remove entries whose `expires_at <= now`. Returns the number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}
