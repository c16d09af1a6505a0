//! PostgreSQL backends (sqlx, runtime-checked queries).
//!
//! Schema lives in `migrations/`. Conditional updates carry the guard in the
//! `WHERE` clause so the database decides races, never the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    CredentialStore, RefreshTokenBackend, RevocationBackend, StoreError, StoreResult, UserUpdate,
};
use crate::models::auth::{
    ActionTokenClaim, ActionTokenKind, RefreshToken, RevocationEntry, Role, User,
};

const USER_COLUMNS: &str = "id::text AS id, email, name, password_hash, role, is_active, \
     is_email_verified, email_verification_token_hash, email_verification_expires_at, \
     reset_password_token_hash, reset_password_expires_at, created_at";

const QUALIFIED_USER_COLUMNS: &str = "users.id::text AS id, users.email, users.name, \
     users.password_hash, users.role, users.is_active, users.is_email_verified, \
     users.email_verification_token_hash, users.email_verification_expires_at, \
     users.reset_password_token_hash, users.reset_password_expires_at, users.created_at";

const REFRESH_COLUMNS: &str = "token, user_id::text AS user_id, created_at, expires_at, \
     created_by_ip, revoked_at, revoked_by_ip, replaced_by_token";

/// Row shape of `users`.
#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: String,
    email: String,
    name: Option<String>,
    password_hash: String,
    role: String,
    is_active: bool,
    is_email_verified: bool,
    email_verification_token_hash: Option<String>,
    email_verification_expires_at: Option<DateTime<Utc>>,
    reset_password_token_hash: Option<String>,
    reset_password_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let role: Role = row.role.parse().map_err(StoreError::Corrupt)?;
        Ok(User {
            id: row.id,
            email: row.email,
            name: row.name,
            password_hash: row.password_hash,
            role,
            is_active: row.is_active,
            is_email_verified: row.is_email_verified,
            email_verification_token_hash: row.email_verification_token_hash,
            email_verification_expires_at: row.email_verification_expires_at,
            reset_password_token_hash: row.reset_password_token_hash,
            reset_password_expires_at: row.reset_password_expires_at,
            created_at: row.created_at,
        })
    }
}

/// `users` row plus the role it had before an update.
#[derive(Debug, sqlx::FromRow)]
struct RoleChangeRow {
    previous_role: String,
    #[sqlx(flatten)]
    user: UserRow,
}

/// Row shape of `refresh_tokens`.
#[derive(Debug, sqlx::FromRow)]
struct RefreshTokenRow {
    token: String,
    user_id: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    created_by_ip: String,
    revoked_at: Option<DateTime<Utc>>,
    revoked_by_ip: Option<String>,
    replaced_by_token: Option<String>,
}

impl From<RefreshTokenRow> for RefreshToken {
    fn from(row: RefreshTokenRow) -> Self {
        RefreshToken {
            token: row.token,
            user_id: row.user_id,
            created_at: row.created_at,
            expires_at: row.expires_at,
            created_by_ip: row.created_by_ip,
            revoked_at: row.revoked_at,
            revoked_by_ip: row.revoked_by_ip,
            replaced_by_token: row.replaced_by_token,
        }
    }
}

/// Column pair holding an action token's digest and expiry.
fn action_token_columns(kind: ActionTokenKind) -> (&'static str, &'static str) {
    match kind {
        ActionTokenKind::EmailVerification => (
            "email_verification_token_hash",
            "email_verification_expires_at",
        ),
        ActionTokenKind::PasswordReset => ("reset_password_token_hash", "reset_password_expires_at"),
    }
}

/// PostgreSQL store implementing every backend trait over one pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.map(User::try_from).transpose()
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<User>> {
        // Ids are UUIDs; anything else cannot name a row.
        if Uuid::parse_str(id).is_err() {
            return Ok(None);
        }
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1::uuid");
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(User::try_from).transpose()
    }

    async fn insert(&self, user: &User) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO users (id, email, name, password_hash, role, is_active, \
             is_email_verified, email_verification_token_hash, email_verification_expires_at, \
             reset_password_token_hash, reset_password_expires_at, created_at) \
             VALUES ($1::uuid, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.name)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(user.is_active)
        .bind(user.is_email_verified)
        .bind(&user.email_verification_token_hash)
        .bind(user.email_verification_expires_at)
        .bind(&user.reset_password_token_hash)
        .bind(user.reset_password_expires_at)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_action_token(
        &self,
        user_id: &str,
        kind: ActionTokenKind,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        if Uuid::parse_str(user_id).is_err() {
            return Ok(false);
        }
        let (hash_col, expires_col) = action_token_columns(kind);
        let sql = format!("UPDATE users SET {hash_col} = $2, {expires_col} = $3 WHERE id = $1::uuid");
        let result = sqlx::query(&sql)
            .bind(user_id)
            .bind(token_hash)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_action_token(
        &self,
        claim: &ActionTokenClaim,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<User>> {
        let (hash_col, expires_col) = action_token_columns(claim.kind());
        let (change, password_hash) = match claim {
            ActionTokenClaim::ResetPassword { password_hash } => {
                ("password_hash = $3", Some(password_hash.as_str()))
            }
            ActionTokenClaim::VerifyEmail => ("is_email_verified = TRUE", None),
        };
        let sql = format!(
            "UPDATE users SET {hash_col} = NULL, {expires_col} = NULL, {change} \
             WHERE {hash_col} = $1 AND {expires_col} > $2 \
             RETURNING {USER_COLUMNS}"
        );
        let mut query = sqlx::query_as::<_, UserRow>(&sql).bind(token_hash).bind(now);
        if let Some(hash) = password_hash {
            query = query.bind(hash);
        }
        let row = query.fetch_optional(&self.pool).await?;
        row.map(User::try_from).transpose()
    }

    async fn set_active(&self, user_id: &str, active: bool) -> StoreResult<UserUpdate<bool>> {
        if Uuid::parse_str(user_id).is_err() {
            return Ok(UserUpdate::NotFound);
        }
        let sql = format!(
            "UPDATE users SET is_active = $2 WHERE id = $1::uuid AND is_active <> $2 \
             RETURNING {USER_COLUMNS}"
        );
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(user_id)
            .bind(active)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(UserUpdate::Changed {
                user: row.try_into()?,
                previous: !active,
            }),
            None => self.unchanged(user_id).await,
        }
    }

    async fn set_role(&self, user_id: &str, role: Role) -> StoreResult<UserUpdate<Role>> {
        if Uuid::parse_str(user_id).is_err() {
            return Ok(UserUpdate::NotFound);
        }
        let sql = format!(
            "WITH prev AS (SELECT id, role FROM users WHERE id = $1::uuid FOR UPDATE) \
             UPDATE users SET role = $2 FROM prev \
             WHERE users.id = prev.id AND prev.role <> $2 \
             RETURNING prev.role AS previous_role, {QUALIFIED_USER_COLUMNS}"
        );
        let row = sqlx::query_as::<_, RoleChangeRow>(&sql)
            .bind(user_id)
            .bind(role.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let previous = row.previous_role.parse().map_err(StoreError::Corrupt)?;
                Ok(UserUpdate::Changed {
                    user: row.user.try_into()?,
                    previous,
                })
            }
            None => self.unchanged(user_id).await,
        }
    }
}

impl PgStore {
    /// Resolve a no-op conditional update into `Unchanged` or `NotFound`.
    async fn unchanged<T>(&self, user_id: &str) -> StoreResult<UserUpdate<T>> {
        Ok(match self.find_by_id(user_id).await? {
            Some(user) => UserUpdate::Unchanged(user),
            None => UserUpdate::NotFound,
        })
    }
}

#[async_trait]
impl RefreshTokenBackend for PgStore {
    async fn insert(&self, token: &RefreshToken) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO refresh_tokens (token, user_id, created_at, expires_at, created_by_ip, \
             revoked_at, revoked_by_ip, replaced_by_token) \
             VALUES ($1, $2::uuid, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&token.token)
        .bind(&token.user_id)
        .bind(token.created_at)
        .bind(token.expires_at)
        .bind(&token.created_by_ip)
        .bind(token.revoked_at)
        .bind(&token.revoked_by_ip)
        .bind(&token.replaced_by_token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, token: &str) -> StoreResult<Option<RefreshToken>> {
        let sql = format!("SELECT {REFRESH_COLUMNS} FROM refresh_tokens WHERE token = $1");
        let row = sqlx::query_as::<_, RefreshTokenRow>(&sql)
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(RefreshToken::from))
    }

    async fn revoke_if_unrevoked(
        &self,
        token: &str,
        at: DateTime<Utc>,
        ip: &str,
        replacement: Option<&str>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE refresh_tokens \
             SET revoked_at = $2, revoked_by_ip = $3, replaced_by_token = $4 \
             WHERE token = $1 AND revoked_at IS NULL",
        )
        .bind(token)
        .bind(at)
        .bind(ip)
        .bind(replacement)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, token: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_if_expired(&self, token: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE token = $1 AND expires_at <= $2")
            .bind(token)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_all_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn revoke_all_for_user(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
        ip: &str,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = $2, revoked_by_ip = $3 \
             WHERE user_id = $1::uuid AND revoked_at IS NULL",
        )
        .bind(user_id)
        .bind(at)
        .bind(ip)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RevocationBackend for PgStore {
    async fn insert(&self, entry: &RevocationEntry) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO revoked_access_tokens (token, expires_at) VALUES ($1, $2) \
             ON CONFLICT (token) DO NOTHING",
        )
        .bind(&entry.token)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn contains(&self, token: &str) -> StoreResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM revoked_access_tokens WHERE token = $1)",
        )
        .bind(token)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM revoked_access_tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
