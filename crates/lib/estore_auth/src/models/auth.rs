//! Authentication domain models.
//!
//! These are storage-agnostic; the PostgreSQL and in-memory backends both map
//! onto the same structs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Authorization role carried by a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Domain user as held by the credential store.
///
/// `email` is always stored normalized (trimmed, lowercase).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub password_hash: String,
    pub role: Role,
    pub is_active: bool,
    pub is_email_verified: bool,
    pub email_verification_token_hash: Option<String>,
    pub email_verification_expires_at: Option<DateTime<Utc>>,
    pub reset_password_token_hash: Option<String>,
    pub reset_password_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Store the hash and expiry of an outstanding action token.
    pub fn set_action_token(&mut self, kind: ActionTokenKind, hash: String, expires_at: DateTime<Utc>) {
        match kind {
            ActionTokenKind::EmailVerification => {
                self.email_verification_token_hash = Some(hash);
                self.email_verification_expires_at = Some(expires_at);
            }
            ActionTokenKind::PasswordReset => {
                self.reset_password_token_hash = Some(hash);
                self.reset_password_expires_at = Some(expires_at);
            }
        }
    }

    /// Drop any outstanding action token of the given kind.
    pub fn clear_action_token(&mut self, kind: ActionTokenKind) {
        match kind {
            ActionTokenKind::EmailVerification => {
                self.email_verification_token_hash = None;
                self.email_verification_expires_at = None;
            }
            ActionTokenKind::PasswordReset => {
                self.reset_password_token_hash = None;
                self.reset_password_expires_at = None;
            }
        }
    }

    /// Whether an unexpired action token with this hash is outstanding.
    pub fn has_action_token(&self, kind: ActionTokenKind, hash: &str, now: DateTime<Utc>) -> bool {
        let (stored, expires_at) = match kind {
            ActionTokenKind::EmailVerification => (
                self.email_verification_token_hash.as_deref(),
                self.email_verification_expires_at,
            ),
            ActionTokenKind::PasswordReset => (
                self.reset_password_token_hash.as_deref(),
                self.reset_password_expires_at,
            ),
        };
        stored == Some(hash) && expires_at.is_some_and(|exp| exp > now)
    }
}

/// Which single-use emailed token a hash belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionTokenKind {
    EmailVerification,
    PasswordReset,
}

impl ActionTokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionTokenKind::EmailVerification => "email_verification",
            ActionTokenKind::PasswordReset => "password_reset",
        }
    }
}

/// A redemption of a single-use token together with the change it authorizes.
///
/// Stores clear the token and apply the change in one atomic update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionTokenClaim {
    /// Replace the password hash.
    ResetPassword { password_hash: String },
    /// Mark the email address verified.
    VerifyEmail,
}

impl ActionTokenClaim {
    pub fn kind(&self) -> ActionTokenKind {
        match self {
            ActionTokenClaim::ResetPassword { .. } => ActionTokenKind::PasswordReset,
            ActionTokenClaim::VerifyEmail => ActionTokenKind::EmailVerification,
        }
    }
}

/// Persisted refresh token.
///
/// Rotation links the old record to its successor through
/// `replaced_by_token`; following those links reconstructs the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshToken {
    pub token: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub created_by_ip: String,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_by_ip: Option<String>,
    pub replaced_by_token: Option<String>,
}

impl RefreshToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Active iff never revoked and not yet expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked() && !self.is_expired(now)
    }

    /// Lifecycle state at `now`.
    pub fn state(&self, now: DateTime<Utc>) -> RefreshTokenState {
        if self.is_expired(now) {
            RefreshTokenState::Expired
        } else if self.replaced_by_token.is_some() {
            RefreshTokenState::Rotated
        } else if self.is_revoked() {
            RefreshTokenState::Revoked
        } else {
            RefreshTokenState::Active
        }
    }
}

/// States of a refresh-token session. Everything except `Active` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTokenState {
    Active,
    Rotated,
    Revoked,
    Expired,
}

/// Blacklisted access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationEntry {
    pub token: String,
    /// The access token's own `exp`; the entry is useless after this.
    pub expires_at: DateTime<Utc>,
}

/// JWT claims embedded in access tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject, the user ID.
    pub sub: String,
    /// Issued at (unix timestamp).
    pub iat: i64,
    /// Expiry (unix timestamp).
    pub exp: i64,
    /// Unique token id, so two tokens minted in the same second differ.
    pub jti: String,
}

/// A freshly signed access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedAccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Access + refresh token pair returned by login, refresh and verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub user_id: String,
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token: String,
    pub refresh_token_expires_at: DateTime<Utc>,
}

/// Raw single-use token to be delivered out of band (email link).
#[derive(Clone, PartialEq, Eq)]
pub struct ActionTokenGrant {
    pub kind: ActionTokenKind,
    pub user_id: String,
    pub email: String,
    pub raw_token: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for ActionTokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionTokenGrant")
            .field("kind", &self.kind)
            .field("user_id", &self.user_id)
            .field("email", &self.email)
            .field("raw_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Message returned by every password-reset request, found or not.
pub const PASSWORD_RESET_REQUESTED: &str = "Email sent";

/// Result of a password-reset request.
///
/// The externally visible part, [`PasswordResetRequest::message`], is the
/// same whether or not the email matched a user. `grant` is for the mail
/// dispatcher only and must never shape the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordResetRequest {
    pub message: &'static str,
    pub grant: Option<ActionTokenGrant>,
}

/// Newly registered user plus the verification token to email them.
#[derive(Debug, Clone)]
pub struct RegisteredUser {
    pub user: User,
    pub verification: ActionTokenGrant,
}

/// Best-effort description of the calling client, kept for forensics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientContext {
    pub ip: String,
    pub user_agent: Option<String>,
}

impl ClientContext {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user_agent: None,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}
