//! Authentication primitives and the session error taxonomy.
//!
//! Provides access-token signing, password hashing and single-use action
//! tokens. [`crate::session::SessionManager`] composes them with the stores.

pub mod action_token;
pub mod jwt;
pub mod password;

use std::fmt;

use thiserror::Error;

use crate::store::StoreError;

/// Why a presented token is dead even though it is not expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokedReason {
    /// Access token was logged out.
    Blacklisted,
    /// Refresh token was already exchanged for a successor.
    Rotated,
    /// Refresh token was revoked without a successor.
    Revoked,
}

impl fmt::Display for RevokedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RevokedReason::Blacklisted => "Blacklisted",
            RevokedReason::Rotated => "already rotated",
            RevokedReason::Revoked => "revoked",
        })
    }
}

/// Session and token errors.
///
/// Every variant is an expected outcome the caller maps to a response;
/// only `StoreUnavailable` and `Internal` indicate infrastructure trouble.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account is deactivated")]
    AccountDeactivated,

    #[error("Please verify your email to login")]
    EmailNotVerified,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token revoked: {0}")]
    TokenRevoked(RevokedReason),

    #[error("Invalid or expired token")]
    InvalidOrExpiredToken,

    #[error("Email already registered")]
    EmailTaken,

    #[error("Email already verified")]
    EmailAlreadyVerified,

    #[error("User not found")]
    UserNotFound,

    #[error("Weak password: {0}")]
    WeakPassword(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Stable machine-readable code for the transport layer.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::AccountDeactivated => "account_deactivated",
            AuthError::EmailNotVerified => "email_not_verified",
            AuthError::InvalidToken => "invalid_token",
            AuthError::TokenExpired => "token_expired",
            AuthError::TokenRevoked(_) => "token_revoked",
            AuthError::InvalidOrExpiredToken => "invalid_or_expired_token",
            AuthError::EmailTaken => "email_taken",
            AuthError::EmailAlreadyVerified => "email_already_verified",
            AuthError::UserNotFound => "user_not_found",
            AuthError::WeakPassword(_) => "weak_password",
            AuthError::StoreUnavailable(_) => "store_unavailable",
            AuthError::Internal(_) => "internal_error",
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        AuthError::StoreUnavailable(e.to_string())
    }
}

impl From<jwt::CodecError> for AuthError {
    fn from(e: jwt::CodecError) -> Self {
        match e {
            jwt::CodecError::Malformed(_) => AuthError::InvalidToken,
            jwt::CodecError::Expired => AuthError::TokenExpired,
            jwt::CodecError::Signing(msg) => AuthError::Internal(msg),
        }
    }
}
