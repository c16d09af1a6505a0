//! Single-use emailed tokens (email verification, password reset).
//!
//! The raw value goes to the user; the user record only keeps its SHA-256
//! digest and an expiry. Consumption clears both.

use chrono::{DateTime, Duration, Utc};

use crate::ids::{ACTION_TOKEN_LEN, hash_token, random_token};
use crate::models::auth::{ActionTokenGrant, ActionTokenKind, User};

/// Default password-reset token lifetime: 1 hour.
pub const RESET_TOKEN_EXPIRY_SECS: i64 = 60 * 60;

/// Default email-verification token lifetime: 24 hours.
pub const VERIFICATION_TOKEN_EXPIRY_SECS: i64 = 24 * 60 * 60;

/// Mint a token of `kind` for `user` without touching the record.
///
/// Returns the grant and the digest to persist next to its expiry.
pub fn mint(user: &User, kind: ActionTokenKind, ttl: Duration, now: DateTime<Utc>) -> (ActionTokenGrant, String) {
    let raw_token = random_token(ACTION_TOKEN_LEN);
    let token_hash = hash_token(&raw_token);
    let grant = ActionTokenGrant {
        kind,
        user_id: user.id.clone(),
        email: user.email.clone(),
        raw_token,
        expires_at: now + ttl,
    };
    (grant, token_hash)
}

/// Mint a token of `kind` and store its digest on `user`, replacing any
/// outstanding one. Used for records that are not persisted yet.
pub fn issue(user: &mut User, kind: ActionTokenKind, ttl: Duration, now: DateTime<Utc>) -> ActionTokenGrant {
    let (grant, token_hash) = mint(user, kind, ttl, now);
    user.set_action_token(kind, token_hash, grant.expires_at);
    grant
}

/// Digest used to look up a presented raw token.
pub fn digest(raw_token: &str) -> String {
    hash_token(raw_token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::auth::Role;

    fn user(now: DateTime<Utc>) -> User {
        User {
            id: "u1".into(),
            email: "reset@test.com".into(),
            name: None,
            password_hash: "x".into(),
            role: Role::User,
            is_active: true,
            is_email_verified: true,
            email_verification_token_hash: None,
            email_verification_expires_at: None,
            reset_password_token_hash: None,
            reset_password_expires_at: None,
            created_at: now,
        }
    }

    #[test]
    fn issue_stores_only_the_digest() {
        let now = Utc::now();
        let mut u = user(now);
        let grant = issue(&mut u, ActionTokenKind::PasswordReset, Duration::hours(1), now);

        assert_eq!(grant.raw_token.len(), ACTION_TOKEN_LEN);
        assert_eq!(u.reset_password_token_hash.as_deref(), Some(digest(&grant.raw_token).as_str()));
        assert_ne!(u.reset_password_token_hash.as_deref(), Some(grant.raw_token.as_str()));
        assert_eq!(u.reset_password_expires_at, Some(now + Duration::hours(1)));
        assert!(u.email_verification_token_hash.is_none());
    }

    #[test]
    fn reissue_replaces_previous_token() {
        let now = Utc::now();
        let mut u = user(now);
        let first = issue(&mut u, ActionTokenKind::EmailVerification, Duration::hours(24), now);
        let second = issue(&mut u, ActionTokenKind::EmailVerification, Duration::hours(24), now);

        let first_hash = digest(&first.raw_token);
        let second_hash = digest(&second.raw_token);
        assert!(!u.has_action_token(ActionTokenKind::EmailVerification, &first_hash, now));
        assert!(u.has_action_token(ActionTokenKind::EmailVerification, &second_hash, now));
    }

    #[test]
    fn mint_leaves_the_user_alone() {
        let now = Utc::now();
        let u = user(now);
        let (grant, hash) = mint(&u, ActionTokenKind::EmailVerification, Duration::hours(24), now);

        assert_eq!(hash, digest(&grant.raw_token));
        assert_eq!(grant.expires_at, now + Duration::hours(24));
        assert!(u.email_verification_token_hash.is_none());
    }

    #[test]
    fn expired_token_is_not_outstanding() {
        let now = Utc::now();
        let mut u = user(now);
        let grant = issue(&mut u, ActionTokenKind::PasswordReset, Duration::hours(1), now);
        let hash = digest(&grant.raw_token);

        assert!(u.has_action_token(ActionTokenKind::PasswordReset, &hash, now + Duration::minutes(59)));
        assert!(!u.has_action_token(ActionTokenKind::PasswordReset, &hash, now + Duration::hours(1)));
    }
}
