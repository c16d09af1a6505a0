//! In-memory backends on DashMap.
//!
//! Each record lives in one shard; mutations go through the shard's write
//! lock, which gives the same per-record atomicity as a conditional SQL
//! `UPDATE`. Used by tests and by embedders that do not need durability.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{
    CredentialStore, RefreshTokenBackend, RevocationBackend, StoreError, StoreResult, UserUpdate,
};
use crate::models::auth::{
    ActionTokenClaim, ActionTokenKind, RefreshToken, RevocationEntry, Role, User,
};

/// Volatile store implementing every backend trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: DashMap<String, User>,
    /// Normalized email -> user id.
    emails: DashMap<String, String>,
    refresh_tokens: DashMap<String, RefreshToken>,
    revoked: DashMap<String, DateTime<Utc>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }

    /// Number of refresh token records, revoked or not.
    pub fn refresh_token_count(&self) -> usize {
        self.refresh_tokens.len()
    }

    /// Number of blacklisted access tokens still held.
    pub fn revocation_count(&self) -> usize {
        self.revoked.len()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        self.check()?;
        let Some(id) = self.emails.get(email).map(|r| r.value().clone()) else {
            return Ok(None);
        };
        Ok(self.users.get(&id).map(|u| u.value().clone()))
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<User>> {
        self.check()?;
        Ok(self.users.get(id).map(|u| u.value().clone()))
    }

    async fn insert(&self, user: &User) -> StoreResult<()> {
        self.check()?;
        match self.emails.entry(user.email.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "email '{}' already registered",
                user.email
            ))),
            Entry::Vacant(slot) => {
                self.users.insert(user.id.clone(), user.clone());
                slot.insert(user.id.clone());
                Ok(())
            }
        }
    }

    async fn set_action_token(
        &self,
        user_id: &str,
        kind: ActionTokenKind,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.check()?;
        let Some(mut user) = self.users.get_mut(user_id) else {
            return Ok(false);
        };
        user.set_action_token(kind, token_hash.to_string(), expires_at);
        Ok(true)
    }

    async fn claim_action_token(
        &self,
        claim: &ActionTokenClaim,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<User>> {
        self.check()?;
        let kind = claim.kind();
        let candidate = self
            .users
            .iter()
            .find(|u| u.has_action_token(kind, token_hash, now))
            .map(|u| u.key().clone());
        let Some(id) = candidate else {
            return Ok(None);
        };

        // Re-check under the write lock: a concurrent claimer may have won.
        let Some(mut user) = self.users.get_mut(&id) else {
            return Ok(None);
        };
        if !user.has_action_token(kind, token_hash, now) {
            return Ok(None);
        }
        user.clear_action_token(kind);
        match claim {
            ActionTokenClaim::ResetPassword { password_hash } => {
                user.password_hash = password_hash.clone();
            }
            ActionTokenClaim::VerifyEmail => user.is_email_verified = true,
        }
        Ok(Some(user.clone()))
    }

    async fn set_active(&self, user_id: &str, active: bool) -> StoreResult<UserUpdate<bool>> {
        self.check()?;
        let Some(mut user) = self.users.get_mut(user_id) else {
            return Ok(UserUpdate::NotFound);
        };
        if user.is_active == active {
            return Ok(UserUpdate::Unchanged(user.clone()));
        }
        let previous = user.is_active;
        user.is_active = active;
        Ok(UserUpdate::Changed {
            user: user.clone(),
            previous,
        })
    }

    async fn set_role(&self, user_id: &str, role: Role) -> StoreResult<UserUpdate<Role>> {
        self.check()?;
        let Some(mut user) = self.users.get_mut(user_id) else {
            return Ok(UserUpdate::NotFound);
        };
        if user.role == role {
            return Ok(UserUpdate::Unchanged(user.clone()));
        }
        let previous = user.role;
        user.role = role;
        Ok(UserUpdate::Changed {
            user: user.clone(),
            previous,
        })
    }
}

#[async_trait]
impl RefreshTokenBackend for MemoryStore {
    async fn insert(&self, token: &RefreshToken) -> StoreResult<()> {
        self.check()?;
        match self.refresh_tokens.entry(token.token.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict("refresh token already exists".into())),
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
                Ok(())
            }
        }
    }

    async fn find(&self, token: &str) -> StoreResult<Option<RefreshToken>> {
        self.check()?;
        Ok(self.refresh_tokens.get(token).map(|t| t.value().clone()))
    }

    async fn revoke_if_unrevoked(
        &self,
        token: &str,
        at: DateTime<Utc>,
        ip: &str,
        replacement: Option<&str>,
    ) -> StoreResult<bool> {
        self.check()?;
        let Some(mut record) = self.refresh_tokens.get_mut(token) else {
            return Ok(false);
        };
        if record.revoked_at.is_some() {
            return Ok(false);
        }
        record.revoked_at = Some(at);
        record.revoked_by_ip = Some(ip.to_string());
        record.replaced_by_token = replacement.map(str::to_string);
        Ok(true)
    }

    async fn delete(&self, token: &str) -> StoreResult<bool> {
        self.check()?;
        Ok(self.refresh_tokens.remove(token).is_some())
    }

    async fn delete_if_expired(&self, token: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        self.check()?;
        Ok(self
            .refresh_tokens
            .remove_if(token, |_, t| t.is_expired(now))
            .is_some())
    }

    async fn delete_all_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        self.check()?;
        let mut removed = 0;
        self.refresh_tokens.retain(|_, t| {
            let keep = !t.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }

    async fn revoke_all_for_user(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
        ip: &str,
    ) -> StoreResult<u64> {
        self.check()?;
        let mut revoked = 0;
        for mut record in self.refresh_tokens.iter_mut() {
            if record.user_id == user_id && record.revoked_at.is_none() {
                record.revoked_at = Some(at);
                record.revoked_by_ip = Some(ip.to_string());
                revoked += 1;
            }
        }
        Ok(revoked)
    }
}

#[async_trait]
impl RevocationBackend for MemoryStore {
    async fn insert(&self, entry: &RevocationEntry) -> StoreResult<()> {
        self.check()?;
        self.revoked
            .entry(entry.token.clone())
            .or_insert(entry.expires_at);
        Ok(())
    }

    async fn contains(&self, token: &str) -> StoreResult<bool> {
        self.check()?;
        Ok(self.revoked.contains_key(token))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        self.check()?;
        let mut removed = 0;
        self.revoked.retain(|_, expires_at| {
            let keep = *expires_at > now;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn user(id: &str, email: &str) -> User {
        User {
            id: id.into(),
            email: email.into(),
            name: None,
            password_hash: "hash".into(),
            role: Role::User,
            is_active: true,
            is_email_verified: false,
            email_verification_token_hash: None,
            email_verification_expires_at: None,
            reset_password_token_hash: None,
            reset_password_expires_at: None,
            created_at: Utc::now(),
        }
    }

    fn refresh(token: &str, user_id: &str, expires_at: DateTime<Utc>) -> RefreshToken {
        RefreshToken {
            token: token.into(),
            user_id: user_id.into(),
            created_at: expires_at - Duration::days(7),
            expires_at,
            created_by_ip: "127.0.0.1".into(),
            revoked_at: None,
            revoked_by_ip: None,
            replaced_by_token: None,
        }
    }

    #[tokio::test]
    async fn duplicate_email_is_a_conflict() {
        let store = MemoryStore::new();
        CredentialStore::insert(&store, &user("u1", "a@test.com")).await.unwrap();
        let err = CredentialStore::insert(&store, &user("u2", "a@test.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(store.find_by_id("u2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn field_updates_require_existing_user() {
        let store = MemoryStore::new();
        let stored = store
            .set_action_token("ghost", ActionTokenKind::PasswordReset, "digest", Utc::now())
            .await
            .unwrap();
        assert!(!stored);
        assert_eq!(store.set_active("ghost", false).await.unwrap(), UserUpdate::NotFound);
        assert_eq!(store.set_role("ghost", Role::Admin).await.unwrap(), UserUpdate::NotFound);
    }

    #[tokio::test]
    async fn set_active_reports_previous_value() {
        let store = MemoryStore::new();
        CredentialStore::insert(&store, &user("u1", "a@test.com")).await.unwrap();

        match store.set_active("u1", false).await.unwrap() {
            UserUpdate::Changed { user, previous } => {
                assert!(previous);
                assert!(!user.is_active);
            }
            other => panic!("expected a change, got {other:?}"),
        }
        assert!(matches!(
            store.set_active("u1", false).await.unwrap(),
            UserUpdate::Unchanged(_)
        ));
    }

    #[tokio::test]
    async fn claim_clears_token_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut u = user("u1", "a@test.com");
        u.set_action_token(ActionTokenKind::PasswordReset, "digest".into(), now + Duration::hours(1));
        CredentialStore::insert(&store, &u).await.unwrap();
        let claim = ActionTokenClaim::ResetPassword {
            password_hash: "new-hash".into(),
        };

        let claimed = store
            .claim_action_token(&claim, "digest", now)
            .await
            .unwrap()
            .unwrap();
        assert!(claimed.reset_password_token_hash.is_none());
        assert_eq!(claimed.password_hash, "new-hash");

        let again = store.claim_action_token(&claim, "digest", now).await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn claim_keeps_concurrent_field_changes() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut u = user("u1", "a@test.com");
        u.set_action_token(ActionTokenKind::EmailVerification, "digest".into(), now + Duration::hours(1));
        CredentialStore::insert(&store, &u).await.unwrap();

        store.set_active("u1", false).await.unwrap();
        let claimed = store
            .claim_action_token(&ActionTokenClaim::VerifyEmail, "digest", now)
            .await
            .unwrap()
            .unwrap();

        assert!(claimed.is_email_verified);
        assert!(!claimed.is_active);
    }

    #[tokio::test]
    async fn claim_ignores_other_kind_and_expired() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut u = user("u1", "a@test.com");
        u.set_action_token(ActionTokenKind::EmailVerification, "digest".into(), now + Duration::hours(1));
        CredentialStore::insert(&store, &u).await.unwrap();

        let wrong_kind = store
            .claim_action_token(
                &ActionTokenClaim::ResetPassword {
                    password_hash: "x".into(),
                },
                "digest",
                now,
            )
            .await
            .unwrap();
        assert!(wrong_kind.is_none());

        let expired = store
            .claim_action_token(&ActionTokenClaim::VerifyEmail, "digest", now + Duration::hours(2))
            .await
            .unwrap();
        assert!(expired.is_none());
        assert!(!store.find_by_id("u1").await.unwrap().unwrap().is_email_verified);
    }

    #[tokio::test]
    async fn revoke_is_conditional() {
        let store = MemoryStore::new();
        let now = Utc::now();
        RefreshTokenBackend::insert(&store, &refresh("t1", "u1", now + Duration::days(7)))
            .await
            .unwrap();

        assert!(store.revoke_if_unrevoked("t1", now, "1.1.1.1", Some("t2")).await.unwrap());
        assert!(!store.revoke_if_unrevoked("t1", now, "2.2.2.2", Some("t3")).await.unwrap());

        let record = store.find("t1").await.unwrap().unwrap();
        assert_eq!(record.revoked_by_ip.as_deref(), Some("1.1.1.1"));
        assert_eq!(record.replaced_by_token.as_deref(), Some("t2"));
    }

    #[tokio::test]
    async fn delete_if_expired_keeps_live_tokens() {
        let store = MemoryStore::new();
        let now = Utc::now();
        RefreshTokenBackend::insert(&store, &refresh("live", "u1", now + Duration::days(1)))
            .await
            .unwrap();
        RefreshTokenBackend::insert(&store, &refresh("dead", "u1", now - Duration::days(1)))
            .await
            .unwrap();

        assert!(!store.delete_if_expired("live", now).await.unwrap());
        assert!(store.delete_if_expired("dead", now).await.unwrap());
        assert_eq!(store.refresh_token_count(), 1);
    }

    #[tokio::test]
    async fn delete_all_expired_counts_removed() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (i, offset) in [-2, -1, 1].into_iter().enumerate() {
            RefreshTokenBackend::insert(
                &store,
                &refresh(&format!("t{i}"), "u1", now + Duration::days(offset)),
            )
            .await
            .unwrap();
        }
        assert_eq!(store.delete_all_expired(now).await.unwrap(), 2);
        assert_eq!(store.refresh_token_count(), 1);
    }

    #[tokio::test]
    async fn revoke_all_for_user_only_touches_that_user() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let exp = now + Duration::days(7);
        RefreshTokenBackend::insert(&store, &refresh("a1", "alice", exp)).await.unwrap();
        RefreshTokenBackend::insert(&store, &refresh("a2", "alice", exp)).await.unwrap();
        RefreshTokenBackend::insert(&store, &refresh("b1", "bob", exp)).await.unwrap();

        assert_eq!(store.revoke_all_for_user("alice", now, "ip").await.unwrap(), 2);
        assert!(store.find("b1").await.unwrap().unwrap().revoked_at.is_none());
        assert!(store.find("a1").await.unwrap().unwrap().replaced_by_token.is_none());
    }

    #[tokio::test]
    async fn revocation_insert_is_idempotent_and_purgeable() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let entry = RevocationEntry {
            token: "jwt".into(),
            expires_at: now + Duration::minutes(15),
        };
        RevocationBackend::insert(&store, &entry).await.unwrap();
        RevocationBackend::insert(&store, &entry).await.unwrap();
        assert_eq!(store.revocation_count(), 1);

        assert_eq!(store.purge_expired(now).await.unwrap(), 0);
        assert!(store.contains("jwt").await.unwrap());
        assert_eq!(store.purge_expired(now + Duration::minutes(15)).await.unwrap(), 1);
        assert!(!store.contains("jwt").await.unwrap());
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.find_by_email("a@test.com").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(store.contains("x").await, Err(StoreError::Unavailable(_))));
        store.set_unavailable(false);
        assert!(store.find_by_email("a@test.com").await.unwrap().is_none());
    }
}
