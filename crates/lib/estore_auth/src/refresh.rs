//! Refresh token store: issuance, lookup and single-shot revocation of
//! long-lived refresh tokens on top of a [`RefreshTokenBackend`].

use std::sync::Arc;

use chrono::Duration;
use tracing::debug;

use crate::clock::Clock;
use crate::ids::{REFRESH_TOKEN_LEN, random_token};
use crate::models::auth::RefreshToken;
use crate::store::{RefreshTokenBackend, StoreResult};

/// Refresh token lifetime: 7 days.
pub const REFRESH_TOKEN_EXPIRY_DAYS: i64 = 7;

/// Upper bound on rotation-chain traversal, guards against corrupt cycles.
const MAX_CHAIN_LEN: usize = 10_000;

/// Refresh token lifecycle over an injected backend and clock.
pub struct RefreshTokenStore {
    backend: Arc<dyn RefreshTokenBackend>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl RefreshTokenStore {
    pub fn new(backend: Arc<dyn RefreshTokenBackend>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            backend,
            clock,
            ttl,
        }
    }

    /// Persist a new active token for `user_id`.
    pub async fn create(&self, user_id: &str, ip: &str) -> StoreResult<RefreshToken> {
        let now = self.clock.now();
        let token = RefreshToken {
            token: random_token(REFRESH_TOKEN_LEN),
            user_id: user_id.to_string(),
            created_at: now,
            expires_at: now + self.ttl,
            created_by_ip: ip.to_string(),
            revoked_at: None,
            revoked_by_ip: None,
            replaced_by_token: None,
        };
        self.backend.insert(&token).await?;
        Ok(token)
    }

    pub async fn find_by_token(&self, token: &str) -> StoreResult<Option<RefreshToken>> {
        self.backend.find(token).await
    }

    /// Revoke `token`, linking it to `replacement` when rotating.
    ///
    /// Returns `false` if the token was already revoked (or does not exist):
    /// exactly one of any set of concurrent callers sees `true`.
    pub async fn revoke(&self, token: &str, ip: &str, replacement: Option<&str>) -> StoreResult<bool> {
        let now = self.clock.now();
        self.backend
            .revoke_if_unrevoked(token, now, ip, replacement)
            .await
    }

    /// Delete `token` if it has expired.
    pub async fn delete_expired(&self, token: &str) -> StoreResult<bool> {
        self.backend.delete_if_expired(token, self.clock.now()).await
    }

    /// Delete `token` regardless of state. Used to drop a successor minted
    /// by a rotation that lost its race.
    pub async fn discard(&self, token: &str) -> StoreResult<bool> {
        self.backend.delete(token).await
    }

    /// Revoke every live token of a user.
    pub async fn revoke_all_for_user(&self, user_id: &str, ip: &str) -> StoreResult<u64> {
        self.backend
            .revoke_all_for_user(user_id, self.clock.now(), ip)
            .await
    }

    /// Follow `replaced_by_token` links from `start` and revoke every
    /// successor that is still unrevoked. Returns the tokens revoked.
    pub async fn revoke_descendants(&self, start: &RefreshToken, ip: &str) -> StoreResult<Vec<String>> {
        let mut revoked = Vec::new();
        let mut next = start.replaced_by_token.clone();

        for _ in 0..MAX_CHAIN_LEN {
            let Some(token) = next.take() else {
                break;
            };
            let Some(record) = self.backend.find(&token).await? else {
                break;
            };
            if self.revoke(&record.token, ip, None).await? {
                revoked.push(record.token.clone());
            }
            next = record.replaced_by_token;
        }

        debug!(count = revoked.len(), "revoked rotation-chain descendants");
        Ok(revoked)
    }

    /// Remove every expired record.
    pub async fn sweep_expired(&self) -> StoreResult<u64> {
        self.backend.delete_all_expired(self.clock.now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::memory::MemoryStore;

    fn setup() -> (Arc<MemoryStore>, Arc<ManualClock>, RefreshTokenStore) {
        let backend = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let store = RefreshTokenStore::new(
            backend.clone(),
            clock.clone(),
            Duration::days(REFRESH_TOKEN_EXPIRY_DAYS),
        );
        (backend, clock, store)
    }

    #[tokio::test]
    async fn create_persists_active_token_with_seven_day_expiry() {
        let (_, clock, store) = setup();
        let token = store.create("u1", "10.0.0.1").await.unwrap();

        assert_eq!(token.token.len(), REFRESH_TOKEN_LEN);
        assert_eq!(token.expires_at - token.created_at, Duration::days(7));
        assert!(token.is_active(clock.now()));

        let found = store.find_by_token(&token.token).await.unwrap().unwrap();
        assert_eq!(found, token);
    }

    #[tokio::test]
    async fn revoke_happens_once() {
        let (_, _, store) = setup();
        let token = store.create("u1", "ip").await.unwrap();

        assert!(store.revoke(&token.token, "ip2", Some("next")).await.unwrap());
        assert!(!store.revoke(&token.token, "ip3", None).await.unwrap());

        let found = store.find_by_token(&token.token).await.unwrap().unwrap();
        assert_eq!(found.revoked_by_ip.as_deref(), Some("ip2"));
        assert_eq!(found.replaced_by_token.as_deref(), Some("next"));
    }

    #[tokio::test]
    async fn delete_expired_waits_for_expiry() {
        let (_, clock, store) = setup();
        let token = store.create("u1", "ip").await.unwrap();

        assert!(!store.delete_expired(&token.token).await.unwrap());
        clock.advance(Duration::days(7));
        assert!(store.delete_expired(&token.token).await.unwrap());
        assert!(store.find_by_token(&token.token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn revoke_descendants_walks_the_chain() {
        let (_, _, store) = setup();
        let t1 = store.create("u1", "ip").await.unwrap();
        let t2 = store.create("u1", "ip").await.unwrap();
        let t3 = store.create("u1", "ip").await.unwrap();
        store.revoke(&t1.token, "ip", Some(&t2.token)).await.unwrap();
        store.revoke(&t2.token, "ip", Some(&t3.token)).await.unwrap();

        let t1 = store.find_by_token(&t1.token).await.unwrap().unwrap();
        let revoked = store.revoke_descendants(&t1, "thief").await.unwrap();

        // t2 was already dead; only the live tip is newly revoked.
        assert_eq!(revoked, vec![t3.token.clone()]);
        let tip = store.find_by_token(&t3.token).await.unwrap().unwrap();
        assert!(tip.revoked_at.is_some());
        assert!(tip.replaced_by_token.is_none());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let (backend, clock, store) = setup();
        store.create("u1", "ip").await.unwrap();
        clock.advance(Duration::days(3));
        store.create("u1", "ip").await.unwrap();
        clock.advance(Duration::days(5));

        assert_eq!(store.sweep_expired().await.unwrap(), 1);
        assert_eq!(backend.refresh_token_count(), 1);
    }
}
