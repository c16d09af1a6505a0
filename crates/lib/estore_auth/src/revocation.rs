//! Access-token revocation list (logout blacklist).
//!
//! Entries carry the access token's own expiry. Once that passes the codec
//! rejects the token anyway, so [`RevocationList::purge_expired`] may drop
//! the entry. Nothing removes an entry earlier.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::models::auth::RevocationEntry;
use crate::store::{RevocationBackend, StoreResult};

/// Blacklist of access tokens invalidated before their natural expiry.
pub struct RevocationList {
    backend: Arc<dyn RevocationBackend>,
    clock: Arc<dyn Clock>,
}

impl RevocationList {
    pub fn new(backend: Arc<dyn RevocationBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// Blacklist `token` until `expires_at`. Idempotent.
    pub async fn add(&self, token: &str, expires_at: DateTime<Utc>) -> StoreResult<()> {
        self.backend
            .insert(&RevocationEntry {
                token: token.to_string(),
                expires_at,
            })
            .await
    }

    pub async fn contains(&self, token: &str) -> StoreResult<bool> {
        self.backend.contains(token).await
    }

    /// Drop entries whose token has expired on its own.
    pub async fn purge_expired(&self) -> StoreResult<u64> {
        self.backend.purge_expired(self.clock.now()).await
    }
}
