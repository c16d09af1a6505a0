//! Session manager: the login / rotation / logout state machine.
//!
//! Holds no mutable state of its own. Every durable change goes through one
//! of the injected stores, so any number of managers may share a backend.
//!
//! A refresh-token session moves `Active -> Rotated | Revoked | Expired`;
//! every state but `Active` is terminal. Rotation revokes the presented
//! token with a conditional update, so of any set of concurrent refresh
//! calls for the same token exactly one wins.

use std::sync::Arc;

use serde_json::json;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditEventKind, AuditSink, PgAuditSink};
use crate::auth::jwt::{AccessTokenCodec, timestamp_to_datetime};
use crate::auth::password::{
    check_password_policy, hash_password, verify_against_dummy, verify_password,
};
use crate::auth::{AuthError, RevokedReason, action_token};
use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;
use crate::ids::uuidv7;
use crate::models::auth::{
    ActionTokenClaim, ActionTokenGrant, ActionTokenKind, ClientContext, IssuedAccessToken,
    PASSWORD_RESET_REQUESTED, PasswordResetRequest, RefreshToken, RegisteredUser, Role,
    TokenClaims, TokenPair, User,
};
use crate::refresh::RefreshTokenStore;
use crate::revocation::RevocationList;
use crate::store::memory::MemoryStore;
use crate::store::postgres::PgStore;
use crate::store::{CredentialStore, RefreshTokenBackend, RevocationBackend, StoreError, UserUpdate};


/// Recorded as the revoking address for refresh tokens killed by an
/// administrative action.
const ADMIN_ACTOR: &str = "admin";

/// Records removed by one [`SessionManager::sweep`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub refresh_tokens_removed: u64,
    pub revocations_purged: u64,
}

/// Normalize an email for lookup and storage.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Session and token lifecycle over injected stores, audit sink and clock.
pub struct SessionManager {
    credentials: Arc<dyn CredentialStore>,
    refresh_tokens: RefreshTokenStore,
    revocations: RevocationList,
    codec: AccessTokenCodec,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        refresh_backend: Arc<dyn RefreshTokenBackend>,
        revocation_backend: Arc<dyn RevocationBackend>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        let codec = AccessTokenCodec::new(
            config.jwt_secret.as_bytes(),
            config.access_token_ttl,
            clock.clone(),
        );
        let refresh_tokens =
            RefreshTokenStore::new(refresh_backend, clock.clone(), config.refresh_token_ttl);
        let revocations = RevocationList::new(revocation_backend, clock.clone());

        Self {
            credentials,
            refresh_tokens,
            revocations,
            codec,
            audit,
            clock,
            config,
        }
    }

    /// Manager over a single [`MemoryStore`] serving all three backends.
    pub fn in_memory(
        store: Arc<MemoryStore>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        Self::new(store.clone(), store.clone(), store, audit, clock, config)
    }

    /// Manager over PostgreSQL, auditing into `auth_audit_log`.
    pub fn postgres(pool: PgPool, config: SessionConfig) -> Self {
        let store = Arc::new(PgStore::new(pool.clone()));
        Self::new(
            store.clone(),
            store.clone(),
            store,
            Arc::new(PgAuditSink::new(pool)),
            Arc::new(SystemClock),
            config,
        )
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Registration & login
    // -----------------------------------------------------------------------

    /// Create an active, unverified user and mint its verification token.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        name: Option<&str>,
        client: &ClientContext,
    ) -> Result<RegisteredUser, AuthError> {
        check_password_policy(password)?;
        let email = normalize_email(email);
        if self.credentials.find_by_email(&email).await?.is_some() {
            return Err(AuthError::EmailTaken);
        }

        let now = self.clock.now();
        let mut user = User {
            id: uuidv7().to_string(),
            email,
            name: name.map(str::to_string),
            password_hash: hash_password(password)?,
            role: Role::User,
            is_active: true,
            is_email_verified: false,
            email_verification_token_hash: None,
            email_verification_expires_at: None,
            reset_password_token_hash: None,
            reset_password_expires_at: None,
            created_at: now,
        };
        let verification = action_token::issue(
            &mut user,
            ActionTokenKind::EmailVerification,
            self.config.verification_token_ttl,
            now,
        );

        match self.credentials.insert(&user).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => return Err(AuthError::EmailTaken),
            Err(e) => return Err(e.into()),
        }

        info!(user_id = %user.id, "registered user");
        self.emit(
            AuditEventKind::Register,
            Some(&user.id),
            Some(client),
            json!({ "email": user.email }),
        )
        .await;

        Ok(RegisteredUser { user, verification })
    }

    /// Authenticate with email and password.
    ///
    /// An unknown email and a wrong password both yield
    /// [`AuthError::InvalidCredentials`].
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        client: &ClientContext,
    ) -> Result<TokenPair, AuthError> {
        let email = normalize_email(email);
        let Some(user) = self.credentials.find_by_email(&email).await? else {
            // Same bcrypt cost as a real check so response time does not
            // reveal whether the email exists.
            verify_against_dummy(password);
            debug!("login rejected: unknown email");
            return Err(AuthError::InvalidCredentials);
        };
        if !user.is_active {
            return Err(AuthError::AccountDeactivated);
        }
        if !user.is_email_verified {
            return Err(AuthError::EmailNotVerified);
        }
        if !verify_password(password, &user.password_hash)? {
            debug!(user_id = %user.id, "login rejected: wrong password");
            return Err(AuthError::InvalidCredentials);
        }

        let pair = self.issue_pair(&user.id, &client.ip).await?;
        info!(user_id = %user.id, "user logged in");
        self.emit(
            AuditEventKind::Login,
            Some(&user.id),
            Some(client),
            json!({ "email": user.email }),
        )
        .await;
        Ok(pair)
    }

    // -----------------------------------------------------------------------
    // Refresh rotation
    // -----------------------------------------------------------------------

    /// Exchange a refresh token for a new access + refresh pair.
    ///
    /// Expiry is checked before revocation: an expired token is deleted and
    /// reported as [`AuthError::TokenExpired`] whatever its revocation state.
    pub async fn refresh(&self, token: &str, client: &ClientContext) -> Result<TokenPair, AuthError> {
        let Some(current) = self.refresh_tokens.find_by_token(token).await? else {
            debug!("refresh rejected: unknown token");
            return Err(AuthError::InvalidToken);
        };

        if current.is_expired(self.clock.now()) {
            self.refresh_tokens.delete_expired(token).await?;
            debug!(user_id = %current.user_id, "refresh rejected: token expired");
            return Err(AuthError::TokenExpired);
        }

        if current.is_revoked() {
            let reason = revoked_reason(&current);
            self.handle_reuse(&current, reason, client).await?;
            return Err(AuthError::TokenRevoked(reason));
        }

        match self.credentials.find_by_id(&current.user_id).await? {
            None => {
                debug!(user_id = %current.user_id, "refresh rejected: user gone");
                return Err(AuthError::InvalidToken);
            }
            Some(user) if !user.is_active => {
                debug!(user_id = %user.id, "refresh rejected: account deactivated");
                return Err(AuthError::AccountDeactivated);
            }
            Some(_) => {}
        }

        let next = self.refresh_tokens.create(&current.user_id, &client.ip).await?;
        if !self
            .refresh_tokens
            .revoke(token, &client.ip, Some(&next.token))
            .await?
        {
            // Another caller rotated the token between our read and revoke.
            if let Err(e) = self.refresh_tokens.discard(&next.token).await {
                warn!(user_id = %current.user_id, "failed to discard orphaned refresh token: {e}");
            }
            warn!(user_id = %current.user_id, ip = %client.ip, "lost concurrent refresh race");
            return Err(AuthError::TokenRevoked(RevokedReason::Rotated));
        }

        let access = self.codec.issue(&current.user_id)?;
        debug!(user_id = %current.user_id, "rotated refresh token");
        self.emit(
            AuditEventKind::TokenRefresh,
            Some(&current.user_id),
            Some(client),
            json!({}),
        )
        .await;

        Ok(TokenPair {
            user_id: current.user_id,
            access_token: access.token,
            access_token_expires_at: access.expires_at,
            refresh_token: next.token,
            refresh_token_expires_at: next.expires_at,
        })
    }

    /// A dead refresh token was presented again: log, audit and optionally
    /// kill the rest of its rotation chain.
    async fn handle_reuse(
        &self,
        presented: &RefreshToken,
        reason: RevokedReason,
        client: &ClientContext,
    ) -> Result<(), AuthError> {
        warn!(
            user_id = %presented.user_id,
            ip = %client.ip,
            %reason,
            "revoked refresh token presented again"
        );

        let chain_revoked = if self.config.revoke_chain_on_reuse {
            self.refresh_tokens
                .revoke_descendants(presented, &client.ip)
                .await?
                .len()
        } else {
            0
        };

        self.emit(
            AuditEventKind::RefreshTokenReuse,
            Some(&presented.user_id),
            Some(client),
            json!({
                "reason": reason.to_string(),
                "chainRevoked": chain_revoked,
            }),
        )
        .await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Access tokens & logout
    // -----------------------------------------------------------------------

    /// Validate an access token and return its user id.
    ///
    /// Does not consult the user record: a deactivated user's token stays
    /// usable until it expires.
    pub async fn validate_access_token(&self, token: &str) -> Result<String, AuthError> {
        self.authenticate(token).await.map(|claims| claims.sub)
    }

    async fn authenticate(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let claims = self.codec.validate(token).map_err(|e| {
            debug!("access token rejected: {e}");
            AuthError::from(e)
        })?;
        if self.revocations.contains(token).await? {
            return Err(AuthError::TokenRevoked(RevokedReason::Blacklisted));
        }
        Ok(claims)
    }

    /// Blacklist a valid access token until its own expiry.
    ///
    /// Refresh tokens of the user are left untouched.
    pub async fn logout(&self, access_token: &str, client: &ClientContext) -> Result<(), AuthError> {
        let claims = self.authenticate(access_token).await?;
        self.revocations
            .add(access_token, timestamp_to_datetime(claims.exp))
            .await?;

        info!(user_id = %claims.sub, "user logged out");
        self.emit(AuditEventKind::Logout, Some(&claims.sub), Some(client), json!({}))
            .await;
        Ok(())
    }

    /// Blacklist the access token and revoke every live refresh token of
    /// its user. Returns the number of refresh tokens revoked.
    pub async fn logout_all(&self, access_token: &str, client: &ClientContext) -> Result<u64, AuthError> {
        let claims = self.authenticate(access_token).await?;
        self.revocations
            .add(access_token, timestamp_to_datetime(claims.exp))
            .await?;
        let revoked = self
            .refresh_tokens
            .revoke_all_for_user(&claims.sub, &client.ip)
            .await?;

        info!(user_id = %claims.sub, revoked, "user logged out everywhere");
        self.emit(
            AuditEventKind::LogoutAll,
            Some(&claims.sub),
            Some(client),
            json!({ "refreshTokensRevoked": revoked }),
        )
        .await;
        Ok(revoked)
    }

    // -----------------------------------------------------------------------
    // Password reset
    // -----------------------------------------------------------------------

    /// Start a password reset.
    ///
    /// The returned message is identical whether or not the email belongs
    /// to a user; only `grant` differs and it must stay server-side.
    pub async fn request_password_reset(&self, email: &str) -> Result<PasswordResetRequest, AuthError> {
        let email = normalize_email(email);
        let unmatched = || PasswordResetRequest {
            message: PASSWORD_RESET_REQUESTED,
            grant: None,
        };
        let Some(user) = self.credentials.find_by_email(&email).await? else {
            debug!("password reset requested for unknown email");
            self.emit(
                AuditEventKind::PasswordResetRequested,
                None,
                None,
                json!({ "matched": false }),
            )
            .await;
            return Ok(unmatched());
        };

        let (grant, digest) = action_token::mint(
            &user,
            ActionTokenKind::PasswordReset,
            self.config.reset_token_ttl,
            self.clock.now(),
        );
        if !self
            .credentials
            .set_action_token(&user.id, grant.kind, &digest, grant.expires_at)
            .await?
        {
            // Deleted between lookup and update.
            debug!(user_id = %user.id, "password reset target vanished");
            return Ok(unmatched());
        }

        self.emit(
            AuditEventKind::PasswordResetRequested,
            Some(&user.id),
            None,
            json!({ "matched": true }),
        )
        .await;
        Ok(PasswordResetRequest {
            message: PASSWORD_RESET_REQUESTED,
            grant: Some(grant),
        })
    }

    /// Redeem a reset token, set the new password and log the user in.
    pub async fn consume_password_reset(
        &self,
        raw_token: &str,
        new_password: &str,
        client: &ClientContext,
    ) -> Result<IssuedAccessToken, AuthError> {
        check_password_policy(new_password)?;
        let password_hash = hash_password(new_password)?;

        let claim = ActionTokenClaim::ResetPassword { password_hash };
        let Some(user) = self.claim(&claim, raw_token).await? else {
            return Err(AuthError::InvalidOrExpiredToken);
        };

        let access = self.codec.issue(&user.id)?;
        info!(user_id = %user.id, "password reset");
        self.emit(AuditEventKind::PasswordReset, Some(&user.id), Some(client), json!({}))
            .await;
        Ok(access)
    }

    // -----------------------------------------------------------------------
    // Email verification
    // -----------------------------------------------------------------------

    /// Mint a verification token for a user, replacing any outstanding one.
    pub async fn issue_email_verification(&self, user_id: &str) -> Result<ActionTokenGrant, AuthError> {
        let user = self
            .credentials
            .find_by_id(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;
        self.issue_verification(user).await
    }

    /// Same as [`SessionManager::issue_email_verification`], looked up by email.
    pub async fn resend_email_verification(&self, email: &str) -> Result<ActionTokenGrant, AuthError> {
        let user = self
            .credentials
            .find_by_email(&normalize_email(email))
            .await?
            .ok_or(AuthError::UserNotFound)?;
        self.issue_verification(user).await
    }

    async fn issue_verification(&self, user: User) -> Result<ActionTokenGrant, AuthError> {
        if user.is_email_verified {
            return Err(AuthError::EmailAlreadyVerified);
        }
        let (grant, digest) = action_token::mint(
            &user,
            ActionTokenKind::EmailVerification,
            self.config.verification_token_ttl,
            self.clock.now(),
        );
        if !self
            .credentials
            .set_action_token(&user.id, grant.kind, &digest, grant.expires_at)
            .await?
        {
            return Err(AuthError::UserNotFound);
        }

        self.emit(
            AuditEventKind::EmailVerificationIssued,
            Some(&user.id),
            None,
            json!({}),
        )
        .await;
        Ok(grant)
    }

    /// Redeem a verification token and log the user in.
    pub async fn consume_email_verification(
        &self,
        raw_token: &str,
        client: &ClientContext,
    ) -> Result<TokenPair, AuthError> {
        let Some(user) = self.claim(&ActionTokenClaim::VerifyEmail, raw_token).await? else {
            return Err(AuthError::InvalidOrExpiredToken);
        };

        info!(user_id = %user.id, "email verified");
        self.emit(AuditEventKind::EmailVerified, Some(&user.id), Some(client), json!({}))
            .await;

        if !user.is_active {
            return Err(AuthError::AccountDeactivated);
        }
        self.issue_pair(&user.id, &client.ip).await
    }

    /// Redeem a token and apply its change in one store update.
    async fn claim(&self, claim: &ActionTokenClaim, raw_token: &str) -> Result<Option<User>, AuthError> {
        let claimed = self
            .credentials
            .claim_action_token(claim, &action_token::digest(raw_token), self.clock.now())
            .await?;
        if claimed.is_none() {
            debug!(kind = claim.kind().as_str(), "action token rejected");
        }
        Ok(claimed)
    }

    // -----------------------------------------------------------------------
    // Administration
    // -----------------------------------------------------------------------

    /// Activate or deactivate a user.
    ///
    /// Deactivation blocks logins and revokes every live refresh token of
    /// the user. Outstanding access tokens run to their expiry.
    pub async fn set_active(&self, user_id: &str, active: bool) -> Result<User, AuthError> {
        let user = match self.credentials.set_active(user_id, active).await? {
            UserUpdate::NotFound => return Err(AuthError::UserNotFound),
            UserUpdate::Unchanged(user) => return Ok(user),
            UserUpdate::Changed { user, .. } => user,
        };

        let (kind, details) = if active {
            (AuditEventKind::UserActivated, json!({}))
        } else {
            let revoked = self
                .refresh_tokens
                .revoke_all_for_user(&user.id, ADMIN_ACTOR)
                .await?;
            (
                AuditEventKind::UserDeactivated,
                json!({ "refreshTokensRevoked": revoked }),
            )
        };
        info!(user_id = %user.id, active, "user activation changed");
        self.emit(kind, Some(&user.id), None, details).await;
        Ok(user)
    }

    pub async fn set_role(&self, user_id: &str, role: Role) -> Result<User, AuthError> {
        let (user, previous) = match self.credentials.set_role(user_id, role).await? {
            UserUpdate::NotFound => return Err(AuthError::UserNotFound),
            UserUpdate::Unchanged(user) => return Ok(user),
            UserUpdate::Changed { user, previous } => (user, previous),
        };

        info!(user_id = %user.id, %previous, %role, "user role changed");
        self.emit(
            AuditEventKind::RoleChanged,
            Some(&user.id),
            None,
            json!({ "from": previous, "to": role }),
        )
        .await;
        Ok(user)
    }

    // -----------------------------------------------------------------------
    // Housekeeping
    // -----------------------------------------------------------------------

    /// Remove expired refresh tokens and revocation entries.
    pub async fn sweep(&self) -> Result<SweepReport, AuthError> {
        let report = SweepReport {
            refresh_tokens_removed: self.refresh_tokens.sweep_expired().await?,
            revocations_purged: self.revocations.purge_expired().await?,
        };
        debug!(
            refresh_tokens = report.refresh_tokens_removed,
            revocations = report.revocations_purged,
            "swept expired session records"
        );
        Ok(report)
    }

    /// Run [`SessionManager::sweep`] every `sweep_interval` until aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config.sweep_interval);
            loop {
                interval.tick().await;
                if let Err(e) = manager.sweep().await {
                    warn!("session sweep failed: {e}");
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn issue_pair(&self, user_id: &str, ip: &str) -> Result<TokenPair, AuthError> {
        let access = self.codec.issue(user_id)?;
        let refresh = self.refresh_tokens.create(user_id, ip).await?;
        Ok(TokenPair {
            user_id: user_id.to_string(),
            access_token: access.token,
            access_token_expires_at: access.expires_at,
            refresh_token: refresh.token,
            refresh_token_expires_at: refresh.expires_at,
        })
    }

    /// Record an audit event. Sink errors and timeouts are logged and dropped.
    async fn emit(
        &self,
        kind: AuditEventKind,
        user_id: Option<&str>,
        client: Option<&ClientContext>,
        details: serde_json::Value,
    ) {
        let event = AuditEvent {
            kind,
            user_id: user_id.map(str::to_string),
            ip: client.map(|c| c.ip.clone()),
            user_agent: client.and_then(|c| c.user_agent.clone()),
            details,
            timestamp: self.clock.now(),
        };

        match tokio::time::timeout(self.config.audit_timeout, self.audit.record(&event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(event = %kind, "failed to record audit event: {e}"),
            Err(_) => warn!(event = %kind, "audit sink timed out; event dropped"),
        }
    }
}

fn revoked_reason(token: &RefreshToken) -> RevokedReason {
    if token.replaced_by_token.is_some() {
        RevokedReason::Rotated
    } else {
        RevokedReason::Revoked
    }
}
