//! Audit sink for security-relevant session events.
//!
//! Recording is best effort: the session manager logs sink failures and
//! carries on, so a broken sink can never fail a login or a logout.

use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

use crate::ids::uuidv7;

/// Kind of session event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventKind {
    Register,
    Login,
    Logout,
    LogoutAll,
    TokenRefresh,
    RefreshTokenReuse,
    PasswordResetRequested,
    PasswordReset,
    EmailVerificationIssued,
    EmailVerified,
    UserActivated,
    UserDeactivated,
    RoleChanged,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventKind::Register => "REGISTER",
            AuditEventKind::Login => "LOGIN",
            AuditEventKind::Logout => "LOGOUT",
            AuditEventKind::LogoutAll => "LOGOUT_ALL",
            AuditEventKind::TokenRefresh => "TOKEN_REFRESH",
            AuditEventKind::RefreshTokenReuse => "REFRESH_TOKEN_REUSE",
            AuditEventKind::PasswordResetRequested => "PASSWORD_RESET_REQUESTED",
            AuditEventKind::PasswordReset => "PASSWORD_RESET",
            AuditEventKind::EmailVerificationIssued => "EMAIL_VERIFICATION_ISSUED",
            AuditEventKind::EmailVerified => "EMAIL_VERIFIED",
            AuditEventKind::UserActivated => "USER_ACTIVATED",
            AuditEventKind::UserDeactivated => "USER_DEACTIVATED",
            AuditEventKind::RoleChanged => "ROLE_CHANGED",
        }
    }
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    #[serde(rename = "type")]
    pub kind: AuditEventKind,
    pub user_id: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Errors raised by a sink. Never surfaced to session callers.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit write failed: {0}")]
    Write(String),
}

impl From<sqlx::Error> for AuditError {
    fn from(e: sqlx::Error) -> Self {
        AuditError::Write(e.to_string())
    }
}

/// Destination for audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Writes events to the `auth_audit_log` table.
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        sqlx::query(
            r#"
            INSERT INTO auth_audit_log (id, event_type, user_id, ip, user_agent, details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(uuidv7())
        .bind(event.kind.as_str())
        .bind(&event.user_id)
        .bind(&event.ip)
        .bind(&event.user_agent)
        .bind(&event.details)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Emits events as structured `tracing` records on the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        info!(
            target: "audit",
            event = %event.kind,
            user_id = event.user_id.as_deref().unwrap_or("-"),
            ip = event.ip.as_deref().unwrap_or("-"),
            details = %event.details,
            "audit event"
        );
        Ok(())
    }
}

/// Keeps events in memory; handy in tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Kinds of recorded events, in order.
    pub fn kinds(&self) -> Vec<AuditEventKind> {
        self.events().into_iter().map(|e| e.kind).collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}
