//! Session configuration: signing secret, token lifetimes and policy knobs.

use std::path::PathBuf;
use std::time::Duration as StdDuration;

use chrono::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::auth::action_token::{RESET_TOKEN_EXPIRY_SECS, VERIFICATION_TOKEN_EXPIRY_SECS};
use crate::auth::jwt::ACCESS_TOKEN_EXPIRY_SECS;
use crate::ids::random_token;
use crate::refresh::REFRESH_TOKEN_EXPIRY_DAYS;

/// Default bound on a single audit write.
pub const DEFAULT_AUDIT_TIMEOUT_MS: u64 = 2_000;

/// Default interval between background sweeps.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Length of a generated signing secret.
pub const JWT_SECRET_LEN: usize = 64;

/// Largest numeric value accepted from the environment (about 100 years in seconds).
const MAX_CONFIG_VALUE: u64 = 3_153_600_000;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Configuration for the session manager.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// HMAC secret for access tokens.
    pub jwt_secret: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub reset_token_ttl: Duration,
    pub verification_token_ttl: Duration,
    /// Revoke the live tail of a rotation chain when a rotated token is replayed.
    pub revoke_chain_on_reuse: bool,
    /// Upper bound on one audit write before it is dropped.
    pub audit_timeout: StdDuration,
    /// Period of the background sweeper.
    pub sweep_interval: StdDuration,
}

impl SessionConfig {
    /// Default policy with the given signing secret.
    pub fn with_secret(jwt_secret: impl Into<String>) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            access_token_ttl: Duration::seconds(ACCESS_TOKEN_EXPIRY_SECS),
            refresh_token_ttl: Duration::days(REFRESH_TOKEN_EXPIRY_DAYS),
            reset_token_ttl: Duration::seconds(RESET_TOKEN_EXPIRY_SECS),
            verification_token_ttl: Duration::seconds(VERIFICATION_TOKEN_EXPIRY_SECS),
            revoke_chain_on_reuse: false,
            audit_timeout: StdDuration::from_millis(DEFAULT_AUDIT_TIMEOUT_MS),
            sweep_interval: StdDuration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }

    /// Reads configuration from environment variables with sensible defaults.
    ///
    /// | Variable                       | Default                        |
    /// |--------------------------------|--------------------------------|
    /// | `JWT_SECRET` / `AUTH_SECRET`   | generated & persisted to file  |
    /// | `ACCESS_TOKEN_TTL_SECS`        | `900` (15 minutes)             |
    /// | `REFRESH_TOKEN_TTL_SECS`       | `604800` (7 days)              |
    /// | `RESET_TOKEN_TTL_SECS`         | `3600` (1 hour)                |
    /// | `VERIFICATION_TOKEN_TTL_SECS`  | `86400` (24 hours)             |
    /// | `REVOKE_CHAIN_ON_REUSE`        | `false`                        |
    /// | `AUDIT_TIMEOUT_MS`             | `2000`                         |
    /// | `SWEEP_INTERVAL_SECS`          | `60`                           |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SessionConfig::from_env`] over an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secret = ["JWT_SECRET", "AUTH_SECRET"]
            .into_iter()
            .filter_map(&lookup)
            .find(|s| !s.is_empty())
            .unwrap_or_else(resolve_jwt_secret);

        let mut config = Self::with_secret(secret);
        if let Some(secs) = parse_u64(&lookup, "ACCESS_TOKEN_TTL_SECS")? {
            config.access_token_ttl = seconds(secs);
        }
        if let Some(secs) = parse_u64(&lookup, "REFRESH_TOKEN_TTL_SECS")? {
            config.refresh_token_ttl = seconds(secs);
        }
        if let Some(secs) = parse_u64(&lookup, "RESET_TOKEN_TTL_SECS")? {
            config.reset_token_ttl = seconds(secs);
        }
        if let Some(secs) = parse_u64(&lookup, "VERIFICATION_TOKEN_TTL_SECS")? {
            config.verification_token_ttl = seconds(secs);
        }
        if let Some(raw) = lookup("REVOKE_CHAIN_ON_REUSE") {
            config.revoke_chain_on_reuse = parse_bool("REVOKE_CHAIN_ON_REUSE", &raw)?;
        }
        if let Some(ms) = parse_u64(&lookup, "AUDIT_TIMEOUT_MS")? {
            config.audit_timeout = StdDuration::from_millis(ms);
        }
        if let Some(secs) = parse_u64(&lookup, "SWEEP_INTERVAL_SECS")? {
            config.sweep_interval = StdDuration::from_secs(secs.max(1));
        }
        Ok(config)
    }
}

fn seconds(secs: u64) -> Duration {
    // Bounded by MAX_CONFIG_VALUE, so the conversion cannot overflow.
    Duration::seconds(secs as i64)
}

fn parse_u64<F>(lookup: &F, key: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let value = raw.trim().parse::<u64>().map_err(|e| ConfigError::Invalid {
        key,
        value: raw.clone(),
        reason: e.to_string(),
    })?;
    if value == 0 || value > MAX_CONFIG_VALUE {
        return Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: format!("must be between 1 and {MAX_CONFIG_VALUE}"),
        });
    }
    Ok(Some(value))
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: "expected a boolean".into(),
        }),
    }
}

/// Resolve the signing secret from the persisted file, generating one on
/// first use. Env vars are handled by [`SessionConfig::from_env`].
pub fn resolve_jwt_secret() -> String {
    let secret_path = jwt_secret_path();
    if let Ok(existing) = std::fs::read_to_string(&secret_path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let secret = random_token(JWT_SECRET_LEN);
    match persist_jwt_secret(&secret) {
        Ok(path) => info!(path = %path.display(), "generated new JWT secret"),
        Err(e) => warn!("generated JWT secret could not be persisted: {e}"),
    }
    secret
}

/// Write `secret` to the JWT secret file, replacing any previous one.
pub fn persist_jwt_secret(secret: &str) -> std::io::Result<PathBuf> {
    let secret_path = jwt_secret_path();
    if let Some(parent) = secret_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&secret_path, secret)?;
    Ok(secret_path)
}

/// Path to the persisted JWT secret file.
///
/// `$ESTORE_DATA_DIR/jwt-secret` when set, else `<data dir>/estore/jwt-secret`.
pub fn jwt_secret_path() -> PathBuf {
    if let Ok(dir) = std::env::var("ESTORE_DATA_DIR")
        && !dir.is_empty()
    {
        return PathBuf::from(dir).join("jwt-secret");
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("estore")
        .join("jwt-secret")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_policy() {
        let config = SessionConfig::with_secret("s");
        assert_eq!(config.access_token_ttl, Duration::minutes(15));
        assert_eq!(config.refresh_token_ttl, Duration::days(7));
        assert_eq!(config.reset_token_ttl, Duration::hours(1));
        assert_eq!(config.verification_token_ttl, Duration::hours(24));
        assert!(!config.revoke_chain_on_reuse);
    }

    #[test]
    fn lookup_overrides_defaults() {
        let config = SessionConfig::from_lookup(lookup(&[
            ("JWT_SECRET", "from-env"),
            ("ACCESS_TOKEN_TTL_SECS", "60"),
            ("VERIFICATION_TOKEN_TTL_SECS", "7200"),
            ("REVOKE_CHAIN_ON_REUSE", "true"),
            ("AUDIT_TIMEOUT_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.jwt_secret, "from-env");
        assert_eq!(config.access_token_ttl, Duration::seconds(60));
        assert_eq!(config.verification_token_ttl, Duration::hours(2));
        assert!(config.revoke_chain_on_reuse);
        assert_eq!(config.audit_timeout, StdDuration::from_millis(250));
    }

    #[test]
    fn auth_secret_is_a_fallback() {
        let config =
            SessionConfig::from_lookup(lookup(&[("JWT_SECRET", ""), ("AUTH_SECRET", "fallback")]))
                .unwrap();
        assert_eq!(config.jwt_secret, "fallback");
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = SessionConfig::from_lookup(lookup(&[
            ("JWT_SECRET", "s"),
            ("ACCESS_TOKEN_TTL_SECS", "fifteen"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("ACCESS_TOKEN_TTL_SECS"));

        assert!(
            SessionConfig::from_lookup(lookup(&[("JWT_SECRET", "s"), ("RESET_TOKEN_TTL_SECS", "0")]))
                .is_err()
        );
        assert!(
            SessionConfig::from_lookup(lookup(&[("JWT_SECRET", "s"), ("REVOKE_CHAIN_ON_REUSE", "maybe")]))
                .is_err()
        );
    }
}
