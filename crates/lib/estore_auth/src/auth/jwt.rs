//! Access token codec: HS256 JWTs with a fixed lifetime.
//!
//! Stateless. Revocation is checked by the caller against the
//! [`crate::revocation::RevocationList`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use thiserror::Error;
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::auth::{IssuedAccessToken, TokenClaims};

/// Access token lifetime: 15 minutes.
pub const ACCESS_TOKEN_EXPIRY_SECS: i64 = 15 * 60;

/// Why a token failed validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed token or bad signature: {0}")]
    Malformed(String),

    #[error("token expired")]
    Expired,

    #[error("jwt encode: {0}")]
    Signing(String),
}

/// Signs and verifies access tokens.
pub struct AccessTokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl AccessTokenCodec {
    pub fn new(secret: &[u8], ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the injected clock, not the system time.
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            ttl,
            clock,
        }
    }

    /// Sign a new access token for `user_id`.
    pub fn issue(&self, user_id: &str) -> Result<IssuedAccessToken, CodecError> {
        let now = self.clock.now();
        let expires_at = now + self.ttl;
        let claims = TokenClaims {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| CodecError::Signing(e.to_string()))?;

        Ok(IssuedAccessToken {
            token,
            expires_at: timestamp_to_datetime(claims.exp),
        })
    }

    /// Verify signature and expiry, returning the claims.
    pub fn validate(&self, token: &str) -> Result<TokenClaims, CodecError> {
        let data = decode::<TokenClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        let claims = data.claims;

        if self.clock.now().timestamp() >= claims.exp {
            return Err(CodecError::Expired);
        }
        Ok(claims)
    }
}

/// Convert a unix `exp` claim to a UTC instant.
pub fn timestamp_to_datetime(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const SECRET: &[u8] = b"test-secret";

    fn codec(clock: Arc<ManualClock>) -> AccessTokenCodec {
        AccessTokenCodec::new(SECRET, Duration::seconds(ACCESS_TOKEN_EXPIRY_SECS), clock)
    }

    #[test]
    fn issued_token_validates_to_subject() {
        let clock = Arc::new(ManualClock::default());
        let codec = codec(clock.clone());

        let issued = codec.issue("user-1").unwrap();
        let claims = codec.validate(&issued.token).unwrap();

        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.exp - claims.iat, ACCESS_TOKEN_EXPIRY_SECS);
        assert_eq!(issued.expires_at.timestamp(), claims.exp);
    }

    #[test]
    fn token_expires_after_ttl() {
        let clock = Arc::new(ManualClock::default());
        let codec = codec(clock.clone());
        let issued = codec.issue("user-1").unwrap();

        clock.advance(Duration::seconds(ACCESS_TOKEN_EXPIRY_SECS - 1));
        assert!(codec.validate(&issued.token).is_ok());

        clock.advance(Duration::seconds(1));
        assert_eq!(codec.validate(&issued.token), Err(CodecError::Expired));
    }

    #[test]
    fn wrong_secret_is_malformed() {
        let clock = Arc::new(ManualClock::default());
        let issued = codec(clock.clone()).issue("user-1").unwrap();

        let other = AccessTokenCodec::new(b"other-secret", Duration::minutes(15), clock);
        assert!(matches!(
            other.validate(&issued.token),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        let codec = codec(Arc::new(ManualClock::default()));
        assert!(matches!(
            codec.validate("not.a.jwt"),
            Err(CodecError::Malformed(_))
        ));
        assert!(matches!(codec.validate(""), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let clock = Arc::new(ManualClock::default());
        let codec = codec(clock);
        let a = codec.issue("user-a").unwrap().token;
        let b = codec.issue("user-b").unwrap().token;

        // Splice b's payload onto a's signature.
        let a_parts: Vec<&str> = a.split('.').collect();
        let b_parts: Vec<&str> = b.split('.').collect();
        let forged = format!("{}.{}.{}", a_parts[0], b_parts[1], a_parts[2]);

        assert!(matches!(
            codec.validate(&forged),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn tokens_minted_in_the_same_instant_differ() {
        let codec = codec(Arc::new(ManualClock::default()));
        let a = codec.issue("user-1").unwrap();
        let b = codec.issue("user-1").unwrap();
        assert_ne!(a.token, b.token);
    }
}
