//! Identifier and opaque token generation.
//!
//! User ids are UUIDv7 (time-sortable). Bearer secrets handed to clients are
//! random alphanumeric strings drawn from the thread-local CSPRNG; only their
//! SHA-256 digest is ever compared against persisted state.

use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Length of refresh-token strings.
pub const REFRESH_TOKEN_LEN: usize = 64;

/// Length of raw email-verification / password-reset tokens.
pub const ACTION_TOKEN_LEN: usize = 40;

/// Generate a new UUIDv7 (timestamp-sortable).
pub fn uuidv7() -> Uuid {
    Uuid::now_v7()
}

/// Generate a random alphanumeric token of `len` characters.
pub fn random_token(len: usize) -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// SHA-256 hex digest of a token, for storage and lookup.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuidv7_is_valid() {
        let id = uuidv7();
        assert_eq!(id.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn random_token_has_requested_length_and_alphabet() {
        let token = random_token(REFRESH_TOKEN_LEN);
        assert_eq!(token.len(), REFRESH_TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn random_tokens_differ() {
        assert_ne!(random_token(ACTION_TOKEN_LEN), random_token(ACTION_TOKEN_LEN));
    }

    #[test]
    fn hash_token_is_stable_sha256_hex() {
        // sha256("abc")
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(hash_token("abc").len(), 64);
    }
}
