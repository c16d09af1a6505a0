//! Password hashing via bcrypt, plus the strength policy applied on
//! registration and reset.

use std::sync::OnceLock;

use super::AuthError;

/// bcrypt cost factor.
const BCRYPT_COST: u32 = 10;

/// Minimum accepted password length.
pub const MIN_PASSWORD_LEN: usize = 8;

const COMMON_PASSWORDS: &[&str] = &["password", "password123", "admin", "12345678", "qwertyuiop"];

/// Hash a password with bcrypt (cost 10).
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    bcrypt::hash(password, BCRYPT_COST)
        .map_err(|e| AuthError::Internal(format!("bcrypt hash: {e}")))
}

/// Verify a password against a bcrypt hash.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    bcrypt::verify(password, hash).map_err(|e| AuthError::Internal(format!("bcrypt verify: {e}")))
}

static DUMMY_HASH: OnceLock<Option<String>> = OnceLock::new();

fn dummy_hash() -> Option<&'static str> {
    DUMMY_HASH
        .get_or_init(|| bcrypt::hash("estore-auth-absent-user", BCRYPT_COST).ok())
        .as_deref()
}

/// Burn one bcrypt verification for a login whose email matched no user.
/// Always `false`.
pub fn verify_against_dummy(password: &str) -> bool {
    if let Some(hash) = dummy_hash() {
        let _ = bcrypt::verify(password, hash);
    }
    false
}

/// Reject passwords that are short, single-class or on the common list.
pub fn check_password_policy(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::WeakPassword(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }

    let has_lower = password.chars().any(|c| c.is_lowercase());
    let has_upper = password.chars().any(|c| c.is_uppercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_symbol = password
        .chars()
        .any(|c| !c.is_alphanumeric() && !c.is_whitespace());
    if !(has_lower && has_upper && has_digit && has_symbol) {
        return Err(AuthError::WeakPassword(
            "Password must contain uppercase, lowercase, number, and special character".into(),
        ));
    }

    let lowered = password.to_lowercase();
    if COMMON_PASSWORDS.contains(&lowered.as_str()) {
        return Err(AuthError::WeakPassword("Common passwords are not allowed".into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify() {
        let hash = hash_password("StrongP@ssw0rd!").unwrap();
        assert_ne!(hash, "StrongP@ssw0rd!");
        assert!(verify_password("StrongP@ssw0rd!", &hash).unwrap());
        assert!(!verify_password("WrongP@ssw0rd!", &hash).unwrap());
    }

    #[test]
    fn verify_against_garbage_hash_is_an_error() {
        assert!(verify_password("x", "not-a-bcrypt-hash").is_err());
    }

    #[test]
    fn dummy_verification_runs_at_full_cost() {
        assert!(!verify_against_dummy("estore-auth-absent-user"));
        assert!(!verify_against_dummy("StrongP@ssw0rd!"));
        let hash = dummy_hash().unwrap();
        assert!(hash.starts_with("$2b$10$"), "{hash}");
    }

    #[test]
    fn policy_rejects_short_passwords() {
        let err = check_password_policy("Pass1!").unwrap_err();
        assert!(err.to_string().contains("at least 8 characters"));
    }

    #[test]
    fn policy_requires_character_classes() {
        let err = check_password_policy("password1!").unwrap_err();
        assert!(err.to_string().contains("uppercase"));
        assert!(check_password_policy("PASSWORD1!").is_err());
        assert!(check_password_policy("Password!!").is_err());
        assert!(check_password_policy("Password11").is_err());
    }

    #[test]
    fn policy_accepts_strong_passwords() {
        assert!(check_password_policy("StrongP@ssw0rd!").is_ok());
    }
}
