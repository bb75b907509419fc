//! Secret hashing and verification using argon2id.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;

use super::AuthError;

/// Hashes a secret with argon2id and a random salt, returning a PHC string.
pub fn hash_secret(secret: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|e| AuthError::Hash(e.to_string()))?;
    Ok(hash.to_string())
}

/// Verifies a secret against a stored PHC string in constant time.
///
/// An unparsable hash is an error; a wrong secret is `Ok(false)`.
pub fn verify_secret(secret: &str, hash: &str) -> Result<bool, AuthError> {
    let parsed = PasswordHash::new(hash).map_err(|e| AuthError::InvalidHash(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(secret.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_secret("0123456789abcdef0123456789abcdef").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_secret("0123456789abcdef0123456789abcdef", &hash).unwrap());
        assert!(!verify_secret("not-the-secret", &hash).unwrap());
    }

    #[test]
    fn test_salts_differ() {
        assert_ne!(hash_secret("same").unwrap(), hash_secret("same").unwrap());
    }

    #[test]
    fn test_malformed_hash_is_error() {
        assert!(matches!(
            verify_secret("anything", "not-a-phc-string"),
            Err(AuthError::InvalidHash(_))
        ));
    }
}
