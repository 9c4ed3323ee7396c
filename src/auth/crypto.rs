//! Token generation, hashing, and password hashing helpers.

use anyhow::{Context, Result, anyhow};
use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng as SaltRng},
};
use once_cell::sync::Lazy;
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Bytes of entropy in every reset, refresh, and CSRF token.
pub const TOKEN_BYTES: usize = 32;

// Verified against when an account does not exist so both paths pay the argon2 cost.
static DUMMY_PASSWORD_HASH: Lazy<Option<String>> =
    Lazy::new(|| hash_password("custodia-dummy-password").ok());

/// Create a 256-bit random token, hex encoded.
///
/// # Errors
/// Returns an error if the OS random source fails.
pub fn generate_token() -> Result<String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate random token")?;
    Ok(hex::encode(bytes))
}

/// Hash a token so raw values never touch the datastore.
#[must_use]
pub fn hash_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Hash a password into an argon2id PHC string.
///
/// # Errors
/// Returns an error if hashing fails.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut SaltRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| anyhow!("failed to hash password: {err}"))
}

/// Verify a password against a stored PHC string. Malformed hashes never verify.
#[must_use]
pub fn verify_password(password: &str, password_hash: &str) -> bool {
    PasswordHash::new(password_hash).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
}

/// Burn the same work as a real verification when there is no account to check.
pub fn verify_dummy_password(password: &str) {
    if let Some(hash) = DUMMY_PASSWORD_HASH.as_deref() {
        let _ = verify_password(password, hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn generate_token_is_256_bit_hex() -> Result<()> {
        let token = generate_token()?;
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token()?);
        Ok(())
    }

    #[test]
    fn hash_token_stable() {
        let first = hash_token("token");
        let second = hash_token("token");
        let different = hash_token("other");
        assert_eq!(first, second);
        assert_ne!(first, different);
        assert_eq!(first.len(), 32);
    }

    #[test]
    fn constant_time_eq_compares_bytes() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn password_hash_verifies() -> Result<()> {
        let hash = hash_password("Correct-Horse-42!")?;
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("Correct-Horse-42!", &hash));
        assert!(!verify_password("wrong", &hash));
        assert!(!verify_password("Correct-Horse-42!", "not-a-phc-string"));
        Ok(())
    }
}
