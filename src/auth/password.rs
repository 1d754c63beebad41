//! Password hashing
//!
//! User passwords are stored as Argon2 PHC strings
//! (`$argon2id$v=19$m=...,t=...,p=...$salt$hash`).

use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use tracing::warn;

use crate::error::{Error, Result};

/// Hash a password with a fresh random salt
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::encode_b64(uuid::Uuid::new_v4().as_bytes())
        .map_err(|e| Error::Internal(format!("salt encoding failed: {e}")))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| Error::Internal(format!("password hashing failed: {e}")))?;
    Ok(hash.to_string())
}

/// Check a password against a stored PHC string; malformed hashes never match
pub fn verify_password(password: &str, phc: &str) -> bool {
    PasswordHash::new(phc)
        .and_then(|parsed| Argon2::default().verify_password(password.as_bytes(), &parsed))
        .is_ok()
}

/// [`verify_password`] on the blocking pool, off the async workers
pub async fn verify_password_blocking(password: String, phc: String) -> bool {
    match tokio::task::spawn_blocking(move || verify_password(&password, &phc)).await {
        Ok(verified) => verified,
        Err(e) => {
            warn!(error = %e, "Password verification task failed");
            false
        }
    }
}

/// Reject strings that are not parseable PHC hashes
pub fn validate_hash(phc: &str) -> Result<()> {
    PasswordHash::new(phc)
        .map(|_| ())
        .map_err(|e| Error::Config(format!("invalid password hash: {e}")))
}
