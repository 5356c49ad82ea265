//! Queue record and shared-secret handling.
//!
//! A queue is the unit of isolation: it scopes tasks and workers and is
//! guarded by a password shared between the experimenter and their workers.
//! Only the salted hash is persisted.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use ulid::Ulid;

use labtasker_core::QueueId;

use crate::error::{Error, Result};

const MAX_NAME_LEN: usize = 100;

/// The persisted queue document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRecord {
    /// Queue identifier.
    pub id: QueueId,
    /// Unique queue name.
    pub name: String,
    /// Salted hash of the queue password. Never the password itself.
    pub password_hash: String,
    /// User-defined tags (JSON object).
    pub metadata: Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub last_modified: DateTime<Utc>,
    /// Optimistic-concurrency tag, bumped on every successful update.
    pub etag: u64,
}

impl QueueRecord {
    /// Builds a new queue with a freshly hashed password.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the name or password fails
    /// validation, or `metadata` is not a JSON object.
    pub fn new(
        name: impl Into<String>,
        password: &str,
        metadata: Value,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let name = name.into();
        validate_queue_name(&name)?;
        validate_password(password)?;
        if !metadata.is_object() {
            return Err(Error::invalid_argument("queue metadata must be a JSON object"));
        }

        Ok(Self {
            id: QueueId::generate(),
            name,
            password_hash: hash_password(password),
            metadata,
            created_at: now,
            last_modified: now,
            etag: 0,
        })
    }

    /// Checks a presented password against the stored hash.
    #[must_use]
    pub fn verify_password(&self, password: &str) -> bool {
        verify_password(password, &self.password_hash)
    }

    /// Replaces the stored password hash.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the new password fails
    /// validation.
    pub fn set_password(&mut self, password: &str) -> Result<()> {
        validate_password(password)?;
        self.password_hash = hash_password(password);
        Ok(())
    }

    /// Stamps a mutation: bumps the etag and refreshes `last_modified`.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_modified = now;
        self.etag += 1;
    }
}

/// Validates a queue name: 1-100 chars of `[a-zA-Z0-9_-]`.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] on violation.
pub fn validate_queue_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::invalid_argument(
            "queue name must be between 1 and 100 characters",
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::invalid_argument(
            "queue name may only contain letters, digits, '_' and '-'",
        ));
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<()> {
    if password.is_empty() || password.len() > MAX_NAME_LEN {
        return Err(Error::invalid_argument(
            "queue password must be between 1 and 100 characters",
        ));
    }
    Ok(())
}

/// Hashes a password with a random salt: `<salt>$<base64(sha256(salt || password))>`.
#[must_use]
pub fn hash_password(password: &str) -> String {
    let salt = Ulid::new().to_string();
    format!("{salt}${}", digest(&salt, password))
}

/// Verifies a password against a stored `salt$digest` hash.
///
/// Comparison is constant-time over the digest bytes so the hash does not
/// leak a prefix through timing.
#[must_use]
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, expected)) = stored.split_once('$') else {
        return false;
    };
    constant_time_eq(digest(salt, password).as_bytes(), expected.as_bytes())
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    BASE64.encode(hasher.finalize())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn password_roundtrip() {
        let queue = QueueRecord::new("exp-1", "hunter2", json!({}), Utc::now()).unwrap();
        assert!(queue.verify_password("hunter2"));
        assert!(!queue.verify_password("hunter3"));
        assert!(!queue.password_hash.contains("hunter2"));
    }

    #[test]
    fn hashes_are_salted() {
        let a = hash_password("same");
        let b = hash_password("same");
        assert_ne!(a, b);
        assert!(verify_password("same", &a));
        assert!(verify_password("same", &b));
    }

    #[test]
    fn set_password_rotates_hash() {
        let mut queue = QueueRecord::new("exp-1", "old", json!({}), Utc::now()).unwrap();
        queue.set_password("new").unwrap();
        assert!(!queue.verify_password("old"));
        assert!(queue.verify_password("new"));
    }

    #[test]
    fn queue_name_validation() {
        assert!(validate_queue_name("exp_2024-a").is_ok());
        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name("has space").is_err());
        assert!(validate_queue_name(&"x".repeat(101)).is_err());
    }

    #[test]
    fn malformed_stored_hash_never_verifies() {
        assert!(!verify_password("anything", "no-separator"));
    }

    #[test]
    fn non_object_metadata_rejected() {
        assert!(QueueRecord::new("q", "pw", json!([1]), Utc::now()).is_err());
    }
}
