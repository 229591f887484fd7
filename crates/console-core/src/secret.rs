//! Shared symmetric key material for the token codec.
//!
//! The key and IV can be replaced at runtime (key rotation), so handlers read
//! them through a [`SecretCell`] instead of holding a copy.

use crate::codec;
use crate::error::ConsoleResult;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A base64url key/IV pair.
///
/// Deserializes from the key-rotation body
/// `{"base64EncodedKeyBytes": "...", "base64EncodedIvBytes": "..."}`.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EncryptorSecret {
    #[serde(rename = "base64EncodedKeyBytes")]
    pub key: String,
    #[serde(rename = "base64EncodedIvBytes")]
    pub iv: String,
}

impl EncryptorSecret {
    pub fn new(key: impl Into<String>, iv: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            iv: iv.into(),
        }
    }

    /// Whether both halves have been provided.
    pub fn is_set(&self) -> bool {
        !self.key.is_empty() && !self.iv.is_empty()
    }

    /// Check that the key and IV decode and have usable lengths.
    pub fn check(&self) -> ConsoleResult<()> {
        codec::check_secret(&self.key, &self.iv)
    }
}

impl fmt::Debug for EncryptorSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptorSecret")
            .field("set", &self.is_set())
            .finish()
    }
}

/// Read-mostly shared cell holding the current [`EncryptorSecret`].
#[derive(Clone, Default)]
pub struct SecretCell {
    inner: Arc<RwLock<EncryptorSecret>>,
}

impl SecretCell {
    pub fn new(secret: EncryptorSecret) -> Self {
        Self {
            inner: Arc::new(RwLock::new(secret)),
        }
    }

    /// Snapshot of the current secret.
    pub async fn get(&self) -> EncryptorSecret {
        self.inner.read().await.clone()
    }

    /// Replace the secret for all subsequent encrypt/decrypt calls.
    pub async fn set(&self, secret: EncryptorSecret) {
        *self.inner.write().await = secret;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rotation_body() {
        let s: EncryptorSecret = serde_json::from_str(
            r#"{"base64EncodedKeyBytes":"kV9Ld-X4rKlTQF4ZJwyn9A","base64EncodedIvBytes":"PCb_WQYrUgbahQeqDEkuUw"}"#,
        )
        .unwrap();
        assert_eq!(s.key, "kV9Ld-X4rKlTQF4ZJwyn9A");
        assert_eq!(s.iv, "PCb_WQYrUgbahQeqDEkuUw");
        assert!(s.is_set());
        assert!(s.check().is_ok());
    }

    #[test]
    fn debug_hides_key() {
        let s = EncryptorSecret::new("kV9Ld-X4rKlTQF4ZJwyn9A", "PCb_WQYrUgbahQeqDEkuUw");
        assert!(!format!("{s:?}").contains("kV9Ld"));
    }

    #[tokio::test]
    async fn set_replaces_for_later_readers() {
        let cell = SecretCell::default();
        assert!(!cell.get().await.is_set());

        let reader = cell.clone();
        cell.set(EncryptorSecret::new("a", "b")).await;
        assert_eq!(reader.get().await, EncryptorSecret::new("a", "b"));
    }
}
