//! Encrypted, TTL-bound credential store.
//!
//! Credentials are sealed with AES-256-GCM and held in memory keyed by
//! session id. Plaintext exists only transiently inside `encrypt`/`decrypt`
//! and is never logged. Expiry is lazy on access, with [`CredentialVault::sweep_expired`]
//! available for periodic maintenance.

use std::collections::HashMap;
use std::time::Duration;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// AES-256 key length in bytes.
const KEY_LEN: usize = 32;

/// AES-GCM nonce length in bytes. The nonce is prepended to each ciphertext.
const NONCE_LEN: usize = 12;

/// Errors from vault construction and sealing operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Key is missing or structurally invalid. Raised at construction only.
    #[error("Invalid vault key: {0}")]
    InvalidKey(String),

    /// Serialization or cipher failure while sealing.
    #[error("Encryption failed: {0}")]
    Encrypt(String),

    /// Ciphertext is malformed, tampered, or undeserializable.
    #[error("Decryption failed: {0}")]
    Decrypt(String),
}

/// Credential payloads the vault can seal.
///
/// The vault itself is agnostic to the payload's internal shape; the
/// extraction adapter decides how to hand it to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    /// Cookie name -> value pairs.
    Cookies { values: HashMap<String, String> },
    /// An opaque cookie-jar blob, already in Netscape format.
    CookieJar { content: String },
}

impl Credentials {
    /// Render as Netscape cookie-file content for engines that read cookie
    /// files. Name/value pairs are written as session cookies under `domain`;
    /// a raw jar is passed through untouched.
    pub fn to_netscape(&self, domain: &str) -> String {
        match self {
            Self::CookieJar { content } => content.clone(),
            Self::Cookies { values } => {
                let mut out = String::from("# Netscape HTTP Cookie File\n");
                for (name, value) in values {
                    out.push_str(&format!("{domain}\tTRUE\t/\tTRUE\t0\t{name}\t{value}\n"));
                }
                out
            }
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Self::Cookies { .. } => "cookies",
            Self::CookieJar { .. } => "cookie_jar",
        }
    }
}

struct CredentialRecord {
    ciphertext: Vec<u8>,
    created_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// In-memory encrypted credential store, keyed by session id.
pub struct CredentialVault {
    cipher: Aes256Gcm,
    records: DashMap<String, CredentialRecord>,
}

impl CredentialVault {
    /// Create a vault from a base64-encoded 256-bit key.
    ///
    /// The key is validated here, not on first use: an empty or structurally
    /// invalid key makes the vault unusable and must surface immediately.
    pub fn new(key_b64: &str) -> Result<Self, VaultError> {
        if key_b64.is_empty() {
            return Err(VaultError::InvalidKey(
                "vault key not configured".to_string(),
            ));
        }

        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(key_b64)
            .map_err(|e| VaultError::InvalidKey(format!("not valid base64: {e}")))?;
        if key_bytes.len() != KEY_LEN {
            return Err(VaultError::InvalidKey(format!(
                "expected {KEY_LEN} bytes, got {}",
                key_bytes.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| VaultError::InvalidKey(e.to_string()))?;

        Ok(Self {
            cipher,
            records: DashMap::new(),
        })
    }

    /// Generate a fresh base64-encoded 256-bit key.
    pub fn generate_key() -> String {
        let bytes: [u8; KEY_LEN] = rand::rng().random();
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    /// Seal a credential payload: serialize, encrypt, prepend the nonce.
    pub fn encrypt(&self, credentials: &Credentials) -> Result<Vec<u8>, VaultError> {
        let plaintext =
            serde_json::to_vec(credentials).map_err(|e| VaultError::Encrypt(e.to_string()))?;

        let nonce: [u8; NONCE_LEN] = rand::rng().random();
        let ciphertext = self
            .cipher
            .encrypt((&nonce).into(), plaintext.as_slice())
            .map_err(|e| VaultError::Encrypt(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a sealed payload. Fails if the ciphertext is truncated, the
    /// authentication tag does not verify, or the plaintext does not parse.
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Credentials, VaultError> {
        if sealed.len() <= NONCE_LEN {
            return Err(VaultError::Decrypt("ciphertext too short".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce: &[u8; NONCE_LEN] = nonce
            .try_into()
            .map_err(|_| VaultError::Decrypt("malformed nonce".to_string()))?;

        let plaintext = self
            .cipher
            .decrypt(nonce.into(), ciphertext)
            .map_err(|_| VaultError::Decrypt("authentication failed".to_string()))?;

        serde_json::from_slice(&plaintext).map_err(|e| VaultError::Decrypt(e.to_string()))
    }

    /// Encrypt and store credentials for a session, overwriting any prior
    /// record. The record expires `ttl` from now.
    pub fn store(
        &self,
        session_id: &str,
        credentials: &Credentials,
        ttl: Duration,
    ) -> Result<(), VaultError> {
        let ciphertext = self.encrypt(credentials)?;
        let now = Utc::now();
        let expires_at = expiry_from(now, ttl);

        self.records.insert(
            session_id.to_string(),
            CredentialRecord {
                ciphertext,
                created_at: now,
                last_accessed: now,
                expires_at,
            },
        );

        info!(
            session_id = %session_id,
            kind = credentials.describe(),
            expires_at = %expires_at,
            "Stored credentials"
        );
        Ok(())
    }

    /// Retrieve and decrypt credentials for a session.
    ///
    /// Returns `Ok(None)` when no record exists or the record has expired
    /// (expired records are deleted on the spot). A tampered record surfaces
    /// as a [`VaultError::Decrypt`] for the caller to classify.
    pub fn retrieve(&self, session_id: &str) -> Result<Option<Credentials>, VaultError> {
        let now = Utc::now();

        let expired = match self.records.get(session_id) {
            None => {
                debug!(session_id = %session_id, "No credentials found");
                return Ok(None);
            }
            Some(record) => now > record.expires_at,
        };
        if expired {
            // Drop the read guard before removing to avoid self-deadlock.
            self.records.remove(session_id);
            info!(session_id = %session_id, "Credentials expired, removed");
            return Ok(None);
        }

        let Some(mut record) = self.records.get_mut(session_id) else {
            return Ok(None);
        };
        let credentials = self.decrypt(&record.ciphertext)?;
        record.last_accessed = now;
        debug!(session_id = %session_id, "Retrieved credentials");
        Ok(Some(credentials))
    }

    /// True if the session has no credentials or they are past expiry.
    pub fn is_expired(&self, session_id: &str) -> bool {
        match self.records.get(session_id) {
            None => true,
            Some(record) => record.expires_at < Utc::now(),
        }
    }

    /// True if the credentials expire within `threshold` (or are absent).
    pub fn needs_refresh(&self, session_id: &str, threshold: Duration) -> bool {
        let Some(record) = self.records.get(session_id) else {
            return true;
        };
        let threshold =
            chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        record.expires_at - Utc::now() < threshold
    }

    /// Delete credentials for a session. Returns true if a record existed.
    pub fn delete(&self, session_id: &str) -> bool {
        let removed = self.records.remove(session_id).is_some();
        if removed {
            info!(session_id = %session_id, "Deleted credentials");
        }
        removed
    }

    /// Remove every expired record. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0usize;
        self.records.retain(|_, record| {
            if record.expires_at < now {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            info!(count = removed, "Swept expired credentials");
        }
        removed
    }

    /// Number of stored credential records, expired or not.
    pub fn session_count(&self) -> usize {
        self.records.len()
    }

    /// Age of the record for diagnostics. `None` when absent.
    pub fn record_age(&self, session_id: &str) -> Option<chrono::Duration> {
        self.records
            .get(session_id)
            .map(|record| Utc::now() - record.created_at)
    }
}

fn expiry_from(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    match chrono::Duration::from_std(ttl) {
        Ok(delta) => now
            .checked_add_signed(delta)
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
        Err(_) => {
            warn!("Credential TTL out of range, treating as never-expiring");
            DateTime::<Utc>::MAX_UTC
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> CredentialVault {
        CredentialVault::new(&CredentialVault::generate_key()).unwrap()
    }

    fn cookie_credentials() -> Credentials {
        let mut values = HashMap::new();
        values.insert("SID".to_string(), "abc123".to_string());
        values.insert("HSID".to_string(), "def456".to_string());
        Credentials::Cookies { values }
    }

    #[test]
    fn test_rejects_bad_keys_at_construction() {
        assert!(matches!(
            CredentialVault::new(""),
            Err(VaultError::InvalidKey(_))
        ));
        assert!(matches!(
            CredentialVault::new("not base64!!!"),
            Err(VaultError::InvalidKey(_))
        ));
        // Valid base64, wrong length.
        let short = base64::engine::general_purpose::STANDARD.encode([0u8; 16]);
        assert!(matches!(
            CredentialVault::new(&short),
            Err(VaultError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let vault = test_vault();
        let credentials = cookie_credentials();

        let sealed = vault.encrypt(&credentials).unwrap();
        assert_ne!(sealed.len(), 0);
        let opened = vault.decrypt(&sealed).unwrap();
        assert_eq!(opened, credentials);
    }

    #[test]
    fn test_cookie_jar_round_trip() {
        let vault = test_vault();
        let credentials = Credentials::CookieJar {
            content: "# Netscape HTTP Cookie File\n.example.com\tTRUE\t/\tTRUE\t0\tSID\tv\n"
                .to_string(),
        };
        let sealed = vault.encrypt(&credentials).unwrap();
        assert_eq!(vault.decrypt(&sealed).unwrap(), credentials);
    }

    #[test]
    fn test_tampered_ciphertext_fails_closed() {
        let vault = test_vault();
        let mut sealed = vault.encrypt(&cookie_credentials()).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(
            vault.decrypt(&sealed),
            Err(VaultError::Decrypt(_))
        ));
    }

    #[test]
    fn test_truncated_ciphertext_fails_closed() {
        let vault = test_vault();
        assert!(vault.decrypt(&[]).is_err());
        assert!(vault.decrypt(&[0u8; NONCE_LEN]).is_err());
    }

    #[test]
    fn test_decrypt_with_different_key_fails() {
        let vault_a = test_vault();
        let vault_b = test_vault();
        let sealed = vault_a.encrypt(&cookie_credentials()).unwrap();
        assert!(vault_b.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_store_retrieve_updates_access_time() {
        let vault = test_vault();
        vault
            .store("session-1", &cookie_credentials(), Duration::from_secs(3600))
            .unwrap();

        let retrieved = vault.retrieve("session-1").unwrap();
        assert_eq!(retrieved, Some(cookie_credentials()));
        assert!(!vault.is_expired("session-1"));
    }

    #[test]
    fn test_retrieve_unknown_session() {
        let vault = test_vault();
        assert_eq!(vault.retrieve("nope").unwrap(), None);
        assert!(vault.is_expired("nope"));
    }

    #[test]
    fn test_expired_record_removed_on_retrieve() {
        let vault = test_vault();
        vault
            .store("session-1", &cookie_credentials(), Duration::ZERO)
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(vault.retrieve("session-1").unwrap(), None);
        assert_eq!(vault.session_count(), 0);
        assert!(vault.is_expired("session-1"));
    }

    #[test]
    fn test_store_overwrites_prior_record() {
        let vault = test_vault();
        vault
            .store("session-1", &cookie_credentials(), Duration::from_secs(3600))
            .unwrap();
        let replacement = Credentials::CookieJar {
            content: "replaced".to_string(),
        };
        vault
            .store("session-1", &replacement, Duration::from_secs(3600))
            .unwrap();

        assert_eq!(vault.retrieve("session-1").unwrap(), Some(replacement));
        assert_eq!(vault.session_count(), 1);
    }

    #[test]
    fn test_needs_refresh_threshold() {
        let vault = test_vault();

        // Absent sessions always need refresh.
        assert!(vault.needs_refresh("absent", Duration::from_secs(6 * 3600)));

        vault
            .store("short", &cookie_credentials(), Duration::from_secs(2 * 3600))
            .unwrap();
        assert!(vault.needs_refresh("short", Duration::from_secs(6 * 3600)));

        vault
            .store("long", &cookie_credentials(), Duration::from_secs(10 * 3600))
            .unwrap();
        assert!(!vault.needs_refresh("long", Duration::from_secs(6 * 3600)));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let vault = test_vault();
        vault
            .store("session-1", &cookie_credentials(), Duration::from_secs(3600))
            .unwrap();
        assert!(vault.delete("session-1"));
        assert!(!vault.delete("session-1"));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let vault = test_vault();
        vault
            .store("gone", &cookie_credentials(), Duration::ZERO)
            .unwrap();
        vault
            .store("kept", &cookie_credentials(), Duration::from_secs(3600))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(vault.sweep_expired(), 1);
        assert_eq!(vault.session_count(), 1);
        assert!(vault.retrieve("kept").unwrap().is_some());
    }

    #[test]
    fn test_netscape_rendering() {
        let mut values = HashMap::new();
        values.insert("SID".to_string(), "abc".to_string());
        let cookies = Credentials::Cookies { values };
        let rendered = cookies.to_netscape(".youtube.com");
        assert!(rendered.starts_with("# Netscape HTTP Cookie File\n"));
        assert!(rendered.contains(".youtube.com\tTRUE\t/\tTRUE\t0\tSID\tabc"));

        let jar = Credentials::CookieJar {
            content: "raw".to_string(),
        };
        assert_eq!(jar.to_netscape(".ignored.com"), "raw");
    }
}
