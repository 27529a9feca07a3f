//! Key provider
//!
//! Resolves the single 256-bit dataset key from an external source (an
//! environment variable or a secret file) once, and keeps it in memory for
//! the life of the provider. Key bytes are zeroized on drop and never appear
//! in `Debug` output, logs or error messages. Only the non-secret
//! fingerprint ([`EncryptionKey::key_id`]) may be logged.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::KeyConfig;
use crate::error::{KeyError, KeyResult};

/// Key length required by AES-256-GCM
pub const KEY_LEN: usize = 32;

/// Length of the hex-encoded key
pub const KEY_HEX_LEN: usize = KEY_LEN * 2;

/// Symmetric key material
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_LEN],
}

impl EncryptionKey {
    /// Build a key from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> KeyResult<Self> {
        if bytes.len() != KEY_LEN {
            return Err(KeyError::FormatInvalid {
                reason: format!("expected {} bytes, got {}", KEY_LEN, bytes.len()),
            });
        }

        let mut key = Self { bytes: [0u8; KEY_LEN] };
        key.bytes.copy_from_slice(bytes);
        Ok(key)
    }

    /// Build a key from its hex encoding; surrounding whitespace is ignored
    pub fn from_hex(encoded: &str) -> KeyResult<Self> {
        let encoded = encoded.trim();
        if encoded.len() != KEY_HEX_LEN {
            return Err(KeyError::FormatInvalid {
                reason: format!("expected {} hex characters ({} bytes)", KEY_HEX_LEN, KEY_LEN),
            });
        }

        let mut key = Self { bytes: [0u8; KEY_LEN] };
        hex::decode_to_slice(encoded, &mut key.bytes)
            .map_err(|_| KeyError::FormatInvalid { reason: "not valid hexadecimal".to_string() })?;
        Ok(key)
    }

    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut key = Self { bytes: [0u8; KEY_LEN] };
        OsRng.fill_bytes(&mut key.bytes);
        key
    }

    /// Non-secret fingerprint: first 8 bytes of the BLAKE3 hash, hex encoded
    pub fn key_id(&self) -> String {
        let digest = blake3::hash(&self.bytes);
        hex::encode(&digest.as_bytes()[..8])
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("key_id", &self.key_id())
            .finish_non_exhaustive()
    }
}

/// Generate a new key and return its hex encoding, for operators
/// provisioning the key source
pub fn generate_key_hex() -> Zeroizing<String> {
    let key = EncryptionKey::generate();
    Zeroizing::new(hex::encode(key.as_bytes()))
}

/// Where the key comes from
#[derive(Clone)]
pub enum KeySource {
    /// Environment variable holding the hex-encoded key
    Env(String),

    /// Secret file holding the hex-encoded key
    File(PathBuf),

    /// Key injected directly by the caller
    Static(Arc<EncryptionKey>),
}

impl KeySource {
    /// Human-readable name of the source, safe to log
    pub fn name(&self) -> String {
        match self {
            KeySource::Env(var) => format!("environment variable {}", var),
            KeySource::File(path) => format!("secret file {}", path.display()),
            KeySource::Static(_) => "injected key".to_string(),
        }
    }

    fn read(&self) -> KeyResult<Arc<EncryptionKey>> {
        match self {
            KeySource::Env(var) => {
                let value = match std::env::var(var) {
                    Ok(value) => Zeroizing::new(value),
                    Err(std::env::VarError::NotPresent) => {
                        return Err(KeyError::Unavailable { source_name: self.name() });
                    }
                    Err(std::env::VarError::NotUnicode(_)) => {
                        return Err(KeyError::FormatInvalid { reason: "not valid unicode".to_string() });
                    }
                };
                Self::decode(self, &value)
            }
            KeySource::File(path) => {
                let value = std::fs::read_to_string(path)
                    .map(Zeroizing::new)
                    .map_err(|_| KeyError::Unavailable { source_name: self.name() })?;
                Self::decode(self, &value)
            }
            KeySource::Static(key) => Ok(key.clone()),
        }
    }

    fn decode(&self, value: &str) -> KeyResult<Arc<EncryptionKey>> {
        if value.trim().is_empty() {
            return Err(KeyError::Unavailable { source_name: self.name() });
        }
        EncryptionKey::from_hex(value).map(Arc::new)
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Resolve-once holder of the dataset key
///
/// Constructed explicitly and shared by `Arc`; the first call to
/// [`KeyProvider::resolve_key`] reads the source and the outcome (key or
/// error) is cached for the provider's lifetime.
#[derive(Debug)]
pub struct KeyProvider {
    source: KeySource,
    resolved: OnceLock<KeyResult<Arc<EncryptionKey>>>,
}

impl KeyProvider {
    /// Create a provider over a source; nothing is read yet
    pub fn new(source: KeySource) -> Self {
        Self {
            source,
            resolved: OnceLock::new(),
        }
    }

    /// Create a provider from configuration; a secret file wins over the
    /// environment variable
    pub fn from_config(config: &KeyConfig) -> Self {
        let source = match &config.secret_file {
            Some(path) => KeySource::File(path.clone()),
            None => KeySource::Env(config.env_var.clone()),
        };
        Self::new(source)
    }

    /// Create a provider around an already materialised key
    pub fn with_key(key: EncryptionKey) -> Self {
        Self::new(KeySource::Static(Arc::new(key)))
    }

    /// Resolve the key, reading the source on first use only
    pub fn resolve_key(&self) -> KeyResult<Arc<EncryptionKey>> {
        self.resolved
            .get_or_init(|| {
                let outcome = self.source.read();
                match &outcome {
                    Ok(key) => tracing::info!(source = %self.source.name(), key_id = %key.key_id(), "Resolved encryption key"),
                    Err(e) => tracing::error!(source = %self.source.name(), "Encryption key resolution failed: {}", e),
                }
                outcome
            })
            .clone()
    }

    /// Fingerprint of the resolved key, if resolution succeeded
    pub fn key_id(&self) -> Option<String> {
        match self.resolved.get() {
            Some(Ok(key)) => Some(key.key_id()),
            _ => None,
        }
    }

    /// Source description, safe to log
    pub fn source_name(&self) -> String {
        self.source.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_key_from_hex() {
        let key = EncryptionKey::from_hex(&format!("  {}\n", KEY_HEX)).unwrap();
        assert_eq!(key.as_bytes()[31], 0x1f);
        assert_eq!(key.key_id().len(), 16);
    }

    #[test]
    fn test_key_format_invalid() {
        assert!(matches!(EncryptionKey::from_hex("abcd"), Err(KeyError::FormatInvalid { .. })));

        let not_hex = "zz".repeat(KEY_LEN);
        assert!(matches!(EncryptionKey::from_hex(&not_hex), Err(KeyError::FormatInvalid { .. })));

        assert!(matches!(EncryptionKey::from_bytes(&[0u8; 16]), Err(KeyError::FormatInvalid { .. })));
    }

    #[test]
    fn test_debug_never_prints_key_bytes() {
        let key = EncryptionKey::from_hex(KEY_HEX).unwrap();
        let rendered = format!("{:?}", key);
        assert!(!rendered.contains(KEY_HEX));
        assert!(rendered.contains(&key.key_id()));
    }

    #[test]
    fn test_env_source_missing() {
        let provider = KeyProvider::new(KeySource::Env("BOTICA_TEST_KEY_MISSING_7F3A".to_string()));
        let result = provider.resolve_key();
        assert!(matches!(result, Err(KeyError::Unavailable { .. })));
        assert!(provider.key_id().is_none());
    }

    #[test]
    fn test_env_source_resolves_once() {
        let var = "BOTICA_TEST_KEY_RESOLVE_ONCE";
        std::env::set_var(var, KEY_HEX);
        let provider = KeyProvider::new(KeySource::Env(var.to_string()));

        let first = provider.resolve_key().unwrap();
        std::env::set_var(var, &*generate_key_hex());
        let second = provider.resolve_key().unwrap();
        std::env::remove_var(var);

        assert_eq!(first.key_id(), second.key_id());
        assert_eq!(provider.key_id(), Some(first.key_id()));
    }

    #[test]
    fn test_file_source() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), format!("{}\n", KEY_HEX)).unwrap();

        let config = KeyConfig {
            env_var: "BOTICA_TEST_KEY_UNUSED".to_string(),
            secret_file: Some(file.path().to_path_buf()),
        };
        let provider = KeyProvider::from_config(&config);
        let key = provider.resolve_key().unwrap();
        assert_eq!(key.key_id(), EncryptionKey::from_hex(KEY_HEX).unwrap().key_id());
    }

    #[test]
    fn test_error_message_never_contains_value() {
        let var = "BOTICA_TEST_KEY_SHORT";
        std::env::set_var(var, "deadbeefcafe");
        let provider = KeyProvider::new(KeySource::Env(var.to_string()));
        let error = provider.resolve_key().unwrap_err();
        std::env::remove_var(var);

        assert!(matches!(error, KeyError::FormatInvalid { .. }));
        assert!(!error.to_string().contains("deadbeefcafe"));
    }

    #[test]
    fn test_generated_keys_differ() {
        let a = generate_key_hex();
        let b = generate_key_hex();
        assert_eq!(a.len(), KEY_HEX_LEN);
        assert_ne!(*a, *b);
    }
}
