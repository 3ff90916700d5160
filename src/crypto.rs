//! Cryptographic primitives for WolfLink
//!
//! Every datagram body, control or data, is sealed with ChaCha20-Poly1305
//! under a single pre-shared key. The sealed blob carries its own nonce:
//!
//! ```text
//! [12: nonce] [N: ciphertext] [16: tag]
//! ```
//!
//! There is no key exchange and no replay window; a fresh random nonce is
//! drawn for every message.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use tracing::info;

use crate::error::{Error, Result};

/// Key length in bytes
pub const KEY_LEN: usize = 32;
/// Nonce length in bytes
pub const NONCE_LEN: usize = 12;
/// Poly1305 tag length in bytes
pub const TAG_LEN: usize = 16;

/// Pre-shared key the stock servers are provisioned with
/// (`KGiEbfJODclOCzUVfWXBO7Y/ohnEVxf7+RnwaAA1/78=`)
const BUILTIN_KEY: [u8; KEY_LEN] = [
    0x28, 0x68, 0x84, 0x6d, 0xf2, 0x4e, 0x0d, 0xc9, 0x4e, 0x0b, 0x35, 0x15, 0x7d, 0x65, 0xc1, 0x3b,
    0xb6, 0x3f, 0xa2, 0x19, 0xc4, 0x57, 0x17, 0xfb, 0xf9, 0x19, 0xf0, 0x68, 0x00, 0x35, 0xff, 0xbf,
];

/// A 32-byte pre-shared symmetric key
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a new random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// The key shared with the stock servers
    pub fn builtin() -> Self {
        Self(BUILTIN_KEY)
    }

    /// Parse a base64-encoded key
    pub fn from_base64(b64: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(b64.trim())
            .map_err(|e| Error::ConfigurationInvalid(format!("key is not valid base64: {}", e)))?;
        if bytes.len() != KEY_LEN {
            return Err(Error::ConfigurationInvalid(format!(
                "invalid key length: {} (expected {})",
                bytes.len(),
                KEY_LEN
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }

    /// Encode the key as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Load a key from a file (32 bytes, base64 encoded)
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_base64(&content)
    }

    /// Save the key to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_base64())?;
        // Restrict permissions (owner-only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        info!("Pre-shared key saved to {:?}", path);
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Authenticated cipher bound to one pre-shared key
#[derive(Clone)]
pub struct Cipher {
    aead: ChaCha20Poly1305,
}

impl Cipher {
    pub fn new(key: &SymmetricKey) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(key.as_bytes())),
        }
    }

    /// Seal `plaintext`, returning `nonce || ciphertext || tag`
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = self
            .aead
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::CryptoFailure)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&sealed);
        Ok(blob)
    }

    /// Open a blob produced by [`Cipher::encrypt`]
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::CryptoFailure);
        }
        let (nonce_bytes, sealed) = blob.split_at(NONCE_LEN);
        self.aead
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| Error::CryptoFailure)
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cipher(ChaCha20Poly1305)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = Cipher::new(&SymmetricKey::generate());
        let blob = cipher.encrypt(b"hello tunnel").unwrap();
        assert_eq!(blob.len(), NONCE_LEN + b"hello tunnel".len() + TAG_LEN);
        assert_eq!(cipher.decrypt(&blob).unwrap(), b"hello tunnel");
    }

    #[test]
    fn test_fresh_nonce_per_message() {
        let cipher = Cipher::new(&SymmetricKey::builtin());
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = Cipher::new(&SymmetricKey::generate()).encrypt(b"secret").unwrap();
        let other = Cipher::new(&SymmetricKey::generate());
        assert!(matches!(other.decrypt(&sealed), Err(Error::CryptoFailure)));
    }

    #[test]
    fn test_tampered_blob_fails() {
        let cipher = Cipher::new(&SymmetricKey::builtin());
        let mut blob = cipher.encrypt(b"payload").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(cipher.decrypt(&blob), Err(Error::CryptoFailure)));

        blob[last] ^= 0x01;
        blob[NONCE_LEN] ^= 0x80;
        assert!(matches!(cipher.decrypt(&blob), Err(Error::CryptoFailure)));
    }

    #[test]
    fn test_short_blob_fails() {
        let cipher = Cipher::new(&SymmetricKey::builtin());
        assert!(matches!(cipher.decrypt(&[]), Err(Error::CryptoFailure)));
        assert!(matches!(
            cipher.decrypt(&[0u8; NONCE_LEN + TAG_LEN - 1]),
            Err(Error::CryptoFailure)
        ));
    }

    #[test]
    fn test_empty_plaintext() {
        let cipher = Cipher::new(&SymmetricKey::builtin());
        let blob = cipher.encrypt(&[]).unwrap();
        assert_eq!(blob.len(), NONCE_LEN + TAG_LEN);
        assert!(cipher.decrypt(&blob).unwrap().is_empty());
    }

    #[test]
    fn test_builtin_key() {
        let key = SymmetricKey::builtin();
        assert_eq!(key.to_base64(), "KGiEbfJODclOCzUVfWXBO7Y/ohnEVxf7+RnwaAA1/78=");
    }

    #[test]
    fn test_key_base64_errors() {
        assert!(SymmetricKey::from_base64("not base64!!").is_err());
        assert!(SymmetricKey::from_base64("AAAA").is_err());
    }

    #[test]
    fn test_key_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("psk.key");
        let key = SymmetricKey::generate();
        key.save(&path).unwrap();
        assert_eq!(SymmetricKey::load(&path).unwrap(), key);
    }
}
