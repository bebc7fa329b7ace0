//! Symmetric encryption for session cookies.
//!
//! The codec only depends on the [`Cipher`] trait. [`AesGcmCipher`] is the
//! bundled implementation: AES-256-GCM with a fresh random 96-bit nonce per
//! call, laid out as `nonce || ciphertext || tag`.
//!
//! # Example
//!
//! ```rust
//! use gatekeeper_session::cipher::{AesGcmCipher, Cipher};
//!
//! let cipher = AesGcmCipher::from_secret("0123456789abcdefghijklmnopqrstuv").unwrap();
//! let sealed = cipher.encrypt(b"user@example.com").unwrap();
//! assert_eq!(cipher.decrypt(&sealed).unwrap(), b"user@example.com");
//! ```

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::Rng;
use thiserror::Error;
use zeroize::Zeroize;

/// Length of the AES-256 key.
pub const KEY_LENGTH: usize = 32;

/// Length of the GCM nonce prepended to every ciphertext.
const NONCE_LENGTH: usize = 12;

/// Length of the GCM authentication tag.
const TAG_LENGTH: usize = 16;

/// Errors raised by a [`Cipher`].
///
/// Messages are deliberately generic: they never carry key material or
/// details of why authentication failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The secret does not yield a usable key.
    #[error("invalid cipher key: {0}")]
    InvalidKey(String),

    /// Encryption failed.
    #[error("encryption failed")]
    Encrypt,

    /// The ciphertext is truncated, tampered with, or sealed under another key.
    #[error("decryption failed")]
    Decrypt,
}

/// Symmetric encrypt/decrypt primitive consumed by the session codec.
///
/// Implementations own nonce management; callers never supply one.
pub trait Cipher: Send + Sync {
    /// Seals `plaintext`.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Opens a value produced by [`Cipher::encrypt`] under the same key.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// AES-256-GCM cipher.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    /// Creates a cipher from raw key bytes.
    pub fn new(key: [u8; KEY_LENGTH]) -> Self {
        let mut key = key;
        let cipher = Aes256Gcm::new((&key).into());
        key.zeroize();
        Self { cipher }
    }

    /// Creates a cipher from a configured cookie secret.
    ///
    /// The secret is accepted either as exactly 32 raw bytes or as standard
    /// or URL-safe base64 (padded or not) decoding to 32 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] when no interpretation yields a
    /// 32-byte key.
    pub fn from_secret(secret: &str) -> Result<Self, CryptoError> {
        let secret = secret.trim();

        if secret.len() == KEY_LENGTH {
            let mut key = [0u8; KEY_LENGTH];
            key.copy_from_slice(secret.as_bytes());
            return Ok(Self::new(key));
        }

        let candidates = [
            STANDARD.decode(secret).ok(),
            URL_SAFE.decode(secret).ok(),
            STANDARD_NO_PAD.decode(secret).ok(),
            URL_SAFE_NO_PAD.decode(secret).ok(),
        ];

        for mut candidate in candidates.into_iter().flatten() {
            if candidate.len() == KEY_LENGTH {
                let mut key = [0u8; KEY_LENGTH];
                key.copy_from_slice(&candidate);
                candidate.zeroize();
                return Ok(Self::new(key));
            }
            candidate.zeroize();
        }

        Err(CryptoError::InvalidKey(format!(
            "secret must be {KEY_LENGTH} bytes, or base64 encoding {KEY_LENGTH} bytes"
        )))
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LENGTH];
        rand::rng().fill(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LENGTH + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < NONCE_LENGTH + TAG_LENGTH {
            return Err(CryptoError::Decrypt);
        }

        let (nonce, sealed) = ciphertext.split_at(NONCE_LENGTH);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::Decrypt)
    }
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher").finish_non_exhaustive()
    }
}
