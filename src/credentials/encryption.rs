//! AES-256-GCM encryption boundary for credential secrets.
//!
//! Every secret that reaches the database passes through [`Cipher::encrypt`].
//! The stored form is `base64(nonce || ciphertext)`, so a single column holds
//! everything needed to decrypt one value.

use crate::error::CryptoError;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::fmt;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
pub const NONCE_SIZE: usize = 12;

const SELF_TEST_PLAINTEXT: &str = "tokenkeeper-self-test";

/// Symmetric cipher bound to one master key.
///
/// Construction validates the key and runs a round-trip self-test, so a
/// `Cipher` that exists is known to work. A bad key is a configuration error
/// and should stop the process before it accepts traffic.
pub struct Cipher {
    inner: Aes256Gcm,
}

impl Cipher {
    /// Builds a cipher from a base64-encoded 32-byte master key.
    ///
    /// # Returns
    /// * `Ok(Cipher)` - Key is valid and the self-test passed
    /// * `Err(CryptoError::Configuration)` - Bad base64, wrong length, or self-test failure
    pub fn from_base64_key(key_base64: &str) -> Result<Self, CryptoError> {
        let key_bytes = BASE64.decode(key_base64.trim()).map_err(|e| {
            CryptoError::Configuration(format!("failed to decode base64 encryption key: {e}"))
        })?;

        if key_bytes.len() != KEY_SIZE {
            return Err(CryptoError::Configuration(format!(
                "encryption key must be {} bytes (256 bits), got {} bytes",
                KEY_SIZE,
                key_bytes.len()
            )));
        }

        let inner = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| CryptoError::Configuration(format!("failed to create cipher: {e}")))?;

        let cipher = Self { inner };
        cipher.self_test()?;
        Ok(cipher)
    }

    /// Generates a fresh random master key, base64-encoded.
    pub fn generate_key() -> String {
        let key = Aes256Gcm::generate_key(OsRng);
        BASE64.encode(key)
    }

    /// Encrypts a secret with a random nonce.
    ///
    /// # Security
    /// - Nonce is never reused: each call draws from the OS RNG
    /// - Authenticated encryption, so tampering is detected on decrypt
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .inner
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError::Configuration(format!("encryption failed: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(sealed))
    }

    /// Decrypts a value produced by [`Cipher::encrypt`].
    ///
    /// Any failure (bad base64, truncated input, wrong key, tampering,
    /// non-UTF-8 plaintext) is reported as `CorruptedSecret`. It is local to
    /// the one value and never a reason to stop the process.
    pub fn decrypt(&self, sealed: &str) -> Result<String, CryptoError> {
        let bytes = BASE64
            .decode(sealed)
            .map_err(|_| CryptoError::CorruptedSecret)?;

        if bytes.len() <= NONCE_SIZE {
            return Err(CryptoError::CorruptedSecret);
        }

        let (nonce, ciphertext) = bytes.split_at(NONCE_SIZE);
        let plaintext = self
            .inner
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::CorruptedSecret)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::CorruptedSecret)
    }

    /// Round-trips a fixed value through the cipher.
    pub fn self_test(&self) -> Result<(), CryptoError> {
        let sealed = self.encrypt(SELF_TEST_PLAINTEXT)?;
        match self.decrypt(&sealed) {
            Ok(plain) if plain == SELF_TEST_PLAINTEXT => Ok(()),
            _ => Err(CryptoError::Configuration(
                "encryption self-test failed".to_string(),
            )),
        }
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}
