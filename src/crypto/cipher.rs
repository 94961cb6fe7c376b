//! ChaCha20-Poly1305 AEAD Encryption
//!
//! The symmetric half of the hybrid scheme. Every message gets its own
//! key and nonce, so nonce reuse under one key cannot happen through
//! [`Cipher::encrypt`].

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use zeroize::Zeroizing;

use super::error::{CryptoError, CryptoResult};

/// Size of the encryption key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Output of a single encryption: the nonce travels next to the ciphertext
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sealed {
    /// Random nonce used for this ciphertext
    pub nonce: [u8; NONCE_SIZE],
    /// ciphertext || tag
    pub ciphertext: Vec<u8>,
}

/// Symmetric cipher for encryption/decryption
pub struct Cipher;

impl Cipher {
    /// Generate a fresh random message key
    pub fn generate_key() -> Zeroizing<[u8; KEY_SIZE]> {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        rand::thread_rng().fill_bytes(key.as_mut_slice());
        key
    }

    /// Encrypt data under a random nonce
    pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> CryptoResult<Sealed> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = Self::encrypt_with_nonce(key, &nonce, plaintext)?;
        Ok(Sealed { nonce, ciphertext })
    }

    /// Encrypt with a specific nonce
    ///
    /// WARNING: Using the same nonce twice with the same key is catastrophic!
    pub fn encrypt_with_nonce(
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(key.into());
        cipher
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }

    /// Decrypt and verify data
    pub fn decrypt(key: &[u8; KEY_SIZE], nonce: &[u8], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        if nonce.len() != NONCE_SIZE || ciphertext.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let cipher = ChaCha20Poly1305::new(key.into());
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
