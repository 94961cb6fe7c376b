//! Cryptographic error types

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The provided key has an invalid length
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length in bytes
        expected: usize,
        /// Actual key length in bytes
        actual: usize,
    },

    /// Requested RSA modulus is below the supported minimum
    #[error("Key size too small: {bits} bits (minimum {minimum})")]
    KeyTooSmall {
        /// Requested modulus size
        bits: usize,
        /// Minimum accepted modulus size
        minimum: usize,
    },

    /// Requested RSA modulus is above the supported maximum
    #[error("Key size too large: {bits} bits (maximum {maximum})")]
    KeyTooLarge {
        /// Requested modulus size
        bits: usize,
        /// Maximum accepted modulus size
        maximum: usize,
    },

    /// Key pair generation failed
    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Wrapping the message key with the recipient's public key failed
    #[error("Key wrapping failed: {0}")]
    KeyWrapFailed(String),

    /// Unwrapping the message key failed (wrong private key or corrupt data)
    #[error("Key unwrapping failed")]
    KeyUnwrapFailed,

    /// Encryption operation failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed - authentication tag mismatch (possibly tampered data)
    #[error("Decryption failed: authentication tag mismatch")]
    DecryptionFailed,

    /// An envelope field is not valid base64 or the envelope is not JSON
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The public key format is invalid
    #[error("Invalid public key format: {0}")]
    InvalidPublicKey(String),

    /// The private key format is invalid
    #[error("Invalid private key format")]
    InvalidPrivateKey,

    /// Decrypted bytes are not UTF-8 text
    #[error("Decrypted payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
