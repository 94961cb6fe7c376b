//! Cryptographic primitives for Whisperline
//!
//! This module provides all the cryptographic building blocks:
//! - `identity`: RSA identity key pairs and their JWK encoding
//! - `cipher`: ChaCha20-Poly1305 AEAD encryption
//! - `engine`: hybrid envelope encryption built from the two above
//! - `hash`: BLAKE3 key fingerprints

pub mod cipher;
pub mod engine;
pub mod error;
pub mod hash;
pub mod identity;

// Re-export commonly used types
pub use cipher::Cipher;
pub use engine::{CryptoEngine, Decrypted, EncryptedEnvelope, UNDECRYPTABLE_PLACEHOLDER};
pub use error::{CryptoError, CryptoResult};
pub use hash::Hash;
pub use identity::{check_key_bits, Jwk, KeyPair, PrivateKey, PublicKey, DEFAULT_KEY_BITS, MAX_KEY_BITS, MIN_KEY_BITS};


#[cfg(test)]
mod integration_tests {
    use super::*;

    #[test]
    fn test_full_encryption_flow() {
        let engine = CryptoEngine::new();
        let alice = fixtures::alice();
        let bob = fixtures::bob();

        // Alice encrypts for Bob and for herself
        let to_bob = engine.encrypt("Hello, Bob! This is a secret.", bob.public_key()).unwrap();
        let to_self = engine.encrypt("Hello, Bob! This is a secret.", alice.public_key()).unwrap();

        // Each copy opens only with its own private key
        assert_eq!(
            engine.try_decrypt(&to_bob, bob.private_key()).unwrap(),
            "Hello, Bob! This is a secret."
        );
        assert_eq!(
            engine.try_decrypt(&to_self, alice.private_key()).unwrap(),
            "Hello, Bob! This is a secret."
        );
        assert!(engine.try_decrypt(&to_bob, alice.private_key()).is_err());
    }

    #[test]
    fn test_envelope_survives_transport_encoding() {
        let engine = CryptoEngine::new();
        let bob = fixtures::bob();

        let json = engine.encrypt("over the wire", bob.public_key()).unwrap().to_json().unwrap();
        let envelope = EncryptedEnvelope::from_json(&json).unwrap();

        assert_eq!(engine.decrypt(&envelope, bob.private_key()), Decrypted::Plaintext("over the wire".into()));
    }
}
