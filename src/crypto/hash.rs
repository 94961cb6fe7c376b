//! BLAKE3 hashing for key fingerprints
//!
//! Fingerprints are what the rest of the crate logs and displays in place
//! of key material.

/// Size of a hash output in bytes
pub const HASH_SIZE: usize = 32;

/// Number of hash bytes shown in a fingerprint
pub const FINGERPRINT_BYTES: usize = 16;

/// Domain separation for fingerprints
const FINGERPRINT_CONTEXT: &str = "whisperline 2024 public key fingerprint v1";

/// A hash output
pub type HashOutput = [u8; HASH_SIZE];

/// Hashing operations
pub struct Hash;

impl Hash {
    /// Compute hash of data
    pub fn hash(data: &[u8]) -> HashOutput {
        blake3::hash(data).into()
    }

    /// Compute hash and return as hex string
    pub fn hash_hex(data: &[u8]) -> String {
        hex::encode(Self::hash(data))
    }

    /// Fingerprint of an encoded public key, grouped for reading aloud
    ///
    /// `"3f2a 91c0 …"`: 16 bytes of a domain-separated hash in 2-byte groups.
    pub fn fingerprint(encoded_key: &[u8]) -> String {
        let digest = blake3::derive_key(FINGERPRINT_CONTEXT, encoded_key);
        digest[..FINGERPRINT_BYTES]
            .chunks(2)
            .map(hex::encode)
            .collect::<Vec<_>>()
            .join(" ")
    }
}
