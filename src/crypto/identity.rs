//! RSA identity keys
//!
//! Each user owns one long-lived RSA key pair. The public half is exchanged
//! as a JSON Web Key; the private half only ever leaves memory as PKCS#8
//! DER inside the local key store.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::error::{CryptoError, CryptoResult};
use super::hash::Hash;

/// Smallest accepted RSA modulus
pub const MIN_KEY_BITS: usize = 2048;

/// Largest accepted RSA modulus; bigger public keys do not load back
pub const MAX_KEY_BITS: usize = 4096;

/// Modulus size used when nothing else is configured
pub const DEFAULT_KEY_BITS: usize = 2048;

/// JWK `alg` advertised for identity keys
pub const JWK_ALG: &str = "RSA-OAEP-256";

/// JSON Web Key form of an RSA public key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type, always `"RSA"`
    pub kty: String,
    /// Modulus, base64url without padding
    pub n: String,
    /// Public exponent, base64url without padding
    pub e: String,
    /// Intended algorithm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
}

/// A public key used to wrap message keys for its owner
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Jwk", into = "Jwk")]
pub struct PublicKey(RsaPublicKey);

impl PublicKey {
    /// Export as a JSON Web Key
    pub fn to_jwk(&self) -> Jwk {
        Jwk {
            kty: "RSA".to_string(),
            n: URL_SAFE_NO_PAD.encode(self.0.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(self.0.e().to_bytes_be()),
            alg: Some(JWK_ALG.to_string()),
        }
    }

    /// Import from a JSON Web Key
    pub fn from_jwk(jwk: &Jwk) -> CryptoResult<Self> {
        if jwk.kty != "RSA" {
            return Err(CryptoError::InvalidPublicKey(format!(
                "unsupported key type {}",
                jwk.kty
            )));
        }

        let n = decode_component(&jwk.n)?;
        let e = decode_component(&jwk.e)?;

        check_key_bits(n.bits())?;

        RsaPublicKey::new(n, e)
            .map(PublicKey)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
    }

    /// Modulus size in bits
    pub fn bits(&self) -> usize {
        self.0.n().bits()
    }

    /// Short human-readable fingerprint
    pub fn fingerprint(&self) -> String {
        let mut encoded = self.0.n().to_bytes_be();
        encoded.extend_from_slice(&self.0.e().to_bytes_be());
        Hash::fingerprint(&encoded)
    }

    pub(crate) fn as_rsa(&self) -> &RsaPublicKey {
        &self.0
    }
}

/// Reject moduli outside `MIN_KEY_BITS..=MAX_KEY_BITS`
pub fn check_key_bits(bits: usize) -> CryptoResult<()> {
    if bits < MIN_KEY_BITS {
        return Err(CryptoError::KeyTooSmall {
            bits,
            minimum: MIN_KEY_BITS,
        });
    }
    if bits > MAX_KEY_BITS {
        return Err(CryptoError::KeyTooLarge {
            bits,
            maximum: MAX_KEY_BITS,
        });
    }
    Ok(())
}

fn decode_component(value: &str) -> CryptoResult<BigUint> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    if bytes.is_empty() {
        return Err(CryptoError::InvalidPublicKey("empty component".to_string()));
    }
    Ok(BigUint::from_bytes_be(&bytes))
}

impl TryFrom<Jwk> for PublicKey {
    type Error = CryptoError;

    fn try_from(jwk: Jwk) -> CryptoResult<Self> {
        PublicKey::from_jwk(&jwk)
    }
}

impl From<PublicKey> for Jwk {
    fn from(key: PublicKey) -> Self {
        key.to_jwk()
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fingerprint())
    }
}

/// The private half of an identity
///
/// The underlying RSA key zeroizes itself when dropped.
#[derive(Clone)]
pub struct PrivateKey(RsaPrivateKey);

impl PrivateKey {
    /// Export as PKCS#8 DER
    ///
    /// WARNING: This exposes the secret key. Only the key store calls it.
    pub fn to_pkcs8_der(&self) -> CryptoResult<Zeroizing<Vec<u8>>> {
        let document = self
            .0
            .to_pkcs8_der()
            .map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Zeroizing::new(document.as_bytes().to_vec()))
    }

    /// Import from PKCS#8 DER
    pub fn from_pkcs8_der(der: &[u8]) -> CryptoResult<Self> {
        let key = RsaPrivateKey::from_pkcs8_der(der).map_err(|_| CryptoError::InvalidPrivateKey)?;
        key.validate().map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(PrivateKey(key))
    }

    /// Derive the matching public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.to_public_key())
    }

    pub(crate) fn as_rsa(&self) -> &RsaPrivateKey {
        &self.0
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

/// A user's asymmetric identity
#[derive(Clone)]
pub struct KeyPair {
    public: PublicKey,
    private: PrivateKey,
}

impl KeyPair {
    /// Generate a new random key pair with a modulus of `bits`
    pub fn generate(bits: usize) -> CryptoResult<Self> {
        check_key_bits(bits)?;

        let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| CryptoError::KeyGenerationFailed(e.to_string()))?;

        Ok(Self::from_private(PrivateKey(private)))
    }

    /// Rebuild a key pair from its private half
    pub fn from_private(private: PrivateKey) -> Self {
        KeyPair {
            public: private.public_key(),
            private,
        }
    }

    /// Get the public key
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Get the private key
    pub fn private_key(&self) -> &PrivateKey {
        &self.private
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("private", &"[REDACTED]")
            .finish()
    }
}
