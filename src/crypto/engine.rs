//! Hybrid message encryption
//!
//! Each message is sealed with a fresh ChaCha20-Poly1305 key; that key is
//! wrapped with RSA-OAEP (SHA-256) for the recipient. The resulting
//! [`EncryptedEnvelope`] is self-contained and travels as a JSON string.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use rsa::Oaep;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use super::cipher::{Cipher, KEY_SIZE};
use super::error::{CryptoError, CryptoResult};
use super::identity::{PrivateKey, PublicKey};

/// Text shown in place of a message that could not be decrypted
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "[Unable to decrypt message]";

/// One encrypted message: ciphertext plus the key needed to open it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    /// base64(ciphertext || tag)
    pub ciphertext: String,
    /// base64(RSA-OAEP(message key))
    #[serde(alias = "encryptedKey")]
    pub wrapped_key: String,
    /// base64(nonce)
    pub iv: String,
    /// When the envelope was sealed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl EncryptedEnvelope {
    /// Serialize for transmission
    pub fn to_json(&self) -> CryptoResult<String> {
        serde_json::to_string(self).map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))
    }

    /// Parse a transmitted envelope
    pub fn from_json(raw: &str) -> CryptoResult<Self> {
        serde_json::from_str(raw).map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))
    }
}

/// Result of a best-effort decryption
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decrypted {
    /// The message opened successfully
    Plaintext(String),
    /// Wrong key, corrupt data or unsupported format
    Undecryptable,
}

impl Decrypted {
    /// Text to display: the plaintext or [`UNDECRYPTABLE_PLACEHOLDER`]
    pub fn into_text(self) -> String {
        match self {
            Decrypted::Plaintext(text) => text,
            Decrypted::Undecryptable => UNDECRYPTABLE_PLACEHOLDER.to_string(),
        }
    }

    /// Whether decryption failed
    pub fn is_undecryptable(&self) -> bool {
        matches!(self, Decrypted::Undecryptable)
    }
}

/// Stateless hybrid encryption service
///
/// Key material is always passed in; the engine holds none.
#[derive(Clone, Copy, Debug, Default)]
pub struct CryptoEngine;

impl CryptoEngine {
    /// Create an engine
    pub fn new() -> Self {
        CryptoEngine
    }

    /// Encrypt `plaintext` so that only the holder of `recipient`'s private key can read it
    pub fn encrypt(&self, plaintext: &str, recipient: &PublicKey) -> CryptoResult<EncryptedEnvelope> {
        let message_key = Cipher::generate_key();
        let sealed = Cipher::encrypt(&message_key, plaintext.as_bytes())?;

        let wrapped = recipient
            .as_rsa()
            .encrypt(
                &mut rand::thread_rng(),
                Oaep::new::<Sha256>(),
                message_key.as_slice(),
            )
            .map_err(|e| CryptoError::KeyWrapFailed(e.to_string()))?;

        Ok(EncryptedEnvelope {
            ciphertext: BASE64.encode(&sealed.ciphertext),
            wrapped_key: BASE64.encode(wrapped),
            iv: BASE64.encode(sealed.nonce),
            timestamp: Some(Utc::now()),
        })
    }

    /// Decrypt an envelope, reporting why it failed
    pub fn try_decrypt(&self, envelope: &EncryptedEnvelope, own: &PrivateKey) -> CryptoResult<String> {
        let wrapped = decode_field(&envelope.wrapped_key, "wrappedKey")?;
        let nonce = decode_field(&envelope.iv, "iv")?;
        let ciphertext = decode_field(&envelope.ciphertext, "ciphertext")?;

        let unwrapped = Zeroizing::new(
            own.as_rsa()
                .decrypt(Oaep::new::<Sha256>(), &wrapped)
                .map_err(|_| CryptoError::KeyUnwrapFailed)?,
        );
        let key: Zeroizing<[u8; KEY_SIZE]> = Zeroizing::new(
            unwrapped
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_SIZE,
                    actual: unwrapped.len(),
                })?,
        );

        let plaintext = Cipher::decrypt(&key, &nonce, &ciphertext)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
    }

    /// Decrypt an envelope; any failure becomes [`Decrypted::Undecryptable`]
    pub fn decrypt(&self, envelope: &EncryptedEnvelope, own: &PrivateKey) -> Decrypted {
        match self.try_decrypt(envelope, own) {
            Ok(text) => Decrypted::Plaintext(text),
            Err(e) => {
                tracing::debug!(error = %e, "envelope could not be decrypted");
                Decrypted::Undecryptable
            }
        }
    }

    /// Whether `raw` has the shape of an encrypted envelope
    ///
    /// Never fails: anything that is not a JSON object carrying string
    /// `ciphertext`, `wrappedKey` (or `encryptedKey`) and `iv` fields is
    /// treated as plain text.
    pub fn is_envelope(raw: &str) -> bool {
        if !raw.trim_start().starts_with('{') {
            return false;
        }

        let Ok(serde_json::Value::Object(fields)) = serde_json::from_str(raw) else {
            return false;
        };

        let is_str = |name: &str| fields.get(name).is_some_and(|v| v.is_string());
        is_str("ciphertext") && (is_str("wrappedKey") || is_str("encryptedKey")) && is_str("iv")
    }

    /// Turn stored or received content into display text
    ///
    /// Envelopes are decrypted (placeholder on failure); anything else is
    /// legacy plain text and returned unchanged.
    pub fn open_text(&self, raw: &str, own: &PrivateKey) -> String {
        if !Self::is_envelope(raw) {
            return raw.to_string();
        }

        match EncryptedEnvelope::from_json(raw) {
            Ok(envelope) => self.decrypt(&envelope, own).into_text(),
            Err(e) => {
                tracing::debug!(error = %e, "envelope-shaped payload failed to parse");
                UNDECRYPTABLE_PLACEHOLDER.to_string()
            }
        }
    }
}

fn decode_field(value: &str, field: &str) -> CryptoResult<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| CryptoError::MalformedEnvelope(format!("{field}: {e}")))
}
