//! Local key storage
//!
//! Holds the local user's identity key pair and a cache of contacts' public
//! keys, both under one namespaced directory:
//!
//! ```text
//! <data_dir>/<namespace>/identity.json   version, public JWK, PKCS#8 private key
//! <data_dir>/<namespace>/contacts.json   peer id -> public JWK
//! ```
//!
//! Wiping the namespace removes both files together. Missing or corrupt
//! identity material is never fatal: a fresh pair is generated instead.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::{check_key_bits, CryptoError, KeyPair, PrivateKey, PublicKey};

/// File holding the identity key pair
pub const IDENTITY_FILE: &str = "identity.json";

/// File holding cached contact keys
pub const CONTACTS_FILE: &str = "contacts.json";

const FORMAT_VERSION: u8 = 1;

/// Key store errors
#[derive(Error, Debug)]
pub enum KeyStoreError {
    /// No cached public key for this peer
    #[error("No public key known for {0}")]
    NotFound(String),

    /// Namespace cannot be used as a directory name
    #[error("Invalid key store namespace {0:?}")]
    InvalidNamespace(String),

    /// Reading or writing the key files failed
    #[error("Key storage I/O failed: {0}")]
    Io(#[from] io::Error),

    /// Encoding key material for disk failed
    #[error("Key encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Key generation or conversion failed
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Result type for key store operations
pub type KeyStoreResult<T> = Result<T, KeyStoreError>;

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    version: u8,
    public_key: PublicKey,
    private_key: String,
    created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct ContactsFile {
    version: u8,
    keys: BTreeMap<String, PublicKey>,
}

enum StoredIdentity {
    Missing,
    Corrupt(String),
    Found(KeyPair),
}

/// Identity and contact key storage for one local user
pub struct KeyStore {
    dir: PathBuf,
    namespace: String,
    key_bits: usize,
    identity: RwLock<Option<Arc<KeyPair>>>,
    contacts: RwLock<HashMap<String, PublicKey>>,
}

impl KeyStore {
    /// Open (or lazily create) the store for `namespace` under `data_dir`
    ///
    /// Nothing is generated here; call [`KeyStore::ensure_identity`].
    pub fn open(data_dir: impl AsRef<Path>, namespace: &str, key_bits: usize) -> KeyStoreResult<Self> {
        if !is_valid_namespace(namespace) {
            return Err(KeyStoreError::InvalidNamespace(namespace.to_string()));
        }
        check_key_bits(key_bits)?;

        let dir = data_dir.as_ref().join(namespace);
        let contacts = load_contacts(&dir.join(CONTACTS_FILE));

        Ok(KeyStore {
            dir,
            namespace: namespace.to_string(),
            key_bits,
            identity: RwLock::new(None),
            contacts: RwLock::new(contacts),
        })
    }

    /// The namespace (local user id) this store belongs to
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Directory holding this namespace's files
    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Return the identity, loading or generating it on first use
    ///
    /// Repeated calls return the same pair. A corrupt identity file is
    /// replaced by a new, unrelated pair and reported once with `warn!`.
    pub fn ensure_identity(&self) -> KeyStoreResult<Arc<KeyPair>> {
        if let Some(pair) = self.identity.read().as_ref() {
            return Ok(Arc::clone(pair));
        }

        let mut slot = self.identity.write();
        if let Some(pair) = slot.as_ref() {
            return Ok(Arc::clone(pair));
        }

        let path = self.dir.join(IDENTITY_FILE);
        let pair = match load_identity(&path) {
            StoredIdentity::Found(pair) => {
                debug!(namespace = %self.namespace, fingerprint = %pair.public_key(), "loaded identity");
                pair
            }
            StoredIdentity::Missing => {
                info!(namespace = %self.namespace, bits = self.key_bits, "no identity found, generating key pair");
                self.generate_and_persist(&path)?
            }
            StoredIdentity::Corrupt(reason) => {
                warn!(
                    namespace = %self.namespace,
                    %reason,
                    "stored identity is unreadable; generating a new key pair, earlier messages will no longer decrypt"
                );
                self.generate_and_persist(&path)?
            }
        };

        let pair = Arc::new(pair);
        *slot = Some(Arc::clone(&pair));
        Ok(pair)
    }

    /// The identity if it has already been ensured
    pub fn identity(&self) -> Option<Arc<KeyPair>> {
        self.identity.read().clone()
    }

    /// Look up a contact's cached public key
    pub fn get_public_key(&self, peer: &str) -> KeyStoreResult<PublicKey> {
        self.contacts
            .read()
            .get(peer)
            .cloned()
            .ok_or_else(|| KeyStoreError::NotFound(peer.to_string()))
    }

    /// Cache a contact's public key, replacing any older one
    pub fn cache_public_key(&self, peer: &str, key: PublicKey) -> KeyStoreResult<()> {
        let mut contacts = self.contacts.write();
        match contacts.get(peer) {
            Some(existing) if *existing == key => return Ok(()),
            Some(existing) => info!(
                peer,
                old = %existing,
                new = %key,
                "contact key changed"
            ),
            None => debug!(peer, fingerprint = %key, "caching contact key"),
        }
        contacts.insert(peer.to_string(), key);

        let file = ContactsFile {
            version: FORMAT_VERSION,
            keys: contacts.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        write_atomic(&self.dir.join(CONTACTS_FILE), &serde_json::to_vec_pretty(&file)?)?;
        Ok(())
    }

    /// Peers with a cached key
    pub fn cached_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.contacts.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Irreversibly delete the identity and the contact cache
    pub fn wipe_identity(&self) -> KeyStoreResult<()> {
        let mut identity = self.identity.write();
        let mut contacts = self.contacts.write();

        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        *identity = None;
        contacts.clear();
        info!(namespace = %self.namespace, "identity wiped");
        Ok(())
    }

    fn generate_and_persist(&self, path: &Path) -> KeyStoreResult<KeyPair> {
        let pair = KeyPair::generate(self.key_bits)?;
        let der = pair.private_key().to_pkcs8_der()?;

        let file = IdentityFile {
            version: FORMAT_VERSION,
            public_key: pair.public_key().clone(),
            private_key: BASE64.encode(der.as_slice()),
            created_at: Utc::now(),
        };
        write_atomic(path, &serde_json::to_vec_pretty(&file)?)?;

        info!(namespace = %self.namespace, fingerprint = %pair.public_key(), "identity created");
        Ok(pair)
    }
}

fn is_valid_namespace(namespace: &str) -> bool {
    !namespace.is_empty()
        && namespace != "."
        && namespace != ".."
        && namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
}

fn load_identity(path: &Path) -> StoredIdentity {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return StoredIdentity::Missing,
        Err(e) => return StoredIdentity::Corrupt(e.to_string()),
    };

    let file: IdentityFile = match serde_json::from_slice(&bytes) {
        Ok(file) => file,
        Err(e) => return StoredIdentity::Corrupt(e.to_string()),
    };
    if file.version != FORMAT_VERSION {
        return StoredIdentity::Corrupt(format!("unsupported version {}", file.version));
    }

    let pair = BASE64
        .decode(&file.private_key)
        .map_err(|e| e.to_string())
        .and_then(|der| PrivateKey::from_pkcs8_der(&der).map_err(|e| e.to_string()))
        .map(KeyPair::from_private);

    match pair {
        Ok(pair) if *pair.public_key() == file.public_key => StoredIdentity::Found(pair),
        Ok(_) => StoredIdentity::Corrupt("public key does not match private key".to_string()),
        Err(reason) => StoredIdentity::Corrupt(reason),
    }
}

fn load_contacts(path: &Path) -> HashMap<String, PublicKey> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "contact key cache unreadable, starting empty");
            return HashMap::new();
        }
    };

    match serde_json::from_slice::<ContactsFile>(&bytes) {
        Ok(file) => file.keys.into_iter().collect(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "contact key cache corrupt, starting empty");
            HashMap::new()
        }
    }
}

/// Write via a temporary file and rename so readers never see half a file
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }

    fs::rename(&tmp, path)
}
