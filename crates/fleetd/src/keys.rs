//! Device key pairs and request signing.

use crate::error::KeyError;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

/// Stores device key pairs by key id.
pub trait KeypairManager: Send + Sync {
    /// Generates a new key pair and returns its id. Slow; call unlocked.
    fn generate(&self) -> Result<String, KeyError>;

    fn public_key(&self, key_id: &str) -> Result<Vec<u8>, KeyError>;

    fn sign(&self, key_id: &str, payload: &[u8]) -> Result<Vec<u8>, KeyError>;
}

/// Key id: hex SHA-256 of the public key.
pub fn key_id(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// Ed25519 key pairs, optionally persisted one file per key.
pub struct Ed25519Keypairs {
    dir: Option<PathBuf>,
    keys: Mutex<HashMap<String, SigningKey>>,
}

impl Ed25519Keypairs {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            keys: Mutex::new(HashMap::new()),
        }
    }

    fn load(&self, key_id: &str) -> Result<SigningKey, KeyError> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(k) = keys.get(key_id) {
            return Ok(k.clone());
        }
        let dir = self.dir.as_ref().ok_or_else(|| KeyError::NotFound(key_id.to_string()))?;
        let raw = fs::read_to_string(dir.join(key_id)).map_err(|_| KeyError::NotFound(key_id.to_string()))?;
        let bytes: [u8; 32] = hex::decode(raw.trim())
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| KeyError::NotFound(key_id.to_string()))?;
        let key = SigningKey::from_bytes(&bytes);
        keys.insert(key_id.to_string(), key.clone());
        Ok(key)
    }
}

/// Writes the key readable by its owner only, never replacing an existing file.
fn write_private_key(dir: &Path, id: &str, key: &SigningKey) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
        builder.mode(0o700);
        opts.mode(0o600);
    }
    builder.create(dir)?;
    let mut file = opts.open(dir.join(id))?;
    file.write_all(hex::encode(key.to_bytes()).as_bytes())?;
    file.sync_all()
}

impl KeypairManager for Ed25519Keypairs {
    fn generate(&self) -> Result<String, KeyError> {
        let key = SigningKey::generate(&mut OsRng);
        let id = key_id(key.verifying_key().as_bytes());
        if let Some(dir) = &self.dir {
            write_private_key(dir, &id, &key).map_err(|e| KeyError::Sign(e.to_string()))?;
        }
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), key);
        info!("Generated device key {}", id);
        Ok(id)
    }

    fn public_key(&self, key_id: &str) -> Result<Vec<u8>, KeyError> {
        Ok(self.load(key_id)?.verifying_key().to_bytes().to_vec())
    }

    fn sign(&self, key_id: &str, payload: &[u8]) -> Result<Vec<u8>, KeyError> {
        Ok(self.load(key_id)?.sign(payload).to_bytes().to_vec())
    }
}

/// Headers and optional body signed with a device key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SignedRequest {
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    pub public_key: String,
    pub signature: String,
}

fn signing_payload(headers: &BTreeMap<String, String>, body: Option<&str>) -> Vec<u8> {
    // Maps of strings always serialize.
    serde_json::to_vec(&(headers, body)).unwrap_or_default()
}

impl SignedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Checks the signature against the embedded public key.
    pub fn verify(&self) -> bool {
        let Some(pk) = hex::decode(&self.public_key).ok().and_then(|b| <[u8; 32]>::try_from(b).ok()) else {
            return false;
        };
        let Ok(vk) = VerifyingKey::from_bytes(&pk) else {
            return false;
        };
        let Some(sig) = hex::decode(&self.signature)
            .ok()
            .and_then(|b| Signature::from_slice(&b).ok())
        else {
            return false;
        };
        vk.verify(&signing_payload(&self.headers, self.body.as_deref()), &sig)
            .is_ok()
    }
}

/// Signs serial and session requests.
pub trait Signer: Send + Sync {
    fn sign_request(
        &self,
        key_id: &str,
        headers: BTreeMap<String, String>,
        body: Option<String>,
    ) -> Result<SignedRequest, KeyError>;
}

/// Signs with keys from a [`KeypairManager`].
pub struct KeypairSigner {
    keys: Arc<dyn KeypairManager>,
}

impl KeypairSigner {
    pub fn new(keys: Arc<dyn KeypairManager>) -> Self {
        Self { keys }
    }
}

impl Signer for KeypairSigner {
    fn sign_request(
        &self,
        key_id: &str,
        headers: BTreeMap<String, String>,
        body: Option<String>,
    ) -> Result<SignedRequest, KeyError> {
        let payload = signing_payload(&headers, body.as_deref());
        let signature = self.keys.sign(key_id, &payload)?;
        let public_key = self.keys.public_key(key_id)?;
        Ok(SignedRequest {
            headers,
            body,
            public_key: hex::encode(public_key),
            signature: hex::encode(signature),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_and_sign() {
        let keys: Arc<dyn KeypairManager> = Arc::new(Ed25519Keypairs::in_memory());
        let id = keys.generate().unwrap();
        assert_eq!(id, key_id(&keys.public_key(&id).unwrap()));

        let signer = KeypairSigner::new(keys);
        let mut headers = BTreeMap::new();
        headers.insert("brand-id".to_string(), "canonical".to_string());
        let mut req = signer.sign_request(&id, headers, None).unwrap();
        assert!(req.verify());

        req.headers.insert("model".to_string(), "tampered".to_string());
        assert!(!req.verify());
    }

    #[test]
    fn test_unknown_key() {
        let keys = Ed25519Keypairs::in_memory();
        assert!(matches!(keys.sign("nope", b"x"), Err(KeyError::NotFound(_))));
    }

    #[test]
    fn test_persisted_keys_reload() {
        let tmp = TempDir::new().unwrap();
        let id = Ed25519Keypairs::open(tmp.path()).generate().unwrap();
        let reopened = Ed25519Keypairs::open(tmp.path());
        assert_eq!(key_id(&reopened.public_key(&id).unwrap()), id);
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("private-keys-v1");
        let id = Ed25519Keypairs::open(&dir).generate().unwrap();

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&dir.join(&id)), 0o600);
        assert_eq!(mode(&dir), 0o700);
    }
}
