//! Persistence seams for session and auth material.
//!
//! The engine only ever talks to [`KeyValueStore`]; encryption at rest is a
//! wrapper ([`SealedStore`]) around any store and any [`Cipher`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use hkdf::Hkdf;
use sha2::Sha256;

/// Key under which the last registered session id is kept.
pub const SESSION_ID_KEY: &str = "session.id";

const NONCE_LEN: usize = 12;
const HKDF_INFO: &[u8] = b"parla session store v1";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store format error: {0}")]
    Format(String),
    #[error("cipher error: {0}")]
    Cipher(String),
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

pub trait Cipher: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError>;
    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, StoreError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poison) => poison.into_inner(),
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        lock(&self.entries).clone()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        lock(&self.entries).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        lock(&self.entries).remove(key);
        Ok(())
    }
}

/// JSON object on disk, rewritten on every change.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| StoreError::Format(format!("{}: {e}", path.display())))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(entries)
            .map_err(|e| StoreError::Format(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = lock(&self.entries);
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = lock(&self.entries);
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }
}

/// AES-256-GCM with a key derived from a caller secret via HKDF-SHA256.
/// Sealed layout: 12-byte nonce followed by ciphertext and tag.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn from_secret(secret: &[u8], salt: &[u8]) -> Result<Self, StoreError> {
        let hk = Hkdf::<Sha256>::new(Some(salt), secret);
        let mut key = [0u8; 32];
        hk.expand(HKDF_INFO, &mut key)
            .map_err(|e| StoreError::Cipher(format!("hkdf expand: {e}")))?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| StoreError::Cipher(format!("key init: {e}")))?;
        Ok(Self { cipher })
    }
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher").finish_non_exhaustive()
    }
}

impl Cipher for AesGcmCipher {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let nonce = Aes256Gcm::generate_nonce(OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| StoreError::Cipher(format!("encrypt: {e}")))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, StoreError> {
        if sealed.len() < NONCE_LEN {
            return Err(StoreError::Cipher("sealed value too short".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| StoreError::Cipher(format!("decrypt: {e}")))
    }
}

/// Encrypts values (base64 of the sealed bytes) before they reach `inner`.
pub struct SealedStore<S, C> {
    inner: S,
    cipher: C,
}

impl<S: KeyValueStore, C: Cipher> SealedStore<S, C> {
    pub fn new(inner: S, cipher: C) -> Self {
        Self { inner, cipher }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: KeyValueStore, C: Cipher> KeyValueStore for SealedStore<S, C> {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let Some(encoded) = self.inner.get(key)? else {
            return Ok(None);
        };
        let sealed = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| StoreError::Format(format!("base64: {e}")))?;
        let plain = self.cipher.open(&sealed)?;
        String::from_utf8(plain)
            .map(Some)
            .map_err(|e| StoreError::Format(format!("utf-8: {e}")))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let sealed = self.cipher.seal(value.as_bytes())?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(sealed);
        self.inner.set(key, &encoded)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> AesGcmCipher {
        AesGcmCipher::from_secret(b"correct horse battery staple", b"parla-test").expect("cipher")
    }

    #[test]
    fn sealed_store_hides_plaintext() {
        let backing = MemoryStore::new();
        let store = SealedStore::new(backing.clone(), cipher());
        store.set(SESSION_ID_KEY, "sess-42").expect("set");

        let raw = backing.snapshot();
        let stored = raw.get(SESSION_ID_KEY).expect("value persisted");
        assert!(!stored.contains("sess-42"), "value must be encrypted at rest");
        assert_eq!(store.get(SESSION_ID_KEY).expect("get").as_deref(), Some("sess-42"));
    }

    #[test]
    fn wrong_secret_cannot_open() {
        let backing = MemoryStore::new();
        SealedStore::new(backing.clone(), cipher())
            .set("k", "v")
            .expect("set");
        let other = AesGcmCipher::from_secret(b"different", b"parla-test").expect("cipher");
        let err = SealedStore::new(backing, other)
            .get("k")
            .expect_err("tag check must fail");
        assert!(matches!(err, StoreError::Cipher(_)));
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state").join("session.json");
        {
            let store = FileStore::open(&path).expect("open");
            store.set("a", "1").expect("set");
            store.set("b", "2").expect("set");
            store.remove("a").expect("remove");
        }
        let store = FileStore::open(&path).expect("reopen");
        assert_eq!(store.get("a").expect("get"), None);
        assert_eq!(store.get("b").expect("get").as_deref(), Some("2"));
    }

    #[test]
    fn missing_key_is_none() {
        let store = SealedStore::new(MemoryStore::new(), cipher());
        assert_eq!(store.get("nope").expect("get"), None);
    }
}
