// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Key-value storage for the credential and the session id.
//!
//! The access and refresh tokens are always written together through
//! [`KeyValueStore::apply`], so a reader never sees one without the other.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::StorageKind;
use crate::error::ChatError;
use crate::token::Credential;

pub const ACCESS_TOKEN_KEY: &str = "chatwire.access_token";
pub const REFRESH_TOKEN_KEY: &str = "chatwire.refresh_token";
pub const SESSION_ID_KEY: &str = "chatwire.session_id";

/// A set (`Some`) or remove (`None`) of one key.
pub type Write<'a> = (&'a str, Option<String>);

/// Backing storage. Implementations apply a batch of writes atomically.
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<String>;
    fn apply(&self, writes: &[Write<'_>]) -> Result<(), ChatError>;
}

/// Process-lifetime storage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn apply(&self, writes: &[Write<'_>]) -> Result<(), ChatError> {
        let mut entries = self.entries.lock();
        apply_to(&mut entries, writes);
        Ok(())
    }
}

/// JSON-file storage that survives restarts.
///
/// The whole map is cached in memory and rewritten on every batch with a
/// tmp-file-and-rename so a crash never leaves a torn file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`. A corrupt file is
    /// treated as empty and replaced on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ChatError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let entries = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(path = %path.display(), "discarding unreadable token store: {e}");
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), keys = entries.len(), "opened token store");
        Ok(Self { path, entries: Mutex::new(entries) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn apply(&self, writes: &[Write<'_>]) -> Result<(), ChatError> {
        let mut entries = self.entries.lock();
        let mut next = entries.clone();
        apply_to(&mut next, writes);
        save(&self.path, &next)?;
        *entries = next;
        Ok(())
    }
}

fn apply_to(entries: &mut HashMap<String, String>, writes: &[Write<'_>]) {
    for (key, value) in writes {
        match value {
            Some(v) => {
                entries.insert((*key).to_owned(), v.clone());
            }
            None => {
                entries.remove(*key);
            }
        }
    }
}

/// Write the map atomically (unique tmp name, then rename).
fn save(path: &Path, entries: &HashMap<String, String>) -> Result<(), ChatError> {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let json = serde_json::to_string_pretty(entries).map_err(|e| ChatError::Storage(e.to_string()))?;
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_name = format!(
        "{}.{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id(),
        seq,
    );
    let tmp_path = path.with_file_name(tmp_name);
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Typed view over a [`KeyValueStore`] for the keys this crate owns.
#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore").finish_non_exhaustive()
    }
}

impl TokenStore {
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self { inner }
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Open the backend selected by `kind`. `path` is only used for
    /// persistent storage.
    pub fn open(kind: StorageKind, path: &Path) -> Result<Self, ChatError> {
        match kind {
            StorageKind::Persistent => Ok(Self::new(Arc::new(FileStore::open(path)?))),
            StorageKind::Session => Ok(Self::memory()),
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner.get(ACCESS_TOKEN_KEY).filter(|t| !t.is_empty())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.inner.get(REFRESH_TOKEN_KEY).filter(|t| !t.is_empty())
    }

    /// The stored credential, if the access token carries a decodable expiry.
    pub fn credential(&self) -> Option<Credential> {
        Credential::new(self.access_token()?, self.refresh_token())
    }

    /// Persist both tokens in one write. A credential without a refresh
    /// token removes any previously stored one.
    pub fn save_credential(&self, cred: &Credential) -> Result<(), ChatError> {
        self.inner.apply(&[
            (ACCESS_TOKEN_KEY, Some(cred.access_token().to_owned())),
            (REFRESH_TOKEN_KEY, cred.refresh_token().map(str::to_owned)),
        ])
    }

    pub fn clear_credential(&self) -> Result<(), ChatError> {
        self.inner.apply(&[(ACCESS_TOKEN_KEY, None), (REFRESH_TOKEN_KEY, None)])
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.get(SESSION_ID_KEY).filter(|s| !s.is_empty())
    }

    pub fn set_session_id(&self, id: &str) -> Result<(), ChatError> {
        self.inner.apply(&[(SESSION_ID_KEY, Some(id.to_owned()))])
    }

    pub fn clear_session_id(&self) -> Result<(), ChatError> {
        self.inner.apply(&[(SESSION_ID_KEY, None)])
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
