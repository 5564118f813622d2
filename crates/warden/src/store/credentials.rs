//! Durable credential snapshot.
//!
//! The whole snapshot is a single JSON document mapping credential id to
//! credential. Every operation reads it, applies its change and rewrites it
//! through a temp file + rename, all under one async mutex so concurrent
//! writers (foreground acquisition vs. the replenisher) never lose updates.
//! A snapshot that fails to parse is discarded and read as empty.

use beian_common::{Credential, CredentialPatch, StoreError};
use rand::seq::IndexedRandom;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{Clock, SystemClock};

type Snapshot = BTreeMap<String, Credential>;

pub struct CredentialStore {
    path: PathBuf,
    /// Entries older than this are dropped whenever the snapshot is rewritten
    retention: Duration,
    clock: Arc<dyn Clock>,
    lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>, retention: Duration) -> Self {
        Self::with_clock(path, retention, Arc::new(SystemClock))
    }

    pub fn with_clock(path: impl Into<PathBuf>, retention: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            retention,
            clock,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add a credential stamped with the current time. Returns false (and
    /// leaves the stored entry untouched) if the id is already present.
    pub async fn insert(&self, mut credential: Credential) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut snapshot = self.read_snapshot().await?;
        if snapshot.contains_key(&credential.id) {
            return Ok(false);
        }

        credential.issued_at = self.clock.now();
        tracing::debug!(credential_id = %credential.id, "Storing credential");
        snapshot.insert(credential.id.clone(), credential);
        self.write_snapshot(snapshot).await?;
        Ok(true)
    }

    /// Merge `patch` into an existing entry without touching `issued_at`
    pub async fn update(&self, id: &str, patch: CredentialPatch) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut snapshot = self.read_snapshot().await?;
        let Some(credential) = snapshot.get_mut(id) else {
            return Ok(false);
        };

        credential.apply(patch);
        self.write_snapshot(snapshot).await?;
        Ok(true)
    }

    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut snapshot = self.read_snapshot().await?;
        if snapshot.remove(id).is_none() {
            return Ok(false);
        }

        self.write_snapshot(snapshot).await?;
        Ok(true)
    }

    /// Entries whose age is at most `ttl`
    pub async fn load_live(&self, ttl: Duration) -> Result<Vec<Credential>, StoreError> {
        let _guard = self.lock.lock().await;
        let now = self.clock.now();
        let snapshot = self.read_snapshot().await?;
        Ok(snapshot
            .into_values()
            .filter(|c| c.is_live_at(ttl, now))
            .collect())
    }

    pub async fn count_live(&self, ttl: Duration) -> Result<usize, StoreError> {
        Ok(self.load_live(ttl).await?.len())
    }

    /// One uniformly random live credential, if any
    pub async fn pick_random_live(&self, ttl: Duration) -> Result<Option<Credential>, StoreError> {
        let live = self.load_live(ttl).await?;
        Ok(live.choose(&mut rand::rng()).cloned())
    }

    /// Unreadable state of any kind reads as empty; the next write replaces it
    async fn read_snapshot(&self) -> Result<Snapshot, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Snapshot::new()),
            Err(e) => {
                tracing::warn!(path = ?self.path, error = %e, "Credential snapshot unreadable, treating as empty");
                return Ok(Snapshot::new());
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                tracing::warn!(path = ?self.path, error = %e, "Credential snapshot corrupt, discarding");
                match tokio::fs::remove_file(&self.path).await {
                    Err(e) if e.kind() != ErrorKind::NotFound => {
                        tracing::warn!(path = ?self.path, error = %e, "Failed to remove corrupt snapshot");
                    }
                    _ => {}
                }
                Ok(Snapshot::new())
            }
        }
    }

    async fn write_snapshot(&self, mut snapshot: Snapshot) -> Result<(), StoreError> {
        let now = self.clock.now();
        snapshot.retain(|_, c| c.is_live_at(self.retention, now));

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let data = serde_json::to_vec(&snapshot)?;
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
