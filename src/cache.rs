use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::Builder;

use crate::domain::EntityKind;
use crate::error::PipelineError;

const MAX_ID_CHARS: usize = 80;

/// Deterministic key over (entity kind, entity id, exact query parameters).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    kind: EntityKind,
    id: String,
    params: BTreeMap<String, String>,
    signature: String,
}

impl CacheKey {
    pub fn new(kind: EntityKind, id: &str) -> Self {
        Self::with_params(kind, id, &[])
    }

    pub fn with_params(kind: EntityKind, id: &str, params: &[(&str, &str)]) -> Self {
        let params = params
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<BTreeMap<_, _>>();
        let signature = signature(kind, id, &params);
        Self {
            kind,
            id: id.to_string(),
            params,
            signature,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }
}

fn signature(kind: EntityKind, id: &str, params: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(id.as_bytes());
    for (key, value) in params {
        hasher.update(b"\n");
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub kind: EntityKind,
    pub id: String,
    pub signature: String,
    pub params: BTreeMap<String, String>,
    pub fetched_at: String,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
}

#[derive(Debug)]
pub struct CacheStore {
    root: Utf8PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl CacheStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self {
            root,
            locks: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<(), PipelineError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))
    }

    pub fn entry_path(&self, key: &CacheKey) -> Utf8PathBuf {
        self.root
            .join(key.kind.as_str())
            .join(sanitize_id(&key.id))
            .join(format!("{}.json", key.signature))
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        match self.read_entry(key) {
            Ok(Some(entry)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(err) => {
                tracing::warn!("{err}; treating as cache miss");
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, key: &CacheKey, payload: &str) -> Result<(), PipelineError> {
        let path = self.entry_path(key);
        let lock_key = path.to_string();
        let lock = self
            .locks
            .entry(lock_key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock();
            self.write_entry(key, &path, payload)
        };
        // Only the table and this writer hold the lock: nobody is waiting on it.
        self.locks
            .remove_if(&lock_key, |_, held| Arc::strong_count(held) == 2);
        result
    }

    fn write_entry(
        &self,
        key: &CacheKey,
        path: &Utf8Path,
        payload: &str,
    ) -> Result<(), PipelineError> {
        if let Ok(Some(existing)) = self.read_entry(key) {
            if existing.payload == payload {
                return Ok(());
            }
            tracing::warn!(
                kind = %key.kind,
                id = %key.id,
                "cache entry payload changed; last writer wins"
            );
        }

        let entry = CacheEntry {
            kind: key.kind,
            id: key.id.clone(),
            signature: key.signature.clone(),
            params: key.params.clone(),
            fetched_at: chrono::Utc::now().to_rfc3339(),
            payload: payload.to_string(),
        };
        let content = serde_json::to_vec_pretty(&entry)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        write_atomic(path, &content)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn fetch_through<F>(&self, key: &CacheKey, fetch: F) -> Result<String, PipelineError>
    where
        F: FnOnce() -> Result<String, PipelineError>,
    {
        if let Some(entry) = self.get(key) {
            return Ok(entry.payload);
        }
        let payload = fetch()?;
        if let Err(err) = self.put(key, &payload) {
            tracing::warn!(kind = %key.kind, id = %key.id, "cache write failed: {err}");
        }
        Ok(payload)
    }

    /// Like `fetch_through`, but a cached payload failing `valid` is dropped
    /// and refetched, and a fetched payload failing `valid` is not stored.
    pub fn fetch_validated<F, V>(
        &self,
        key: &CacheKey,
        fetch: F,
        valid: V,
    ) -> Result<String, PipelineError>
    where
        F: FnOnce() -> Result<String, PipelineError>,
        V: Fn(&str) -> bool,
    {
        if let Some(entry) = self.get(key) {
            if valid(&entry.payload) {
                return Ok(entry.payload);
            }
            tracing::warn!(kind = %key.kind, id = %key.id, "cached payload unusable; refetching");
            self.remove(key)?;
        }
        let payload = fetch()?;
        if valid(&payload) {
            if let Err(err) = self.put(key, &payload) {
                tracing::warn!(kind = %key.kind, id = %key.id, "cache write failed: {err}");
            }
        }
        Ok(payload)
    }

    pub fn remove(&self, key: &CacheKey) -> Result<(), PipelineError> {
        let path = self.entry_path(key);
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(PipelineError::Filesystem(err.to_string())),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    fn read_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>, PipelineError> {
        let path = self.entry_path(key);
        let content = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(PipelineError::CacheCorruption {
                    path: path.to_string(),
                    message: err.to_string(),
                });
            }
        };
        let entry: CacheEntry =
            serde_json::from_str(&content).map_err(|err| PipelineError::CacheCorruption {
                path: path.to_string(),
                message: err.to_string(),
            })?;
        if entry.kind != key.kind || entry.id != key.id || entry.signature != key.signature {
            return Err(PipelineError::CacheCorruption {
                path: path.to_string(),
                message: "entry does not match its key".to_string(),
            });
        }
        Ok(Some(entry))
    }
}

pub fn write_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), PipelineError> {
    let parent = path
        .parent()
        .ok_or_else(|| PipelineError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".geo-harvester")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    Ok(())
}

fn sanitize_id(id: &str) -> String {
    let cleaned = id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .take(MAX_ID_CHARS)
        .collect::<String>();
    if cleaned.is_empty() || cleaned.chars().all(|ch| ch == '.') {
        return "_".to_string();
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_ignores_param_order() {
        let a = CacheKey::with_params(EntityKind::PubMedSearch, "t", &[("a", "1"), ("b", "2")]);
        let b = CacheKey::with_params(EntityKind::PubMedSearch, "t", &[("b", "2"), ("a", "1")]);
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize_id("a/b c"), "a_b_c");
        assert_eq!(sanitize_id(".."), "_");
    }

    #[test]
    fn write_locks_are_released_after_put() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = Arc::new(CacheStore::new(root));
        std::thread::scope(|scope| {
            for worker in 0..4 {
                let store = store.clone();
                scope.spawn(move || {
                    for idx in 0..25 {
                        let key = CacheKey::new(EntityKind::GeoSeries, &format!("GSE{}", idx % 5));
                        store.put(&key, &format!("payload {worker}")).unwrap();
                    }
                });
            }
        });
        assert!(store.locks.is_empty());
        assert!(store.stats().writes >= 5);
    }
}
