//! Content-addressed artifact caches, mapping a rule key to an archived
//! output tree plus recorded string metadata.
//!
//! The engine consults a cache before running a rule's steps and stores the
//! produced outputs afterwards. Cache trouble is never allowed to fail a
//! build: fetch errors are downgraded to misses and store errors are
//! reported in aggregate when the cache is closed. Stores run on a bounded
//! background executor owned by [`MultiArtifactCache`], which `close()`
//! drains.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{bounded, Sender};
use log::{debug, trace, warn};
use thiserror::Error;

use kiln_hash::RuleKey;

mod archive;
mod dir;
mod http;

pub use crate::dir::DirArtifactCache;
pub use crate::http::{HttpArtifactCache, MAX_CONNECTION_FAILURE_REPORTS};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed cache archive: {0}")]
    MalformedArchive(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("artifact cache HTTP error: {0}")]
    Http(String),
}

/// A successful fetch: the archived tree has been materialized under the
/// project root, and these are the recorded output paths and metadata that
/// were stored with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit {
    pub metadata: HashMap<String, String>,
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheResult {
    Hit(CacheHit),
    Miss,
}

impl CacheResult {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheResult::Hit(_))
    }
}

/// The cache contract. `fetch` materializes outputs atomically (a partial
/// fetch is rolled back and reported as a miss); `store` is idempotent and
/// may be a no-op for read-only caches; `close` flushes pending work.
pub trait ArtifactCache: Send + Sync {
    fn name(&self) -> &str;

    fn fetch(&self, key: &RuleKey, project_root: &Path) -> CacheResult;

    fn store(
        &self,
        key: &RuleKey,
        project_root: &Path,
        paths: &[PathBuf],
        metadata: &HashMap<String, String>,
    ) -> Result<(), CacheError>;

    fn is_store_supported(&self) -> bool;

    fn close(&self);
}

/// A cache that never hits and never stores.
pub struct NoopArtifactCache;

impl ArtifactCache for NoopArtifactCache {
    fn name(&self) -> &str {
        "noop"
    }

    fn fetch(&self, _key: &RuleKey, _project_root: &Path) -> CacheResult {
        CacheResult::Miss
    }

    fn store(
        &self,
        _key: &RuleKey,
        _project_root: &Path,
        _paths: &[PathBuf],
        _metadata: &HashMap<String, String>,
    ) -> Result<(), CacheError> {
        Ok(())
    }

    fn is_store_supported(&self) -> bool {
        false
    }

    fn close(&self) {}
}

struct StoreRequest {
    /// `None` stores to every writable delegate; `Some(i)` back-fills only
    /// delegate `i` after a hit in a later one.
    cache_index: Option<usize>,
    key: RuleKey,
    project_root: PathBuf,
    paths: Vec<PathBuf>,
    metadata: HashMap<String, String>,
}

const STORE_QUEUE_CAPACITY: usize = 256;

/// An ordered list of delegate caches. Fetches return the first hit and
/// back-fill earlier writable delegates; stores are queued to a background
/// worker that writes to every writable delegate and is drained on close.
pub struct MultiArtifactCache {
    caches: Arc<Vec<Arc<dyn ArtifactCache>>>,
    tx: Mutex<Option<Sender<StoreRequest>>>,
    worker: Mutex<Option<thread::JoinHandle<usize>>>,
}

impl MultiArtifactCache {
    pub fn new(caches: Vec<Arc<dyn ArtifactCache>>) -> MultiArtifactCache {
        let caches = Arc::new(caches);
        let (tx, rx) = bounded::<StoreRequest>(STORE_QUEUE_CAPACITY);

        let worker_caches = Arc::clone(&caches);
        let worker = thread::Builder::new()
            .name("artifact-store".into())
            .spawn(move || {
                let mut failures = 0;
                for req in rx {
                    for (i, cache) in worker_caches.iter().enumerate() {
                        if !cache.is_store_supported() {
                            continue;
                        }
                        if let Some(only) = req.cache_index {
                            if only != i {
                                continue;
                            }
                        }
                        if let Err(e) =
                            cache.store(&req.key, &req.project_root, &req.paths, &req.metadata)
                        {
                            warn!("failed to store {} to '{}' cache: {}", req.key, cache.name(), e);
                            failures += 1;
                        }
                    }
                }
                failures
            })
            .expect("failed to spawn artifact-store thread");

        MultiArtifactCache {
            caches,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    fn enqueue(&self, req: StoreRequest) {
        let tx = self.tx.lock().unwrap();
        if let Some(tx) = tx.as_ref() {
            // A full queue applies backpressure rather than dropping stores.
            let _ = tx.send(req);
        }
    }
}

impl ArtifactCache for MultiArtifactCache {
    fn name(&self) -> &str {
        "multi"
    }

    fn fetch(&self, key: &RuleKey, project_root: &Path) -> CacheResult {
        for (i, cache) in self.caches.iter().enumerate() {
            if let CacheResult::Hit(hit) = cache.fetch(key, project_root) {
                trace!("cache hit for {} in '{}'", key, cache.name());
                for (j, earlier) in self.caches.iter().enumerate().take(i) {
                    if earlier.is_store_supported() {
                        self.enqueue(StoreRequest {
                            cache_index: Some(j),
                            key: *key,
                            project_root: project_root.to_path_buf(),
                            paths: hit.paths.clone(),
                            metadata: hit.metadata.clone(),
                        });
                    }
                }
                return CacheResult::Hit(hit);
            }
        }
        CacheResult::Miss
    }

    fn store(
        &self,
        key: &RuleKey,
        project_root: &Path,
        paths: &[PathBuf],
        metadata: &HashMap<String, String>,
    ) -> Result<(), CacheError> {
        if !self.is_store_supported() {
            return Ok(());
        }
        self.enqueue(StoreRequest {
            cache_index: None,
            key: *key,
            project_root: project_root.to_path_buf(),
            paths: paths.to_vec(),
            metadata: metadata.clone(),
        });
        Ok(())
    }

    fn is_store_supported(&self) -> bool {
        self.caches.iter().any(|c| c.is_store_supported())
    }

    fn close(&self) {
        // Dropping the sender lets the worker drain the queue and exit.
        self.tx.lock().unwrap().take();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            match worker.join() {
                Ok(0) => debug!("artifact cache closed with no store failures"),
                Ok(failures) => warn!("artifact cache closed; {} store(s) failed", failures),
                Err(_) => warn!("artifact-store thread panicked"),
            }
        }
        for cache in self.caches.iter() {
            cache.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn key(tag: &str) -> RuleKey {
        let mut b = RuleKey::builder();
        b.set_str("test", tag);
        b.build()
    }

    #[test]
    fn multi_fetch_prefers_earlier_and_backfills() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("out.txt"), b"artifact").unwrap();

        let near_dir = tempfile::tempdir().unwrap();
        let far_dir = tempfile::tempdir().unwrap();
        let near: Arc<dyn ArtifactCache> =
            Arc::new(DirArtifactCache::new(near_dir.path(), true).unwrap());
        let far: Arc<dyn ArtifactCache> =
            Arc::new(DirArtifactCache::new(far_dir.path(), true).unwrap());

        let k = key("multi");
        let paths = vec![PathBuf::from("out.txt")];
        let metadata = HashMap::new();
        far.store(&k, root.path(), &paths, &metadata).unwrap();

        let multi = MultiArtifactCache::new(vec![near, far]);
        assert!(multi.fetch(&k, root.path()).is_hit());
        multi.close();

        // After close, the back-fill into the nearer cache has drained.
        let near = DirArtifactCache::new(near_dir.path(), true).unwrap();
        assert!(near.fetch(&k, root.path()).is_hit());
    }

    #[test]
    fn noop_never_hits() {
        let root = tempfile::tempdir().unwrap();
        let cache = NoopArtifactCache;
        assert_eq!(cache.fetch(&key("noop"), root.path()), CacheResult::Miss);
        assert!(!cache.is_store_supported());
    }
}
