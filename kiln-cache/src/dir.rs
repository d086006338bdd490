//! The local artifact cache: a directory of archives indexed by rule key.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{trace, warn};

use kiln_hash::RuleKey;

use crate::archive;
use crate::{ArtifactCache, CacheError, CacheHit, CacheResult};

pub struct DirArtifactCache {
    cache_dir: PathBuf,
    store_enabled: bool,
}

impl DirArtifactCache {
    pub fn new(cache_dir: &Path, store_enabled: bool) -> Result<DirArtifactCache, CacheError> {
        fs::create_dir_all(cache_dir)?;
        Ok(DirArtifactCache { cache_dir: cache_dir.to_path_buf(), store_enabled })
    }

    fn archive_path(&self, key: &RuleKey) -> PathBuf {
        self.cache_dir.join(format!("{}.tar.gz", key.to_hex()))
    }
}

impl ArtifactCache for DirArtifactCache {
    fn name(&self) -> &str {
        "dir"
    }

    fn fetch(&self, key: &RuleKey, project_root: &Path) -> CacheResult {
        let path = self.archive_path(key);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(_) => {
                trace!("dir cache miss for {}", key);
                return CacheResult::Miss;
            }
        };
        match archive::unpack(file, project_root) {
            Ok(payload) => {
                CacheResult::Hit(CacheHit { metadata: payload.metadata, paths: payload.paths })
            }
            Err(e) => {
                warn!("failed to unpack cached artifact {}: {}", path.display(), e);
                CacheResult::Miss
            }
        }
    }

    fn store(
        &self,
        key: &RuleKey,
        project_root: &Path,
        paths: &[PathBuf],
        metadata: &HashMap<String, String>,
    ) -> Result<(), CacheError> {
        if !self.store_enabled {
            return Ok(());
        }
        let bytes = archive::pack(project_root, paths, metadata)?;
        // Write through a temp file and rename so a concurrent fetch never
        // observes a half-written archive, and repeated stores of the same
        // key are idempotent.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.cache_dir)?;
        tmp.write_all(&bytes)?;
        tmp.persist(self.archive_path(key)).map_err(|e| CacheError::Io(e.error))?;
        Ok(())
    }

    fn is_store_supported(&self) -> bool {
        self.store_enabled
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(tag: &str) -> RuleKey {
        let mut b = RuleKey::builder();
        b.set_str("test", tag);
        b.build()
    }

    #[test]
    fn store_then_fetch_round_trips() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("buck-out/gen")).unwrap();
        fs::write(root.path().join("buck-out/gen/a.jar"), b"jar contents").unwrap();

        let cache_dir = tempfile::tempdir().unwrap();
        let cache = DirArtifactCache::new(cache_dir.path(), true).unwrap();

        let k = key("roundtrip");
        let paths = vec![PathBuf::from("buck-out/gen/a.jar")];
        let mut metadata = HashMap::new();
        metadata.insert("abi".to_owned(), "cafebabe".to_owned());
        cache.store(&k, root.path(), &paths, &metadata).unwrap();

        // Fetch into a fresh project root.
        let other = tempfile::tempdir().unwrap();
        match cache.fetch(&k, other.path()) {
            CacheResult::Hit(hit) => {
                assert_eq!(hit.metadata, metadata);
                assert_eq!(hit.paths, paths);
            }
            CacheResult::Miss => panic!("expected a hit"),
        }
        assert_eq!(fs::read(other.path().join("buck-out/gen/a.jar")).unwrap(), b"jar contents");
    }

    #[test]
    fn unknown_key_misses() {
        let root = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = DirArtifactCache::new(cache_dir.path(), true).unwrap();
        assert_eq!(cache.fetch(&key("absent"), root.path()), CacheResult::Miss);
    }

    #[test]
    fn read_only_cache_does_not_store() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("a.txt"), b"a").unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = DirArtifactCache::new(cache_dir.path(), false).unwrap();
        assert!(!cache.is_store_supported());
        cache.store(&key("ro"), root.path(), &[PathBuf::from("a.txt")], &HashMap::new()).unwrap();
        assert_eq!(fs::read_dir(cache_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn corrupt_archive_is_a_miss() {
        let root = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = DirArtifactCache::new(cache_dir.path(), true).unwrap();
        let k = key("corrupt");
        fs::write(cache.archive_path(&k), b"not a tarball").unwrap();
        assert_eq!(cache.fetch(&k, root.path()), CacheResult::Miss);
    }
}
