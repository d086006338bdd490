//! A shared cache of file content hashes, keyed by project-relative path.
//!
//! The cache is read-heavy: every source path contributing to a rule key
//! goes through it, and the same file is typically an input to many rules.
//! Reads take a shared lock; a miss computes the digest outside any lock
//! and then takes the write lock to publish it. Entries are invalidated by
//! path when the caller learns a file has changed.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use log::trace;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::Sha1HashCode;

#[derive(Debug, Error)]
pub enum FileHashError {
    #[error("{0} does not exist on disk")]
    MissingFile(PathBuf),
    #[error("failed to hash {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub struct FileHashCache {
    root: PathBuf,
    entries: RwLock<HashMap<PathBuf, Sha1HashCode>>,
}

impl FileHashCache {
    pub fn new<P: Into<PathBuf>>(project_root: P) -> FileHashCache {
        FileHashCache { root: project_root.into(), entries: RwLock::new(HashMap::new()) }
    }

    pub fn project_root(&self) -> &Path {
        &self.root
    }

    /// Returns the content hash for a project-relative path, computing and
    /// caching it on first use.
    pub fn get(&self, path: &Path) -> Result<Sha1HashCode, FileHashError> {
        {
            let entries = self.entries.read().unwrap();
            if let Some(hash) = entries.get(path) {
                return Ok(*hash);
            }
        }

        let hash = self.hash_file(path)?;
        let mut entries = self.entries.write().unwrap();
        // A racing thread may have hashed the same file; both computed the
        // same digest, so the double insert is harmless.
        entries.insert(path.to_path_buf(), hash);
        Ok(hash)
    }

    pub fn invalidate(&self, path: &Path) {
        trace!("invalidating file hash for {}", path.display());
        self.entries.write().unwrap().remove(path);
    }

    pub fn invalidate_all(&self) {
        self.entries.write().unwrap().clear();
    }

    fn hash_file(&self, path: &Path) -> Result<Sha1HashCode, FileHashError> {
        let full = self.root.join(path);
        if !full.exists() {
            return Err(FileHashError::MissingFile(path.to_path_buf()));
        }
        let mut file = File::open(&full)
            .map_err(|source| FileHashError::Io { path: path.to_path_buf(), source })?;
        let mut hasher = Sha1::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = file
                .read(&mut buf)
                .map_err(|source| FileHashError::Io { path: path.to_path_buf(), source })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Sha1HashCode::new(hasher.finalize().into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn caches_and_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("A.java"), b"class A {}").unwrap();

        let cache = FileHashCache::new(dir.path());
        let first = cache.get(Path::new("A.java")).unwrap();
        assert_eq!(first, Sha1HashCode::of_bytes(b"class A {}"));

        // A stale entry survives until invalidated.
        fs::write(dir.path().join("A.java"), b"class A { int x; }").unwrap();
        assert_eq!(cache.get(Path::new("A.java")).unwrap(), first);

        cache.invalidate(Path::new("A.java"));
        let second = cache.get(Path::new("A.java")).unwrap();
        assert_ne!(first, second);
        assert_eq!(second, Sha1HashCode::of_bytes(b"class A { int x; }"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileHashCache::new(dir.path());
        match cache.get(Path::new("nope.java")) {
            Err(FileHashError::MissingFile(p)) => assert_eq!(p, PathBuf::from("nope.java")),
            other => panic!("expected MissingFile, got {:?}", other.map(|h| h.to_hex())),
        }
    }
}
