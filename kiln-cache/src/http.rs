//! The remote artifact cache, speaking a small HTTP protocol:
//!
//! - fetch: `GET <base>/artifact/key/<rulekey>`; 200 is a hit whose body is
//!   the archive, 404 is a miss, anything else is logged and treated as a
//!   miss;
//! - store: `POST <base>/artifact/` with a multipart body carrying parts
//!   `key0` (the rule key) and `data0` (the archive) and a
//!   `Buck-Artifact-Count` header.
//!
//! Timeouts are per request and there are no retries: the scheduler falls
//! through to a local rebuild on a miss. The cache must stay quiet when the
//! server is down, so connection failures are reported at most
//! [`MAX_CONNECTION_FAILURE_REPORTS`] times per build.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use log::{debug, warn};
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use url::Url;

use kiln_hash::RuleKey;

use crate::archive;
use crate::{ArtifactCache, CacheError, CacheHit, CacheResult};

/// How many times per build a connection failure is surfaced to the user
/// before further reports are suppressed.
pub const MAX_CONNECTION_FAILURE_REPORTS: usize = 10;

pub struct HttpArtifactCache {
    base_url: Url,
    client: Client,
    store_enabled: bool,
    connection_failures: AtomicUsize,
}

impl HttpArtifactCache {
    pub fn new(
        base_url: Url,
        timeout: Duration,
        store_enabled: bool,
    ) -> Result<HttpArtifactCache, CacheError> {
        let mut base_url = base_url;
        // `Url::join` treats a base without a trailing slash as a file.
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CacheError::Http(e.to_string()))?;
        Ok(HttpArtifactCache {
            base_url,
            client,
            store_enabled,
            connection_failures: AtomicUsize::new(0),
        })
    }

    fn fetch_url(&self, key: &RuleKey) -> Url {
        self.base_url
            .join(&format!("artifact/key/{}", key.to_hex()))
            .expect("rule key hex is always a valid URL path segment")
    }

    fn store_url(&self) -> Url {
        self.base_url.join("artifact/").expect("base URL accepts the artifact path")
    }

    fn report_connection_failure(&self, what: &str, error: &dyn std::fmt::Display) {
        let reported = self.connection_failures.fetch_add(1, Ordering::SeqCst);
        if reported < MAX_CONNECTION_FAILURE_REPORTS {
            warn!("artifact cache {} failed: {}", what, error);
            if reported + 1 == MAX_CONNECTION_FAILURE_REPORTS {
                warn!("further artifact cache connection failures will not be reported");
            }
        }
    }
}

impl ArtifactCache for HttpArtifactCache {
    fn name(&self) -> &str {
        "http"
    }

    fn fetch(&self, key: &RuleKey, project_root: &Path) -> CacheResult {
        let response = match self.client.get(self.fetch_url(key)).send() {
            Ok(response) => response,
            Err(e) => {
                self.report_connection_failure("fetch", &e);
                return CacheResult::Miss;
            }
        };

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return CacheResult::Miss,
            status => {
                warn!("unexpected response {} fetching {} from artifact cache", status, key);
                return CacheResult::Miss;
            }
        }

        let bytes = match response.bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.report_connection_failure("fetch", &e);
                return CacheResult::Miss;
            }
        };

        match archive::unpack(Cursor::new(bytes), project_root) {
            Ok(payload) => {
                CacheResult::Hit(CacheHit { metadata: payload.metadata, paths: payload.paths })
            }
            Err(e) => {
                warn!("failed to unpack remote artifact for {}: {}", key, e);
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
        let form = Form::new()
            .text("key0", key.to_hex())
            .part("data0", Part::bytes(bytes).file_name(format!("{}.tar.gz", key.to_hex())));

        // Stores tolerate an unavailable server: the build already
        // succeeded locally, so the worst case is a future cache miss.
        match self
            .client
            .post(self.store_url())
            .header("Buck-Artifact-Count", "1")
            .multipart(form)
            .send()
        {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => {
                debug!("artifact cache store for {} returned {}", key, response.status());
                Ok(())
            }
            Err(e) => {
                self.report_connection_failure("store", &e);
                Ok(())
            }
        }
    }

    fn is_store_supported(&self) -> bool {
        self.store_enabled
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_cache() -> HttpArtifactCache {
        // Port 9 (discard) is reliably closed in test environments.
        HttpArtifactCache::new(
            Url::parse("http://127.0.0.1:9/cache").unwrap(),
            Duration::from_millis(250),
            true,
        )
        .unwrap()
    }

    #[test]
    fn connection_failure_is_a_miss() {
        let root = tempfile::tempdir().unwrap();
        let cache = unreachable_cache();
        let mut b = RuleKey::builder();
        b.set_str("test", "http");
        assert_eq!(cache.fetch(&b.build(), root.path()), CacheResult::Miss);
    }

    #[test]
    fn store_tolerates_unreachable_server() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.txt"), b"a").unwrap();
        let cache = unreachable_cache();
        let mut b = RuleKey::builder();
        b.set_str("test", "http-store");
        cache
            .store(&b.build(), root.path(), &[PathBuf::from("a.txt")], &HashMap::new())
            .unwrap();
    }

    #[test]
    fn urls_have_the_wire_shape() {
        let cache = unreachable_cache();
        let mut b = RuleKey::builder();
        b.set_str("test", "url");
        let key = b.build();
        assert_eq!(
            cache.fetch_url(&key).as_str(),
            format!("http://127.0.0.1:9/cache/artifact/key/{}", key.to_hex())
        );
        assert_eq!(cache.store_url().as_str(), "http://127.0.0.1:9/cache/artifact/");
    }
}
