//! The per-rule sidecar: a small JSON string map persisted next to a
//! rule's outputs after every successful build.
//!
//! It records the total rule key the outputs were built with, the recorded
//! artifact paths, and any string metadata the rule asked to keep (values
//! that cannot be re-derived from the outputs alone, like a pre-dexed
//! library's linear-alloc estimate). On the next invocation a matching
//! key lets the engine reuse the on-disk outputs without consulting the
//! cache or running any step, and rules restore their in-memory state from
//! here via `initialize_from_disk`.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

use kiln_hash::RuleKey;
use kiln_target::BuildTarget;

use crate::errors::BuildError;
use crate::project::ProjectFilesystem;

use kiln_cache::CacheHit;

/// Reserved keys; everything else in the map is rule metadata.
pub const RULE_KEY: &str = "RULE_KEY";
pub const RULE_KEY_NO_DEPS: &str = "RULE_KEY_NO_DEPS";
pub const DEPS_ABI: &str = "DEPS_ABI";
pub const RECORDED_PATHS: &str = "RECORDED_PATHS";

const RESERVED: &[&str] = &[RULE_KEY, RULE_KEY_NO_DEPS, DEPS_ABI, RECORDED_PATHS];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OnDiskBuildInfo {
    values: BTreeMap<String, String>,
}

impl OnDiskBuildInfo {
    pub fn new(
        rule_key: &RuleKey,
        artifacts: &[PathBuf],
        metadata: &BTreeMap<String, String>,
    ) -> OnDiskBuildInfo {
        let mut values = metadata.clone();
        values.insert(RULE_KEY.to_owned(), rule_key.to_hex());
        let paths: Vec<String> =
            artifacts.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        values.insert(
            RECORDED_PATHS.to_owned(),
            serde_json::to_string(&paths).expect("string lists always serialize"),
        );
        OnDiskBuildInfo { values }
    }

    /// Records the without-deps key and the combined dep ABI observed at
    /// build time; the engine compares them on later invocations to skip
    /// rebuilds whose deps changed internals only.
    pub fn with_abi_bookkeeping(
        mut self,
        rule_key_no_deps: &RuleKey,
        deps_abi: Option<kiln_hash::Sha1HashCode>,
    ) -> OnDiskBuildInfo {
        self.values.insert(RULE_KEY_NO_DEPS.to_owned(), rule_key_no_deps.to_hex());
        if let Some(abi) = deps_abi {
            self.values.insert(DEPS_ABI.to_owned(), abi.to_hex());
        }
        self
    }

    pub fn from_cache_hit(rule_key: &RuleKey, hit: &CacheHit) -> OnDiskBuildInfo {
        let metadata: BTreeMap<String, String> =
            hit.metadata.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        OnDiskBuildInfo::new(rule_key, &hit.paths, &metadata)
    }

    pub fn read(
        project: &ProjectFilesystem,
        target: &BuildTarget,
    ) -> Result<Option<OnDiskBuildInfo>, BuildError> {
        let path = project.metadata_path(target);
        if !project.exists(&path) {
            return Ok(None);
        }
        let bytes = project.read_file(&path)?;
        match serde_json::from_slice::<OnDiskBuildInfo>(&bytes) {
            Ok(info) => Ok(Some(info)),
            // A mangled sidecar reads as "no previous build".
            Err(_) => Ok(None),
        }
    }

    pub fn write(
        &self,
        project: &ProjectFilesystem,
        target: &BuildTarget,
    ) -> Result<(), BuildError> {
        let path = project.metadata_path(target);
        let bytes = serde_json::to_vec_pretty(self).expect("string maps always serialize");
        project.write_file(&path, &bytes)
    }

    pub fn rule_key(&self) -> Option<RuleKey> {
        self.values.get(RULE_KEY).and_then(|hex| RuleKey::from_hex(hex).ok())
    }

    pub fn rule_key_no_deps(&self) -> Option<RuleKey> {
        self.values.get(RULE_KEY_NO_DEPS).and_then(|hex| RuleKey::from_hex(hex).ok())
    }

    pub fn deps_abi(&self) -> Option<kiln_hash::Sha1HashCode> {
        self.values
            .get(DEPS_ABI)
            .and_then(|hex| kiln_hash::Sha1HashCode::from_hex(hex).ok())
    }

    pub fn recorded_paths(&self) -> Vec<PathBuf> {
        self.values
            .get(RECORDED_PATHS)
            .and_then(|json| serde_json::from_str::<Vec<String>>(json).ok())
            .unwrap_or_default()
            .into_iter()
            .map(PathBuf::from)
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// The rule's own metadata, without the reserved bookkeeping keys.
    pub fn metadata(&self) -> HashMap<String, String> {
        self.values
            .iter()
            .filter(|(k, _)| !RESERVED.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let project = ProjectFilesystem::new(dir.path());
        let target = BuildTarget::parse("//java/app:lib").unwrap();

        let key = {
            let mut b = RuleKey::builder();
            b.set_str("name", "//java/app:lib");
            b.build()
        };
        let mut metadata = BTreeMap::new();
        metadata.insert("linearalloc".to_owned(), "4096".to_owned());
        let artifacts = vec![PathBuf::from("buck-out/gen/java/app/lib.jar")];

        let info = OnDiskBuildInfo::new(&key, &artifacts, &metadata);
        info.write(&project, &target).unwrap();

        let loaded = OnDiskBuildInfo::read(&project, &target).unwrap().unwrap();
        assert_eq!(loaded.rule_key(), Some(key));
        assert_eq!(loaded.recorded_paths(), artifacts);
        assert_eq!(loaded.get("linearalloc"), Some("4096"));
        assert_eq!(loaded.metadata().len(), 1);
    }

    #[test]
    fn missing_or_corrupt_sidecar_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let project = ProjectFilesystem::new(dir.path());
        let target = BuildTarget::parse("//java/app:lib").unwrap();
        assert!(OnDiskBuildInfo::read(&project, &target).unwrap().is_none());

        project.write_file(&project.metadata_path(&target), b"not json").unwrap();
        assert!(OnDiskBuildInfo::read(&project, &target).unwrap().is_none());
    }
}
