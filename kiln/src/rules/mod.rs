//! Build rules: the nodes of the action graph.
//!
//! A rule is a fixed record - target, type, deps, visibility - plus its
//! operational aspect, the [`Buildable`], which knows how to contribute to
//! the rule key, produce build steps, and restore in-memory state from a
//! previous build. Rule kinds share behavior through small trait seams
//! ([`HasClasspathEntries`], [`AndroidPackageable`], [`NativeLinkable`])
//! rather than inheritance.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use kiln_hash::{FileHashCache, RuleKeyBuilder, RuleKeyPair, Sha1HashCode};
use kiln_target::{BuildTarget, BuildTargetPattern};

use crate::build::on_disk::OnDiskBuildInfo;
use crate::build::step::Step;
use crate::build::BuildContext;
use crate::config::Config;
use crate::errors::BuildError;
use crate::project::ProjectFilesystem;

pub mod android;
pub mod args;
pub mod classpath;
pub mod cxx;
pub mod genrule;
pub mod java;

pub use self::classpath::HasClasspathEntries;
pub use self::cxx::NativeLinkable;

pub use self::android::packageable::AndroidPackageable;
pub use crate::attr::Description;

/// The type tag of a rule. User-declarable kinds come from build files;
/// the remaining kinds exist only as flavored helper rules introduced by
/// graph enhancement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuleType {
    JavaLibrary,
    JavaTest,
    PrebuiltJar,
    AndroidLibrary,
    AndroidResource,
    AndroidBuildConfig,
    AndroidBinary,
    CxxLibrary,
    Genrule,
    // Synthesized by graph enhancement.
    BuildConfigHelper,
    DummyRDotJava,
    UberRDotJava,
    PreDex,
    HeaderSymlinkTree,
    StaticLibrary,
    SharedLibrary,
}

impl RuleType {
    pub fn name(self) -> &'static str {
        match self {
            RuleType::JavaLibrary => "java_library",
            RuleType::JavaTest => "java_test",
            RuleType::PrebuiltJar => "prebuilt_jar",
            RuleType::AndroidLibrary => "android_library",
            RuleType::AndroidResource => "android_resource",
            RuleType::AndroidBuildConfig => "android_build_config",
            RuleType::AndroidBinary => "android_binary",
            RuleType::CxxLibrary => "cxx_library",
            RuleType::Genrule => "genrule",
            RuleType::BuildConfigHelper => "build_config_helper",
            RuleType::DummyRDotJava => "dummy_r_dot_java",
            RuleType::UberRDotJava => "uber_r_dot_java",
            RuleType::PreDex => "pre_dex",
            RuleType::HeaderSymlinkTree => "header_symlink_tree",
            RuleType::StaticLibrary => "static_library",
            RuleType::SharedLibrary => "shared_library",
        }
    }

    /// Parses a user-declarable rule type tag from a build file.
    pub fn parse(s: &str) -> Option<RuleType> {
        Some(match s {
            "java_library" => RuleType::JavaLibrary,
            "java_test" => RuleType::JavaTest,
            "prebuilt_jar" => RuleType::PrebuiltJar,
            "android_library" => RuleType::AndroidLibrary,
            "android_resource" => RuleType::AndroidResource,
            "android_build_config" => RuleType::AndroidBuildConfig,
            "android_binary" => RuleType::AndroidBinary,
            "cxx_library" => RuleType::CxxLibrary,
            "genrule" => RuleType::Genrule,
            _ => return None,
        })
    }
}

/// Everything a description factory needs to construct a rule, including
/// the handles the finished rule keeps: the project filesystem and the
/// shared config.
#[derive(Clone)]
pub struct BuildRuleParams {
    pub target: BuildTarget,
    pub declared_deps: Vec<BuildTarget>,
    pub extra_deps: Vec<BuildTarget>,
    pub visibility: Vec<BuildTargetPattern>,
    pub project: Arc<ProjectFilesystem>,
    pub config: Arc<Config>,
}

impl BuildRuleParams {
    /// Parameters for a graph-enhancement helper: the originating target
    /// with one appended flavor naming the helper's role, and no
    /// user-facing visibility of its own.
    pub fn child(&self, flavor: &str, declared_deps: Vec<BuildTarget>) -> BuildRuleParams {
        BuildRuleParams {
            target: self.target.with_flavor(flavor),
            declared_deps,
            extra_deps: vec![],
            visibility: vec![],
            project: Arc::clone(&self.project),
            config: Arc::clone(&self.config),
        }
    }
}

/// A node in the action graph. `extra_deps` were introduced by graph
/// enhancement and are invisible to the user; they affect caching (they
/// participate in the rule key like any dep) but not classpath semantics.
pub struct BuildRule {
    target: BuildTarget,
    rule_type: RuleType,
    declared_deps: Vec<BuildTarget>,
    extra_deps: Vec<BuildTarget>,
    visibility: Vec<BuildTargetPattern>,
    project: Arc<ProjectFilesystem>,
    buildable: Box<dyn Buildable>,
    rule_key_pair: Mutex<Option<RuleKeyPair>>,
}

impl BuildRule {
    pub fn new(
        params: BuildRuleParams,
        rule_type: RuleType,
        buildable: Box<dyn Buildable>,
    ) -> BuildRule {
        BuildRule {
            target: params.target,
            rule_type,
            declared_deps: params.declared_deps,
            extra_deps: params.extra_deps,
            visibility: params.visibility,
            project: params.project,
            buildable,
            rule_key_pair: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &BuildTarget {
        &self.target
    }

    pub fn rule_type(&self) -> RuleType {
        self.rule_type
    }

    pub fn declared_deps(&self) -> &[BuildTarget] {
        &self.declared_deps
    }

    pub fn extra_deps(&self) -> &[BuildTarget] {
        &self.extra_deps
    }

    /// All deps, declared first, then enhancement-introduced ones.
    pub fn deps(&self) -> impl Iterator<Item = &BuildTarget> {
        self.declared_deps.iter().chain(self.extra_deps.iter())
    }

    pub fn visibility(&self) -> &[BuildTargetPattern] {
        &self.visibility
    }

    pub fn project(&self) -> &ProjectFilesystem {
        &self.project
    }

    pub fn buildable(&self) -> &dyn Buildable {
        self.buildable.as_ref()
    }

    /// Rules compare equal for re-registration purposes when their fixed
    /// record matches; the buildable is derived from the same inputs.
    pub fn equals_for_reregistration(&self, other: &BuildRule) -> bool {
        self.target == other.target
            && self.rule_type == other.rule_type
            && self.declared_deps == other.declared_deps
            && self.extra_deps == other.extra_deps
    }

    pub(crate) fn cached_rule_key_pair(&self) -> Option<RuleKeyPair> {
        *self.rule_key_pair.lock().unwrap()
    }

    /// Memoizes the computed key pair. Recomputing a different key for the
    /// same rule within one invocation indicates an internal bug.
    pub(crate) fn memoize_rule_key_pair(&self, pair: RuleKeyPair) {
        let mut slot = self.rule_key_pair.lock().unwrap();
        if let Some(existing) = *slot {
            assert_eq!(
                existing, pair,
                "rule key for {} changed within one invocation",
                self.target
            );
            return;
        }
        *slot = Some(pair);
    }
}

impl std::fmt::Debug for BuildRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildRule")
            .field("target", &self.target)
            .field("rule_type", &self.rule_type.name())
            .field("declared_deps", &self.declared_deps)
            .field("extra_deps", &self.extra_deps)
            .finish()
    }
}

/// Context handed to [`Buildable::append_to_rule_key`]: the shared file
/// hash cache for source-path hashing and the config for tool
/// fingerprints.
pub struct RuleKeyCtx<'a> {
    pub hashes: &'a FileHashCache,
    pub config: &'a Config,
}

impl RuleKeyCtx<'_> {
    /// Hashes a list of source paths as `(logical name, content hash)`
    /// pairs under one field.
    pub fn set_source_paths(
        &self,
        builder: &mut RuleKeyBuilder,
        field: &str,
        paths: &[PathBuf],
    ) -> Result<(), BuildError> {
        let mut pairs = Vec::with_capacity(paths.len());
        for path in paths {
            pairs.push((path.to_string_lossy().into_owned(), self.hashes.get(path)?));
        }
        builder.set_source_paths(field, pairs.iter().map(|(l, h)| (l.as_str(), *h)));
        Ok(())
    }
}

/// Where build outputs and metadata produced by a rule get recorded while
/// it builds. The engine persists the recorded paths and metadata to the
/// rule's sidecar and to the artifact cache.
#[derive(Debug, Default)]
pub struct BuildableContext {
    artifacts: Vec<PathBuf>,
    metadata: BTreeMap<String, String>,
}

impl BuildableContext {
    pub fn new() -> BuildableContext {
        BuildableContext::default()
    }

    /// Records a project-relative path (file or directory) as a produced
    /// artifact to be cached.
    pub fn record_artifact(&mut self, path: PathBuf) {
        if !self.artifacts.contains(&path) {
            self.artifacts.push(path);
        }
    }

    /// Records string metadata restored by `initialize_from_disk` on later
    /// builds, for properties not re-derivable from the outputs alone.
    pub fn add_metadata(&mut self, key: &str, value: String) {
        self.metadata.insert(key.to_owned(), value);
    }

    pub fn artifacts(&self) -> &[PathBuf] {
        &self.artifacts
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

/// The operational aspect of a rule.
pub trait Buildable: Send + Sync {
    /// Contributes the rule's own inputs-that-matter to its
    /// without-deps rule key. Dependencies are hashed separately by the
    /// engine.
    fn append_to_rule_key(
        &self,
        builder: &mut RuleKeyBuilder,
        ctx: &RuleKeyCtx<'_>,
    ) -> Result<(), BuildError>;

    /// The ordered steps that produce this rule's outputs. Called only on
    /// a cache miss; artifacts and metadata already known at this point
    /// should be recorded into `out`.
    fn steps(
        &self,
        ctx: &BuildContext,
        out: &mut BuildableContext,
    ) -> Result<Vec<Box<dyn Step>>, BuildError>;

    /// The primary output other rules reference, if any.
    fn output_path(&self) -> Option<PathBuf> {
        None
    }

    /// Runs after all steps succeeded; the place to compute metadata that
    /// depends on the produced outputs (ABI hashes, size estimates).
    fn on_build_finished(
        &self,
        _ctx: &BuildContext,
        _out: &mut BuildableContext,
    ) -> Result<(), BuildError> {
        Ok(())
    }

    /// Rebuilds in-memory state from recorded metadata after a cache hit
    /// or a matching-rule-key short circuit, without re-running steps.
    fn initialize_from_disk(&self, _info: &OnDiskBuildInfo) {}

    /// The hash of this rule's outward-visible interface, if the rule kind
    /// supports interface hashing. Available only once built (or restored
    /// from disk).
    fn abi_key(&self) -> Option<Sha1HashCode> {
        None
    }

    /// The key dependents may fold into their total rule keys in place of
    /// this rule's total key, letting them declare equality when only
    /// internals changed.
    fn abi_key_for_deps(&self) -> Option<Sha1HashCode> {
        None
    }

    /// For pre-dexed rules: the recorded linear-alloc footprint estimate
    /// used by dex splitting.
    fn linear_alloc_estimate(&self) -> Option<u64> {
        None
    }

    /// For resource rules: the text-symbols (R.txt) output.
    fn text_symbols_file(&self) -> Option<PathBuf> {
        None
    }

    /// For C++ rules: what a dependent's preprocessor needs from this
    /// rule.
    fn cxx_preprocessor_input(&self) -> Option<crate::rules::cxx::CxxPreprocessorInput> {
        None
    }

    /// For test rules: the class whose `main` drives the test run.
    fn test_main_class(&self) -> Option<String> {
        None
    }

    fn as_packageable(&self) -> Option<&dyn AndroidPackageable> {
        None
    }

    fn as_classpath(&self) -> Option<&dyn HasClasspathEntries> {
        None
    }

    fn as_native_linkable(&self) -> Option<&dyn NativeLinkable> {
        None
    }
}
