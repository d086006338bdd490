//! Shared fixture for integration tests: a scratch project in a temp
//! directory, built through the same wiring the CLI uses.

use std::path::Path;
use std::sync::Arc;

use kiln::attr::DescriptionRegistry;
use kiln::build::{keys, BuildContext, BuildEngine, BuildReport};
use kiln::build_files;
use kiln::config::Config;
use kiln::errors::BuildError;
use kiln::graph::{build_action_graph, ActionGraph};
use kiln::project::ProjectFilesystem;
use kiln::rules::RuleKeyCtx;
use kiln_cache::{ArtifactCache, NoopArtifactCache};
use kiln_hash::{FileHashCache, RuleKeyPair};
use kiln_target::BuildTarget;

pub struct TestProject {
    dir: tempfile::TempDir,
}

/// One build invocation's wiring, constructed fresh so that nothing
/// memoized leaks between "invocations" in a test.
pub struct Invocation {
    pub project: Arc<ProjectFilesystem>,
    pub config: Arc<Config>,
    pub graph: Arc<ActionGraph>,
    pub hashes: Arc<FileHashCache>,
}

impl TestProject {
    pub fn new() -> TestProject {
        TestProject { dir: tempfile::tempdir().expect("failed to create a temp project") }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, relative: &str, contents: &str) {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("failed to create parent dirs");
        }
        std::fs::write(path, contents).expect("failed to write fixture file");
    }

    pub fn read(&self, relative: &str) -> Vec<u8> {
        std::fs::read(self.dir.path().join(relative)).expect("failed to read fixture file")
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.dir.path().join(relative).exists()
    }

    /// Points the external JVM tools at `/bin/true` so java rules build
    /// without a JDK on the test machine.
    pub fn stub_jvm_tools(&self) {
        self.write(".buckconfig", "[tools]\n  javac = true\n");
    }

    pub fn invocation(&self) -> Invocation {
        let project = Arc::new(ProjectFilesystem::new(self.dir.path()));
        let config = Arc::new(Config::load(self.dir.path()).expect("config loads"));
        let registry = DescriptionRegistry::with_default_descriptions();
        let target_graph = build_files::load_target_graph(self.dir.path(), &registry)
            .expect("target graph loads");
        let graph = Arc::new(
            build_action_graph(
                &target_graph,
                &registry,
                Arc::clone(&project),
                Arc::clone(&config),
            )
            .expect("action graph builds"),
        );
        let hashes = Arc::new(FileHashCache::new(self.dir.path()));
        Invocation { project, config, graph, hashes }
    }

    pub fn build(&self, targets: &[&str]) -> Result<BuildReport, BuildError> {
        self.build_with_cache(Arc::new(NoopArtifactCache), targets)
    }

    pub fn build_with_cache(
        &self,
        cache: Arc<dyn ArtifactCache>,
        targets: &[&str],
    ) -> Result<BuildReport, BuildError> {
        let invocation = self.invocation();
        let context = BuildContext {
            project: invocation.project,
            graph: invocation.graph,
            config: invocation.config,
            hashes: invocation.hashes,
        };
        let engine = BuildEngine::new(context, cache);
        let roots: Vec<BuildTarget> = targets.iter().map(|t| target(t)).collect();
        let report = engine.build(&roots);
        engine.close();
        report
    }

    /// Computes a target's rule keys the way a fresh invocation would.
    pub fn rule_key_pair(&self, target_str: &str) -> RuleKeyPair {
        let invocation = self.invocation();
        let rule = invocation.graph.require(&target(target_str)).expect("rule exists");
        let ctx = RuleKeyCtx { hashes: &invocation.hashes, config: &invocation.config };
        keys::rule_key_pair(&rule, &invocation.graph, &ctx).expect("rule key computes")
    }
}

pub fn target(s: &str) -> BuildTarget {
    BuildTarget::parse(s).expect("test targets are well-formed")
}
