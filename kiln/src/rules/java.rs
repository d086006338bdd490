//! JVM rules: `java_library` (and its Android twin), `prebuilt_jar` and
//! `java_test`.
//!
//! A java library's output is a single jar. Alongside the jar the rule
//! records a class-name to class-hash map, from which its ABI key is
//! derived: when a library rebuilds but presents the same interface, the
//! engine uses the unchanged ABI to skip rebuilding dependents even
//! though their total rule keys moved.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use log::trace;
use walkdir::WalkDir;

use kiln_hash::{RuleKeyBuilder, Sha1HashCode};
use kiln_target::BuildTarget;

use crate::attr::{CoerceError, CoercionCtx, RawAttributes};
use crate::build::on_disk::OnDiskBuildInfo;
use crate::build::step::{CopyStep, MkdirStep, RemovePathStep, ShellStep, Step, ZipDirectoryStep};
use crate::build::BuildContext;
use crate::errors::BuildError;
use crate::graph::{ActionGraph, BuildRuleResolver};
use crate::rules::android::packageable::{AndroidPackageable, AndroidPackageableCollector};
use crate::rules::args::{JavaLibraryArgs, JavaTestArgs, PrebuiltJarArgs, RuleArgs};
use crate::rules::classpath::{
    self, ClasspathEntry, HasClasspathEntries,
};
use crate::rules::{
    Buildable, BuildableContext, BuildRule, BuildRuleParams, Description, RuleKeyCtx, RuleType,
};
use crate::target_graph::TargetNode;

const CLASSES_METADATA: &str = "classes";

pub struct JavaLibrary {
    target: BuildTarget,
    args: JavaLibraryArgs,
    classes_dir: PathBuf,
    output_jar: PathBuf,
    class_hashes: Mutex<Option<BTreeMap<String, Sha1HashCode>>>,
    transitive_classpath: Mutex<Option<Vec<ClasspathEntry>>>,
}

impl JavaLibrary {
    pub fn new(params: &BuildRuleParams, args: JavaLibraryArgs) -> JavaLibrary {
        let name = params.target.flavored_name();
        let classes_dir = params.project.scratch_dir(&params.target).join("classes");
        let output_jar = params
            .project
            .gen_dir(&params.target)
            .join(format!("lib__{}__output", name))
            .join(format!("{}.jar", name));
        JavaLibrary {
            target: params.target.clone(),
            args,
            classes_dir,
            output_jar,
            class_hashes: Mutex::new(None),
            transitive_classpath: Mutex::new(None),
        }
    }

    pub fn output_jar(&self) -> &PathBuf {
        &self.output_jar
    }

    /// The class-name to class-hash map recorded by the last build, if
    /// this rule has been built or restored in this invocation.
    pub fn class_hashes(&self) -> Option<BTreeMap<String, Sha1HashCode>> {
        self.class_hashes.lock().unwrap().clone()
    }

    fn classpath_roots(&self) -> Vec<BuildTarget> {
        let mut roots = self.args.deps.clone();
        roots.extend(self.args.exported_deps.iter().cloned());
        roots
    }

    fn set_class_hashes(&self, hashes: BTreeMap<String, Sha1HashCode>) {
        *self.class_hashes.lock().unwrap() = Some(hashes);
    }
}

/// SHA-1 over the sorted `(class name, class hash)` pairs.
pub fn abi_key_of(class_hashes: &BTreeMap<String, Sha1HashCode>) -> Sha1HashCode {
    let mut bytes = Vec::new();
    for (name, hash) in class_hashes {
        bytes.extend_from_slice(name.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(hash.as_bytes());
    }
    Sha1HashCode::of_bytes(&bytes)
}

fn encode_class_hashes(map: &BTreeMap<String, Sha1HashCode>) -> String {
    let strings: BTreeMap<&String, String> =
        map.iter().map(|(k, v)| (k, v.to_hex())).collect();
    serde_json::to_string(&strings).expect("string maps always serialize")
}

fn decode_class_hashes(encoded: &str) -> Option<BTreeMap<String, Sha1HashCode>> {
    let strings: BTreeMap<String, String> = serde_json::from_str(encoded).ok()?;
    let mut map = BTreeMap::new();
    for (name, hex) in strings {
        map.insert(name, Sha1HashCode::from_hex(&hex).ok()?);
    }
    Some(map)
}

impl Buildable for JavaLibrary {
    fn append_to_rule_key(
        &self,
        builder: &mut RuleKeyBuilder,
        ctx: &RuleKeyCtx<'_>,
    ) -> Result<(), BuildError> {
        ctx.set_source_paths(builder, "srcs", &self.args.srcs)?;
        ctx.set_source_paths(builder, "resources", &self.args.resources)?;
        match &self.args.proguard_config {
            Some(path) => {
                let hash = ctx.hashes.get(path)?;
                builder.set_source_path(
                    "proguard_config",
                    &path.to_string_lossy(),
                    hash,
                );
            }
            None => {
                builder.set_opt_str("proguard_config", None);
            }
        }
        builder.set_opt_str("source", self.args.source_level.as_deref());
        builder.set_opt_str("target", self.args.target_level.as_deref());
        builder.set_str("javac", &ctx.config.tool_fingerprint(&ctx.config.tools.javac));
        Ok(())
    }

    fn steps(
        &self,
        ctx: &BuildContext,
        _out: &mut BuildableContext,
    ) -> Result<Vec<Box<dyn Step>>, BuildError> {
        let mut steps: Vec<Box<dyn Step>> = vec![
            Box::new(RemovePathStep::new(self.classes_dir.clone())),
            Box::new(MkdirStep::new(self.classes_dir.clone())),
        ];

        if !self.args.srcs.is_empty() {
            let mut args = vec![
                "-d".to_owned(),
                self.classes_dir.to_string_lossy().into_owned(),
            ];
            let entries = self.transitive_classpath_entries(&ctx.graph);
            if !entries.is_empty() {
                args.push("-classpath".to_owned());
                args.push(classpath::to_classpath_argument(&entries));
            }
            if let Some(source) = &self.args.source_level {
                args.push("-source".to_owned());
                args.push(source.clone());
            }
            if let Some(target) = &self.args.target_level {
                args.push("-target".to_owned());
                args.push(target.clone());
            }
            for src in &self.args.srcs {
                args.push(src.to_string_lossy().into_owned());
            }
            steps.push(Box::new(ShellStep::new("javac", &ctx.config.tools.javac, args)));
        }

        // Classpath resources ride along inside the jar.
        for resource in &self.args.resources {
            let file_name = resource
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            steps.push(Box::new(CopyStep::new(
                resource.clone(),
                self.classes_dir.join(file_name),
            )));
        }

        steps.push(Box::new(ZipDirectoryStep::jar(
            self.classes_dir.clone(),
            self.output_jar.clone(),
        )));
        Ok(steps)
    }

    fn output_path(&self) -> Option<PathBuf> {
        Some(self.output_jar.clone())
    }

    fn on_build_finished(
        &self,
        ctx: &BuildContext,
        out: &mut BuildableContext,
    ) -> Result<(), BuildError> {
        let classes_root = ctx.project.resolve(&self.classes_dir);
        let mut hashes = BTreeMap::new();
        for entry in WalkDir::new(&classes_root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&classes_root)
                .expect("walkdir yields paths under its root");
            let rel = rel.to_string_lossy().replace('\\', "/");
            if let Some(stripped) = rel.strip_suffix(".class") {
                let class_name = stripped.replace('/', ".");
                let bytes = std::fs::read(entry.path())
                    .map_err(|e| BuildError::file_system(entry.path(), e))?;
                hashes.insert(class_name, Sha1HashCode::of_bytes(&bytes));
            }
        }
        trace!("{} produced {} class(es)", self.target, hashes.len());
        out.add_metadata(CLASSES_METADATA, encode_class_hashes(&hashes));
        self.set_class_hashes(hashes);
        Ok(())
    }

    fn initialize_from_disk(&self, info: &OnDiskBuildInfo) {
        if let Some(map) = info.get(CLASSES_METADATA).and_then(decode_class_hashes) {
            self.set_class_hashes(map);
        }
    }

    fn abi_key(&self) -> Option<Sha1HashCode> {
        self.class_hashes.lock().unwrap().as_ref().map(abi_key_of)
    }

    fn abi_key_for_deps(&self) -> Option<Sha1HashCode> {
        self.abi_key()
    }

    fn as_classpath(&self) -> Option<&dyn HasClasspathEntries> {
        Some(self)
    }

    fn as_packageable(&self) -> Option<&dyn AndroidPackageable> {
        Some(self)
    }
}

impl HasClasspathEntries for JavaLibrary {
    fn output_classpath_entries(&self) -> Vec<ClasspathEntry> {
        vec![(self.target.clone(), self.output_jar.clone())]
    }

    fn declared_classpath_entries(&self, graph: &ActionGraph) -> Vec<ClasspathEntry> {
        let mut entries = self.output_classpath_entries();
        for dep in self.classpath_roots() {
            if let Some(rule) = graph.get(&dep) {
                if let Some(classpath) = rule.buildable().as_classpath() {
                    entries.extend(classpath.output_classpath_entries());
                }
            }
        }
        entries
    }

    fn transitive_classpath_entries(&self, graph: &ActionGraph) -> Vec<ClasspathEntry> {
        let mut slot = self.transitive_classpath.lock().unwrap();
        if let Some(entries) = slot.as_ref() {
            return entries.clone();
        }
        let entries = classpath::transitive_classpath(graph, &self.classpath_roots());
        *slot = Some(entries.clone());
        entries
    }
}

impl AndroidPackageable for JavaLibrary {
    fn required_packageables(&self) -> Vec<BuildTarget> {
        self.classpath_roots()
    }

    fn add_to_collector(
        &self,
        collector: &mut AndroidPackageableCollector,
    ) -> Result<(), BuildError> {
        collector.add_classpath_entry(&self.target, self.output_jar.clone());
        if let Some(hashes) = self.class_hashes() {
            collector.add_class_hashes(&self.target, hashes);
        }
        if let Some(config) = &self.args.proguard_config {
            collector.add_proguard_config(&self.target, config.clone());
        }
        Ok(())
    }
}

pub struct JavaLibraryDescription {
    rule_type: RuleType,
}

impl JavaLibraryDescription {
    /// `java_library` and `android_library` share one description body;
    /// only the type tag differs.
    pub fn new(rule_type: RuleType) -> JavaLibraryDescription {
        JavaLibraryDescription { rule_type }
    }
}

impl Description for JavaLibraryDescription {
    fn rule_type(&self) -> RuleType {
        self.rule_type
    }

    fn coerce(
        &self,
        ctx: &CoercionCtx<'_>,
        raw: &RawAttributes,
    ) -> Result<RuleArgs, CoerceError> {
        Ok(RuleArgs::JavaLibrary(JavaLibraryArgs::coerce(ctx, raw)?))
    }

    fn create_build_rule(
        &self,
        params: BuildRuleParams,
        _resolver: &mut BuildRuleResolver,
        node: &TargetNode,
    ) -> Result<BuildRule, BuildError> {
        let args = match &node.args {
            RuleArgs::JavaLibrary(args) => args.clone(),
            _ => unreachable!("java_library created from foreign args"),
        };
        let buildable = JavaLibrary::new(&params, args);
        Ok(BuildRule::new(params, self.rule_type, Box::new(buildable)))
    }
}

/// A jar checked into the tree. Its classpath contribution is a copy of
/// the jar under `buck-out`, so dependents never reference source paths.
pub struct PrebuiltJar {
    target: BuildTarget,
    binary_jar: PathBuf,
    output_jar: PathBuf,
    abi: Mutex<Option<Sha1HashCode>>,
}

impl PrebuiltJar {
    pub fn new(params: &BuildRuleParams, args: &PrebuiltJarArgs) -> PrebuiltJar {
        let output_jar = params.project.gen_path(
            &params.target,
            &format!("{}.jar", params.target.flavored_name()),
        );
        PrebuiltJar {
            target: params.target.clone(),
            binary_jar: args.binary_jar.clone(),
            output_jar,
            abi: Mutex::new(None),
        }
    }
}

impl Buildable for PrebuiltJar {
    fn append_to_rule_key(
        &self,
        builder: &mut RuleKeyBuilder,
        ctx: &RuleKeyCtx<'_>,
    ) -> Result<(), BuildError> {
        let hash = ctx.hashes.get(&self.binary_jar)?;
        builder.set_source_path("binary_jar", &self.binary_jar.to_string_lossy(), hash);
        Ok(())
    }

    fn steps(
        &self,
        _ctx: &BuildContext,
        _out: &mut BuildableContext,
    ) -> Result<Vec<Box<dyn Step>>, BuildError> {
        Ok(vec![Box::new(CopyStep::new(self.binary_jar.clone(), self.output_jar.clone()))])
    }

    fn output_path(&self) -> Option<PathBuf> {
        Some(self.output_jar.clone())
    }

    fn on_build_finished(
        &self,
        ctx: &BuildContext,
        out: &mut BuildableContext,
    ) -> Result<(), BuildError> {
        let hash = ctx.hashes.get(&self.binary_jar)?;
        out.add_metadata("abi", hash.to_hex());
        *self.abi.lock().unwrap() = Some(hash);
        Ok(())
    }

    fn initialize_from_disk(&self, info: &OnDiskBuildInfo) {
        if let Some(hash) = info.get("abi").and_then(|hex| Sha1HashCode::from_hex(hex).ok()) {
            *self.abi.lock().unwrap() = Some(hash);
        }
    }

    fn abi_key(&self) -> Option<Sha1HashCode> {
        *self.abi.lock().unwrap()
    }

    fn as_classpath(&self) -> Option<&dyn HasClasspathEntries> {
        Some(self)
    }

    fn as_packageable(&self) -> Option<&dyn AndroidPackageable> {
        Some(self)
    }
}

impl HasClasspathEntries for PrebuiltJar {
    fn output_classpath_entries(&self) -> Vec<ClasspathEntry> {
        vec![(self.target.clone(), self.output_jar.clone())]
    }

    fn declared_classpath_entries(&self, _graph: &ActionGraph) -> Vec<ClasspathEntry> {
        self.output_classpath_entries()
    }

    fn transitive_classpath_entries(&self, _graph: &ActionGraph) -> Vec<ClasspathEntry> {
        self.output_classpath_entries()
    }
}

impl AndroidPackageable for PrebuiltJar {
    fn required_packageables(&self) -> Vec<BuildTarget> {
        vec![]
    }

    fn add_to_collector(
        &self,
        collector: &mut AndroidPackageableCollector,
    ) -> Result<(), BuildError> {
        collector.add_classpath_entry(&self.target, self.output_jar.clone());
        Ok(())
    }
}

pub struct PrebuiltJarDescription;

impl Description for PrebuiltJarDescription {
    fn rule_type(&self) -> RuleType {
        RuleType::PrebuiltJar
    }

    fn coerce(
        &self,
        ctx: &CoercionCtx<'_>,
        raw: &RawAttributes,
    ) -> Result<RuleArgs, CoerceError> {
        Ok(RuleArgs::PrebuiltJar(PrebuiltJarArgs::coerce(ctx, raw)?))
    }

    fn create_build_rule(
        &self,
        params: BuildRuleParams,
        _resolver: &mut BuildRuleResolver,
        node: &TargetNode,
    ) -> Result<BuildRule, BuildError> {
        let args = match &node.args {
            RuleArgs::PrebuiltJar(args) => args,
            _ => unreachable!("prebuilt_jar created from foreign args"),
        };
        let buildable = PrebuiltJar::new(&params, args);
        Ok(BuildRule::new(params, RuleType::PrebuiltJar, Box::new(buildable)))
    }
}

/// A test rule is a java library whose jar the `test` command knows how
/// to run.
pub struct JavaTest {
    library: JavaLibrary,
    test_main_class: Option<String>,
}

impl JavaTest {
    pub fn new(params: &BuildRuleParams, args: &JavaTestArgs) -> JavaTest {
        JavaTest {
            library: JavaLibrary::new(params, args.library.clone()),
            test_main_class: args.test_main_class.clone(),
        }
    }
}

impl Buildable for JavaTest {
    fn append_to_rule_key(
        &self,
        builder: &mut RuleKeyBuilder,
        ctx: &RuleKeyCtx<'_>,
    ) -> Result<(), BuildError> {
        self.library.append_to_rule_key(builder, ctx)?;
        builder.set_opt_str("test_main_class", self.test_main_class.as_deref());
        Ok(())
    }

    fn steps(
        &self,
        ctx: &BuildContext,
        out: &mut BuildableContext,
    ) -> Result<Vec<Box<dyn Step>>, BuildError> {
        self.library.steps(ctx, out)
    }

    fn output_path(&self) -> Option<PathBuf> {
        self.library.output_path()
    }

    fn on_build_finished(
        &self,
        ctx: &BuildContext,
        out: &mut BuildableContext,
    ) -> Result<(), BuildError> {
        self.library.on_build_finished(ctx, out)
    }

    fn initialize_from_disk(&self, info: &OnDiskBuildInfo) {
        self.library.initialize_from_disk(info);
    }

    fn test_main_class(&self) -> Option<String> {
        self.test_main_class.clone()
    }

    fn as_classpath(&self) -> Option<&dyn HasClasspathEntries> {
        Some(&self.library)
    }
}

pub struct JavaTestDescription;

impl Description for JavaTestDescription {
    fn rule_type(&self) -> RuleType {
        RuleType::JavaTest
    }

    fn coerce(
        &self,
        ctx: &CoercionCtx<'_>,
        raw: &RawAttributes,
    ) -> Result<RuleArgs, CoerceError> {
        Ok(RuleArgs::JavaTest(JavaTestArgs::coerce(ctx, raw)?))
    }

    fn create_build_rule(
        &self,
        params: BuildRuleParams,
        _resolver: &mut BuildRuleResolver,
        node: &TargetNode,
    ) -> Result<BuildRule, BuildError> {
        let args = match &node.args {
            RuleArgs::JavaTest(args) => args,
            _ => unreachable!("java_test created from foreign args"),
        };
        let buildable = JavaTest::new(&params, args);
        Ok(BuildRule::new(params, RuleType::JavaTest, Box::new(buildable)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_key_tracks_interface_only() {
        let mut a = BTreeMap::new();
        a.insert("com.example.A".to_owned(), Sha1HashCode::of_bytes(b"A v1"));
        a.insert("com.example.B".to_owned(), Sha1HashCode::of_bytes(b"B v1"));
        let key_a = abi_key_of(&a);

        // Same map, same key.
        assert_eq!(key_a, abi_key_of(&a.clone()));

        // A changed class hash changes the key.
        let mut b = a.clone();
        b.insert("com.example.B".to_owned(), Sha1HashCode::of_bytes(b"B v2"));
        assert_ne!(key_a, abi_key_of(&b));

        // A new class changes the key.
        let mut c = a.clone();
        c.insert("com.example.C".to_owned(), Sha1HashCode::of_bytes(b"C v1"));
        assert_ne!(key_a, abi_key_of(&c));
    }

    #[test]
    fn class_hashes_round_trip_through_metadata() {
        let mut map = BTreeMap::new();
        map.insert("com.example.A".to_owned(), Sha1HashCode::of_bytes(b"A"));
        map.insert("com.example.B$Inner".to_owned(), Sha1HashCode::of_bytes(b"B$Inner"));
        let decoded = decode_class_hashes(&encode_class_hashes(&map)).unwrap();
        assert_eq!(map, decoded);
    }
}
