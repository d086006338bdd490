//! `android_binary`: the APK pipeline, assembled by graph enhancement.
//!
//! Creating the rule aggregates the packageable collection of its deps and
//! registers the helper rules the pipeline needs: one
//! `#buildconfig_<pkg>` per collected build-config package, the
//! `#dummy_r_dot_java` and `#uber_r_dot_java` generators, and (when dex
//! splitting) one `#dex` pre-dex helper per library jar. The binary's own
//! action sequence is fixed: filter resources, aapt package, R.java,
//! ProGuard (release only), dex (pre-dexed merge or single dx),
//! apkbuilder, optional resource repack, zipalign.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use log::trace;
use regex::RegexSet;

use kiln_hash::RuleKeyBuilder;
use kiln_target::BuildTarget;

use crate::attr::{CoerceError, CoercionCtx, RawAttributes};
use crate::build::step::{
    ExecutionContext, MkdirStep, RepackZipStep, ShellStep, Step, StepOutcome, WriteFileStep,
    XzStep,
};
use crate::build::BuildContext;
use crate::errors::BuildError;
use crate::graph::BuildRuleResolver;
use crate::rules::android::build_config::AndroidBuildConfig;
use crate::rules::android::packageable::{self, AndroidPackageableCollection};
use crate::rules::android::pre_dex::{PreDex, DEX_FLAVOR};
use crate::rules::android::smart_dex;
use crate::rules::android::split_dex::{
    self, DexInput, SecondaryDexMetadataStep, SECONDARY_DEX_JAR_DIR, SECONDARY_DEX_METADATA,
};
use crate::rules::args::{
    AndroidBinaryArgs, AndroidBuildConfigArgs, DexStore, PackageType, RuleArgs,
};
use crate::rules::{
    Buildable, BuildableContext, BuildRule, BuildRuleParams, Description, RuleKeyCtx, RuleType,
};
use crate::target_graph::TargetNode;

pub struct AndroidBinary {
    target: BuildTarget,
    args: AndroidBinaryArgs,
    collection: AndroidPackageableCollection,
    /// `#dex` helpers, in collection order; empty unless split_dex.
    dex_targets: Vec<BuildTarget>,
    scratch: PathBuf,
    output_apk: PathBuf,
}

impl AndroidBinary {
    fn resources_apk(&self) -> PathBuf {
        self.scratch.join(format!("{}.unsigned-resources.apk", self.target.short_name()))
    }

    fn classes_dex(&self) -> PathBuf {
        self.scratch.join("classes.dex")
    }

    fn secondary_assets_root(&self) -> PathBuf {
        self.scratch.join("secondary-dex-assets")
    }

    fn unsigned_apk(&self) -> PathBuf {
        self.scratch.join(format!("{}.unsigned.apk", self.target.short_name()))
    }

    fn proguard_dir(&self) -> PathBuf {
        self.scratch.join("proguard")
    }

    /// The dex inputs for bucketing, read from the pre-dex helper rules.
    fn dex_inputs(&self, ctx: &BuildContext) -> Result<Vec<DexInput>, BuildError> {
        let mut inputs = vec![];
        for target in &self.dex_targets {
            let rule = ctx.graph.require(target)?;
            let buildable = rule.buildable();
            let dex_jar = buildable
                .output_path()
                .expect("pre-dex helpers always have an output");
            let linear_alloc = buildable.linear_alloc_estimate().unwrap_or_else(|| {
                // The helper built before us, so the estimate is always
                // recorded; a missing value means a fresh checkout where
                // the jar itself is the best approximation.
                fs::metadata(ctx.project.resolve(&dex_jar)).map(|m| m.len()).unwrap_or(0)
            });
            let classes = split_dex::classes_in_jar(&ctx.project.resolve(&dex_jar))
                .unwrap_or_default();
            inputs.push(DexInput {
                owner: target.unflavored(),
                dex_jar,
                linear_alloc,
                classes,
            });
        }
        Ok(inputs)
    }

    fn primary_dex_classes(
        &self,
        ctx: &BuildContext,
    ) -> Result<Option<HashSet<String>>, BuildError> {
        match &self.args.primary_dex_classes_file {
            None => Ok(None),
            Some(path) => {
                let bytes = ctx.project.read_file(path)?;
                let classes = String::from_utf8_lossy(&bytes)
                    .lines()
                    .map(|l| l.trim().to_owned())
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .collect();
                Ok(Some(classes))
            }
        }
    }

    fn split_dex_steps(
        &self,
        ctx: &BuildContext,
        steps: &mut Vec<Box<dyn Step>>,
    ) -> Result<(), BuildError> {
        let patterns = RegexSet::new(&self.args.primary_dex_patterns)
            .map_err(|e| BuildError::UserInput(format!("bad primary dex pattern: {}", e)))?;
        let primary_classes = self.primary_dex_classes(ctx)?;
        let inputs = self.dex_inputs(ctx)?;
        let buckets = split_dex::bucket(
            inputs,
            self.args.linear_alloc_hard_limit,
            &patterns,
            primary_classes.as_ref(),
        )?;
        trace!(
            "{}: {} primary input(s), {} secondary bucket(s)",
            self.target,
            buckets.primary.len(),
            buckets.secondary.len()
        );

        // Primary dex: merge the primary bucket's pre-dexed jars.
        let primary_jars: Vec<PathBuf> =
            buckets.primary.iter().map(|i| i.dex_jar.clone()).collect();
        if primary_jars.is_empty() {
            // Nothing routed to the primary dex; ship an empty one.
            steps.push(Box::new(WriteFileStep::new(self.classes_dex(), vec![])));
        } else {
            steps.push(Box::new(smart_dex::dx_step(
                &ctx.config,
                &self.classes_dex(),
                &primary_jars,
            )));
        }

        // Secondary dexes land under the assets tree apkbuilder packages.
        let jar_dir = self.secondary_assets_root().join(SECONDARY_DEX_JAR_DIR);
        steps.push(Box::new(MkdirStep::new(jar_dir.clone())));
        let mut metadata_entries = vec![];
        for (n, bucket) in buckets.secondary.iter().enumerate() {
            let number = n + 1;
            let jars: Vec<PathBuf> = bucket.iter().map(|i| i.dex_jar.clone()).collect();
            let raw = self.scratch.join(format!("secondary-{}.raw.jar", number));
            let jar = jar_dir.join(format!("secondary-{}.dex.jar", number));
            steps.push(Box::new(smart_dex::dx_step(&ctx.config, &raw, &jars)));
            // Froyo cannot open deflated secondary dexes; store them.
            steps.push(Box::new(RepackZipStep::stored(raw, jar.clone())));
            let first_class = buckets
                .secondary_first_class(n)
                .unwrap_or_default()
                .to_owned();
            match self.args.dex_store {
                DexStore::Jar => {
                    metadata_entries.push((jar, first_class));
                }
                DexStore::XzJar => {
                    let xz = jar_dir.join(format!("secondary-{}.dex.jar.xz", number));
                    steps.push(Box::new(XzStep::new(jar.clone(), xz.clone())));
                    steps.push(Box::new(crate::build::step::RemovePathStep::new(jar)));
                    metadata_entries.push((xz, first_class));
                }
            }
        }
        steps.push(Box::new(SecondaryDexMetadataStep::new(
            metadata_entries,
            jar_dir.join(SECONDARY_DEX_METADATA),
        )));
        Ok(())
    }
}

impl Buildable for AndroidBinary {
    fn append_to_rule_key(
        &self,
        builder: &mut RuleKeyBuilder,
        ctx: &RuleKeyCtx<'_>,
    ) -> Result<(), BuildError> {
        let manifest_hash = ctx.hashes.get(&self.args.manifest)?;
        builder.set_source_path(
            "manifest",
            &self.args.manifest.to_string_lossy(),
            manifest_hash,
        );
        builder.set_str("package_type", self.args.package_type.as_str());
        builder.set_bool("split_dex", self.args.split_dex);
        builder.set_int("linear_alloc_hard_limit", self.args.linear_alloc_hard_limit as i64);
        builder.set_strings("primary_dex_patterns", &self.args.primary_dex_patterns);
        match &self.args.primary_dex_classes_file {
            Some(path) => {
                let hash = ctx.hashes.get(path)?;
                builder.set_source_path(
                    "primary_dex_classes_file",
                    &path.to_string_lossy(),
                    hash,
                );
            }
            None => {
                builder.set_opt_str("primary_dex_classes_file", None);
            }
        }
        let mut no_dx: Vec<String> =
            self.args.no_dx.iter().map(|t| t.to_string()).collect();
        no_dx.sort();
        builder.set_strings("no_dx", &no_dx);
        let mut excluded: Vec<String> =
            self.args.excluded_resource_deps.iter().map(|t| t.to_string()).collect();
        excluded.sort();
        builder.set_strings("excluded_resource_deps", &excluded);
        builder.set_strings("resource_filter", &self.args.resource_filter);
        builder.set_bool("compress_resources", self.args.compress_resources);
        builder.set_str(
            "dex_store",
            match self.args.dex_store {
                DexStore::Jar => "jar",
                DexStore::XzJar => "xz",
            },
        );
        match &self.args.keystore {
            Some(path) => {
                let hash = ctx.hashes.get(path)?;
                builder.set_source_path("keystore", &path.to_string_lossy(), hash);
            }
            None => {
                builder.set_opt_str("keystore", None);
            }
        }
        match &self.args.proguard_config {
            Some(path) => {
                let hash = ctx.hashes.get(path)?;
                builder.set_source_path("proguard_config", &path.to_string_lossy(), hash);
            }
            None => {
                builder.set_opt_str("proguard_config", None);
            }
        }
        builder.set_str("aapt", &ctx.config.tool_fingerprint(&ctx.config.tools.aapt));
        builder.set_str("dx", &ctx.config.tool_fingerprint(&ctx.config.tools.dx));
        builder
            .set_str("apkbuilder", &ctx.config.tool_fingerprint(&ctx.config.tools.apkbuilder));
        builder.set_str("zipalign", &ctx.config.tool_fingerprint(&ctx.config.tools.zipalign));
        Ok(())
    }

    fn steps(
        &self,
        ctx: &BuildContext,
        _out: &mut BuildableContext,
    ) -> Result<Vec<Box<dyn Step>>, BuildError> {
        let mut steps: Vec<Box<dyn Step>> = vec![Box::new(MkdirStep::new(self.scratch.clone()))];

        // Resource filtering precedes aapt.
        let res_dirs = if self.args.resource_filter.is_empty() {
            self.collection.resource_dirs.clone()
        } else {
            let filtered_root = self.scratch.join("filtered-res");
            steps.push(Box::new(FilterResourcesStep::new(
                self.collection.resource_dirs.clone(),
                filtered_root.clone(),
                self.args.resource_filter.clone(),
            )));
            (0..self.collection.resource_dirs.len())
                .map(|i| filtered_root.join(i.to_string()))
                .collect()
        };

        // aapt package. --auto-add-overlay is hard-coded, and there is
        // deliberately no way to pass --no-crunch: aapt distorts some
        // pre-crunched images when crunching is disabled, so we always
        // let it crunch.
        let r_java_dir = self.scratch.join("aapt-r-java");
        steps.push(Box::new(MkdirStep::new(r_java_dir.clone())));
        let mut aapt_args = vec![
            "package".to_owned(),
            "-f".to_owned(),
            "--auto-add-overlay".to_owned(),
            "-M".to_owned(),
            self.args.manifest.to_string_lossy().into_owned(),
        ];
        for dir in &res_dirs {
            aapt_args.push("-S".to_owned());
            aapt_args.push(dir.to_string_lossy().into_owned());
        }
        for dir in &self.collection.asset_dirs {
            aapt_args.push("-A".to_owned());
            aapt_args.push(dir.to_string_lossy().into_owned());
        }
        aapt_args.push("-J".to_owned());
        aapt_args.push(r_java_dir.to_string_lossy().into_owned());
        aapt_args.push("-F".to_owned());
        aapt_args.push(self.resources_apk().to_string_lossy().into_owned());
        steps.push(Box::new(ShellStep::new("aapt", &ctx.config.tools.aapt, aapt_args)));

        // ProGuard runs only for release packages.
        let mut dex_input_jars: Vec<PathBuf> =
            self.collection.classpath_entries_to_dex.iter().map(|(_, jar)| jar.clone()).collect();
        if self.args.package_type == PackageType::Release {
            let proguard_dir = self.proguard_dir();
            steps.push(Box::new(MkdirStep::new(proguard_dir.clone())));
            let mut out_jars = vec![];
            let mut argfile = String::new();
            for (i, jar) in dex_input_jars.iter().enumerate() {
                let out_jar = proguard_dir.join(format!("{}.obfuscated.jar", i));
                argfile.push_str(&format!(
                    "-injars {}\n-outjars {}\n",
                    jar.display(),
                    out_jar.display()
                ));
                out_jars.push(out_jar);
            }
            for config in &self.collection.proguard_configs {
                argfile.push_str(&format!("-include {}\n", config.display()));
            }
            if let Some(config) = &self.args.proguard_config {
                argfile.push_str(&format!("-include {}\n", config.display()));
            }
            let argfile_path = proguard_dir.join("command-line.txt");
            steps.push(Box::new(WriteFileStep::new(
                argfile_path.clone(),
                argfile.into_bytes(),
            )));
            steps.push(Box::new(ShellStep::new(
                "proguard",
                &ctx.config.tools.proguard,
                vec![format!("@{}", argfile_path.display())],
            )));
            // ProGuard omits an -outjars whose -injars was stripped to
            // nothing; every declared output must exist regardless.
            steps.push(Box::new(EnsureJarsExistStep::new(out_jars.clone())));
            if !self.args.split_dex {
                dex_input_jars = out_jars;
            }
        }

        // Dex.
        if self.args.split_dex {
            self.split_dex_steps(ctx, &mut steps)?;
        } else if dex_input_jars.is_empty() {
            steps.push(Box::new(WriteFileStep::new(self.classes_dex(), vec![])));
        } else {
            steps.push(Box::new(smart_dex::dx_step(
                &ctx.config,
                &self.classes_dex(),
                &dex_input_jars,
            )));
        }

        // apkbuilder assembles the unsigned APK from the aapt output, the
        // dex files and native libraries.
        let mut apk_args = vec![
            self.unsigned_apk().to_string_lossy().into_owned(),
            "-u".to_owned(),
            "-z".to_owned(),
            self.resources_apk().to_string_lossy().into_owned(),
            "-f".to_owned(),
            self.classes_dex().to_string_lossy().into_owned(),
        ];
        if self.args.split_dex {
            apk_args.push("-rf".to_owned());
            apk_args.push(self.secondary_assets_root().to_string_lossy().into_owned());
        }
        for dir in &self.collection.native_lib_dirs {
            apk_args.push("-nf".to_owned());
            apk_args.push(dir.to_string_lossy().into_owned());
        }
        if let Some(keystore) = &self.args.keystore {
            apk_args.push("-k".to_owned());
            apk_args.push(keystore.to_string_lossy().into_owned());
        }
        steps.push(Box::new(ShellStep::new(
            "apkbuilder",
            &ctx.config.tools.apkbuilder,
            apk_args,
        )));

        // Optional resource repack, then zipalign into the final APK.
        let mut current = self.unsigned_apk();
        if self.args.compress_resources {
            let repacked = self.scratch.join(format!(
                "{}.compressed.apk",
                self.target.short_name()
            ));
            steps.push(Box::new(RepackZipStep::stored(current, repacked.clone())));
            current = repacked;
        }
        steps.push(Box::new(ShellStep::new(
            "zipalign",
            &ctx.config.tools.zipalign,
            vec![
                "-f".to_owned(),
                "4".to_owned(),
                current.to_string_lossy().into_owned(),
                self.output_apk.to_string_lossy().into_owned(),
            ],
        )));

        Ok(steps)
    }

    fn output_path(&self) -> Option<PathBuf> {
        Some(self.output_apk.clone())
    }
}

/// Copies resource trees, dropping `values-<locale>` directories for
/// locales outside the configured filter.
pub struct FilterResourcesStep {
    res_dirs: Vec<PathBuf>,
    dest_root: PathBuf,
    locales: Vec<String>,
}

impl FilterResourcesStep {
    pub fn new(
        res_dirs: Vec<PathBuf>,
        dest_root: PathBuf,
        locales: Vec<String>,
    ) -> FilterResourcesStep {
        FilterResourcesStep { res_dirs, dest_root, locales }
    }

    fn keep(&self, relative: &Path) -> bool {
        for component in relative.components() {
            let name = component.as_os_str().to_string_lossy();
            if let Some(locale) = name.strip_prefix("values-") {
                if !self.locales.iter().any(|l| l == locale) {
                    return false;
                }
            }
        }
        true
    }
}

impl Step for FilterResourcesStep {
    fn short_name(&self) -> &str {
        "filter_resources"
    }

    fn description(&self) -> String {
        format!(
            "filter {} resource dir(s) to locales [{}]",
            self.res_dirs.len(),
            self.locales.join(", ")
        )
    }

    fn execute(&self, ctx: &ExecutionContext) -> StepOutcome {
        let result = (|| -> io::Result<()> {
            for (i, dir) in self.res_dirs.iter().enumerate() {
                let src_root = ctx.project.resolve(dir);
                let dest_root = ctx.project.resolve(&self.dest_root.join(i.to_string()));
                for entry in walkdir::WalkDir::new(&src_root)
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_file())
                {
                    let rel = entry
                        .path()
                        .strip_prefix(&src_root)
                        .expect("walkdir yields paths under its root");
                    if !self.keep(rel) {
                        continue;
                    }
                    let dest = dest_root.join(rel);
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::copy(entry.path(), &dest)?;
                }
            }
            Ok(())
        })();
        match result {
            Ok(()) => StepOutcome::success(),
            Err(e) => StepOutcome::failure(1, e.to_string()),
        }
    }
}

/// Creates an empty, valid zip for every listed jar that does not exist.
pub struct EnsureJarsExistStep {
    jars: Vec<PathBuf>,
}

impl EnsureJarsExistStep {
    pub fn new(jars: Vec<PathBuf>) -> EnsureJarsExistStep {
        EnsureJarsExistStep { jars }
    }
}

impl Step for EnsureJarsExistStep {
    fn short_name(&self) -> &str {
        "ensure_jars_exist"
    }

    fn description(&self) -> String {
        format!("ensure {} jar(s) exist", self.jars.len())
    }

    fn execute(&self, ctx: &ExecutionContext) -> StepOutcome {
        for jar in &self.jars {
            let full = ctx.project.resolve(jar);
            if full.exists() {
                continue;
            }
            let result = (|| -> io::Result<()> {
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut writer = zip::ZipWriter::new(File::create(&full)?);
                writer
                    .finish()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                Ok(())
            })();
            if let Err(e) = result {
                return StepOutcome::failure(1, e.to_string());
            }
        }
        StepOutcome::success()
    }
}

/// Generates `R.java` sources: dummy (empty resource ids, used to compile
/// libraries before real ids exist) or uber (real ids parsed from every
/// collected text-symbols file).
pub struct GenerateRDotJavaStep {
    packages: Vec<String>,
    text_symbol_files: Vec<PathBuf>,
    output_dir: PathBuf,
}

impl GenerateRDotJavaStep {
    pub fn new(
        packages: Vec<String>,
        text_symbol_files: Vec<PathBuf>,
        output_dir: PathBuf,
    ) -> GenerateRDotJavaStep {
        GenerateRDotJavaStep { packages, text_symbol_files, output_dir }
    }
}

impl Step for GenerateRDotJavaStep {
    fn short_name(&self) -> &str {
        "generate_r_dot_java"
    }

    fn description(&self) -> String {
        format!(
            "generate R.java for [{}] from {} symbol file(s)",
            self.packages.join(", "),
            self.text_symbol_files.len()
        )
    }

    fn execute(&self, ctx: &ExecutionContext) -> StepOutcome {
        let result = (|| -> io::Result<()> {
            // type -> (name -> value), from "int <type> <name> <value>"
            // text-symbols lines.
            let mut symbols: std::collections::BTreeMap<
                String,
                std::collections::BTreeMap<String, String>,
            > = std::collections::BTreeMap::new();
            for file in &self.text_symbol_files {
                let full = ctx.project.resolve(file);
                if !full.exists() {
                    continue;
                }
                for line in fs::read_to_string(&full)?.lines() {
                    let mut parts = line.split_whitespace();
                    let (kind, ty, name) =
                        match (parts.next(), parts.next(), parts.next()) {
                            (Some(kind), Some(ty), Some(name)) => (kind, ty, name),
                            _ => continue,
                        };
                    if kind != "int" && kind != "int[]" {
                        continue;
                    }
                    let value: String =
                        parts.collect::<Vec<&str>>().join(" ");
                    symbols
                        .entry(ty.to_owned())
                        .or_default()
                        .insert(name.to_owned(), value);
                }
            }

            for package in &self.packages {
                let mut source = String::new();
                source.push_str("// Generated by kiln. Do not edit.\n");
                source.push_str(&format!("package {};\n\npublic final class R {{\n", package));
                for (ty, names) in &symbols {
                    source.push_str(&format!("  public static final class {} {{\n", ty));
                    for (name, value) in names {
                        source.push_str(&format!(
                            "    public static final int {} = {};\n",
                            name,
                            if value.is_empty() { "0" } else { value }
                        ));
                    }
                    source.push_str("  }\n");
                }
                source.push_str("}\n");

                let package_dir: PathBuf = package.split('.').collect();
                let dest =
                    ctx.project.resolve(&self.output_dir.join(package_dir).join("R.java"));
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(dest, source)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => StepOutcome::success(),
            Err(e) => StepOutcome::failure(1, e.to_string()),
        }
    }
}

/// The `#dummy_r_dot_java` / `#uber_r_dot_java` helper rules.
pub struct RDotJava {
    packages: Vec<String>,
    text_symbol_files: Vec<PathBuf>,
    output_dir: PathBuf,
    dummy: bool,
}

impl RDotJava {
    fn new(
        params: &BuildRuleParams,
        packages: Vec<String>,
        text_symbol_files: Vec<PathBuf>,
        dummy: bool,
    ) -> RDotJava {
        let output_dir = params.project.annotation_dir(&params.target);
        RDotJava { packages, text_symbol_files, output_dir, dummy }
    }
}

impl Buildable for RDotJava {
    fn append_to_rule_key(
        &self,
        builder: &mut RuleKeyBuilder,
        _ctx: &RuleKeyCtx<'_>,
    ) -> Result<(), BuildError> {
        builder.set_strings("packages", &self.packages);
        builder.set_bool("dummy", self.dummy);
        // Text-symbol contents are covered by the resource deps' keys.
        let paths: Vec<String> = self
            .text_symbol_files
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        builder.set_strings("text_symbols", &paths);
        Ok(())
    }

    fn steps(
        &self,
        _ctx: &BuildContext,
        out: &mut BuildableContext,
    ) -> Result<Vec<Box<dyn Step>>, BuildError> {
        out.record_artifact(self.output_dir.clone());
        let files = if self.dummy { vec![] } else { self.text_symbol_files.clone() };
        Ok(vec![Box::new(GenerateRDotJavaStep::new(
            self.packages.clone(),
            files,
            self.output_dir.clone(),
        ))])
    }

    fn output_path(&self) -> Option<PathBuf> {
        Some(self.output_dir.clone())
    }
}

pub struct AndroidBinaryDescription;

impl Description for AndroidBinaryDescription {
    fn rule_type(&self) -> RuleType {
        RuleType::AndroidBinary
    }

    fn coerce(
        &self,
        ctx: &CoercionCtx<'_>,
        raw: &RawAttributes,
    ) -> Result<RuleArgs, CoerceError> {
        Ok(RuleArgs::AndroidBinary(AndroidBinaryArgs::coerce(ctx, raw)?))
    }

    fn create_build_rule(
        &self,
        params: BuildRuleParams,
        resolver: &mut BuildRuleResolver,
        node: &TargetNode,
    ) -> Result<BuildRule, BuildError> {
        let args = match &node.args {
            RuleArgs::AndroidBinary(args) => args.clone(),
            _ => unreachable!("android_binary created from foreign args"),
        };

        let mut collector = packageable::AndroidPackageableCollector::new(
            params.target.clone(),
            args.no_dx.clone(),
            args.excluded_resource_deps.clone(),
        );
        packageable::collect(resolver, &args.deps, &mut collector)?;
        let collection = collector.build();

        let mut extra_deps: Vec<BuildTarget> = vec![];

        // One build-config helper per collected package.
        for (package, constants) in &collection.build_config_constants {
            let child = params.child(&format!("buildconfig_{}", package), vec![]);
            let helper_args = AndroidBuildConfigArgs {
                java_package: package.clone(),
                constants: constants.clone(),
            };
            let buildable = AndroidBuildConfig::new(&child, &helper_args);
            let rule =
                BuildRule::new(child, RuleType::BuildConfigHelper, Box::new(buildable));
            extra_deps.push(resolver.add_to_index(rule).target().clone());
        }

        // R.java generators. The dummy variant has no deps; the uber
        // variant depends on every resource rule whose text symbols it
        // reads.
        let resource_dep_targets: Vec<BuildTarget> = args
            .deps
            .iter()
            .filter(|dep| {
                resolver
                    .get(dep)
                    .map_or(false, |r| r.buildable().text_symbols_file().is_some())
            })
            .cloned()
            .collect();
        let packages = collection.r_dot_java_packages.clone();
        if !packages.is_empty() {
            let dummy_child = params.child("dummy_r_dot_java", vec![]);
            let dummy = RDotJava::new(&dummy_child, packages.clone(), vec![], true);
            let rule =
                BuildRule::new(dummy_child, RuleType::DummyRDotJava, Box::new(dummy));
            extra_deps.push(resolver.add_to_index(rule).target().clone());

            let uber_child =
                params.child("uber_r_dot_java", resource_dep_targets.clone());
            let uber = RDotJava::new(
                &uber_child,
                packages,
                collection.text_symbols_files.clone(),
                false,
            );
            let rule = BuildRule::new(uber_child, RuleType::UberRDotJava, Box::new(uber));
            extra_deps.push(resolver.add_to_index(rule).target().clone());
        }

        // Pre-dex helpers, one per jar headed into the dex.
        let mut dex_targets = vec![];
        if args.split_dex {
            for (owner, jar) in &collection.classpath_entries_to_dex {
                let helper_target = owner.unflavored().with_flavor(DEX_FLAVOR);
                if let Some(existing) = resolver.get(&helper_target) {
                    dex_targets.push(existing.target().clone());
                    extra_deps.push(existing.target().clone());
                    continue;
                }
                let helper_params = BuildRuleParams {
                    target: helper_target,
                    declared_deps: vec![owner.unflavored()],
                    extra_deps: vec![],
                    visibility: vec![],
                    project: std::sync::Arc::clone(&params.project),
                    config: std::sync::Arc::clone(&params.config),
                };
                let buildable =
                    PreDex::new(&helper_params, owner.unflavored(), jar.clone());
                let rule = BuildRule::new(helper_params, RuleType::PreDex, Box::new(buildable));
                let registered = resolver.add_to_index(rule);
                dex_targets.push(registered.target().clone());
                extra_deps.push(registered.target().clone());
            }
        }

        let output_apk = params
            .project
            .gen_path(&params.target, &format!("{}.apk", params.target.short_name()));
        let scratch = params.project.scratch_dir(&params.target);
        let buildable = AndroidBinary {
            target: params.target.clone(),
            args,
            collection,
            dex_targets,
            scratch,
            output_apk,
        };

        let params = BuildRuleParams { extra_deps, ..params };
        Ok(BuildRule::new(params, RuleType::AndroidBinary, Box::new(buildable)))
    }
}
