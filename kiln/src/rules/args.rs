//! Typed constructor-argument records, one per user-declarable rule kind,
//! and their coercion from raw attributes.
//!
//! Field sets are fixed per rule type; attributes with no source entry
//! stay at their declared default. Attribute names in build files are the
//! python-style spellings of these field names.

use std::collections::HashSet;
use std::path::PathBuf;

use kiln_target::BuildTarget;

use crate::attr::{coercer, AttrValue, CoerceError, CoercionCtx, RawAttributes};

fn targets(
    ctx: &CoercionCtx<'_>,
    raw: &RawAttributes,
    name: &str,
) -> Result<Vec<BuildTarget>, CoerceError> {
    match raw.get(name) {
        None => Ok(vec![]),
        Some(v) => {
            coercer::set(v, |e| coercer::target(ctx, e)).map_err(|e| e.in_attribute(name))
        }
    }
}

fn source_paths(
    ctx: &CoercionCtx<'_>,
    raw: &RawAttributes,
    name: &str,
) -> Result<Vec<PathBuf>, CoerceError> {
    match raw.get(name) {
        None => Ok(vec![]),
        Some(v) => coercer::sorted_set(v, |e| coercer::path(ctx, e))
            .map_err(|e| e.in_attribute(name)),
    }
}

fn opt_source_path(
    ctx: &CoercionCtx<'_>,
    raw: &RawAttributes,
    name: &str,
) -> Result<Option<PathBuf>, CoerceError> {
    coercer::optional(raw.get(name), |v| coercer::path(ctx, v))
        .map_err(|e| e.in_attribute(name))
}

fn opt_string(raw: &RawAttributes, name: &str) -> Result<Option<String>, CoerceError> {
    coercer::optional(raw.get(name), coercer::string).map_err(|e| e.in_attribute(name))
}

fn strings(raw: &RawAttributes, name: &str) -> Result<Vec<String>, CoerceError> {
    match raw.get(name) {
        None => Ok(vec![]),
        Some(v) => coercer::list(v, coercer::string).map_err(|e| e.in_attribute(name)),
    }
}

fn flag(raw: &RawAttributes, name: &str, default: bool) -> Result<bool, CoerceError> {
    match raw.get(name) {
        None => Ok(default),
        Some(v) => coercer::boolean(v).map_err(|e| e.in_attribute(name)),
    }
}

#[derive(Debug, Default, Clone)]
pub struct JavaLibraryArgs {
    pub srcs: Vec<PathBuf>,
    pub resources: Vec<PathBuf>,
    pub deps: Vec<BuildTarget>,
    pub exported_deps: Vec<BuildTarget>,
    pub proguard_config: Option<PathBuf>,
    pub source_level: Option<String>,
    pub target_level: Option<String>,
}

impl JavaLibraryArgs {
    pub fn coerce(
        ctx: &CoercionCtx<'_>,
        raw: &RawAttributes,
    ) -> Result<JavaLibraryArgs, CoerceError> {
        Ok(JavaLibraryArgs {
            srcs: source_paths(ctx, raw, "srcs")?,
            resources: source_paths(ctx, raw, "resources")?,
            deps: targets(ctx, raw, "deps")?,
            exported_deps: targets(ctx, raw, "exported_deps")?,
            proguard_config: opt_source_path(ctx, raw, "proguard_config")?,
            source_level: opt_string(raw, "source")?,
            target_level: opt_string(raw, "target")?,
        })
    }
}

#[derive(Debug, Default, Clone)]
pub struct JavaTestArgs {
    pub library: JavaLibraryArgs,
    /// Fully-qualified class whose `main` drives the test run.
    pub test_main_class: Option<String>,
}

impl JavaTestArgs {
    pub fn coerce(
        ctx: &CoercionCtx<'_>,
        raw: &RawAttributes,
    ) -> Result<JavaTestArgs, CoerceError> {
        Ok(JavaTestArgs {
            library: JavaLibraryArgs::coerce(ctx, raw)?,
            test_main_class: opt_string(raw, "test_main_class")?,
        })
    }
}

#[derive(Debug, Default, Clone)]
pub struct PrebuiltJarArgs {
    pub binary_jar: PathBuf,
    pub deps: Vec<BuildTarget>,
}

impl PrebuiltJarArgs {
    pub fn coerce(
        ctx: &CoercionCtx<'_>,
        raw: &RawAttributes,
    ) -> Result<PrebuiltJarArgs, CoerceError> {
        let binary_jar = match raw.get("binary_jar") {
            Some(v) => coercer::path(ctx, v).map_err(|e| e.in_attribute("binary_jar"))?,
            None => {
                return Err(CoerceError::InvalidPath(String::new()).in_attribute("binary_jar"))
            }
        };
        Ok(PrebuiltJarArgs { binary_jar, deps: targets(ctx, raw, "deps")? })
    }
}

#[derive(Debug, Default, Clone)]
pub struct AndroidResourceArgs {
    pub res: Option<PathBuf>,
    pub assets: Option<PathBuf>,
    pub manifest: Option<PathBuf>,
    /// The java package R.java is generated into.
    pub package: Option<String>,
    pub deps: Vec<BuildTarget>,
}

impl AndroidResourceArgs {
    pub fn coerce(
        ctx: &CoercionCtx<'_>,
        raw: &RawAttributes,
    ) -> Result<AndroidResourceArgs, CoerceError> {
        Ok(AndroidResourceArgs {
            res: opt_source_path(ctx, raw, "res")?,
            assets: opt_source_path(ctx, raw, "assets")?,
            manifest: opt_source_path(ctx, raw, "manifest")?,
            package: opt_string(raw, "package")?,
            deps: targets(ctx, raw, "deps")?,
        })
    }
}

#[derive(Debug, Default, Clone)]
pub struct AndroidBuildConfigArgs {
    pub java_package: String,
    /// `name = value` constants; values keep their declared spelling.
    pub constants: Vec<(String, String)>,
}

impl AndroidBuildConfigArgs {
    pub fn coerce(
        _ctx: &CoercionCtx<'_>,
        raw: &RawAttributes,
    ) -> Result<AndroidBuildConfigArgs, CoerceError> {
        let java_package = opt_string(raw, "package")?.ok_or_else(|| {
            CoerceError::WrongType { expected: "string", found: "nothing".to_owned() }
                .in_attribute("package")
        })?;
        let constants = match raw.get("values") {
            None => vec![],
            Some(v) => coercer::map(v, coercer::string, |val| match val {
                AttrValue::String(s) => Ok(s.clone()),
                AttrValue::Bool(b) => Ok(b.to_string()),
                AttrValue::Int(i) => Ok(i.to_string()),
                other => Err(CoerceError::WrongType {
                    expected: "string, integer or boolean",
                    found: other.kind().to_owned(),
                }),
            })
            .map_err(|e| e.in_attribute("values"))?,
        };
        Ok(AndroidBuildConfigArgs { java_package, constants })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageType {
    Debug,
    Release,
}

impl Default for PackageType {
    fn default() -> PackageType {
        PackageType::Debug
    }
}

impl PackageType {
    pub fn as_str(self) -> &'static str {
        match self {
            PackageType::Debug => "debug",
            PackageType::Release => "release",
        }
    }
}

/// How secondary dexes are stored inside the APK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DexStore {
    Jar,
    XzJar,
}

impl Default for DexStore {
    fn default() -> DexStore {
        DexStore::Jar
    }
}

pub const DEFAULT_LINEAR_ALLOC_HARD_LIMIT: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct AndroidBinaryArgs {
    pub manifest: PathBuf,
    pub keystore: Option<PathBuf>,
    pub keystore_properties: Option<PathBuf>,
    pub package_type: PackageType,
    pub deps: Vec<BuildTarget>,
    /// Targets whose classpath entries must not be dexed into the APK.
    pub no_dx: HashSet<BuildTarget>,
    /// Targets whose resources, assets and manifests are dropped.
    pub excluded_resource_deps: HashSet<BuildTarget>,
    pub split_dex: bool,
    pub linear_alloc_hard_limit: u64,
    pub primary_dex_patterns: Vec<String>,
    pub primary_dex_classes_file: Option<PathBuf>,
    /// Locales to keep when filtering resources; empty keeps everything.
    pub resource_filter: Vec<String>,
    pub compress_resources: bool,
    pub dex_store: DexStore,
    pub proguard_config: Option<PathBuf>,
}

impl Default for AndroidBinaryArgs {
    fn default() -> AndroidBinaryArgs {
        AndroidBinaryArgs {
            manifest: PathBuf::new(),
            keystore: None,
            keystore_properties: None,
            package_type: PackageType::default(),
            deps: vec![],
            no_dx: HashSet::new(),
            excluded_resource_deps: HashSet::new(),
            split_dex: false,
            linear_alloc_hard_limit: DEFAULT_LINEAR_ALLOC_HARD_LIMIT,
            primary_dex_patterns: vec![],
            primary_dex_classes_file: None,
            resource_filter: vec![],
            compress_resources: false,
            dex_store: DexStore::default(),
            proguard_config: None,
        }
    }
}

impl AndroidBinaryArgs {
    pub fn coerce(
        ctx: &CoercionCtx<'_>,
        raw: &RawAttributes,
    ) -> Result<AndroidBinaryArgs, CoerceError> {
        let manifest = match raw.get("manifest") {
            Some(v) => coercer::path(ctx, v).map_err(|e| e.in_attribute("manifest"))?,
            None => {
                return Err(
                    CoerceError::InvalidPath(String::new()).in_attribute("manifest")
                )
            }
        };
        let package_type = match raw.get("package_type") {
            None => PackageType::default(),
            Some(v) => match coercer::enumeration(v, &["debug", "release"])
                .map_err(|e| e.in_attribute("package_type"))?
            {
                "release" => PackageType::Release,
                _ => PackageType::Debug,
            },
        };
        let dex_store = match raw.get("dex_compression") {
            None => DexStore::default(),
            Some(v) => match coercer::enumeration(v, &["jar", "xz"])
                .map_err(|e| e.in_attribute("dex_compression"))?
            {
                "xz" => DexStore::XzJar,
                _ => DexStore::Jar,
            },
        };
        let linear_alloc_hard_limit = match raw.get("linear_alloc_hard_limit") {
            None => DEFAULT_LINEAR_ALLOC_HARD_LIMIT,
            Some(v) => {
                coercer::integer(v).map_err(|e| e.in_attribute("linear_alloc_hard_limit"))?
                    as u64
            }
        };
        Ok(AndroidBinaryArgs {
            manifest,
            keystore: opt_source_path(ctx, raw, "keystore")?,
            keystore_properties: opt_source_path(ctx, raw, "keystore_properties")?,
            package_type,
            deps: targets(ctx, raw, "deps")?,
            no_dx: targets(ctx, raw, "no_dx")?.into_iter().collect(),
            excluded_resource_deps: targets(ctx, raw, "excluded_resource_deps")?
                .into_iter()
                .collect(),
            split_dex: flag(raw, "split_dex", false)?,
            linear_alloc_hard_limit,
            primary_dex_patterns: strings(raw, "primary_dex_patterns")?,
            primary_dex_classes_file: opt_source_path(ctx, raw, "primary_dex_classes_file")?,
            resource_filter: strings(raw, "resource_filter")?,
            compress_resources: flag(raw, "compress_resources", false)?,
            dex_store,
            proguard_config: opt_source_path(ctx, raw, "proguard_config")?,
        })
    }
}

#[derive(Debug, Default, Clone)]
pub struct CxxLibraryArgs {
    pub srcs: Vec<PathBuf>,
    pub headers: Vec<PathBuf>,
    pub exported_headers: Vec<PathBuf>,
    pub preprocessor_flags: Vec<String>,
    pub compiler_flags: Vec<String>,
    pub linker_flags: Vec<String>,
    pub deps: Vec<BuildTarget>,
}

impl CxxLibraryArgs {
    pub fn coerce(
        ctx: &CoercionCtx<'_>,
        raw: &RawAttributes,
    ) -> Result<CxxLibraryArgs, CoerceError> {
        Ok(CxxLibraryArgs {
            srcs: source_paths(ctx, raw, "srcs")?,
            headers: source_paths(ctx, raw, "headers")?,
            exported_headers: source_paths(ctx, raw, "exported_headers")?,
            preprocessor_flags: strings(raw, "preprocessor_flags")?,
            compiler_flags: strings(raw, "compiler_flags")?,
            linker_flags: strings(raw, "linker_flags")?,
            deps: targets(ctx, raw, "deps")?,
        })
    }
}

#[derive(Debug, Default, Clone)]
pub struct GenruleArgs {
    pub cmd: String,
    pub out: String,
    pub srcs: Vec<PathBuf>,
    pub deps: Vec<BuildTarget>,
}

impl GenruleArgs {
    pub fn coerce(
        ctx: &CoercionCtx<'_>,
        raw: &RawAttributes,
    ) -> Result<GenruleArgs, CoerceError> {
        let cmd = opt_string(raw, "cmd")?.ok_or_else(|| {
            CoerceError::WrongType { expected: "string", found: "nothing".to_owned() }
                .in_attribute("cmd")
        })?;
        let out = opt_string(raw, "out")?.ok_or_else(|| {
            CoerceError::WrongType { expected: "string", found: "nothing".to_owned() }
                .in_attribute("out")
        })?;
        Ok(GenruleArgs {
            cmd,
            out,
            srcs: source_paths(ctx, raw, "srcs")?,
            deps: targets(ctx, raw, "deps")?,
        })
    }
}

/// The typed arguments of a target node, tagged by rule kind.
#[derive(Debug, Clone)]
pub enum RuleArgs {
    JavaLibrary(JavaLibraryArgs),
    JavaTest(JavaTestArgs),
    PrebuiltJar(PrebuiltJarArgs),
    AndroidResource(AndroidResourceArgs),
    AndroidBuildConfig(AndroidBuildConfigArgs),
    AndroidBinary(AndroidBinaryArgs),
    CxxLibrary(CxxLibraryArgs),
    Genrule(GenruleArgs),
}

impl RuleArgs {
    /// The deps the user declared, in declaration order. Exported deps
    /// count: they participate in both visibility checking and the
    /// bottom-up construction order.
    pub fn declared_deps(&self) -> Vec<BuildTarget> {
        match self {
            RuleArgs::JavaLibrary(a) => {
                let mut deps = a.deps.clone();
                deps.extend(a.exported_deps.iter().cloned());
                deps
            }
            RuleArgs::JavaTest(a) => {
                let mut deps = a.library.deps.clone();
                deps.extend(a.library.exported_deps.iter().cloned());
                deps
            }
            RuleArgs::PrebuiltJar(a) => a.deps.clone(),
            RuleArgs::AndroidResource(a) => a.deps.clone(),
            RuleArgs::AndroidBuildConfig(_) => vec![],
            RuleArgs::AndroidBinary(a) => a.deps.clone(),
            RuleArgs::CxxLibrary(a) => a.deps.clone(),
            RuleArgs::Genrule(a) => a.deps.clone(),
        }
    }
}
