//! `android_resource`: a bundle of resources, assets and a manifest
//! fragment, with a text-symbols (R.txt) output.
//!
//! The rule's ABI key is a SHA-1 accumulated over
//! `(path_to_text_symbols, text_symbols_abi_key)` for each resource dep
//! in topological order, with NUL separators, finishing with the rule's
//! own pair. When the key is unchanged, dependents that only consume
//! resource identifiers can skip rebuilding.

use std::path::PathBuf;
use std::sync::Mutex;

use kiln_hash::{RuleKeyBuilder, Sha1HashCode};
use kiln_target::BuildTarget;

use crate::attr::{CoerceError, CoercionCtx, RawAttributes};
use crate::build::on_disk::OnDiskBuildInfo;
use crate::build::step::{ShellStep, Step, WriteFileStep};
use crate::build::BuildContext;
use crate::errors::BuildError;
use crate::graph::BuildRuleResolver;
use crate::rules::android::packageable::{AndroidPackageable, AndroidPackageableCollector};
use crate::rules::args::{AndroidResourceArgs, RuleArgs};
use crate::rules::{
    Buildable, BuildableContext, BuildRule, BuildRuleParams, Description, RuleKeyCtx, RuleType,
};
use crate::target_graph::TargetNode;

const TEXT_SYMBOLS_ABI: &str = "text_symbols_abi";
const ABI: &str = "resource_abi";

pub struct AndroidResource {
    target: BuildTarget,
    args: AndroidResourceArgs,
    text_symbols: PathBuf,
    abi: Mutex<Option<Sha1HashCode>>,
}

impl AndroidResource {
    pub fn new(params: &BuildRuleParams, args: AndroidResourceArgs) -> AndroidResource {
        let text_symbols = params
            .project
            .gen_dir(&params.target)
            .join(format!("__{}_text_symbols__", params.target.flavored_name()))
            .join("R.txt");
        AndroidResource { target: params.target.clone(), args, text_symbols, abi: Mutex::new(None) }
    }

    /// ABI over the dep closure's text symbols, then our own, NUL
    /// separated, in topological order.
    fn compute_abi(&self, ctx: &BuildContext, own_hash: Sha1HashCode) -> Sha1HashCode {
        let mut bytes = Vec::new();
        let mut visited = std::collections::HashSet::new();
        let mut stack: Vec<BuildTarget> = self.args.deps.iter().rev().cloned().collect();
        while let Some(target) = stack.pop() {
            if !visited.insert(target.clone()) {
                continue;
            }
            let rule = match ctx.graph.get(&target) {
                Some(rule) => rule,
                None => continue,
            };
            if let (Some(path), Some(abi)) =
                (rule.buildable().text_symbols_file(), rule.buildable().abi_key())
            {
                bytes.extend_from_slice(path.to_string_lossy().as_bytes());
                bytes.push(0);
                bytes.extend_from_slice(abi.as_bytes());
                bytes.push(0);
            }
            for dep in rule.declared_deps().iter().rev() {
                stack.push(dep.clone());
            }
        }
        bytes.extend_from_slice(self.text_symbols.to_string_lossy().as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(own_hash.as_bytes());
        bytes.push(0);
        Sha1HashCode::of_bytes(&bytes)
    }
}

/// Hashes every file under a directory attribute as a source path, in
/// sorted order; an absent directory contributes a none marker.
fn hash_dir_contents(
    builder: &mut RuleKeyBuilder,
    field: &str,
    dir: Option<&std::path::Path>,
    ctx: &RuleKeyCtx<'_>,
) -> Result<(), BuildError> {
    let dir = match dir {
        Some(dir) => dir,
        None => {
            builder.set_opt_str(field, None);
            return Ok(());
        }
    };
    let root = ctx.hashes.project_root().to_path_buf();
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root.join(dir))
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.path().strip_prefix(&root).ok().map(|p| p.to_path_buf()))
        .collect();
    files.sort();
    let mut pairs = Vec::with_capacity(files.len());
    for file in &files {
        pairs.push((file.to_string_lossy().into_owned(), ctx.hashes.get(file)?));
    }
    builder.set_source_paths(field, pairs.iter().map(|(l, h)| (l.as_str(), *h)));
    Ok(())
}

impl Buildable for AndroidResource {
    fn append_to_rule_key(
        &self,
        builder: &mut RuleKeyBuilder,
        ctx: &RuleKeyCtx<'_>,
    ) -> Result<(), BuildError> {
        // Directory attributes are hashed file by file, so edits inside a
        // res/ tree re-key the rule even though the attribute names only
        // the directory.
        hash_dir_contents(builder, "res", self.args.res.as_deref(), ctx)?;
        hash_dir_contents(builder, "assets", self.args.assets.as_deref(), ctx)?;
        match &self.args.manifest {
            Some(path) => {
                let hash = ctx.hashes.get(path)?;
                builder.set_source_path("manifest", &path.to_string_lossy(), hash);
            }
            None => {
                builder.set_opt_str("manifest", None);
            }
        }
        builder.set_opt_str("package", self.args.package.as_deref());
        Ok(())
    }

    fn steps(
        &self,
        ctx: &BuildContext,
        _out: &mut BuildableContext,
    ) -> Result<Vec<Box<dyn Step>>, BuildError> {
        match (&self.args.res, &self.args.manifest) {
            (Some(res), Some(manifest)) => {
                let out_dir = self
                    .text_symbols
                    .parent()
                    .expect("text symbols live in a directory")
                    .to_path_buf();
                let args = vec![
                    "package".to_owned(),
                    "-m".to_owned(),
                    "-M".to_owned(),
                    manifest.to_string_lossy().into_owned(),
                    "-S".to_owned(),
                    res.to_string_lossy().into_owned(),
                    "--output-text-symbols".to_owned(),
                    out_dir.to_string_lossy().into_owned(),
                ];
                Ok(vec![
                    Box::new(crate::build::step::MkdirStep::new(out_dir)),
                    Box::new(ShellStep::new("aapt", &ctx.config.tools.aapt, args)),
                ])
            }
            // No resources to process: the text symbols are empty, but
            // they must exist for dependents.
            _ => Ok(vec![Box::new(WriteFileStep::new(self.text_symbols.clone(), vec![]))]),
        }
    }

    fn output_path(&self) -> Option<PathBuf> {
        Some(self.text_symbols.clone())
    }

    fn on_build_finished(
        &self,
        ctx: &BuildContext,
        out: &mut BuildableContext,
    ) -> Result<(), BuildError> {
        let bytes = ctx.project.read_file(&self.text_symbols)?;
        let own_hash = Sha1HashCode::of_bytes(&bytes);
        out.add_metadata(TEXT_SYMBOLS_ABI, own_hash.to_hex());
        let abi = self.compute_abi(ctx, own_hash);
        out.add_metadata(ABI, abi.to_hex());
        *self.abi.lock().unwrap() = Some(abi);
        Ok(())
    }

    fn initialize_from_disk(&self, info: &OnDiskBuildInfo) {
        if let Some(abi) = info.get(ABI).and_then(|hex| Sha1HashCode::from_hex(hex).ok()) {
            *self.abi.lock().unwrap() = Some(abi);
        }
    }

    fn abi_key(&self) -> Option<Sha1HashCode> {
        *self.abi.lock().unwrap()
    }

    fn abi_key_for_deps(&self) -> Option<Sha1HashCode> {
        self.abi_key()
    }

    fn text_symbols_file(&self) -> Option<PathBuf> {
        Some(self.text_symbols.clone())
    }

    fn as_packageable(&self) -> Option<&dyn AndroidPackageable> {
        Some(self)
    }
}

impl AndroidPackageable for AndroidResource {
    fn required_packageables(&self) -> Vec<BuildTarget> {
        self.args.deps.clone()
    }

    fn add_to_collector(
        &self,
        collector: &mut AndroidPackageableCollector,
    ) -> Result<(), BuildError> {
        if let Some(res) = &self.args.res {
            collector.add_resource_dir(&self.target, res.clone());
        }
        if let Some(assets) = &self.args.assets {
            collector.add_asset_dir(&self.target, assets.clone());
        }
        if let Some(manifest) = &self.args.manifest {
            collector.add_manifest(&self.target, manifest.clone());
        }
        collector.add_text_symbols_file(&self.target, self.text_symbols.clone());
        if let Some(package) = &self.args.package {
            collector.add_r_dot_java_package(&self.target, package.clone());
        }
        Ok(())
    }
}

pub struct AndroidResourceDescription;

impl Description for AndroidResourceDescription {
    fn rule_type(&self) -> RuleType {
        RuleType::AndroidResource
    }

    fn coerce(
        &self,
        ctx: &CoercionCtx<'_>,
        raw: &RawAttributes,
    ) -> Result<RuleArgs, CoerceError> {
        Ok(RuleArgs::AndroidResource(AndroidResourceArgs::coerce(ctx, raw)?))
    }

    fn create_build_rule(
        &self,
        params: BuildRuleParams,
        _resolver: &mut BuildRuleResolver,
        node: &TargetNode,
    ) -> Result<BuildRule, BuildError> {
        let args = match &node.args {
            RuleArgs::AndroidResource(args) => args.clone(),
            _ => unreachable!("android_resource created from foreign args"),
        };
        let buildable = AndroidResource::new(&params, args);
        Ok(BuildRule::new(params, RuleType::AndroidResource, Box::new(buildable)))
    }
}
