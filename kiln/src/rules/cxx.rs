//! `cxx_library`: native code, expanded by enhancement into a header
//! symlink tree plus static and shared library helpers.
//!
//! Each C++ rule exposes its preprocessor input (include roots, header
//! map, preprocessor flags) to dependents, and its linker input through
//! [`NativeLinkable`]. The linker-input aggregator walks `NativeLinkable`
//! deps in reverse topological order (leaves first), the order the linker
//! needs archives in.

use std::collections::HashSet;
use std::path::PathBuf;

use kiln_hash::RuleKeyBuilder;
use kiln_target::BuildTarget;

use crate::attr::{CoerceError, CoercionCtx, RawAttributes};
use crate::build::step::{MkdirStep, ShellStep, Step, SymlinkTreeStep};
use crate::build::BuildContext;
use crate::errors::BuildError;
use crate::graph::{ActionGraph, BuildRuleResolver};
use crate::rules::args::{CxxLibraryArgs, RuleArgs};
use crate::rules::{
    Buildable, BuildableContext, BuildRule, BuildRuleParams, Description, RuleKeyCtx, RuleType,
};
use crate::target_graph::TargetNode;

pub const HEADER_SYMLINK_TREE_FLAVOR: &str = "header-symlink-tree";
pub const STATIC_FLAVOR: &str = "static";
pub const SHARED_FLAVOR: &str = "shared";

/// What a dependent's preprocessor needs from this rule.
#[derive(Debug, Clone, Default)]
pub struct CxxPreprocessorInput {
    pub include_roots: Vec<PathBuf>,
    /// Include name to source header.
    pub header_map: Vec<(PathBuf, PathBuf)>,
    pub preprocessor_flags: Vec<String>,
}

/// What the linker needs from this rule.
pub trait NativeLinkable {
    fn linker_flags(&self) -> Vec<String>;
    fn linker_inputs(&self) -> Vec<PathBuf>;
}

#[derive(Debug, Default, PartialEq)]
pub struct NativeLinkableInput {
    pub flags: Vec<String>,
    pub inputs: Vec<PathBuf>,
}

/// Aggregates linker input over the `NativeLinkable` dep closure of
/// `roots`, leaves first.
pub fn collect_linker_input(graph: &ActionGraph, roots: &[BuildTarget]) -> NativeLinkableInput {
    let mut result = NativeLinkableInput::default();
    let mut visited = HashSet::new();
    for root in roots {
        visit(graph, root, &mut visited, &mut result);
    }
    result
}

fn visit(
    graph: &ActionGraph,
    target: &BuildTarget,
    visited: &mut HashSet<BuildTarget>,
    result: &mut NativeLinkableInput,
) {
    if !visited.insert(target.clone()) {
        return;
    }
    let rule = match graph.get(target) {
        Some(rule) => rule,
        None => return,
    };
    for dep in rule.declared_deps() {
        visit(graph, dep, visited, result);
    }
    if let Some(linkable) = rule.buildable().as_native_linkable() {
        result.flags.extend(linkable.linker_flags());
        result.inputs.extend(linkable.linker_inputs());
    }
}

/// The user-facing `cxx_library` rule: exposes preprocessor and linker
/// input, delegating actual building to its enhancement helpers.
pub struct CxxLibrary {
    args: CxxLibraryArgs,
    header_tree_dir: PathBuf,
    archive: PathBuf,
    default_platform: Option<String>,
}

impl CxxLibrary {
    fn preprocessor_input(&self) -> CxxPreprocessorInput {
        CxxPreprocessorInput {
            include_roots: vec![self.header_tree_dir.clone()],
            header_map: self
                .args
                .exported_headers
                .iter()
                .map(|h| (include_name(h), h.clone()))
                .collect(),
            preprocessor_flags: self.args.preprocessor_flags.clone(),
        }
    }
}

fn include_name(header: &PathBuf) -> PathBuf {
    PathBuf::from(header.file_name().map(|n| n.to_owned()).unwrap_or_default())
}

impl Buildable for CxxLibrary {
    fn append_to_rule_key(
        &self,
        builder: &mut RuleKeyBuilder,
        ctx: &RuleKeyCtx<'_>,
    ) -> Result<(), BuildError> {
        ctx.set_source_paths(builder, "srcs", &self.args.srcs)?;
        ctx.set_source_paths(builder, "headers", &self.args.headers)?;
        ctx.set_source_paths(builder, "exported_headers", &self.args.exported_headers)?;
        builder.set_strings("preprocessor_flags", &self.args.preprocessor_flags);
        builder.set_strings("compiler_flags", &self.args.compiler_flags);
        builder.set_strings("linker_flags", &self.args.linker_flags);
        builder.set_opt_str("platform", self.default_platform.as_deref());
        Ok(())
    }

    fn steps(
        &self,
        _ctx: &BuildContext,
        _out: &mut BuildableContext,
    ) -> Result<Vec<Box<dyn Step>>, BuildError> {
        // The helpers do the work; this rule just names the outputs.
        Ok(vec![])
    }

    fn output_path(&self) -> Option<PathBuf> {
        Some(self.archive.clone())
    }

    fn cxx_preprocessor_input(&self) -> Option<CxxPreprocessorInput> {
        Some(self.preprocessor_input())
    }

    fn as_native_linkable(&self) -> Option<&dyn NativeLinkable> {
        Some(self)
    }
}

impl NativeLinkable for CxxLibrary {
    fn linker_flags(&self) -> Vec<String> {
        self.args.linker_flags.clone()
    }

    fn linker_inputs(&self) -> Vec<PathBuf> {
        vec![self.archive.clone()]
    }
}

/// The `#header-symlink-tree` helper.
struct HeaderSymlinkTree {
    tree_dir: PathBuf,
    links: Vec<(PathBuf, PathBuf)>,
}

impl Buildable for HeaderSymlinkTree {
    fn append_to_rule_key(
        &self,
        builder: &mut RuleKeyBuilder,
        _ctx: &RuleKeyCtx<'_>,
    ) -> Result<(), BuildError> {
        let rendered: Vec<String> = self
            .links
            .iter()
            .map(|(link, target)| format!("{}={}", link.display(), target.display()))
            .collect();
        builder.set_strings("links", &rendered);
        Ok(())
    }

    fn steps(
        &self,
        _ctx: &BuildContext,
        _out: &mut BuildableContext,
    ) -> Result<Vec<Box<dyn Step>>, BuildError> {
        Ok(vec![Box::new(SymlinkTreeStep::new(self.tree_dir.clone(), self.links.clone()))])
    }

    fn output_path(&self) -> Option<PathBuf> {
        Some(self.tree_dir.clone())
    }
}

/// The `#static` / `#shared` helpers: compile every source, then archive
/// or link.
struct CxxCompileAndLink {
    args: CxxLibraryArgs,
    objects_dir: PathBuf,
    output: PathBuf,
    include_roots: Vec<PathBuf>,
    /// Preprocessor flags inherited from deps' preprocessor input.
    inherited_flags: Vec<String>,
    shared: bool,
}

impl Buildable for CxxCompileAndLink {
    fn append_to_rule_key(
        &self,
        builder: &mut RuleKeyBuilder,
        ctx: &RuleKeyCtx<'_>,
    ) -> Result<(), BuildError> {
        ctx.set_source_paths(builder, "srcs", &self.args.srcs)?;
        ctx.set_source_paths(builder, "headers", &self.args.headers)?;
        builder.set_strings("compiler_flags", &self.args.compiler_flags);
        builder.set_bool("shared", self.shared);
        builder.set_str("cc", &ctx.config.tool_fingerprint(&ctx.config.tools.cc));
        builder.set_str("ar", &ctx.config.tool_fingerprint(&ctx.config.tools.ar));
        Ok(())
    }

    fn steps(
        &self,
        ctx: &BuildContext,
        _out: &mut BuildableContext,
    ) -> Result<Vec<Box<dyn Step>>, BuildError> {
        let mut steps: Vec<Box<dyn Step>> =
            vec![Box::new(MkdirStep::new(self.objects_dir.clone()))];
        let mut objects = vec![];
        for (i, src) in self.args.srcs.iter().enumerate() {
            let object = self.objects_dir.join(format!("{}.o", i));
            let mut cc_args = vec!["-c".to_owned()];
            if self.shared {
                cc_args.push("-fPIC".to_owned());
            }
            for root in &self.include_roots {
                cc_args.push("-I".to_owned());
                cc_args.push(root.to_string_lossy().into_owned());
            }
            cc_args.extend(self.inherited_flags.iter().cloned());
            cc_args.extend(self.args.preprocessor_flags.iter().cloned());
            cc_args.extend(self.args.compiler_flags.iter().cloned());
            cc_args.push("-o".to_owned());
            cc_args.push(object.to_string_lossy().into_owned());
            cc_args.push(src.to_string_lossy().into_owned());
            steps.push(Box::new(ShellStep::new("cc", &ctx.config.tools.cc, cc_args)));
            objects.push(object);
        }

        if self.shared {
            let mut link_args = vec!["-shared".to_owned(), "-o".to_owned()];
            link_args.push(self.output.to_string_lossy().into_owned());
            for object in &objects {
                link_args.push(object.to_string_lossy().into_owned());
            }
            link_args.extend(self.args.linker_flags.iter().cloned());
            steps.push(Box::new(ShellStep::new("link", &ctx.config.tools.cc, link_args)));
        } else {
            let mut ar_args = vec!["rcs".to_owned()];
            ar_args.push(self.output.to_string_lossy().into_owned());
            for object in &objects {
                ar_args.push(object.to_string_lossy().into_owned());
            }
            steps.push(Box::new(ShellStep::new("ar", &ctx.config.tools.ar, ar_args)));
        }
        Ok(steps)
    }

    fn output_path(&self) -> Option<PathBuf> {
        Some(self.output.clone())
    }
}

pub struct CxxLibraryDescription;

impl Description for CxxLibraryDescription {
    fn rule_type(&self) -> RuleType {
        RuleType::CxxLibrary
    }

    fn coerce(
        &self,
        ctx: &CoercionCtx<'_>,
        raw: &RawAttributes,
    ) -> Result<RuleArgs, CoerceError> {
        Ok(RuleArgs::CxxLibrary(CxxLibraryArgs::coerce(ctx, raw)?))
    }

    fn create_build_rule(
        &self,
        params: BuildRuleParams,
        resolver: &mut BuildRuleResolver,
        node: &TargetNode,
    ) -> Result<BuildRule, BuildError> {
        let args = match &node.args {
            RuleArgs::CxxLibrary(args) => args.clone(),
            _ => unreachable!("cxx_library created from foreign args"),
        };
        let name = params.target.flavored_name();
        let base_path = params.target.base_path().to_owned();

        // #header-symlink-tree maps exported include names onto sources.
        let tree_child = params.child(HEADER_SYMLINK_TREE_FLAVOR, vec![]);
        let tree_dir = params
            .project
            .gen_dir(&tree_child.target)
            .join(format!("__{}_headers__", name));
        let links: Vec<(PathBuf, PathBuf)> = args
            .exported_headers
            .iter()
            .map(|header| {
                let link = header
                    .strip_prefix(&base_path)
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|_| include_name(header));
                (link, header.clone())
            })
            .collect();
        let tree_rule = BuildRule::new(
            tree_child,
            RuleType::HeaderSymlinkTree,
            Box::new(HeaderSymlinkTree { tree_dir: tree_dir.clone(), links }),
        );
        let tree_target = resolver.add_to_index(tree_rule).target().clone();

        // Include roots: our own tree plus whatever each dep's
        // preprocessor input exposes.
        let mut include_roots = vec![tree_dir.clone()];
        let mut inherited_flags: Vec<String> = vec![];
        for dep in &args.deps {
            let rule = resolver.require(dep)?;
            if let Some(input) = rule.buildable().cxx_preprocessor_input() {
                include_roots.extend(input.include_roots);
                inherited_flags.extend(input.preprocessor_flags);
            }
        }

        let archive =
            params.project.gen_path(&params.target, &format!("lib{}.a", name));
        let shared_out =
            params.project.gen_path(&params.target, &format!("lib{}.so", name));

        let mut static_deps = vec![tree_target.clone()];
        static_deps.extend(args.deps.iter().cloned());
        let static_child = params.child(STATIC_FLAVOR, static_deps.clone());
        let static_rule = BuildRule::new(
            static_child,
            RuleType::StaticLibrary,
            Box::new(CxxCompileAndLink {
                args: args.clone(),
                objects_dir: params.project.scratch_dir(&params.target).join("static-obj"),
                output: archive.clone(),
                include_roots: include_roots.clone(),
                inherited_flags: inherited_flags.clone(),
                shared: false,
            }),
        );
        let static_target = resolver.add_to_index(static_rule).target().clone();

        let shared_child = params.child(SHARED_FLAVOR, static_deps);
        let shared_rule = BuildRule::new(
            shared_child,
            RuleType::SharedLibrary,
            Box::new(CxxCompileAndLink {
                args: args.clone(),
                objects_dir: params.project.scratch_dir(&params.target).join("shared-obj"),
                output: shared_out,
                include_roots,
                inherited_flags,
                shared: true,
            }),
        );
        let shared_target = resolver.add_to_index(shared_rule).target().clone();

        let default_platform = params.config.default_cxx_platform.clone();
        let buildable = CxxLibrary {
            args,
            header_tree_dir: tree_dir,
            archive,
            default_platform,
        };
        let params = BuildRuleParams {
            extra_deps: vec![tree_target, static_target, shared_target],
            ..params
        };
        Ok(BuildRule::new(params, RuleType::CxxLibrary, Box::new(buildable)))
    }
}
