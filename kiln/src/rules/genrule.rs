//! `genrule`: the escape hatch. Runs a shell command with `$(location
//! //target)` references expanded to dep output paths, producing one
//! declared output under the gen directory.

use std::path::PathBuf;

use lazy_static::lazy_static;
use regex::Regex;

use kiln_hash::RuleKeyBuilder;
use kiln_target::BuildTarget;

use crate::attr::{CoerceError, CoercionCtx, RawAttributes};
use crate::build::step::{MkdirStep, ShellStep, Step};
use crate::build::BuildContext;
use crate::errors::BuildError;
use crate::graph::BuildRuleResolver;
use crate::rules::args::{GenruleArgs, RuleArgs};
use crate::rules::{
    Buildable, BuildableContext, BuildRule, BuildRuleParams, Description, RuleKeyCtx, RuleType,
};
use crate::target_graph::TargetNode;

lazy_static! {
    static ref LOCATION: Regex =
        Regex::new(r"\$\(location\s+([^)]+)\)").expect("the location pattern is valid");
}

pub struct Genrule {
    base_path: String,
    cmd: String,
    srcs: Vec<PathBuf>,
    output: PathBuf,
}

impl Genrule {
    pub fn new(params: &BuildRuleParams, args: &GenruleArgs) -> Genrule {
        Genrule {
            base_path: params.target.base_path().to_owned(),
            cmd: args.cmd.clone(),
            srcs: args.srcs.clone(),
            output: params.project.gen_path(&params.target, &args.out),
        }
    }

    /// Expands `$(location //some:target)` to the referenced rule's
    /// output path.
    fn expand_cmd(&self, ctx: &BuildContext) -> Result<String, BuildError> {
        let mut expanded = String::new();
        let mut last = 0;
        for captures in LOCATION.captures_iter(&self.cmd) {
            let whole = captures.get(0).expect("capture 0 always exists");
            let reference = captures.get(1).expect("the pattern has one group").as_str().trim();
            let target = BuildTarget::parse_with_base(&self.base_path, reference)?;
            let rule = ctx.graph.require(&target)?;
            let output = rule.buildable().output_path().ok_or_else(|| {
                BuildError::UserInput(format!(
                    "$(location {}) references a rule with no output",
                    target
                ))
            })?;
            expanded.push_str(&self.cmd[last..whole.start()]);
            expanded.push_str(&output.to_string_lossy());
            last = whole.end();
        }
        expanded.push_str(&self.cmd[last..]);
        Ok(expanded)
    }
}

impl Buildable for Genrule {
    fn append_to_rule_key(
        &self,
        builder: &mut RuleKeyBuilder,
        ctx: &RuleKeyCtx<'_>,
    ) -> Result<(), BuildError> {
        builder.set_str("cmd", &self.cmd);
        builder.set_str("out", &self.output.to_string_lossy());
        ctx.set_source_paths(builder, "srcs", &self.srcs)?;
        Ok(())
    }

    fn steps(
        &self,
        ctx: &BuildContext,
        _out: &mut BuildableContext,
    ) -> Result<Vec<Box<dyn Step>>, BuildError> {
        let cmd = self.expand_cmd(ctx)?;
        let parent = self
            .output
            .parent()
            .expect("gen outputs always have a parent directory")
            .to_path_buf();
        let srcs = self
            .srcs
            .iter()
            .map(|s| s.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        let shell = ShellStep::new("genrule", std::path::Path::new("/bin/sh"), vec![
            "-c".to_owned(),
            cmd,
        ])
        .with_env("OUT", self.output.to_string_lossy().into_owned())
        .with_env("SRCS", srcs);
        Ok(vec![Box::new(MkdirStep::new(parent)), Box::new(shell)])
    }

    fn output_path(&self) -> Option<PathBuf> {
        Some(self.output.clone())
    }
}

pub struct GenruleDescription;

impl Description for GenruleDescription {
    fn rule_type(&self) -> RuleType {
        RuleType::Genrule
    }

    fn coerce(
        &self,
        ctx: &CoercionCtx<'_>,
        raw: &RawAttributes,
    ) -> Result<RuleArgs, CoerceError> {
        Ok(RuleArgs::Genrule(GenruleArgs::coerce(ctx, raw)?))
    }

    fn create_build_rule(
        &self,
        params: BuildRuleParams,
        _resolver: &mut BuildRuleResolver,
        node: &TargetNode,
    ) -> Result<BuildRule, BuildError> {
        let args = match &node.args {
            RuleArgs::Genrule(args) => args,
            _ => unreachable!("genrule created from foreign args"),
        };
        let buildable = Genrule::new(&params, args);
        Ok(BuildRule::new(params, RuleType::Genrule, Box::new(buildable)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_pattern_matches() {
        let captures = LOCATION.captures("cp $(location //lib:jar) $OUT").unwrap();
        assert_eq!(captures.get(1).unwrap().as_str(), "//lib:jar");
        assert!(LOCATION.captures("echo no references").is_none());
    }
}
