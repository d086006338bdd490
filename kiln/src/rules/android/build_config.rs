//! `android_build_config`: generates a `BuildConfig.java` holding
//! constants keyed by java package.
//!
//! The user-declared rule generates its own source; an Android binary
//! additionally synthesizes one `#buildconfig_<pkg>` helper per package in
//! its transitive deps, carrying the merged constants from the
//! packageable collection.

use std::path::PathBuf;

use kiln_hash::RuleKeyBuilder;
use kiln_target::BuildTarget;

use crate::attr::{CoerceError, CoercionCtx, RawAttributes};
use crate::build::step::{Step, WriteFileStep};
use crate::build::BuildContext;
use crate::errors::BuildError;
use crate::graph::BuildRuleResolver;
use crate::rules::android::packageable::{AndroidPackageable, AndroidPackageableCollector};
use crate::rules::args::{AndroidBuildConfigArgs, RuleArgs};
use crate::rules::{
    Buildable, BuildableContext, BuildRule, BuildRuleParams, Description, RuleKeyCtx, RuleType,
};
use crate::target_graph::TargetNode;

pub struct AndroidBuildConfig {
    java_package: String,
    constants: Vec<(String, String)>,
    output: PathBuf,
}

impl AndroidBuildConfig {
    pub fn new(params: &BuildRuleParams, args: &AndroidBuildConfigArgs) -> AndroidBuildConfig {
        let package_dir: PathBuf = args.java_package.split('.').collect();
        let output = params
            .project
            .gen_dir(&params.target)
            .join(format!("__{}__", params.target.flavored_name()))
            .join(package_dir)
            .join("BuildConfig.java");
        AndroidBuildConfig {
            java_package: args.java_package.clone(),
            constants: args.constants.clone(),
            output,
        }
    }

    pub fn java_package(&self) -> &str {
        &self.java_package
    }

    pub fn constants(&self) -> &[(String, String)] {
        &self.constants
    }
}

/// Renders the generated source. Values that parse as booleans or
/// integers keep their primitive type; everything else becomes a string
/// constant.
pub fn generate_build_config(java_package: &str, constants: &[(String, String)]) -> String {
    let mut out = String::new();
    out.push_str("// Generated by kiln. Do not edit.\n");
    out.push_str(&format!("package {};\n\npublic class BuildConfig {{\n", java_package));
    out.push_str("  private BuildConfig() {}\n");
    for (name, value) in constants {
        let declaration = if value == "true" || value == "false" {
            format!("  public static final boolean {} = {};\n", name, value)
        } else if value.parse::<i64>().is_ok() {
            format!("  public static final int {} = {};\n", name, value)
        } else {
            format!("  public static final String {} = \"{}\";\n", name, value)
        };
        out.push_str(&declaration);
    }
    out.push_str("}\n");
    out
}

impl Buildable for AndroidBuildConfig {
    fn append_to_rule_key(
        &self,
        builder: &mut RuleKeyBuilder,
        _ctx: &RuleKeyCtx<'_>,
    ) -> Result<(), BuildError> {
        builder.set_str("package", &self.java_package);
        let rendered: Vec<String> =
            self.constants.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        builder.set_strings("values", &rendered);
        Ok(())
    }

    fn steps(
        &self,
        _ctx: &BuildContext,
        _out: &mut BuildableContext,
    ) -> Result<Vec<Box<dyn Step>>, BuildError> {
        let source = generate_build_config(&self.java_package, &self.constants);
        Ok(vec![Box::new(WriteFileStep::new(self.output.clone(), source.into_bytes()))])
    }

    fn output_path(&self) -> Option<PathBuf> {
        Some(self.output.clone())
    }

    fn as_packageable(&self) -> Option<&dyn AndroidPackageable> {
        Some(self)
    }
}

impl AndroidPackageable for AndroidBuildConfig {
    fn required_packageables(&self) -> Vec<BuildTarget> {
        vec![]
    }

    fn add_to_collector(
        &self,
        collector: &mut AndroidPackageableCollector,
    ) -> Result<(), BuildError> {
        collector.add_build_config(&self.java_package, self.constants.clone())
    }
}

pub struct AndroidBuildConfigDescription;

impl Description for AndroidBuildConfigDescription {
    fn rule_type(&self) -> RuleType {
        RuleType::AndroidBuildConfig
    }

    fn coerce(
        &self,
        ctx: &CoercionCtx<'_>,
        raw: &RawAttributes,
    ) -> Result<RuleArgs, CoerceError> {
        Ok(RuleArgs::AndroidBuildConfig(AndroidBuildConfigArgs::coerce(ctx, raw)?))
    }

    fn create_build_rule(
        &self,
        params: BuildRuleParams,
        _resolver: &mut BuildRuleResolver,
        node: &TargetNode,
    ) -> Result<BuildRule, BuildError> {
        let args = match &node.args {
            RuleArgs::AndroidBuildConfig(args) => args,
            _ => unreachable!("android_build_config created from foreign args"),
        };
        let buildable = AndroidBuildConfig::new(&params, args);
        Ok(BuildRule::new(params, RuleType::AndroidBuildConfig, Box::new(buildable)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_source_types_constants() {
        let source = generate_build_config(
            "com.example",
            &[
                ("DEBUG".to_owned(), "false".to_owned()),
                ("VERSION_CODE".to_owned(), "42".to_owned()),
                ("FLAVOR".to_owned(), "paid".to_owned()),
            ],
        );
        assert!(source.contains("package com.example;"));
        assert!(source.contains("public static final boolean DEBUG = false;"));
        assert!(source.contains("public static final int VERSION_CODE = 42;"));
        assert!(source.contains("public static final String FLAVOR = \"paid\";"));
    }
}
