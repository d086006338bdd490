//! Per-library pre-dexing: a graph-enhancement helper (`<library>#dex`)
//! that converts one library's jar into a dex jar, so the final binary
//! only merges already-dexed inputs.
//!
//! Alongside the dex jar the rule records its linear-alloc estimate as
//! sidecar metadata; on a cache hit or a matching rule key the estimate
//! is restored from there without reopening the jar.

use std::path::PathBuf;
use std::sync::Mutex;

use kiln_hash::RuleKeyBuilder;
use kiln_target::BuildTarget;

use crate::build::on_disk::OnDiskBuildInfo;
use crate::build::step::Step;
use crate::build::BuildContext;
use crate::errors::BuildError;
use crate::rules::android::{smart_dex, split_dex};
use crate::rules::{Buildable, BuildableContext, BuildRuleParams, RuleKeyCtx};

pub const LINEAR_ALLOC_METADATA: &str = "linearalloc";

/// The flavor appended to a library target for its pre-dex helper.
pub const DEX_FLAVOR: &str = "dex";

pub struct PreDex {
    owner: BuildTarget,
    input_jar: PathBuf,
    output: PathBuf,
    scratch_dir: PathBuf,
    linear_alloc: Mutex<Option<u64>>,
}

impl PreDex {
    pub fn new(params: &BuildRuleParams, owner: BuildTarget, input_jar: PathBuf) -> PreDex {
        let output = params.project.gen_path(
            &params.target,
            &format!("{}.dex.jar", params.target.flavored_name()),
        );
        PreDex {
            owner,
            input_jar,
            output,
            scratch_dir: params.project.scratch_dir(&params.target),
            linear_alloc: Mutex::new(None),
        }
    }

    pub fn owner(&self) -> &BuildTarget {
        &self.owner
    }

    pub fn dex_jar(&self) -> &PathBuf {
        &self.output
    }
}

impl Buildable for PreDex {
    fn append_to_rule_key(
        &self,
        builder: &mut RuleKeyBuilder,
        ctx: &RuleKeyCtx<'_>,
    ) -> Result<(), BuildError> {
        // The input jar's content is covered by the owning library's key,
        // which reaches this rule through its dep contribution.
        builder.set_str("input", &self.input_jar.to_string_lossy());
        builder.set_str("dx", &ctx.config.tool_fingerprint(&ctx.config.tools.dx));
        Ok(())
    }

    fn steps(
        &self,
        ctx: &BuildContext,
        _out: &mut BuildableContext,
    ) -> Result<Vec<Box<dyn Step>>, BuildError> {
        smart_dex::dex_steps(
            &ctx.config,
            ctx.project.root(),
            std::slice::from_ref(&self.input_jar),
            &self.output,
            &self.scratch_dir,
        )
        .map_err(|e| BuildError::file_system(self.input_jar.clone(), e))
    }

    fn output_path(&self) -> Option<PathBuf> {
        Some(self.output.clone())
    }

    fn on_build_finished(
        &self,
        ctx: &BuildContext,
        out: &mut BuildableContext,
    ) -> Result<(), BuildError> {
        let estimate = split_dex::estimate_linear_alloc(&ctx.project.resolve(&self.output))
            .map_err(|e| BuildError::file_system(self.output.clone(), e))?;
        out.add_metadata(LINEAR_ALLOC_METADATA, estimate.to_string());
        *self.linear_alloc.lock().unwrap() = Some(estimate);
        Ok(())
    }

    fn initialize_from_disk(&self, info: &OnDiskBuildInfo) {
        if let Some(estimate) =
            info.get(LINEAR_ALLOC_METADATA).and_then(|v| v.parse::<u64>().ok())
        {
            *self.linear_alloc.lock().unwrap() = Some(estimate);
        }
    }

    fn linear_alloc_estimate(&self) -> Option<u64> {
        *self.linear_alloc.lock().unwrap()
    }
}
