//! Computing the two rule-key flavors for a rule in the action graph.
//!
//! `without_deps` covers the rule's own inputs: its name, type tag and
//! whatever its buildable appends (attributes, source content hashes, tool
//! fingerprints). `total` combines `without_deps` with the total keys of
//! every dependency, in lexicographic target order, so a change anywhere
//! in the transitive dep closure re-keys every rule above it. The
//! narrower ABI keys do not participate here; the engine consults them
//! separately to short-circuit rebuilds of dependents whose deps changed
//! internals only.

use std::sync::Arc;

use kiln_hash::{RuleKey, RuleKeyPair};

use crate::errors::BuildError;
use crate::graph::ActionGraph;
use crate::rules::{BuildRule, RuleKeyCtx};

/// Returns the rule's key pair, computing and memoizing it on first use.
/// Recursion over deps terminates because the graph is acyclic; in steady
/// state every dep's pair is already memoized by the time its dependent
/// asks.
pub fn rule_key_pair(
    rule: &BuildRule,
    graph: &ActionGraph,
    ctx: &RuleKeyCtx<'_>,
) -> Result<RuleKeyPair, BuildError> {
    if let Some(pair) = rule.cached_rule_key_pair() {
        return Ok(pair);
    }

    let mut builder = RuleKey::builder();
    builder.set_str("name", &rule.target().to_string());
    builder.set_str("buck.type", rule.rule_type().name());
    rule.buildable().append_to_rule_key(&mut builder, ctx)?;
    let without_deps = builder.build();

    let mut deps: Vec<Arc<BuildRule>> = graph.deps_of(rule)?;
    deps.sort_by(|a, b| a.target().cmp(b.target()));

    let mut dep_keys = Vec::with_capacity(deps.len());
    for dep in &deps {
        dep_keys.push(rule_key_pair(dep, graph, ctx)?.total);
    }

    let mut builder = RuleKey::builder();
    builder.set_hash("buck.inputs", without_deps.hash());
    builder.set_rule_keys("buck.deps", dep_keys.iter());
    let total = builder.build();

    let pair = RuleKeyPair { without_deps, total };
    rule.memoize_rule_key_pair(pair);
    Ok(pair)
}

/// The combined ABI of a rule's deps: a hash over each dep's
/// `abi_key_for_deps`, in lexicographic target order. `None` when the
/// rule has no deps or any dep does not support interface hashing, in
/// which case the engine cannot ABI-short-circuit this rule.
pub fn combined_deps_abi(
    rule: &BuildRule,
    graph: &ActionGraph,
) -> Result<Option<kiln_hash::Sha1HashCode>, BuildError> {
    let mut deps: Vec<Arc<BuildRule>> = graph.deps_of(rule)?;
    if deps.is_empty() {
        return Ok(None);
    }
    deps.sort_by(|a, b| a.target().cmp(b.target()));
    let mut bytes = Vec::new();
    for dep in &deps {
        let abi = match dep.buildable().abi_key_for_deps() {
            Some(abi) => abi,
            None => return Ok(None),
        };
        bytes.extend_from_slice(dep.target().to_string().as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(abi.as_bytes());
        bytes.push(0);
    }
    Ok(Some(kiln_hash::Sha1HashCode::of_bytes(&bytes)))
}
