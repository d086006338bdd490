//! The build-rule resolver: an append-only index from build target to
//! finished rule.
//!
//! The resolver has exactly two phases. During graph enhancement it is
//! mutated single-threadedly: description factories register the rules
//! they construct, including synthetic helper rules. Once the walk
//! finishes it is sealed into an [`crate::graph::ActionGraph`] and becomes
//! read-only for the parallel execution phase.

use std::collections::HashMap;
use std::sync::Arc;

use kiln_target::BuildTarget;

use crate::errors::BuildError;
use crate::rules::BuildRule;

#[derive(Default)]
pub struct BuildRuleResolver {
    rules: HashMap<BuildTarget, Arc<BuildRule>>,
}

impl BuildRuleResolver {
    pub fn new() -> BuildRuleResolver {
        BuildRuleResolver::default()
    }

    /// Registers a rule. Re-registering a target is a fatal invariant
    /// violation unless the newly-constructed rule compares equal to the
    /// existing one, in which case the existing rule is returned.
    pub fn add_to_index(&mut self, rule: BuildRule) -> Arc<BuildRule> {
        if let Some(existing) = self.rules.get(rule.target()) {
            if existing.equals_for_reregistration(&rule) {
                return Arc::clone(existing);
            }
            panic!(
                "a different rule is already registered for target {}",
                rule.target()
            );
        }
        let target = rule.target().clone();
        let rule = Arc::new(rule);
        self.rules.insert(target, Arc::clone(&rule));
        rule
    }

    pub fn contains(&self, target: &BuildTarget) -> bool {
        self.rules.contains_key(target)
    }

    pub fn get(&self, target: &BuildTarget) -> Option<Arc<BuildRule>> {
        self.rules.get(target).map(Arc::clone)
    }

    /// Looks up a rule that must already be in the index; a dangling
    /// reference means a build file named a rule that was never declared.
    pub fn require(&self, target: &BuildTarget) -> Result<Arc<BuildRule>, BuildError> {
        self.get(target).ok_or_else(|| {
            BuildError::UserInput(format!("no rule found for target {}", target))
        })
    }

    pub(crate) fn into_rules(self) -> HashMap<BuildTarget, Arc<BuildRule>> {
        self.rules
    }
}
