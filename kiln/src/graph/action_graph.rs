//! Bottom-up expansion of the target graph into the executable action
//! graph.
//!
//! The walk visits leaves first, so by the time a description factory runs
//! for a target, every rule its declared deps map to already exists in the
//! resolver. Factories may register additional helper rules while they run
//! (graph enhancement); a helper shares the originating target's name plus
//! one role flavor. After the walk the graph is validated - every edge
//! resolves, including edges into flavored helper subgraphs, and the
//! result is acyclic - and sealed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::trace;

use kiln_target::BuildTarget;

use crate::attr::DescriptionRegistry;
use crate::config::Config;
use crate::errors::BuildError;
use crate::graph::resolver::BuildRuleResolver;
use crate::project::ProjectFilesystem;
use crate::rules::{BuildRule, BuildRuleParams};
use crate::target_graph::TargetGraph;

/// The immutable DAG of build rules, indexed by target.
pub struct ActionGraph {
    rules: HashMap<BuildTarget, Arc<BuildRule>>,
}

impl std::fmt::Debug for ActionGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionGraph")
            .field("rules", &self.rules.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ActionGraph {
    pub fn get(&self, target: &BuildTarget) -> Option<Arc<BuildRule>> {
        self.rules.get(target).map(Arc::clone)
    }

    pub fn require(&self, target: &BuildTarget) -> Result<Arc<BuildRule>, BuildError> {
        self.get(target).ok_or_else(|| {
            BuildError::UserInput(format!("no rule found for target {}", target))
        })
    }

    pub fn rules(&self) -> impl Iterator<Item = &Arc<BuildRule>> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn deps_of(&self, rule: &BuildRule) -> Result<Vec<Arc<BuildRule>>, BuildError> {
        rule.deps().map(|dep| self.require(dep)).collect()
    }
}

/// Expands the whole target graph into an action graph.
pub fn build_action_graph(
    target_graph: &TargetGraph,
    registry: &DescriptionRegistry,
    project: Arc<ProjectFilesystem>,
    config: Arc<Config>,
) -> Result<ActionGraph, BuildError> {
    let mut resolver = BuildRuleResolver::new();
    let mut visited = HashSet::new();

    // Deterministic construction order, leaves first.
    let mut roots: Vec<&BuildTarget> = target_graph.nodes().map(|n| &n.target).collect();
    roots.sort();
    for root in roots {
        visit(root, target_graph, registry, &mut resolver, &project, &config, &mut visited)?;
    }

    let rules = resolver.into_rules();
    validate(&rules)?;
    trace!("action graph sealed with {} rules", rules.len());
    Ok(ActionGraph { rules })
}

fn visit(
    target: &BuildTarget,
    target_graph: &TargetGraph,
    registry: &DescriptionRegistry,
    resolver: &mut BuildRuleResolver,
    project: &Arc<ProjectFilesystem>,
    config: &Arc<Config>,
    visited: &mut HashSet<BuildTarget>,
) -> Result<(), BuildError> {
    if !visited.insert(target.clone()) {
        return Ok(());
    }
    let node = target_graph.require(target)?;
    for dep in &node.declared_deps {
        visit(dep, target_graph, registry, resolver, project, config, visited)?;
    }
    if resolver.contains(target) {
        // An enhancer of an earlier target already produced this rule.
        return Ok(());
    }

    let description = registry.get(node.rule_type).ok_or_else(|| {
        BuildError::UserInput(format!(
            "no description registered for rule type '{}'",
            node.rule_type.name()
        ))
    })?;
    let params = BuildRuleParams {
        target: node.target.clone(),
        declared_deps: node.declared_deps.clone(),
        extra_deps: vec![],
        visibility: node.visibility.clone(),
        project: Arc::clone(project),
        config: Arc::clone(config),
    };
    let rule = description.create_build_rule(params, resolver, node)?;
    resolver.add_to_index(rule);
    Ok(())
}

/// Re-walks every rule's dep closure. Flavored helper rules registered
/// mid-enhancement are reached through the deps of the rules that
/// introduced them; this pass confirms that every such edge resolves and
/// that enhancement introduced no cycle.
fn validate(rules: &HashMap<BuildTarget, Arc<BuildRule>>) -> Result<(), BuildError> {
    for rule in rules.values() {
        for dep in rule.deps() {
            if !rules.contains_key(dep) {
                return Err(BuildError::UserInput(format!(
                    "{} depends on {}, which is not in the action graph",
                    rule.target(),
                    dep
                )));
            }
        }
    }

    // Enhancement factories are trusted less than build files: check
    // acyclicity again over the full rule set, helpers included.
    let mut done: HashSet<&BuildTarget> = HashSet::new();
    let mut in_progress: HashSet<&BuildTarget> = HashSet::new();
    let mut order: Vec<&BuildTarget> = rules.keys().collect();
    order.sort();
    for root in order {
        if done.contains(root) {
            continue;
        }
        let mut stack: Vec<(&BuildTarget, bool)> = vec![(root, false)];
        let mut path: Vec<&BuildTarget> = vec![];
        while let Some((target, children_done)) = stack.pop() {
            if children_done {
                in_progress.remove(target);
                done.insert(target);
                path.pop();
                continue;
            }
            if done.contains(target) {
                continue;
            }
            if in_progress.contains(target) {
                let start = path.iter().position(|t| *t == target).unwrap_or(0);
                let mut listing: Vec<String> =
                    path[start..].iter().map(|t| t.to_string()).collect();
                listing.push(target.to_string());
                return Err(BuildError::Cycle(listing.join(" -> ")));
            }
            in_progress.insert(target);
            path.push(target);
            stack.push((target, true));
            for dep in rules[target].deps() {
                stack.push((rules[dep].target(), false));
            }
        }
    }
    Ok(())
}
