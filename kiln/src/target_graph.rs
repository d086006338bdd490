//! The typed target graph: the immutable, post-coercion description of
//! every declared rule, before graph enhancement expands it into the
//! action graph.
//!
//! Construction validates the three invariants the rest of the engine
//! relies on: every declared dep resolves to a node, every dep is visible
//! to the rule that declares it, and the graph is acyclic. A cycle is
//! fatal and is reported as a readable listing of the targets involved.

use std::collections::HashMap;

use kiln_target::{is_visible_to, BuildTarget, BuildTargetPattern};

use crate::errors::BuildError;
use crate::rules::args::RuleArgs;
use crate::rules::RuleType;

/// One declared rule: its canonical name, rule type, typed constructor
/// arguments, declared deps and visibility patterns. Immutable once built.
#[derive(Debug)]
pub struct TargetNode {
    pub target: BuildTarget,
    pub rule_type: RuleType,
    pub args: RuleArgs,
    pub declared_deps: Vec<BuildTarget>,
    pub visibility: Vec<BuildTargetPattern>,
}

#[derive(Debug, Default)]
pub struct TargetGraph {
    nodes: HashMap<BuildTarget, TargetNode>,
}

impl TargetGraph {
    /// Builds and validates the graph from coerced nodes.
    pub fn new(nodes: Vec<TargetNode>) -> Result<TargetGraph, BuildError> {
        let mut index = HashMap::with_capacity(nodes.len());
        for node in nodes {
            let target = node.target.clone();
            if index.insert(target.clone(), node).is_some() {
                return Err(BuildError::UserInput(format!(
                    "duplicate rule definition for target {}",
                    target
                )));
            }
        }
        let graph = TargetGraph { nodes: index };
        graph.check_deps_exist()?;
        graph.check_visibility()?;
        graph.check_acyclic()?;
        Ok(graph)
    }

    pub fn get(&self, target: &BuildTarget) -> Option<&TargetNode> {
        self.nodes.get(target)
    }

    pub fn require(&self, target: &BuildTarget) -> Result<&TargetNode, BuildError> {
        self.nodes.get(target).ok_or_else(|| {
            BuildError::UserInput(format!("no rule found for target {}", target))
        })
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TargetNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn check_deps_exist(&self) -> Result<(), BuildError> {
        for node in self.nodes.values() {
            for dep in &node.declared_deps {
                if !self.nodes.contains_key(dep) {
                    return Err(BuildError::UserInput(format!(
                        "{} depends on {}, which does not exist",
                        node.target, dep
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_visibility(&self) -> Result<(), BuildError> {
        for node in self.nodes.values() {
            for dep in &node.declared_deps {
                let dep_node = &self.nodes[dep];
                if !is_visible_to(&dep_node.target, &dep_node.visibility, &node.target) {
                    return Err(BuildError::UserInput(format!(
                        "{} depends on {}, which is not visible",
                        node.target, dep
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_acyclic(&self) -> Result<(), BuildError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }

        let mut marks: HashMap<&BuildTarget, Mark> = HashMap::new();
        // Deterministic traversal order keeps cycle reports stable.
        let mut roots: Vec<&BuildTarget> = self.nodes.keys().collect();
        roots.sort();

        for root in roots {
            if marks.contains_key(root) {
                continue;
            }
            // Iterative DFS carrying the current path for cycle reporting.
            let mut path: Vec<&BuildTarget> = vec![];
            let mut stack: Vec<(&BuildTarget, bool)> = vec![(root, false)];
            while let Some((target, children_done)) = stack.pop() {
                if children_done {
                    marks.insert(target, Mark::Done);
                    path.pop();
                    continue;
                }
                match marks.get(target) {
                    Some(Mark::Done) => continue,
                    Some(Mark::InProgress) => {
                        let start =
                            path.iter().position(|t| *t == target).unwrap_or(0);
                        let mut listing: Vec<String> =
                            path[start..].iter().map(|t| t.to_string()).collect();
                        listing.push(target.to_string());
                        return Err(BuildError::Cycle(listing.join(" -> ")));
                    }
                    None => {}
                }
                marks.insert(target, Mark::InProgress);
                path.push(target);
                stack.push((target, true));
                for dep in &self.nodes[target].declared_deps {
                    stack.push((&self.nodes[dep].target, false));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::args::{JavaLibraryArgs, RuleArgs};

    fn node(target: &str, deps: &[&str], visibility: &[&str]) -> TargetNode {
        let deps: Vec<BuildTarget> =
            deps.iter().map(|d| BuildTarget::parse(d).unwrap()).collect();
        TargetNode {
            target: BuildTarget::parse(target).unwrap(),
            rule_type: RuleType::JavaLibrary,
            args: RuleArgs::JavaLibrary(JavaLibraryArgs {
                deps: deps.clone(),
                ..JavaLibraryArgs::default()
            }),
            declared_deps: deps,
            visibility: visibility
                .iter()
                .map(|v| BuildTargetPattern::parse(v).unwrap())
                .collect(),
        }
    }

    #[test]
    fn missing_dep_is_an_error() {
        let err = TargetGraph::new(vec![node("//a:a", &["//b:b"], &[])]).unwrap_err();
        assert_eq!(
            err.user_message(),
            "//a:a depends on //b:b, which does not exist"
        );
    }

    #[test]
    fn invisible_dep_is_an_error() {
        let err = TargetGraph::new(vec![
            node("//app:bin", &["//lib:core"], &[]),
            node("//lib:core", &[], &["//other/..."]),
        ])
        .unwrap_err();
        assert_eq!(
            err.user_message(),
            "//app:bin depends on //lib:core, which is not visible"
        );
    }

    #[test]
    fn public_and_same_package_visibility() {
        TargetGraph::new(vec![
            node("//app:bin", &["//app:lib", "//lib:core"], &[]),
            node("//app:lib", &[], &[]),
            node("//lib:core", &[], &["PUBLIC"]),
        ])
        .unwrap();
    }

    #[test]
    fn cycle_is_reported_in_order() {
        let err = TargetGraph::new(vec![
            node("//a:a", &["//b:b"], &["PUBLIC"]),
            node("//b:b", &["//c:c"], &["PUBLIC"]),
            node("//c:c", &["//a:a"], &["PUBLIC"]),
        ])
        .unwrap_err();
        match err {
            BuildError::Cycle(listing) => {
                assert_eq!(listing, "//a:a -> //b:b -> //c:c -> //a:a");
            }
            other => panic!("expected a cycle error, got {:?}", other),
        }
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        TargetGraph::new(vec![
            node("//a:a", &["//b:b", "//c:c"], &["PUBLIC"]),
            node("//b:b", &["//d:d"], &["PUBLIC"]),
            node("//c:c", &["//d:d"], &["PUBLIC"]),
            node("//d:d", &[], &["PUBLIC"]),
        ])
        .unwrap();
    }
}
