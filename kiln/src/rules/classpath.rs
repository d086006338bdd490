//! Classpath aggregation for JVM rules.
//!
//! Every rule whose output lands on a classpath exposes
//! [`HasClasspathEntries`]; the transitive walk lives here so all such
//! rules share one traversal (and one memoization discipline: the walk is
//! run at most once per rule, cached by the rule itself).

use std::collections::HashSet;
use std::path::PathBuf;

use itertools::Itertools;

use kiln_target::BuildTarget;

use crate::graph::ActionGraph;

/// A classpath entry is a producing rule paired with the jar it produces.
pub type ClasspathEntry = (BuildTarget, PathBuf);

pub trait HasClasspathEntries {
    /// The entries this rule itself adds to the classpath of dependents.
    fn output_classpath_entries(&self) -> Vec<ClasspathEntry>;

    /// Own entries plus those of immediate declared deps.
    fn declared_classpath_entries(&self, graph: &ActionGraph) -> Vec<ClasspathEntry>;

    /// The full transitive classpath rooted at this rule.
    fn transitive_classpath_entries(&self, graph: &ActionGraph) -> Vec<ClasspathEntry>;
}

/// Walks the dep graph from `roots`, collecting the output entries of
/// every classpath-bearing rule exactly once, in root-to-leaf order.
pub fn transitive_classpath(graph: &ActionGraph, roots: &[BuildTarget]) -> Vec<ClasspathEntry> {
    let mut visited: HashSet<BuildTarget> = HashSet::new();
    let mut entries: Vec<ClasspathEntry> = vec![];
    let mut stack: Vec<BuildTarget> = roots.iter().rev().cloned().collect();

    // Pre-order DFS: a rule's own jar comes before its deps' jars, which
    // is the order javac and dx consumers expect.
    while let Some(target) = stack.pop() {
        if !visited.insert(target.clone()) {
            continue;
        }
        let rule = match graph.get(&target) {
            Some(rule) => rule,
            None => continue,
        };
        if let Some(classpath) = rule.buildable().as_classpath() {
            entries.extend(classpath.output_classpath_entries());
        }
        for dep in rule.declared_deps().iter().rev() {
            stack.push(dep.clone());
        }
    }

    // A jar can be exported through several paths; keep the first.
    let mut seen_paths: HashSet<PathBuf> = HashSet::new();
    entries.retain(|(_, jar)| seen_paths.insert(jar.clone()));
    entries
}

/// Renders entries as a `javac -classpath` argument.
pub fn to_classpath_argument(entries: &[ClasspathEntry]) -> String {
    entries.iter().map(|(_, jar)| jar.to_string_lossy()).join(":")
}
