//! The target-graph to action-graph transformation.
//!
//! [`resolver`] holds the append-only rule index that graph enhancement
//! writes into; [`action_graph`] drives the bottom-up walk over the target
//! graph and seals the result into the immutable DAG the scheduler
//! executes.

pub mod action_graph;
pub mod resolver;

pub use self::action_graph::{build_action_graph, ActionGraph};
pub use self::resolver::BuildRuleResolver;
