//! kiln is a polyglot, target-graph-based incremental build engine.
//!
//! Build files declare named rules with typed attributes; kiln turns those
//! declarations into a directed acyclic action graph, then executes the
//! minimal set of actions needed to produce the requested outputs, reusing
//! prior results whenever inputs have not changed. Every rule is identified
//! by a content hash of its inputs-that-matter (its rule key); outputs are
//! looked up in local and remote artifact caches by that key before any
//! build step runs.

#![warn(rust_2018_idioms)]

pub use kiln_target::{BuildTarget, BuildTargetPattern};

pub mod attr;
pub mod build;
pub mod build_files;
pub mod cmd;
pub mod config;
pub mod errors;
pub mod graph;
pub mod project;
pub mod rules;
pub mod target_graph;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
