//! The build engine: dependency-ordered, parallel execution of the action
//! graph with caching.
//!
//! Every involved rule moves through a per-rule state machine: it waits
//! for its deps, computes its rule key, tries the on-disk result of the
//! previous build, then the artifact cache, and only then runs its steps.
//! Independent rules execute in parallel on a fixed worker pool; steps of
//! one rule are strictly sequential. The first failure aborts the build:
//! rules that were queued but not started finish as `Cancelled`, running
//! rules stop after their current step, and nothing downstream of the
//! failure runs any step at all.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::unbounded;
use log::{debug, info, trace, warn};

use kiln_cache::{ArtifactCache, CacheResult};
use kiln_hash::FileHashCache;
use kiln_target::BuildTarget;

use crate::config::Config;
use crate::errors::BuildError;
use crate::graph::ActionGraph;
use crate::project::ProjectFilesystem;
use crate::rules::{BuildRule, BuildableContext, RuleKeyCtx};

pub mod keys;
pub mod on_disk;
pub mod step;

use self::on_disk::OnDiskBuildInfo;
use self::step::ExecutionContext;

/// Shared, read-only state threaded through key computation, step
/// creation and execution.
#[derive(Clone)]
pub struct BuildContext {
    pub project: Arc<ProjectFilesystem>,
    pub graph: Arc<ActionGraph>,
    pub config: Arc<Config>,
    pub hashes: Arc<FileHashCache>,
}

/// How a rule reached `DONE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildRuleSuccessKind {
    /// Steps ran to completion in this invocation.
    BuiltLocally,
    /// Outputs were unpacked from the artifact cache.
    FetchedFromCache,
    /// The previous build's on-disk outputs matched the current rule key;
    /// nothing ran.
    MatchingRuleKey,
    /// The rule's own inputs and its deps' ABI keys matched the previous
    /// build even though some dep's total key changed; nothing ran.
    MatchingDepsAbiAndRuleKeyNoDeps,
}

#[derive(Debug)]
pub enum RuleOutcome {
    Success(BuildRuleSuccessKind),
    Failed(BuildError),
    Cancelled,
}

/// What one invocation of the engine did, per rule and overall.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub outcomes: HashMap<BuildTarget, RuleOutcome>,
    /// Every step that actually executed, in completion order, as
    /// `(rule, step short name)`.
    pub executed_steps: Vec<(BuildTarget, String)>,
}

impl BuildReport {
    pub fn success(&self) -> bool {
        self.outcomes.values().all(|o| matches!(o, RuleOutcome::Success(_)))
    }

    pub fn first_failure(&self) -> Option<(&BuildTarget, &BuildError)> {
        self.outcomes.iter().find_map(|(target, outcome)| match outcome {
            RuleOutcome::Failed(e) => Some((target, e)),
            _ => None,
        })
    }

    /// 0 on success; otherwise the failing step's exit code, or 1.
    pub fn exit_code(&self) -> i32 {
        match self.first_failure() {
            None if self.success() => 0,
            None => 1,
            Some((_, e)) => e.exit_code(),
        }
    }

    pub fn outcome(&self, target: &BuildTarget) -> Option<&RuleOutcome> {
        self.outcomes.get(target)
    }

    pub fn steps_for(&self, target: &BuildTarget) -> Vec<&str> {
        self.executed_steps
            .iter()
            .filter(|(t, _)| t == target)
            .map(|(_, name)| name.as_str())
            .collect()
    }
}

pub struct BuildEngine {
    context: BuildContext,
    cache: Arc<dyn ArtifactCache>,
}

enum State {
    Waiting,
    Queued,
    Terminal,
}

impl BuildEngine {
    pub fn new(context: BuildContext, cache: Arc<dyn ArtifactCache>) -> BuildEngine {
        BuildEngine { context, cache }
    }

    /// Builds the given roots and everything they transitively depend on.
    /// Returns `Err` only for graph-level problems (an unknown root);
    /// per-rule failures are reported through the [`BuildReport`].
    pub fn build(&self, roots: &[BuildTarget]) -> Result<BuildReport, BuildError> {
        let rules = self.involved_rules(roots)?;
        let total = rules.len();
        info!("building {} rule(s) for {} root target(s)", total, roots.len());

        let index: HashMap<&BuildTarget, usize> =
            rules.iter().enumerate().map(|(i, r)| (r.target(), i)).collect();

        let mut pending_deps: Vec<usize> = vec![0; total];
        let mut rev_deps: Vec<Vec<usize>> = vec![vec![]; total];
        for (i, rule) in rules.iter().enumerate() {
            for dep in rule.deps() {
                let dep_idx = index[dep];
                pending_deps[i] += 1;
                rev_deps[dep_idx].push(i);
            }
        }

        let abort = Arc::new(AtomicBool::new(false));
        let (work_tx, work_rx) = unbounded::<usize>();
        let (done_tx, done_rx) =
            unbounded::<(usize, Result<BuildRuleSuccessKind, BuildError>, Vec<String>)>();

        let rules = Arc::new(rules);
        let worker_count = self.context.config.num_threads.max(1).min(total.max(1));
        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let rules = Arc::clone(&rules);
            let context = self.context.clone();
            let cache = Arc::clone(&self.cache);
            let abort = Arc::clone(&abort);
            let work_rx = work_rx.clone();
            let done_tx = done_tx.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("build-{}", worker_id))
                    .spawn(move || {
                        for idx in work_rx {
                            let rule = &rules[idx];
                            let mut executed = vec![];
                            let result = if abort.load(Ordering::SeqCst) {
                                // Queued but not started when the build
                                // aborted.
                                Err(BuildError::Cancelled(rule.target().clone()))
                            } else {
                                build_one(rule, &context, cache.as_ref(), &abort, &mut executed)
                            };
                            if done_tx.send((idx, result, executed)).is_err() {
                                return;
                            }
                        }
                    })
                    .expect("failed to spawn build worker"),
            );
        }
        drop(done_tx);

        let mut states: Vec<State> = (0..total).map(|_| State::Waiting).collect();
        let mut report = BuildReport::default();
        let mut completed = 0;

        for (i, pending) in pending_deps.iter().enumerate() {
            if *pending == 0 {
                states[i] = State::Queued;
                let _ = work_tx.send(i);
            }
        }

        while completed < total {
            let (idx, result, executed) =
                done_rx.recv().expect("all workers exited with work outstanding");
            let target = rules[idx].target().clone();
            for step_name in executed {
                report.executed_steps.push((target.clone(), step_name));
            }
            states[idx] = State::Terminal;
            completed += 1;

            match result {
                Ok(kind) => {
                    trace!("{} done: {:?}", target, kind);
                    report.outcomes.insert(target, RuleOutcome::Success(kind));
                    if !abort.load(Ordering::SeqCst) {
                        for &dependent in &rev_deps[idx] {
                            pending_deps[dependent] -= 1;
                            if pending_deps[dependent] == 0 {
                                if let State::Waiting = states[dependent] {
                                    states[dependent] = State::Queued;
                                    let _ = work_tx.send(dependent);
                                }
                            }
                        }
                    }
                }
                Err(e) if e.is_cancellation() => {
                    report.outcomes.insert(target, RuleOutcome::Cancelled);
                }
                Err(e) => {
                    warn!("{} failed: {}", target, e);
                    abort.store(true, Ordering::SeqCst);
                    report.outcomes.insert(target, RuleOutcome::Failed(e));
                    // Everything still waiting is now unreachable: either
                    // downstream of the failure or abandoned by the abort.
                    for (i, state) in states.iter_mut().enumerate() {
                        if let State::Waiting = state {
                            *state = State::Terminal;
                            completed += 1;
                            report
                                .outcomes
                                .insert(rules[i].target().clone(), RuleOutcome::Cancelled);
                        }
                    }
                }
            }
        }

        drop(work_tx);
        for worker in workers {
            let _ = worker.join();
        }

        debug!(
            "build finished: {} rule(s), {} step(s) executed",
            total,
            report.executed_steps.len()
        );
        Ok(report)
    }

    /// The dep closure of the requested roots, leaves first (a valid
    /// execution order is implied by `pending_deps`, not by this order).
    fn involved_rules(&self, roots: &[BuildTarget]) -> Result<Vec<Arc<BuildRule>>, BuildError> {
        let mut result: Vec<Arc<BuildRule>> = vec![];
        let mut visited: HashMap<BuildTarget, ()> = HashMap::new();
        let mut stack: Vec<Arc<BuildRule>> = vec![];
        for root in roots {
            stack.push(self.context.graph.require(root)?);
        }
        while let Some(rule) = stack.pop() {
            if visited.insert(rule.target().clone(), ()).is_some() {
                continue;
            }
            for dep in self.context.graph.deps_of(&rule)? {
                stack.push(dep);
            }
            result.push(rule);
        }
        Ok(result)
    }

    /// Flushes pending cache stores.
    pub fn close(&self) {
        self.cache.close();
    }
}

fn build_one(
    rule: &Arc<BuildRule>,
    ctx: &BuildContext,
    cache: &dyn ArtifactCache,
    abort: &AtomicBool,
    executed: &mut Vec<String>,
) -> Result<BuildRuleSuccessKind, BuildError> {
    let key_ctx = RuleKeyCtx { hashes: &ctx.hashes, config: &ctx.config };
    let pair = keys::rule_key_pair(rule, &ctx.graph, &key_ctx)?;
    let total = pair.total;
    trace!("{} rule key {}", rule.target(), total);

    // The previous build's outputs are as good as a cache hit when the
    // key matches and the recorded outputs are still on disk.
    if let Some(info) = OnDiskBuildInfo::read(&ctx.project, rule.target())? {
        let outputs_present =
            info.recorded_paths().iter().all(|p| ctx.project.exists(p));
        if info.rule_key() == Some(total) && outputs_present {
            rule.buildable().initialize_from_disk(&info);
            return Ok(BuildRuleSuccessKind::MatchingRuleKey);
        }

        // ABI short circuit: our own inputs are unchanged and every dep
        // presents the same outward interface as last time, so the
        // previous outputs are still correct even though some dep's
        // total key moved. Re-stamp the sidecar with the new total key.
        if outputs_present && info.rule_key_no_deps() == Some(pair.without_deps) {
            let deps_abi = keys::combined_deps_abi(rule, &ctx.graph)?;
            if deps_abi.is_some() && info.deps_abi() == deps_abi {
                rule.buildable().initialize_from_disk(&info);
                let mut metadata = std::collections::BTreeMap::new();
                for (k, v) in info.metadata() {
                    metadata.insert(k, v);
                }
                let restamped =
                    OnDiskBuildInfo::new(&total, &info.recorded_paths(), &metadata)
                        .with_abi_bookkeeping(&pair.without_deps, deps_abi);
                restamped.write(&ctx.project, rule.target())?;
                return Ok(BuildRuleSuccessKind::MatchingDepsAbiAndRuleKeyNoDeps);
            }
        }
    }

    match cache.fetch(&total, ctx.project.root()) {
        CacheResult::Hit(hit) => {
            let deps_abi = keys::combined_deps_abi(rule, &ctx.graph)?;
            let info = OnDiskBuildInfo::from_cache_hit(&total, &hit)
                .with_abi_bookkeeping(&pair.without_deps, deps_abi);
            info.write(&ctx.project, rule.target())?;
            rule.buildable().initialize_from_disk(&info);
            return Ok(BuildRuleSuccessKind::FetchedFromCache);
        }
        CacheResult::Miss => {}
    }

    let mut buildable_ctx = BuildableContext::new();
    let steps = rule.buildable().steps(ctx, &mut buildable_ctx)?;
    let exec_ctx = ExecutionContext { project: Arc::clone(&ctx.project), verbose: false };
    for step in &steps {
        // A failure elsewhere aborts between steps, never mid-step.
        if abort.load(Ordering::SeqCst) {
            return Err(BuildError::Cancelled(rule.target().clone()));
        }
        executed.push(step.short_name().to_owned());
        let outcome = step.execute(&exec_ctx);
        if !outcome.is_success() {
            return Err(BuildError::StepFailure {
                short_name: step.short_name().to_owned(),
                description: step.description(),
                exit_code: outcome.exit_code,
                stderr: outcome.stderr,
            });
        }
    }

    rule.buildable().on_build_finished(ctx, &mut buildable_ctx)?;
    if let Some(output) = rule.buildable().output_path() {
        buildable_ctx.record_artifact(output);
    }

    let deps_abi = keys::combined_deps_abi(rule, &ctx.graph)?;
    let info =
        OnDiskBuildInfo::new(&total, buildable_ctx.artifacts(), buildable_ctx.metadata())
            .with_abi_bookkeeping(&pair.without_deps, deps_abi);
    info.write(&ctx.project, rule.target())?;

    let metadata: std::collections::HashMap<String, String> =
        buildable_ctx.metadata().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    // Store failures must never fail the build; the cache logs in
    // aggregate on close.
    let _ = cache.store(&total, ctx.project.root(), buildable_ctx.artifacts(), &metadata);

    Ok(BuildRuleSuccessKind::BuiltLocally)
}
