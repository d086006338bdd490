//! The command-line surface: command parsing with typo correction, and
//! the drivers behind each command.
//!
//! An unknown command word is matched against the known commands by
//! Levenshtein distance; when the normalized distance is within half the
//! typed word's length the closest command is assumed (with a warning),
//! otherwise the invocation fails. Exit codes: 0 on success, a failing
//! step's own exit code when non-zero, 1 for every other failure.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use kiln_cache::{
    ArtifactCache, CacheResult, DirArtifactCache, HttpArtifactCache, MultiArtifactCache,
    NoopArtifactCache,
};
use kiln_hash::FileHashCache;
use kiln_target::BuildTarget;

use crate::build::on_disk::OnDiskBuildInfo;
use crate::build::{keys, BuildContext, BuildEngine, RuleOutcome};
use crate::build_files;
use crate::config::Config;
use crate::errors::BuildError;
use crate::graph::{build_action_graph, ActionGraph};
use crate::project::ProjectFilesystem;
use crate::attr::DescriptionRegistry;
use crate::rules::{RuleKeyCtx, RuleType};
use crate::target_graph::TargetGraph;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Build,
    Test,
    Install,
    Uninstall,
    Clean,
    Cache,
    Project,
    Targets,
    Audit,
    Run,
    Quickstart,
}

pub const ALL_COMMANDS: &[(&str, Command)] = &[
    ("build", Command::Build),
    ("test", Command::Test),
    ("install", Command::Install),
    ("uninstall", Command::Uninstall),
    ("clean", Command::Clean),
    ("cache", Command::Cache),
    ("project", Command::Project),
    ("targets", Command::Targets),
    ("audit", Command::Audit),
    ("run", Command::Run),
    ("quickstart", Command::Quickstart),
];

#[derive(Debug, PartialEq, Eq)]
pub enum CommandMatch {
    Exact(Command),
    /// Close enough to assume; carries the warning to print.
    Fuzzy(Command, String),
    Unknown(String),
}

pub fn match_command(word: &str) -> CommandMatch {
    for (name, command) in ALL_COMMANDS {
        if *name == word {
            return CommandMatch::Exact(*command);
        }
    }
    let (closest_name, closest_command, distance) = ALL_COMMANDS
        .iter()
        .map(|(name, command)| (*name, *command, levenshtein(word, name)))
        .min_by_key(|(_, _, distance)| *distance)
        .expect("the command table is not empty");
    if word.is_empty() || distance as f64 / word.len() as f64 > 0.5 {
        CommandMatch::Unknown(word.to_owned())
    } else {
        let warning = format!(
            "(Cannot find command '{}', assuming command '{}'.)",
            word, closest_name
        );
        CommandMatch::Fuzzy(closest_command, warning)
    }
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut previous_diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous_diagonal + usize::from(ca != cb);
            previous_diagonal = row[j + 1];
            row[j + 1] = substitution.min(row[j] + 1).min(previous_diagonal + 1);
        }
    }
    row[b.len()]
}

/// Everything a command handler needs, wired once per invocation.
struct Env {
    project: Arc<ProjectFilesystem>,
    config: Arc<Config>,
    target_graph: TargetGraph,
    graph: Arc<ActionGraph>,
    hashes: Arc<FileHashCache>,
    cache: Arc<dyn ArtifactCache>,
}

impl Env {
    fn new(project_root: &Path) -> Result<Env, BuildError> {
        let project = Arc::new(ProjectFilesystem::new(project_root));
        let config = Arc::new(Config::load(project_root)?);
        let registry = DescriptionRegistry::with_default_descriptions();
        let target_graph = build_files::load_target_graph(project_root, &registry)?;
        let graph = Arc::new(build_action_graph(
            &target_graph,
            &registry,
            Arc::clone(&project),
            Arc::clone(&config),
        )?);
        let hashes = Arc::new(FileHashCache::new(project_root));
        let cache = make_cache(&config)?;
        Ok(Env { project, config, target_graph, graph, hashes, cache })
    }

    fn build_context(&self) -> BuildContext {
        BuildContext {
            project: Arc::clone(&self.project),
            graph: Arc::clone(&self.graph),
            config: Arc::clone(&self.config),
            hashes: Arc::clone(&self.hashes),
        }
    }

    fn engine(&self) -> BuildEngine {
        BuildEngine::new(self.build_context(), Arc::clone(&self.cache))
    }

    /// Resolves a command-line target string: an alias from the config,
    /// or a fully-qualified target.
    fn resolve_target(&self, s: &str) -> Result<BuildTarget, BuildError> {
        if let Some(aliased) = self.config.aliases.get(s) {
            return BuildTarget::parse(aliased).map_err(BuildError::from);
        }
        let target = BuildTarget::parse(s)?;
        self.target_graph.require(&target)?;
        Ok(target)
    }

    fn resolve_targets(&self, args: &[String]) -> Result<Vec<BuildTarget>, BuildError> {
        if args.is_empty() {
            return Err(BuildError::UserInput("no target given".to_owned()));
        }
        args.iter().map(|s| self.resolve_target(s)).collect()
    }
}

fn make_cache(config: &Config) -> Result<Arc<dyn ArtifactCache>, BuildError> {
    let mut caches: Vec<Arc<dyn ArtifactCache>> = vec![];
    if let Some(dir) = &config.cache.dir {
        let cache = DirArtifactCache::new(dir, !config.cache.read_only)
            .map_err(|e| BuildError::UserInput(format!("cannot open cache dir: {}", e)))?;
        caches.push(Arc::new(cache));
    }
    if let Some(url) = &config.cache.http_url {
        let url = url::Url::parse(url)
            .map_err(|e| BuildError::UserInput(format!("bad cache http_url: {}", e)))?;
        let cache = HttpArtifactCache::new(
            url,
            Duration::from_secs(config.cache.http_timeout_secs),
            !config.cache.read_only,
        )
        .map_err(|e| BuildError::UserInput(format!("cannot create http cache: {}", e)))?;
        caches.push(Arc::new(cache));
    }
    if caches.is_empty() {
        return Ok(Arc::new(NoopArtifactCache));
    }
    Ok(Arc::new(MultiArtifactCache::new(caches)))
}

/// Entry point below `main`: dispatches one invocation and returns the
/// process exit code.
pub fn run(project_root: &Path, args: &[String]) -> i32 {
    let (command, rest) = match args.split_first() {
        Some((word, rest)) => match match_command(word) {
            CommandMatch::Exact(command) => (command, rest),
            CommandMatch::Fuzzy(command, warning) => {
                println!("{}", warning);
                (command, rest)
            }
            CommandMatch::Unknown(word) => {
                eprintln!("Unknown command '{}'.", word);
                return 1;
            }
        },
        None => {
            eprintln!("No command given. Try 'kiln build <target>'.");
            return 1;
        }
    };

    match dispatch(project_root, command, rest) {
        Ok(code) => code,
        Err(e) => {
            if !e.is_cancellation() {
                eprintln!("{}", e.user_message());
            }
            e.exit_code()
        }
    }
}

fn dispatch(project_root: &Path, command: Command, args: &[String]) -> Result<i32, BuildError> {
    match command {
        Command::Clean => {
            let project = ProjectFilesystem::new(project_root);
            project.clean()?;
            Ok(0)
        }
        Command::Quickstart => {
            println!(
                "Create a KILN file next to your sources, e.g.\n\
                 [{{\"type\": \"java_library\", \"name\": \"lib\", \"srcs\": [\"A.java\"]}}]\n\
                 then run: kiln build //:lib"
            );
            Ok(0)
        }
        Command::Project => {
            let ide = flag_value(args, "--ide").unwrap_or("intellij");
            println!(
                "Project generation for {} is handled by the IDE generator tools; \
                 kiln only provides the action graph.",
                ide
            );
            Ok(0)
        }
        Command::Build => {
            let env = Env::new(project_root)?;
            let roots = env.resolve_targets(args)?;
            run_build(&env, &roots)
        }
        Command::Targets => targets_command(project_root, args),
        Command::Cache => cache_command(project_root, args),
        Command::Audit => audit_command(project_root, args),
        Command::Run => run_command(project_root, args),
        Command::Test => test_command(project_root, args),
        Command::Install => install_command(project_root, args, false),
        Command::Uninstall => install_command(project_root, args, true),
    }
}

fn run_build(env: &Env, roots: &[BuildTarget]) -> Result<i32, BuildError> {
    let engine = env.engine();
    let report = engine.build(roots)?;
    engine.close();

    for root in roots {
        match report.outcome(root) {
            Some(RuleOutcome::Success(kind)) => {
                debug!("{} -> {:?}", root, kind);
            }
            Some(RuleOutcome::Cancelled) | None => {}
            Some(RuleOutcome::Failed(_)) => {}
        }
    }
    if let Some((target, error)) = report.first_failure() {
        eprintln!("BUILD FAILED: {}: {}", target, error.user_message());
    }
    Ok(report.exit_code())
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn targets_command(project_root: &Path, args: &[String]) -> Result<i32, BuildError> {
    let env = Env::new(project_root)?;

    if let Some(alias) = flag_value(args, "--resolvealias") {
        match env.config.aliases.get(alias) {
            Some(target) => {
                println!("{}", target);
                return Ok(0);
            }
            None => {
                return Err(BuildError::UserInput(format!("unknown alias '{}'", alias)))
            }
        }
    }

    let type_filter = match flag_value(args, "--type") {
        Some(tag) => Some(RuleType::parse(tag).ok_or_else(|| {
            BuildError::UserInput(format!("unknown rule type '{}'", tag))
        })?),
        None => None,
    };
    let referenced_file = flag_value(args, "--referenced_file").map(PathBuf::from);
    let show_output = has_flag(args, "--show_output");
    let show_rulekey = has_flag(args, "--show_rulekey");
    let as_json = has_flag(args, "--json");

    let mut nodes: Vec<_> = env.target_graph.nodes().collect();
    nodes.sort_by(|a, b| a.target.cmp(&b.target));

    let key_ctx = RuleKeyCtx { hashes: &env.hashes, config: &env.config };
    let mut json_rows = vec![];
    for node in nodes {
        if let Some(filter) = type_filter {
            if node.rule_type != filter {
                continue;
            }
        }
        if let Some(file) = &referenced_file {
            let srcs = referenced_sources(&env, &node.target);
            if !srcs.iter().any(|s| s == file) {
                continue;
            }
        }

        let rule = env.graph.require(&node.target)?;
        let mut columns = vec![node.target.to_string()];
        if show_rulekey {
            let pair = keys::rule_key_pair(&rule, &env.graph, &key_ctx)?;
            columns.push(pair.total.to_hex());
        }
        if show_output {
            if let Some(output) = rule.buildable().output_path() {
                columns.push(output.to_string_lossy().into_owned());
            }
        }

        if as_json {
            let mut row = serde_json::Map::new();
            row.insert("name".to_owned(), node.target.short_name().into());
            row.insert("type".to_owned(), node.rule_type.name().into());
            row.insert("target".to_owned(), node.target.to_string().into());
            if show_rulekey {
                row.insert("rulekey".to_owned(), columns[1].clone().into());
            }
            json_rows.push(serde_json::Value::Object(row));
        } else {
            println!("{}", columns.join(" "));
        }
    }
    if as_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json_rows).expect("rows always serialize")
        );
    }
    Ok(0)
}

/// Source files a target references, for `targets --referenced_file`.
fn referenced_sources(env: &Env, target: &BuildTarget) -> Vec<PathBuf> {
    use crate::rules::args::RuleArgs;
    match env.target_graph.get(target).map(|n| &n.args) {
        Some(RuleArgs::JavaLibrary(a)) => a.srcs.clone(),
        Some(RuleArgs::JavaTest(a)) => a.library.srcs.clone(),
        Some(RuleArgs::PrebuiltJar(a)) => vec![a.binary_jar.clone()],
        Some(RuleArgs::CxxLibrary(a)) => {
            let mut srcs = a.srcs.clone();
            srcs.extend(a.headers.iter().cloned());
            srcs.extend(a.exported_headers.iter().cloned());
            srcs
        }
        Some(RuleArgs::Genrule(a)) => a.srcs.clone(),
        Some(RuleArgs::AndroidBinary(a)) => vec![a.manifest.clone()],
        Some(RuleArgs::AndroidResource(a)) => {
            a.manifest.iter().cloned().collect()
        }
        _ => vec![],
    }
}

fn cache_command(project_root: &Path, args: &[String]) -> Result<i32, BuildError> {
    let env = Env::new(project_root)?;
    let store = has_flag(args, "--store");
    let key_arg = args
        .iter()
        .find(|a| !a.starts_with("--"))
        .ok_or_else(|| BuildError::UserInput("cache requires a rule key".to_owned()))?;
    let key = kiln_hash::RuleKey::from_hex(key_arg)
        .map_err(|e| BuildError::UserInput(e.to_string()))?;

    if store {
        // Find the sidecar recorded with this key and archive its paths.
        for entry in walkdir::WalkDir::new(project_root.join("buck-out/bin"))
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_type().is_file() && e.file_name() == std::ffi::OsStr::new("METADATA")
            })
        {
            let bytes = std::fs::read(entry.path())
                .map_err(|e| BuildError::file_system(entry.path().to_path_buf(), e))?;
            let values: std::collections::BTreeMap<String, String> =
                match serde_json::from_slice(&bytes) {
                    Ok(values) => values,
                    Err(_) => continue,
                };
            if values.get(crate::build::on_disk::RULE_KEY).map(String::as_str)
                != Some(key_arg.as_str())
            {
                continue;
            }
            let info = OnDiskBuildInfo::new(
                &key,
                &values
                    .get(crate::build::on_disk::RECORDED_PATHS)
                    .and_then(|json| serde_json::from_str::<Vec<String>>(json).ok())
                    .unwrap_or_default()
                    .into_iter()
                    .map(PathBuf::from)
                    .collect::<Vec<_>>(),
                &values,
            );
            let _ = env.cache.store(
                &key,
                project_root,
                &info.recorded_paths(),
                &info.metadata(),
            );
            env.cache.close();
            println!("Stored {} to the artifact cache.", key);
            return Ok(0);
        }
        return Err(BuildError::UserInput(format!(
            "no built rule with key {} found under buck-out",
            key
        )));
    }

    match env.cache.fetch(&key, project_root) {
        CacheResult::Hit(hit) => {
            println!("Fetched {} ({} path(s)).", key, hit.paths.len());
            Ok(0)
        }
        CacheResult::Miss => {
            println!("Cache miss for {}.", key);
            Ok(1)
        }
    }
}

fn audit_command(project_root: &Path, args: &[String]) -> Result<i32, BuildError> {
    let env = Env::new(project_root)?;
    let (what, rest) = match args.split_first() {
        Some((what, rest)) => (what.as_str(), rest),
        None => {
            return Err(BuildError::UserInput(
                "audit requires a subcommand: deps | classpath".to_owned(),
            ))
        }
    };
    let roots = env.resolve_targets(rest)?;
    match what {
        "deps" => {
            for root in &roots {
                let rule = env.graph.require(root)?;
                println!("{}", root);
                let mut deps: Vec<_> = rule.deps().collect();
                deps.sort();
                for dep in deps {
                    println!("  {}", dep);
                }
            }
            Ok(0)
        }
        "classpath" => {
            for root in &roots {
                let rule = env.graph.require(root)?;
                if let Some(classpath) = rule.buildable().as_classpath() {
                    for (owner, jar) in classpath.transitive_classpath_entries(&env.graph) {
                        println!("{} {}", owner, jar.display());
                    }
                }
            }
            Ok(0)
        }
        other => Err(BuildError::UserInput(format!("unknown audit subcommand '{}'", other))),
    }
}

fn run_command(project_root: &Path, args: &[String]) -> Result<i32, BuildError> {
    let env = Env::new(project_root)?;
    let roots = env.resolve_targets(args)?;
    let code = run_build(&env, &roots)?;
    if code != 0 {
        return Ok(code);
    }
    let target = &roots[0];
    let rule = env.graph.require(target)?;
    let output = rule.buildable().output_path().ok_or_else(|| {
        BuildError::UserInput(format!("{} has no runnable output", target))
    })?;
    let status = std::process::Command::new(env.project.resolve(&output))
        .current_dir(project_root)
        .status()
        .map_err(|e| BuildError::file_system(output.clone(), e))?;
    Ok(status.code().unwrap_or(1))
}

fn test_command(project_root: &Path, args: &[String]) -> Result<i32, BuildError> {
    let env = Env::new(project_root)?;
    let roots = env.resolve_targets(args)?;
    let code = run_build(&env, &roots)?;
    if code != 0 {
        return Ok(code);
    }

    let key_ctx = RuleKeyCtx { hashes: &env.hashes, config: &env.config };
    let mut exit = 0;
    for root in &roots {
        let rule = env.graph.require(root)?;
        if rule.rule_type() != RuleType::JavaTest {
            warn!("{} is not a test rule; built only", root);
            continue;
        }
        let pair = keys::rule_key_pair(&rule, &env.graph, &key_ctx)?;

        // Cached result: a sidecar named by the rule key with the stored
        // exit code.
        let results_path = env
            .project
            .scratch_dir(root)
            .join(format!("test-result.{}", pair.total.to_hex()));
        if env.config.use_test_results_cache {
            if let Ok(bytes) = env.project.read_file(&results_path) {
                if let Ok(cached) = String::from_utf8_lossy(&bytes).trim().parse::<i32>() {
                    println!("{} (cached) exit {}", root, cached);
                    exit = exit.max(cached);
                    continue;
                }
            }
        }

        let command = test_command_for(&env, &rule)?;
        let status = std::process::Command::new(&env.config.tools.java)
            .args(&command)
            .current_dir(project_root)
            .status()
            .map_err(|e| BuildError::file_system(env.config.tools.java.clone(), e))?;
        let code = status.code().unwrap_or(1);
        println!("{} exit {}", root, code);
        if env.config.use_test_results_cache {
            env.project.write_file(&results_path, code.to_string().as_bytes())?;
        }
        exit = exit.max(code);
    }
    Ok(exit)
}

fn test_command_for(
    env: &Env,
    rule: &crate::rules::BuildRule,
) -> Result<Vec<String>, BuildError> {
    let main_class = rule.buildable().test_main_class().ok_or_else(|| {
        BuildError::UserInput(format!(
            "{} declares no test_main_class to run",
            rule.target()
        ))
    })?;
    let classpath = rule
        .buildable()
        .as_classpath()
        .map(|c| c.transitive_classpath_entries(&env.graph))
        .unwrap_or_default();
    let mut jars: Vec<String> = classpath
        .iter()
        .map(|(_, jar)| jar.to_string_lossy().into_owned())
        .collect();
    if let Some(own) = rule.buildable().output_path() {
        jars.insert(0, own.to_string_lossy().into_owned());
    }
    Ok(vec!["-classpath".to_owned(), jars.join(":"), main_class])
}

fn install_command(
    project_root: &Path,
    args: &[String],
    uninstall: bool,
) -> Result<i32, BuildError> {
    let env = Env::new(project_root)?;
    let roots = env.resolve_targets(args)?;
    let target = &roots[0];
    let rule = env.graph.require(target)?;
    if rule.rule_type() != RuleType::AndroidBinary {
        return Err(BuildError::UserInput(format!(
            "{} is not an android_binary",
            target
        )));
    }

    if uninstall {
        let package = manifest_package(&env, target)?;
        let status = std::process::Command::new(&env.config.tools.adb)
            .args(&["uninstall".to_owned(), package])
            .status()
            .map_err(|e| BuildError::file_system(env.config.tools.adb.clone(), e))?;
        return Ok(status.code().unwrap_or(1));
    }

    let code = run_build(&env, &roots)?;
    if code != 0 {
        return Ok(code);
    }
    let apk = rule.buildable().output_path().expect("binaries always have an output");
    let status = std::process::Command::new(&env.config.tools.adb)
        .args(&[
            "install".to_owned(),
            "-r".to_owned(),
            env.project.resolve(&apk).to_string_lossy().into_owned(),
        ])
        .status()
        .map_err(|e| BuildError::file_system(env.config.tools.adb.clone(), e))?;
    Ok(status.code().unwrap_or(1))
}

/// Scrapes `package="..."` out of the binary's manifest.
fn manifest_package(env: &Env, target: &BuildTarget) -> Result<String, BuildError> {
    use crate::rules::args::RuleArgs;
    let node = env.target_graph.require(target)?;
    let manifest = match &node.args {
        RuleArgs::AndroidBinary(args) => args.manifest.clone(),
        _ => return Err(BuildError::UserInput(format!("{} has no manifest", target))),
    };
    let text = String::from_utf8_lossy(&env.project.read_file(&manifest)?).into_owned();
    let pattern =
        regex::Regex::new(r#"package\s*=\s*"([^"]+)""#).expect("the pattern is valid");
    pattern
        .captures(&text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_owned())
        .ok_or_else(|| {
            BuildError::UserInput(format!(
                "{} declares no package in its manifest",
                target
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_commands_match() {
        assert_eq!(match_command("build"), CommandMatch::Exact(Command::Build));
        assert_eq!(match_command("targets"), CommandMatch::Exact(Command::Targets));
    }

    #[test]
    fn close_typo_is_assumed_with_a_warning() {
        match match_command("biuld") {
            CommandMatch::Fuzzy(Command::Build, warning) => {
                assert_eq!(
                    warning,
                    "(Cannot find command 'biuld', assuming command 'build'.)"
                );
            }
            other => panic!("expected fuzzy build, got {:?}", other),
        }
        assert!(matches!(match_command("instal"), CommandMatch::Fuzzy(Command::Install, _)));
    }

    #[test]
    fn distant_words_are_unknown() {
        assert_eq!(match_command("xyzzy"), CommandMatch::Unknown("xyzzy".to_owned()));
        assert_eq!(match_command(""), CommandMatch::Unknown(String::new()));
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("build", "build"), 0);
        assert_eq!(levenshtein("biuld", "build"), 2);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
    }
}
