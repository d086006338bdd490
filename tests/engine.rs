//! End-to-end engine scenarios: incremental rebuilds, rule-key
//! sensitivity, caching, ABI short-circuiting and failure propagation.

mod support;

use std::sync::Arc;

use kiln::build::{BuildRuleSuccessKind, RuleOutcome};
use kiln_cache::DirArtifactCache;

use crate::support::{target, TestProject};

fn java_lib_project() -> TestProject {
    let project = TestProject::new();
    project.stub_jvm_tools();
    project.write("A.java", "class A {}\n");
    project.write(
        "KILN",
        r#"[{"type": "java_library", "name": "a", "srcs": ["A.java"]}]"#,
    );
    project
}

#[test]
fn first_build_runs_javac_and_jar_then_noop() {
    let project = java_lib_project();

    let report = project.build(&["//:a"]).unwrap();
    assert!(report.success());
    let steps = report.steps_for(&target("//:a"));
    assert!(steps.contains(&"javac"), "expected a javac step, got {:?}", steps);
    assert!(steps.contains(&"jar"), "expected a jar step, got {:?}", steps);
    assert!(project.exists("buck-out/gen/lib__a__output/a.jar"));

    // Second build, no source change: zero steps, matching rule key.
    let report = project.build(&["//:a"]).unwrap();
    assert!(report.success());
    assert!(
        report.executed_steps.is_empty(),
        "no-op rebuild ran steps: {:?}",
        report.executed_steps
    );
    match report.outcome(&target("//:a")) {
        Some(RuleOutcome::Success(BuildRuleSuccessKind::MatchingRuleKey)) => {}
        other => panic!("expected MatchingRuleKey, got {:?}", other),
    }
}

#[test]
fn rule_keys_are_deterministic_and_input_sensitive() {
    let project = java_lib_project();

    let first = project.rule_key_pair("//:a");
    let again = project.rule_key_pair("//:a");
    assert_eq!(first, again);

    // A one-byte edit re-keys both flavors.
    project.write("A.java", "class A { int x; }\n");
    let edited = project.rule_key_pair("//:a");
    assert_ne!(first.without_deps, edited.without_deps);
    assert_ne!(first.total, edited.total);
}

#[test]
fn editing_a_source_reruns_only_that_rule() {
    let project = java_lib_project();
    project.build(&["//:a"]).unwrap();

    project.write("A.java", "class A { int x; }\n");
    let report = project.build(&["//:a"]).unwrap();
    assert!(report.success());
    assert!(report.steps_for(&target("//:a")).contains(&"javac"));
}

#[test]
fn dep_total_key_change_rekeys_dependent() {
    let project = TestProject::new();
    project.stub_jvm_tools();
    project.write("A.java", "class A {}\n");
    project.write("B.java", "class B {}\n");
    project.write(
        "KILN",
        r#"[{"type": "java_library", "name": "a", "srcs": ["A.java"]},
            {"type": "java_library", "name": "b", "srcs": ["B.java"],
             "deps": [":a"]}]"#,
    );

    let before = project.rule_key_pair("//:b");
    project.write("A.java", "class A { int x; }\n");
    let after = project.rule_key_pair("//:b");
    // b's own inputs did not change, but its dep's key did.
    assert_eq!(before.without_deps, after.without_deps);
    assert_ne!(before.total, after.total);
}

#[test]
fn unchanged_dep_interface_short_circuits_dependent() {
    let project = TestProject::new();
    project.stub_jvm_tools();
    project.write("A.java", "class A {}\n");
    project.write("B.java", "class B {}\n");
    project.write(
        "KILN",
        r#"[{"type": "java_library", "name": "a", "srcs": ["A.java"]},
            {"type": "java_library", "name": "b", "srcs": ["B.java"],
             "deps": [":a"]}]"#,
    );
    project.build(&["//:b"]).unwrap();

    // The stubbed javac emits no classes, so a's ABI (its class-hash
    // map) is stable across this edit even though its rule key moves.
    project.write("A.java", "class A { int x; }\n");
    let report = project.build(&["//:b"]).unwrap();
    assert!(report.success());
    assert!(report.steps_for(&target("//:a")).contains(&"javac"));
    match report.outcome(&target("//:b")) {
        Some(RuleOutcome::Success(
            BuildRuleSuccessKind::MatchingDepsAbiAndRuleKeyNoDeps,
        )) => {}
        other => panic!("expected an ABI short circuit for //:b, got {:?}", other),
    }
    assert!(report.steps_for(&target("//:b")).is_empty());
}

#[test]
fn dep_without_abi_reruns_dependent() {
    let project = TestProject::new();
    project.stub_jvm_tools();
    project.write("B.java", "class B {}\n");
    project.write(
        "KILN",
        r#"[{"type": "genrule", "name": "gen", "cmd": "echo one > \"$OUT\"",
             "out": "gen.txt"},
            {"type": "java_library", "name": "b", "srcs": ["B.java"],
             "deps": [":gen"]}]"#,
    );
    project.build(&["//:b"]).unwrap();

    // Genrules expose no ABI key, so the dependent cannot short-circuit.
    project.write(
        "KILN",
        r#"[{"type": "genrule", "name": "gen", "cmd": "echo two > \"$OUT\"",
             "out": "gen.txt"},
            {"type": "java_library", "name": "b", "srcs": ["B.java"],
             "deps": [":gen"]}]"#,
    );
    let report = project.build(&["//:b"]).unwrap();
    assert!(report.success());
    match report.outcome(&target("//:b")) {
        Some(RuleOutcome::Success(BuildRuleSuccessKind::BuiltLocally)) => {}
        other => panic!("expected //:b to rebuild, got {:?}", other),
    }
}

#[test]
fn genrule_location_expansion_builds_real_outputs() {
    let project = TestProject::new();
    project.write(
        "KILN",
        r#"[{"type": "genrule", "name": "one", "cmd": "printf hello > \"$OUT\"",
             "out": "one.txt"},
            {"type": "genrule", "name": "two",
             "cmd": "cp $(location //:one) \"$OUT\"",
             "out": "two.txt", "deps": [":one"]}]"#,
    );
    let report = project.build(&["//:two"]).unwrap();
    assert!(report.success());
    assert_eq!(project.read("buck-out/gen/two.txt"), b"hello");
}

#[test]
fn cache_round_trips_after_clean() {
    let project = java_lib_project();
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(DirArtifactCache::new(cache_dir.path(), true).unwrap());

    let report = project.build_with_cache(cache.clone(), &["//:a"]).unwrap();
    assert!(report.success());
    let jar_before = project.read("buck-out/gen/lib__a__output/a.jar");

    // Wipe the outputs; the next build must come from the cache without
    // running any step.
    kiln::project::ProjectFilesystem::new(project.root()).clean().unwrap();
    assert!(!project.exists("buck-out"));

    let report = project.build_with_cache(cache, &["//:a"]).unwrap();
    assert!(report.success());
    assert!(report.executed_steps.is_empty(), "{:?}", report.executed_steps);
    match report.outcome(&target("//:a")) {
        Some(RuleOutcome::Success(BuildRuleSuccessKind::FetchedFromCache)) => {}
        other => panic!("expected a cache fetch, got {:?}", other),
    }
    assert_eq!(project.read("buck-out/gen/lib__a__output/a.jar"), jar_before);
}

#[test]
fn failure_cancels_transitive_dependents_and_propagates_exit_code() {
    let project = TestProject::new();
    project.write(
        "KILN",
        r#"[{"type": "genrule", "name": "a", "cmd": "exit 3", "out": "a.txt"},
            {"type": "genrule", "name": "mid",
             "cmd": "cp $(location //:a) \"$OUT\"", "out": "mid.txt",
             "deps": [":a"]},
            {"type": "genrule", "name": "b",
             "cmd": "cp $(location //:mid) \"$OUT\"", "out": "b.txt",
             "deps": [":mid"]}]"#,
    );
    let report = project.build(&["//:b"]).unwrap();
    assert!(!report.success());
    assert_eq!(report.exit_code(), 3);

    match report.outcome(&target("//:a")) {
        Some(RuleOutcome::Failed(e)) => {
            assert_eq!(e.exit_code(), 3);
            assert!(e.user_message().contains("genrule"));
        }
        other => panic!("expected //:a to fail, got {:?}", other),
    }
    for cancelled in &["//:mid", "//:b"] {
        match report.outcome(&target(cancelled)) {
            Some(RuleOutcome::Cancelled) => {}
            other => panic!("expected {} to be cancelled, got {:?}", cancelled, other),
        }
        assert!(report.steps_for(&target(cancelled)).is_empty());
    }
}

#[test]
fn classpath_is_aggregated_root_to_leaf() {
    let project = TestProject::new();
    project.stub_jvm_tools();
    project.write("A.java", "class A {}\n");
    project.write("B.java", "class B {}\n");
    project.write("C.java", "class C {}\n");
    project.write(
        "KILN",
        r#"[{"type": "java_library", "name": "leaf", "srcs": ["C.java"]},
            {"type": "java_library", "name": "mid", "srcs": ["B.java"],
             "deps": [":leaf"]},
            {"type": "java_library", "name": "root", "srcs": ["A.java"],
             "deps": [":mid"]}]"#,
    );

    let invocation = project.invocation();
    let rule = invocation.graph.require(&target("//:root")).unwrap();
    let entries = rule
        .buildable()
        .as_classpath()
        .expect("java libraries expose a classpath")
        .transitive_classpath_entries(&invocation.graph);
    let owners: Vec<String> = entries.iter().map(|(t, _)| t.to_string()).collect();
    assert_eq!(owners, vec!["//:mid", "//:leaf"]);
}
