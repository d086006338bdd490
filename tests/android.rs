//! Android graph-enhancement scenarios: pre-dex helpers, no-dx
//! exclusion, duplicate build-config detection and secondary-dex
//! metadata.

mod support;

use std::sync::Arc;

use kiln::attr::DescriptionRegistry;
use kiln::build::step::{ExecutionContext, Step};
use kiln::build_files;
use kiln::config::Config;
use kiln::errors::BuildError;
use kiln::graph::build_action_graph;
use kiln::project::ProjectFilesystem;
use kiln::rules::android::split_dex::SecondaryDexMetadataStep;

use crate::support::{target, TestProject};

fn android_project(no_dx: &str) -> TestProject {
    let project = TestProject::new();
    project.stub_jvm_tools();
    project.write("java/Lib1.java", "class Lib1 {}\n");
    project.write("java/Lib2.java", "class Lib2 {}\n");
    project.write(
        "java/KILN",
        r#"[{"type": "java_library", "name": "lib1", "srcs": ["Lib1.java"],
             "visibility": ["PUBLIC"]},
            {"type": "java_library", "name": "lib2", "srcs": ["Lib2.java"],
             "visibility": ["PUBLIC"]}]"#,
    );
    project.write("apps/AndroidManifest.xml", "<manifest package=\"com.example.app\"/>\n");
    project.write(
        "apps/KILN",
        &format!(
            r#"[{{"type": "android_binary", "name": "app",
                 "manifest": "AndroidManifest.xml", "split_dex": true,
                 "no_dx": [{}],
                 "deps": ["//java:lib1", "//java:lib2"]}}]"#,
            no_dx
        ),
    );
    project
}

#[test]
fn split_dex_enhancement_registers_pre_dex_helpers() {
    let project = android_project("");
    let invocation = project.invocation();

    // lib1 is dexed, so it gets a #dex helper; the binary depends on it.
    let dex_helper = target("//java:lib1#dex");
    assert!(invocation.graph.get(&dex_helper).is_some());
    let binary = invocation.graph.require(&target("//apps:app")).unwrap();
    assert!(binary.extra_deps().contains(&dex_helper));
}

#[test]
fn no_dx_targets_are_not_pre_dexed() {
    let project = android_project("\"//java:lib2\"");
    let invocation = project.invocation();

    assert!(invocation.graph.get(&target("//java:lib1#dex")).is_some());
    assert!(
        invocation.graph.get(&target("//java:lib2#dex")).is_none(),
        "no_dx targets must not contribute to the dex set"
    );
}

#[test]
fn duplicate_build_config_packages_fail_with_the_exact_message() {
    let project = TestProject::new();
    project.write(
        "configs/KILN",
        r#"[{"type": "android_build_config", "name": "one",
             "package": "com.example.buck", "visibility": ["PUBLIC"]},
            {"type": "android_build_config", "name": "two",
             "package": "com.example.buck", "visibility": ["PUBLIC"]}]"#,
    );
    project.write("apps/AndroidManifest.xml", "<manifest package=\"com.example.app\"/>\n");
    project.write(
        "apps/KILN",
        r#"[{"type": "android_binary", "name": "app",
             "manifest": "AndroidManifest.xml",
             "deps": ["//configs:one", "//configs:two"]}]"#,
    );

    let registry = DescriptionRegistry::with_default_descriptions();
    let target_graph =
        build_files::load_target_graph(project.root(), &registry).unwrap();
    let err = build_action_graph(
        &target_graph,
        &registry,
        Arc::new(ProjectFilesystem::new(project.root())),
        Arc::new(Config::load(project.root()).unwrap()),
    )
    .unwrap_err();
    match err {
        BuildError::UserInput(message) => assert_eq!(
            message,
            "Multiple android_build_config() rules with the same package com.example.buck \
             in the transitive deps of //apps:app."
        ),
        other => panic!("expected a user error, got {:?}", other),
    }
}

#[test]
fn build_config_helpers_carry_the_collected_package() {
    let project = TestProject::new();
    project.write(
        "configs/KILN",
        r#"[{"type": "android_build_config", "name": "flags",
             "package": "com.example.buck",
             "values": {"DEBUG": false, "API_LEVEL": 19},
             "visibility": ["PUBLIC"]}]"#,
    );
    project.write("apps/AndroidManifest.xml", "<manifest package=\"com.example.app\"/>\n");
    project.write(
        "apps/KILN",
        r#"[{"type": "android_binary", "name": "app",
             "manifest": "AndroidManifest.xml",
             "deps": ["//configs:flags"]}]"#,
    );

    let invocation = project.invocation();
    let helper = target("//apps:app#buildconfig_com.example.buck");
    let rule = invocation.graph.get(&helper).expect("the helper is registered");
    assert!(rule.buildable().output_path().is_some());
    let binary = invocation.graph.require(&target("//apps:app")).unwrap();
    assert_eq!(binary.extra_deps().to_vec(), vec![helper]);
}

#[test]
fn secondary_dex_metadata_lines_have_the_wire_shape() {
    let project = TestProject::new();
    // Three fake pre-dexed jars; the metadata step hashes whatever bytes
    // are on disk.
    project.write("jars/secondary-1.dex.jar", "first jar bytes");
    project.write("jars/secondary-2.dex.jar", "second jar bytes");
    project.write("jars/secondary-3.dex.jar", "third jar bytes");

    let entries = vec![
        ("jars/secondary-1.dex.jar".into(), "com.example.a.A".to_owned()),
        ("jars/secondary-2.dex.jar".into(), "com.example.k.K".to_owned()),
        ("jars/secondary-3.dex.jar".into(), "com.example.z.Z".to_owned()),
    ];
    let step = SecondaryDexMetadataStep::new(entries, "jars/metadata.txt".into());
    let ctx = ExecutionContext {
        project: Arc::new(ProjectFilesystem::new(project.root())),
        verbose: false,
    };
    assert_eq!(step.execute(&ctx).exit_code, 0);

    let metadata = String::from_utf8(project.read("jars/metadata.txt")).unwrap();
    let lines: Vec<&str> = metadata.lines().collect();
    assert_eq!(lines.len(), 3);
    for (n, line) in lines.iter().enumerate() {
        let parts: Vec<&str> = line.split(' ').collect();
        assert_eq!(parts.len(), 3, "bad metadata line: {}", line);
        assert_eq!(parts[0], format!("secondary-{}.dex.jar", n + 1));
        assert_eq!(parts[1].len(), 40);
        assert!(parts[1].chars().all(|c| c.is_ascii_hexdigit()));
        assert!(parts[2].contains('.'));
    }
}
