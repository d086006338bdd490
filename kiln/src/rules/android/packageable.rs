//! Aggregation of everything an Android binary packages from its
//! transitive deps.
//!
//! The traversal is a depth-first post-order walk guarded by a visited
//! set: every packageable rule contributes to the collector exactly once.
//! Lists are accumulated in post-order (leaves first) and reversed when
//! the collection is finalized, so consumers always see topological
//! root-to-leaf order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use kiln_hash::Sha1HashCode;
use kiln_target::BuildTarget;

use crate::errors::BuildError;
use crate::graph::BuildRuleResolver;

/// A rule kind that contributes artifacts to an Android package.
pub trait AndroidPackageable {
    /// The deps the packageable traversal must visit below this rule.
    fn required_packageables(&self) -> Vec<BuildTarget>;

    /// Contributes this rule's artifacts. Called exactly once per rule
    /// per collection.
    fn add_to_collector(
        &self,
        collector: &mut AndroidPackageableCollector,
    ) -> Result<(), BuildError>;
}

/// The finalized, root-to-leaf-ordered aggregation.
#[derive(Debug, Default, Clone)]
pub struct AndroidPackageableCollection {
    pub resource_dirs: Vec<PathBuf>,
    pub asset_dirs: Vec<PathBuf>,
    pub manifest_files: Vec<PathBuf>,
    pub native_lib_dirs: Vec<PathBuf>,
    pub proguard_configs: Vec<PathBuf>,
    pub classpath_entries_to_dex: Vec<(BuildTarget, PathBuf)>,
    pub no_dx_classpath_entries: Vec<(BuildTarget, PathBuf)>,
    /// Java package to constants, one entry per `android_build_config`.
    pub build_config_constants: BTreeMap<String, Vec<(String, String)>>,
    pub class_hashes: HashMap<BuildTarget, BTreeMap<String, Sha1HashCode>>,
    /// Text-symbol outputs of resource rules, root-to-leaf.
    pub text_symbols_files: Vec<PathBuf>,
    /// Java packages R.java is generated into, in first-seen order.
    pub r_dot_java_packages: Vec<String>,
}

pub struct AndroidPackageableCollector {
    root: BuildTarget,
    no_dx: HashSet<BuildTarget>,
    excluded_resource_deps: HashSet<BuildTarget>,
    collection: AndroidPackageableCollection,
}

impl AndroidPackageableCollector {
    pub fn new(
        root: BuildTarget,
        no_dx: HashSet<BuildTarget>,
        excluded_resource_deps: HashSet<BuildTarget>,
    ) -> AndroidPackageableCollector {
        AndroidPackageableCollector {
            root,
            no_dx,
            excluded_resource_deps,
            collection: AndroidPackageableCollection::default(),
        }
    }

    fn resources_excluded(&self, owner: &BuildTarget) -> bool {
        self.excluded_resource_deps.contains(&owner.unflavored())
    }

    pub fn add_resource_dir(&mut self, owner: &BuildTarget, dir: PathBuf) {
        if self.resources_excluded(owner) {
            return;
        }
        self.collection.resource_dirs.push(dir);
    }

    pub fn add_asset_dir(&mut self, owner: &BuildTarget, dir: PathBuf) {
        if self.resources_excluded(owner) {
            return;
        }
        self.collection.asset_dirs.push(dir);
    }

    pub fn add_manifest(&mut self, owner: &BuildTarget, manifest: PathBuf) {
        if self.resources_excluded(owner) {
            return;
        }
        self.collection.manifest_files.push(manifest);
    }

    pub fn add_native_libs_dir(&mut self, _owner: &BuildTarget, dir: PathBuf) {
        self.collection.native_lib_dirs.push(dir);
    }

    pub fn add_proguard_config(&mut self, _owner: &BuildTarget, config: PathBuf) {
        self.collection.proguard_configs.push(config);
    }

    pub fn add_text_symbols_file(&mut self, owner: &BuildTarget, path: PathBuf) {
        if self.resources_excluded(owner) {
            return;
        }
        self.collection.text_symbols_files.push(path);
    }

    pub fn add_r_dot_java_package(&mut self, owner: &BuildTarget, package: String) {
        if self.resources_excluded(owner) {
            return;
        }
        if !self.collection.r_dot_java_packages.contains(&package) {
            self.collection.r_dot_java_packages.push(package);
        }
    }

    /// Routes a jar into the dex set, or the no-dx set when its owner was
    /// excluded from dexing.
    pub fn add_classpath_entry(&mut self, owner: &BuildTarget, jar: PathBuf) {
        let entry = (owner.clone(), jar);
        if self.no_dx.contains(&owner.unflavored()) {
            self.collection.no_dx_classpath_entries.push(entry);
        } else {
            self.collection.classpath_entries_to_dex.push(entry);
        }
    }

    pub fn add_class_hashes(
        &mut self,
        owner: &BuildTarget,
        hashes: BTreeMap<String, Sha1HashCode>,
    ) {
        self.collection.class_hashes.insert(owner.clone(), hashes);
    }

    pub fn add_build_config(
        &mut self,
        java_package: &str,
        constants: Vec<(String, String)>,
    ) -> Result<(), BuildError> {
        if self.collection.build_config_constants.contains_key(java_package) {
            return Err(BuildError::UserInput(format!(
                "Multiple android_build_config() rules with the same package {} in the \
                 transitive deps of {}.",
                java_package, self.root
            )));
        }
        self.collection.build_config_constants.insert(java_package.to_owned(), constants);
        Ok(())
    }

    /// Finalizes the collection: post-order lists flip to topological
    /// root-to-leaf order.
    pub fn build(mut self) -> AndroidPackageableCollection {
        self.collection.resource_dirs.reverse();
        self.collection.asset_dirs.reverse();
        self.collection.manifest_files.reverse();
        self.collection.native_lib_dirs.reverse();
        self.collection.proguard_configs.reverse();
        self.collection.classpath_entries_to_dex.reverse();
        self.collection.no_dx_classpath_entries.reverse();
        self.collection.text_symbols_files.reverse();
        self.collection
    }
}

/// Depth-first post-order traversal over the packageable deps of `roots`,
/// invoking `add_to_collector` exactly once per packageable.
pub fn collect(
    resolver: &BuildRuleResolver,
    roots: &[BuildTarget],
    collector: &mut AndroidPackageableCollector,
) -> Result<(), BuildError> {
    let mut visited = HashSet::new();
    for root in roots {
        visit(resolver, root, collector, &mut visited)?;
    }
    Ok(())
}

fn visit(
    resolver: &BuildRuleResolver,
    target: &BuildTarget,
    collector: &mut AndroidPackageableCollector,
    visited: &mut HashSet<BuildTarget>,
) -> Result<(), BuildError> {
    if !visited.insert(target.clone()) {
        return Ok(());
    }
    let rule = match resolver.get(target) {
        Some(rule) => rule,
        // Non-rule references (e.g. keystore paths) never reach here;
        // a missing target is a dangling reference.
        None => {
            return Err(BuildError::UserInput(format!(
                "no rule found for target {}",
                target
            )))
        }
    };
    let packageable = match rule.buildable().as_packageable() {
        Some(packageable) => packageable,
        None => return Ok(()),
    };
    for dep in packageable.required_packageables() {
        visit(resolver, &dep, collector, visited)?;
    }
    packageable.add_to_collector(collector)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(s: &str) -> BuildTarget {
        BuildTarget::parse(s).unwrap()
    }

    #[test]
    fn duplicate_build_config_package_fails_with_the_exact_message() {
        let mut collector = AndroidPackageableCollector::new(
            target("//app:apk"),
            HashSet::new(),
            HashSet::new(),
        );
        collector.add_build_config("com.example.buck", vec![]).unwrap();
        let err = collector
            .add_build_config("com.example.buck", vec![("DEBUG".into(), "false".into())])
            .unwrap_err();
        assert_eq!(
            err.user_message(),
            "Multiple android_build_config() rules with the same package com.example.buck \
             in the transitive deps of //app:apk."
        );
    }

    #[test]
    fn no_dx_entries_go_to_their_own_bucket() {
        let lib2 = target("//java:lib2");
        let mut no_dx = HashSet::new();
        no_dx.insert(lib2.clone());
        let mut collector =
            AndroidPackageableCollector::new(target("//app:apk"), no_dx, HashSet::new());

        collector.add_classpath_entry(&target("//java:lib1"), PathBuf::from("lib1.jar"));
        collector.add_classpath_entry(&lib2, PathBuf::from("lib2.jar"));
        let collection = collector.build();

        assert_eq!(collection.classpath_entries_to_dex.len(), 1);
        assert_eq!(collection.classpath_entries_to_dex[0].0, target("//java:lib1"));
        assert_eq!(collection.no_dx_classpath_entries.len(), 1);
        assert_eq!(collection.no_dx_classpath_entries[0].0, lib2);
    }

    #[test]
    fn excluded_resource_deps_contribute_nothing() {
        let excluded = target("//res:strings");
        let mut excluded_set = HashSet::new();
        excluded_set.insert(excluded.clone());
        let mut collector = AndroidPackageableCollector::new(
            target("//app:apk"),
            HashSet::new(),
            excluded_set,
        );

        collector.add_resource_dir(&excluded, PathBuf::from("res/strings"));
        collector.add_asset_dir(&excluded, PathBuf::from("assets"));
        collector.add_manifest(&excluded, PathBuf::from("AndroidManifest.xml"));
        collector.add_resource_dir(&target("//res:kept"), PathBuf::from("res/kept"));
        let collection = collector.build();

        assert_eq!(collection.resource_dirs, vec![PathBuf::from("res/kept")]);
        assert!(collection.asset_dirs.is_empty());
        assert!(collection.manifest_files.is_empty());
    }

    #[test]
    fn post_order_lists_are_reversed_to_root_to_leaf() {
        let mut collector = AndroidPackageableCollector::new(
            target("//app:apk"),
            HashSet::new(),
            HashSet::new(),
        );
        // Post-order visits leaves first.
        collector.add_resource_dir(&target("//res:leaf"), PathBuf::from("res/leaf"));
        collector.add_resource_dir(&target("//res:mid"), PathBuf::from("res/mid"));
        collector.add_resource_dir(&target("//res:root"), PathBuf::from("res/root"));
        let collection = collector.build();
        assert_eq!(
            collection.resource_dirs,
            vec![
                PathBuf::from("res/root"),
                PathBuf::from("res/mid"),
                PathBuf::from("res/leaf"),
            ]
        );
    }
}
