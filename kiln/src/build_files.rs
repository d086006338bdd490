//! Loading target descriptions from build files.
//!
//! Full build-file evaluation is an external collaborator; what kiln
//! consumes is the evaluated form: per-package `KILN` files holding a
//! JSON array of rule declarations. Each declaration carries its rule
//! `type`, `name`, optional `visibility`, and the rule kind's attributes
//! under their python-style names:
//!
//! ```json
//! [
//!   {"type": "java_library", "name": "util", "srcs": ["Util.java"],
//!    "visibility": ["PUBLIC"]}
//! ]
//! ```

use std::path::Path;

use log::trace;
use walkdir::WalkDir;

use kiln_target::{BuildTarget, BuildTargetPattern};

use crate::attr::{AttrValue, CoercionCtx, DescriptionRegistry, RawAttributes};
use crate::errors::BuildError;
use crate::project::OUTPUT_DIR;
use crate::rules::RuleType;
use crate::target_graph::{TargetGraph, TargetNode};

pub const BUILD_FILE_NAME: &str = "KILN";

/// Walks the project, parses every build file, coerces each declaration
/// through its description and assembles the validated target graph.
pub fn load_target_graph(
    project_root: &Path,
    registry: &DescriptionRegistry,
) -> Result<TargetGraph, BuildError> {
    let mut nodes = vec![];
    for entry in WalkDir::new(project_root)
        .into_iter()
        .filter_entry(|e| {
            if e.depth() == 0 {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            !(name == OUTPUT_DIR || name.starts_with('.'))
        })
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file()
            || entry.file_name() != std::ffi::OsStr::new(BUILD_FILE_NAME)
        {
            continue;
        }
        let base_path = entry
            .path()
            .parent()
            .and_then(|p| p.strip_prefix(project_root).ok())
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        trace!("loading build file for package '{}'", base_path);
        nodes.extend(load_build_file(project_root, entry.path(), &base_path, registry)?);
    }
    TargetGraph::new(nodes)
}

fn load_build_file(
    project_root: &Path,
    path: &Path,
    base_path: &str,
    registry: &DescriptionRegistry,
) -> Result<Vec<TargetNode>, BuildError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| BuildError::file_system(path.to_path_buf(), e))?;
    let parsed: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
        BuildError::UserInput(format!("{} is not valid JSON: {}", path.display(), e))
    })?;
    let declarations = match parsed {
        serde_json::Value::Array(items) => items,
        _ => {
            return Err(BuildError::UserInput(format!(
                "{} must hold a JSON array of rule declarations",
                path.display()
            )))
        }
    };

    let ctx = CoercionCtx { base_path, project_root };
    let mut nodes = vec![];
    for declaration in &declarations {
        let object = declaration.as_object().ok_or_else(|| {
            BuildError::UserInput(format!(
                "every declaration in {} must be a JSON object",
                path.display()
            ))
        })?;

        let type_tag = object.get("type").and_then(|v| v.as_str()).ok_or_else(|| {
            BuildError::UserInput(format!(
                "a declaration in {} is missing its 'type'",
                path.display()
            ))
        })?;
        let rule_type = RuleType::parse(type_tag).ok_or_else(|| {
            BuildError::UserInput(format!("unknown rule type '{}'", type_tag))
        })?;
        let description = registry.get(rule_type).ok_or_else(|| {
            BuildError::UserInput(format!(
                "no description registered for rule type '{}'",
                type_tag
            ))
        })?;

        let name = object.get("name").and_then(|v| v.as_str()).ok_or_else(|| {
            BuildError::UserInput(format!(
                "a {} declaration in {} is missing its 'name'",
                type_tag,
                path.display()
            ))
        })?;
        let target = BuildTarget::new(base_path, name)?;

        let mut visibility = vec![];
        if let Some(patterns) = object.get("visibility").and_then(|v| v.as_array()) {
            for pattern in patterns {
                let pattern = pattern.as_str().ok_or_else(|| {
                    BuildError::UserInput(format!(
                        "{}: visibility patterns must be strings",
                        target
                    ))
                })?;
                visibility.push(BuildTargetPattern::parse(pattern)?);
            }
        }

        let mut raw = RawAttributes::new();
        for (key, value) in object {
            if key == "type" || key == "name" || key == "visibility" {
                continue;
            }
            let value = AttrValue::from_json(value).map_err(|e| {
                BuildError::UserInput(format!("{}: attribute '{}': {}", target, key, e))
            })?;
            raw.insert(key, value);
        }

        let args = description
            .coerce(&ctx, &raw)
            .map_err(|e| BuildError::UserInput(format!("{}: {}", target, e)))?;
        let declared_deps = args.declared_deps();
        nodes.push(TargetNode { target, rule_type, args, declared_deps, visibility });
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn loads_and_validates_a_small_project() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("java/util")).unwrap();
        fs::write(dir.path().join("java/util/Util.java"), b"class Util {}").unwrap();
        fs::write(
            dir.path().join("java/util/KILN"),
            br#"[{"type": "java_library", "name": "util",
                 "srcs": ["Util.java"], "visibility": ["PUBLIC"]}]"#,
        )
        .unwrap();
        fs::create_dir_all(dir.path().join("app")).unwrap();
        fs::write(dir.path().join("app/App.java"), b"class App {}").unwrap();
        fs::write(
            dir.path().join("app/KILN"),
            br#"[{"type": "java_library", "name": "app",
                 "srcs": ["App.java"], "deps": ["//java/util:util"]}]"#,
        )
        .unwrap();

        let registry = DescriptionRegistry::with_default_descriptions();
        let graph = load_target_graph(dir.path(), &registry).unwrap();
        assert_eq!(graph.len(), 2);
        let app = graph.get(&BuildTarget::parse("//app:app").unwrap()).unwrap();
        assert_eq!(app.declared_deps, vec![BuildTarget::parse("//java/util:util").unwrap()]);
    }

    #[test]
    fn unknown_rule_type_is_a_user_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("KILN"),
            br#"[{"type": "haskell_library", "name": "x"}]"#,
        )
        .unwrap();
        let registry = DescriptionRegistry::with_default_descriptions();
        let err = load_target_graph(dir.path(), &registry).unwrap_err();
        assert!(err.user_message().contains("unknown rule type 'haskell_library'"));
    }
}
