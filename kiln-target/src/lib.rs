//! Fully-qualified build target names and the patterns used to match them.
//!
//! A build target is the canonical name of a rule declaration,
//! `//base/path:short_name`, optionally carrying an ordered set of flavors
//! appended by graph enhancement (`//base/path:name#dex`). Patterns match
//! sets of targets and are used both for visibility declarations and for
//! command-line target selection.

use std::fmt;

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use thiserror::Error;

/// Errors produced while parsing targets and patterns. These are always
/// user errors: the offending string came from a build file or the command
/// line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("target '{0}' must contain exactly one colon")]
    MissingColon(String),
    #[error("target '{0}' has an empty short name")]
    EmptyShortName(String),
    #[error("target '{0}' has an invalid base path: {1}")]
    InvalidBasePath(String, String),
    #[error("target '{0}' has an empty flavor")]
    EmptyFlavor(String),
    #[error("'{0}' is not a valid target pattern")]
    InvalidPattern(String),
    #[error("relative target '{0}' must start with ':' or '//'")]
    NotRelative(String),
}

/// A fully-qualified, canonical build target: `//base/path:short_name`,
/// plus the ordered set of flavors appended during graph enhancement.
///
/// Two targets are equal iff base path, short name and flavors all match.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuildTarget {
    base_path: String,
    short_name: String,
    flavors: Vec<String>,
}

impl BuildTarget {
    /// Creates an unflavored target from its components, validating the
    /// base path.
    pub fn new(base_path: &str, short_name: &str) -> Result<BuildTarget, TargetError> {
        let repr = format!("//{}:{}", base_path, short_name);
        if short_name.is_empty() {
            return Err(TargetError::EmptyShortName(repr));
        }
        validate_base_path(base_path, &repr)?;
        Ok(BuildTarget {
            base_path: base_path.to_owned(),
            short_name: short_name.to_owned(),
            flavors: vec![],
        })
    }

    /// Parses a fully-qualified target, with or without the leading `//`.
    pub fn parse(s: &str) -> Result<BuildTarget, TargetError> {
        let stripped = if s.starts_with("//") { &s[2..] } else { s };

        let colon = match stripped.find(':') {
            Some(idx) => idx,
            None => return Err(TargetError::MissingColon(s.to_owned())),
        };
        let (base_path, rest) = stripped.split_at(colon);
        let rest = &rest[1..];
        if rest.contains(':') {
            return Err(TargetError::MissingColon(s.to_owned()));
        }

        let mut parts = rest.splitn(2, '#');
        let short_name = parts.next().unwrap_or("");
        let mut target = BuildTarget::new(base_path, short_name)
            .map_err(|e| rename_error(e, s))?;

        if let Some(flavors) = parts.next() {
            for flavor in flavors.split(',') {
                if flavor.is_empty() {
                    return Err(TargetError::EmptyFlavor(s.to_owned()));
                }
                target = target.with_flavor(flavor);
            }
        }
        Ok(target)
    }

    /// Parses a reference that may be package-relative (`:name`) against
    /// the base path of the build file it appeared in.
    pub fn parse_with_base(base_path: &str, s: &str) -> Result<BuildTarget, TargetError> {
        if s.starts_with(':') {
            let mut repr = String::with_capacity(base_path.len() + s.len() + 2);
            repr.push_str("//");
            repr.push_str(base_path);
            repr.push_str(s);
            BuildTarget::parse(&repr)
        } else if s.starts_with("//") {
            BuildTarget::parse(s)
        } else {
            Err(TargetError::NotRelative(s.to_owned()))
        }
    }

    /// The repo-relative, normalized base path (no leading or trailing `/`).
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn flavors(&self) -> &[String] {
        &self.flavors
    }

    pub fn is_flavored(&self) -> bool {
        !self.flavors.is_empty()
    }

    /// Returns a copy of this target with one more flavor appended. Flavors
    /// form an ordered set; appending an already-present flavor is a no-op.
    pub fn with_flavor(&self, flavor: &str) -> BuildTarget {
        let mut result = self.clone();
        if !result.flavors.iter().any(|f| f == flavor) {
            result.flavors.push(flavor.to_owned());
        }
        result
    }

    /// Returns the target stripped of every flavor.
    pub fn unflavored(&self) -> BuildTarget {
        BuildTarget {
            base_path: self.base_path.clone(),
            short_name: self.short_name.clone(),
            flavors: vec![],
        }
    }

    /// The canonical `//base/path:short_name[#flavors]` form.
    pub fn full_name(&self) -> String {
        self.to_string()
    }

    /// `short_name` with flavors folded in, usable as a file-system name
    /// for per-rule directories.
    pub fn flavored_name(&self) -> String {
        if self.flavors.is_empty() {
            self.short_name.clone()
        } else {
            format!("{}#{}", self.short_name, self.flavors.join(","))
        }
    }
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "//{}:{}", self.base_path, self.short_name)?;
        if !self.flavors.is_empty() {
            write!(f, "#{}", self.flavors.join(","))?;
        }
        Ok(())
    }
}

impl Serialize for BuildTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BuildTarget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<BuildTarget, D::Error> {
        let s = String::deserialize(deserializer)?;
        BuildTarget::parse(&s).map_err(serde::de::Error::custom)
    }
}

fn rename_error(e: TargetError, original: &str) -> TargetError {
    match e {
        TargetError::EmptyShortName(_) => TargetError::EmptyShortName(original.to_owned()),
        TargetError::InvalidBasePath(_, why) => {
            TargetError::InvalidBasePath(original.to_owned(), why)
        }
        other => other,
    }
}

fn validate_base_path(base_path: &str, repr: &str) -> Result<(), TargetError> {
    if base_path.starts_with('/') || base_path.ends_with('/') {
        return Err(TargetError::InvalidBasePath(
            repr.to_owned(),
            "leading or trailing '/'".to_owned(),
        ));
    }
    if base_path.is_empty() {
        return Ok(());
    }
    for segment in base_path.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(TargetError::InvalidBasePath(
                repr.to_owned(),
                format!("path segment '{}' is not normalized", segment),
            ));
        }
    }
    Ok(())
}

/// A pattern over build targets. `MatchAll` corresponds to `//...` (or the
/// `PUBLIC` visibility keyword), `Subdirectory` to `//base/path/...`, and
/// `SingleTarget` to an ordinary fully-qualified target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildTargetPattern {
    MatchAll,
    Subdirectory(String),
    SingleTarget(BuildTarget),
}

impl BuildTargetPattern {
    pub fn parse(s: &str) -> Result<BuildTargetPattern, TargetError> {
        if s == "PUBLIC" || s == "//..." || s == "..." {
            return Ok(BuildTargetPattern::MatchAll);
        }
        if let Some(prefix) = s.strip_suffix("/...") {
            let base = prefix.strip_prefix("//").unwrap_or(prefix);
            validate_base_path(base, s)
                .map_err(|_| TargetError::InvalidPattern(s.to_owned()))?;
            return Ok(BuildTargetPattern::Subdirectory(base.to_owned()));
        }
        if s.contains(':') {
            return Ok(BuildTargetPattern::SingleTarget(BuildTarget::parse(s)?));
        }
        Err(TargetError::InvalidPattern(s.to_owned()))
    }

    pub fn matches(&self, target: &BuildTarget) -> bool {
        match self {
            BuildTargetPattern::MatchAll => true,
            BuildTargetPattern::Subdirectory(prefix) => {
                target.base_path() == prefix
                    || target
                        .base_path()
                        .starts_with(&format!("{}/", prefix))
            }
            BuildTargetPattern::SingleTarget(t) => t == &target.unflavored(),
        }
    }
}

impl fmt::Display for BuildTargetPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildTargetPattern::MatchAll => write!(f, "//..."),
            BuildTargetPattern::Subdirectory(base) => write!(f, "//{}/...", base),
            BuildTargetPattern::SingleTarget(t) => write!(f, "{}", t),
        }
    }
}

/// Whether a rule carrying `visibility` declared at `owner` can be depended
/// upon by `from`. Rules in the same package are always visible to each
/// other; otherwise at least one declared pattern must match.
pub fn is_visible_to(
    owner: &BuildTarget,
    visibility: &[BuildTargetPattern],
    from: &BuildTarget,
) -> bool {
    if owner.base_path() == from.base_path() {
        return true;
    }
    visibility.iter().any(|pattern| pattern.matches(&from.unflavored()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trip() {
        let t = BuildTarget::parse("//java/com/example:lib").unwrap();
        assert_eq!(t.base_path(), "java/com/example");
        assert_eq!(t.short_name(), "lib");
        assert_eq!(t.to_string(), "//java/com/example:lib");
    }

    #[test]
    fn parse_flavored() {
        let t = BuildTarget::parse("//app:binary#dex,uber_r_dot_java").unwrap();
        assert_eq!(t.flavors(), &["dex".to_owned(), "uber_r_dot_java".to_owned()]);
        assert_eq!(t.unflavored(), BuildTarget::parse("//app:binary").unwrap());
        assert_eq!(t.to_string(), "//app:binary#dex,uber_r_dot_java");
    }

    #[test]
    fn parse_root_package() {
        let t = BuildTarget::parse("//:a").unwrap();
        assert_eq!(t.base_path(), "");
        assert_eq!(t.to_string(), "//:a");
    }

    #[test]
    fn flavors_are_an_ordered_set() {
        let t = BuildTarget::parse("//:a").unwrap().with_flavor("dex").with_flavor("dex");
        assert_eq!(t.flavors(), &["dex".to_owned()]);
    }

    #[test]
    fn parse_errors() {
        assert_eq!(
            BuildTarget::parse("//foo"),
            Err(TargetError::MissingColon("//foo".to_owned()))
        );
        assert_eq!(
            BuildTarget::parse("//foo:"),
            Err(TargetError::EmptyShortName("//foo:".to_owned()))
        );
        assert!(matches!(BuildTarget::parse("//foo/../bar:a"), Err(TargetError::InvalidBasePath(..))));
        assert_eq!(
            BuildTarget::parse("//foo:a#"),
            Err(TargetError::EmptyFlavor("//foo:a#".to_owned()))
        );
    }

    #[test]
    fn relative_parse() {
        let t = BuildTarget::parse_with_base("java/com/example", ":util").unwrap();
        assert_eq!(t.to_string(), "//java/com/example:util");
        let t = BuildTarget::parse_with_base("java/com/example", "//other:lib").unwrap();
        assert_eq!(t.to_string(), "//other:lib");
        assert!(BuildTarget::parse_with_base("java", "util").is_err());
    }

    #[test]
    fn pattern_matching() {
        let lib = BuildTarget::parse("//java/com/example:lib").unwrap();
        let other = BuildTarget::parse("//native:so").unwrap();

        assert!(BuildTargetPattern::parse("PUBLIC").unwrap().matches(&lib));
        assert!(BuildTargetPattern::parse("//...").unwrap().matches(&other));

        let subdir = BuildTargetPattern::parse("//java/...").unwrap();
        assert!(subdir.matches(&lib));
        assert!(!subdir.matches(&other));
        // A prefix must match on whole path segments.
        let deceptive = BuildTarget::parse("//javascript:x").unwrap();
        assert!(!subdir.matches(&deceptive));

        let single = BuildTargetPattern::parse("//java/com/example:lib").unwrap();
        assert!(single.matches(&lib));
        assert!(single.matches(&lib.with_flavor("dex")));
        assert!(!single.matches(&other));
    }

    #[test]
    fn same_package_is_always_visible() {
        let owner = BuildTarget::parse("//app:lib").unwrap();
        let sibling = BuildTarget::parse("//app:binary").unwrap();
        let outsider = BuildTarget::parse("//other:binary").unwrap();
        assert!(is_visible_to(&owner, &[], &sibling));
        assert!(!is_visible_to(&owner, &[], &outsider));
        assert!(is_visible_to(&owner, &[BuildTargetPattern::MatchAll], &outsider));
    }
}
