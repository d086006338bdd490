//! Attribute coercion: turning raw parsed build-file values into the typed,
//! validated constructor arguments each rule kind declares.
//!
//! Build-file parsing itself is an external collaborator; it hands us
//! [`AttrValue`] trees (primitives, lists and mappings). The coercers in
//! [`coercer`] convert those into declared field types, and
//! [`description`] holds the registry mapping a rule-type tag to the
//! description that knows how to coerce and construct it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use heck::SnakeCase;
use thiserror::Error;

pub mod coercer;
pub mod description;

pub use self::description::{Description, DescriptionRegistry};

/// A raw parsed attribute value, before coercion.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    String(String),
    List(Vec<AttrValue>),
    Map(Vec<(AttrValue, AttrValue)>),
}

impl AttrValue {
    pub fn kind(&self) -> &'static str {
        match self {
            AttrValue::Bool(_) => "boolean",
            AttrValue::Int(_) => "integer",
            AttrValue::String(_) => "string",
            AttrValue::List(_) => "list",
            AttrValue::Map(_) => "map",
        }
    }

    /// The default-primitive values (`""`, `0`, `false`) read as "absent"
    /// when coercing into an `Option`.
    pub fn is_default_primitive(&self) -> bool {
        match self {
            AttrValue::Bool(b) => !b,
            AttrValue::Int(i) => *i == 0,
            AttrValue::String(s) => s.is_empty(),
            AttrValue::List(_) | AttrValue::Map(_) => false,
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Result<AttrValue, CoerceError> {
        match value {
            serde_json::Value::Bool(b) => Ok(AttrValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(AttrValue::Int)
                .ok_or_else(|| CoerceError::WrongType {
                    expected: "integer",
                    found: n.to_string(),
                }),
            serde_json::Value::String(s) => Ok(AttrValue::String(s.clone())),
            serde_json::Value::Array(items) => items
                .iter()
                .map(AttrValue::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(AttrValue::List),
            serde_json::Value::Object(entries) => entries
                .iter()
                .map(|(k, v)| Ok((AttrValue::String(k.clone()), AttrValue::from_json(v)?)))
                .collect::<Result<Vec<_>, CoerceError>>()
                .map(AttrValue::Map),
            serde_json::Value::Null => Err(CoerceError::WrongType {
                expected: "a primitive, list or map",
                found: "null".to_owned(),
            }),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AttrValue::Bool(b) => serde_json::Value::Bool(*b),
            AttrValue::Int(i) => serde_json::Value::from(*i),
            AttrValue::String(s) => serde_json::Value::String(s.clone()),
            AttrValue::List(items) => {
                serde_json::Value::Array(items.iter().map(AttrValue::to_json).collect())
            }
            AttrValue::Map(entries) => {
                let mut object = serde_json::Map::new();
                for (k, v) in entries {
                    let key = match k {
                        AttrValue::String(s) => s.clone(),
                        other => other.to_display_string(),
                    };
                    object.insert(key, v.to_json());
                }
                serde_json::Value::Object(object)
            }
        }
    }

    /// A short rendering used inside error messages.
    pub fn to_display_string(&self) -> String {
        match self {
            AttrValue::Bool(b) => b.to_string(),
            AttrValue::Int(i) => i.to_string(),
            AttrValue::String(s) => s.clone(),
            AttrValue::List(items) => {
                format!("[{} element list]", items.len())
            }
            AttrValue::Map(entries) => format!("[{} entry map]", entries.len()),
        }
    }
}

/// The attribute record of one rule declaration, keyed by python-style
/// names. Kept sorted so that iteration (and therefore hashing and JSON
/// output) is deterministic.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawAttributes(BTreeMap<String, AttrValue>);

impl RawAttributes {
    pub fn new() -> RawAttributes {
        RawAttributes(BTreeMap::new())
    }

    pub fn insert(&mut self, name: &str, value: AttrValue) {
        self.0.insert(name.to_owned(), value);
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.0.iter()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        for (name, value) in &self.0 {
            object.insert(name.clone(), value.to_json());
        }
        serde_json::Value::Object(object)
    }
}

/// Context a coercer needs: which package the attribute was declared in
/// (for resolving relative paths and `:name` references) and where the
/// project root is (for existence checks).
pub struct CoercionCtx<'a> {
    pub base_path: &'a str,
    pub project_root: &'a Path,
}

#[derive(Debug, Error, PartialEq)]
pub enum CoerceError {
    #[error("invalid path '{0}'")]
    InvalidPath(String),
    #[error("{} does not exist on disk", .0.display())]
    MissingFile(PathBuf),
    #[error("duplicate element '{0}' in sorted set")]
    DuplicateElement(String),
    #[error("expected {expected}, found {found}")]
    WrongType { expected: &'static str, found: String },
    #[error("'{value}' is not one of {}", variants.join(", "))]
    UnknownEnumVariant { value: String, variants: Vec<&'static str> },
    #[error("{0}")]
    InvalidTarget(String),
    #[error("pair must be a 2-element list, found {0} elements")]
    WrongPairArity(usize),
    #[error("attribute '{name}': {source}")]
    InAttribute {
        name: String,
        #[source]
        source: Box<CoerceError>,
    },
}

impl CoerceError {
    /// Wraps an error with the attribute it occurred in, preserving the
    /// innermost message for callers that format the chain.
    pub fn in_attribute(self, name: &str) -> CoerceError {
        CoerceError::InAttribute { name: name.to_owned(), source: Box::new(self) }
    }
}

/// Either of two coercible shapes, tried left first.
#[derive(Clone, Debug, PartialEq)]
pub enum Either<L, R> {
    Left(L),
    Right(R),
}

/// Derives the python-style attribute name from a Rust field name. The
/// conversion is the identity for names that are already lower_underscore;
/// lowerCamel hints from rule descriptions come out as lower_underscore.
pub fn python_name(field_name: &str) -> String {
    field_name.to_snake_case()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_names() {
        assert_eq!(python_name("binaryJar"), "binary_jar");
        assert_eq!(python_name("srcs"), "srcs");
        assert_eq!(python_name("linearAllocHardLimit"), "linear_alloc_hard_limit");
    }

    #[test]
    fn default_primitives() {
        assert!(AttrValue::String(String::new()).is_default_primitive());
        assert!(AttrValue::Int(0).is_default_primitive());
        assert!(AttrValue::Bool(false).is_default_primitive());
        assert!(!AttrValue::String("x".into()).is_default_primitive());
        assert!(!AttrValue::List(vec![]).is_default_primitive());
    }

    #[test]
    fn json_round_trip() {
        let json: serde_json::Value = serde_json::json!({
            "srcs": ["A.java", "B.java"],
            "release": true,
            "jobs": 4,
        });
        let value = AttrValue::from_json(&json).unwrap();
        assert_eq!(value.to_json(), json);
        assert!(AttrValue::from_json(&serde_json::json!(1.5)).is_err());
    }

    #[test]
    fn inner_error_message_is_preserved() {
        let inner = CoerceError::MissingFile(PathBuf::from("src/A.java"));
        let inner_message = inner.to_string();
        let wrapped = inner.in_attribute("srcs");
        assert!(wrapped.to_string().contains("srcs"));
        match wrapped {
            CoerceError::InAttribute { source, .. } => {
                assert_eq!(source.to_string(), inner_message);
            }
            _ => unreachable!(),
        }
    }
}
