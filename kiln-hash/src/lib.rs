//! Content hashing for the build engine: the 160-bit rule keys that identify
//! every rule's inputs-that-matter, the SHA-1 wrapper used for artifact and
//! ABI identities, and the shared file-hash cache.
//!
//! Rule keys are accumulated through [`RuleKeyBuilder`], which hashes a
//! named, ordered sequence of typed fields. Field names participate in the
//! hash, so reordering two `set` calls yields a different key, and writing
//! the same field twice in one builder is a programmer error.

use std::fmt;

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use sha1::{Digest, Sha1};
use thiserror::Error;

mod file_hash_cache;

pub use crate::file_hash_cache::{FileHashCache, FileHashError};

/// A 20-byte SHA-1 digest used as a binary identity: file content hashes,
/// ABI keys, and the storage form of rule keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sha1HashCode([u8; 20]);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("'{0}' is not a 40-character hex SHA-1")]
pub struct InvalidHashError(String);

impl Sha1HashCode {
    pub fn new(bytes: [u8; 20]) -> Sha1HashCode {
        Sha1HashCode(bytes)
    }

    /// Hashes a byte slice in one shot.
    pub fn of_bytes(bytes: &[u8]) -> Sha1HashCode {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        Sha1HashCode(hasher.finalize().into())
    }

    pub fn from_hex(s: &str) -> Result<Sha1HashCode, InvalidHashError> {
        let mut bytes = [0u8; 20];
        if s.len() != 40 {
            return Err(InvalidHashError(s.to_owned()));
        }
        hex::decode_to_slice(s, &mut bytes).map_err(|_| InvalidHashError(s.to_owned()))?;
        Ok(Sha1HashCode(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Sha1HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Sha1HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1HashCode({})", self.to_hex())
    }
}

impl Serialize for Sha1HashCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Sha1HashCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Sha1HashCode, D::Error> {
        let s = String::deserialize(deserializer)?;
        Sha1HashCode::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// The content-addressed identity of a build rule. The primary cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey(Sha1HashCode);

impl RuleKey {
    pub fn builder() -> RuleKeyBuilder {
        RuleKeyBuilder::new()
    }

    pub fn from_hash(hash: Sha1HashCode) -> RuleKey {
        RuleKey(hash)
    }

    pub fn from_hex(s: &str) -> Result<RuleKey, InvalidHashError> {
        Sha1HashCode::from_hex(s).map(RuleKey)
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    pub fn hash(&self) -> Sha1HashCode {
        self.0
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RuleKey({})", self.to_hex())
    }
}

/// The two per-rule key flavors: `without_deps` hashes only the rule's own
/// inputs and is what dependents fold into their recursive hashes; `total`
/// additionally covers the transitive dependency keys and is what the cache
/// and the scheduler identify outputs by.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuleKeyPair {
    pub without_deps: RuleKey,
    pub total: RuleKey,
}

// One-byte tags separating value kinds in the digest, so that e.g. the
// string "1" and the integer 1 never collide.
const TAG_STRING: u8 = b's';
const TAG_BOOL: u8 = b'b';
const TAG_INT: u8 = b'i';
const TAG_STRING_LIST: u8 = b'L';
const TAG_SOURCE_PATH: u8 = b'f';
const TAG_HASH: u8 = b'h';
const TAG_RULE_KEYS: u8 = b'k';
const TAG_NONE: u8 = b'n';

/// Accumulates named fields into a rule key. The order of `set_*` calls is
/// significant, and a duplicate field name panics: both conditions indicate
/// a bug in the rule's key recipe rather than bad user input.
pub struct RuleKeyBuilder {
    hasher: Sha1,
    seen: Vec<String>,
}

impl Default for RuleKeyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleKeyBuilder {
    pub fn new() -> RuleKeyBuilder {
        RuleKeyBuilder { hasher: Sha1::new(), seen: vec![] }
    }

    fn field(&mut self, name: &str, tag: u8) {
        if self.seen.iter().any(|s| s == name) {
            panic!("duplicate rule key field '{}'", name);
        }
        self.seen.push(name.to_owned());
        self.hasher.update(name.as_bytes());
        self.hasher.update(&[0u8, tag]);
    }

    fn raw(&mut self, bytes: &[u8]) {
        self.hasher.update(&(bytes.len() as u64).to_be_bytes());
        self.hasher.update(bytes);
    }

    pub fn set_str(&mut self, name: &str, value: &str) -> &mut Self {
        self.field(name, TAG_STRING);
        self.raw(value.as_bytes());
        self
    }

    pub fn set_bool(&mut self, name: &str, value: bool) -> &mut Self {
        self.field(name, TAG_BOOL);
        self.raw(&[value as u8]);
        self
    }

    pub fn set_int(&mut self, name: &str, value: i64) -> &mut Self {
        self.field(name, TAG_INT);
        self.raw(&value.to_be_bytes());
        self
    }

    /// Hashes an optional scalar; `None` contributes a distinct marker so
    /// that an absent value and an empty string do not collide.
    pub fn set_opt_str(&mut self, name: &str, value: Option<&str>) -> &mut Self {
        match value {
            Some(v) => {
                self.field(name, TAG_STRING);
                self.raw(v.as_bytes());
            }
            None => {
                self.field(name, TAG_NONE);
            }
        }
        self
    }

    /// Hashes a list of strings in iteration order. Unordered containers
    /// must be canonicalized (sorted) by the caller before this call.
    pub fn set_strings<I, S>(&mut self, name: &str, values: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.field(name, TAG_STRING_LIST);
        for value in values {
            self.raw(value.as_ref().as_bytes());
        }
        self.hasher.update(&[0u8]);
        self
    }

    /// Hashes a source path as the pair of its logical name and content
    /// hash, so renames and edits are both visible.
    pub fn set_source_path(
        &mut self,
        name: &str,
        logical: &str,
        content: Sha1HashCode,
    ) -> &mut Self {
        self.field(name, TAG_SOURCE_PATH);
        self.raw(logical.as_bytes());
        self.raw(content.as_bytes());
        self
    }

    /// Hashes a list of `(logical name, content hash)` pairs in iteration
    /// order.
    pub fn set_source_paths<'a, I>(&mut self, name: &str, paths: I) -> &mut Self
    where
        I: IntoIterator<Item = (&'a str, Sha1HashCode)>,
    {
        self.field(name, TAG_SOURCE_PATH);
        for (logical, content) in paths {
            self.raw(logical.as_bytes());
            self.raw(content.as_bytes());
        }
        self.hasher.update(&[0u8]);
        self
    }

    pub fn set_hash(&mut self, name: &str, hash: Sha1HashCode) -> &mut Self {
        self.field(name, TAG_HASH);
        self.raw(hash.as_bytes());
        self
    }

    /// Contributes dependency rule keys in the caller-provided (canonical)
    /// order.
    pub fn set_rule_keys<'a, I>(&mut self, name: &str, keys: I) -> &mut Self
    where
        I: IntoIterator<Item = &'a RuleKey>,
    {
        self.field(name, TAG_RULE_KEYS);
        for key in keys {
            self.raw(key.hash().as_bytes());
        }
        self.hasher.update(&[0u8]);
        self
    }

    pub fn build(self) -> RuleKey {
        RuleKey(Sha1HashCode(self.hasher.finalize().into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let mut a = RuleKey::builder();
        a.set_str("name", "//:a").set_bool("release", true);
        let mut b = RuleKey::builder();
        b.set_str("name", "//:a").set_bool("release", true);
        assert_eq!(a.build(), b.build());
    }

    #[test]
    fn field_order_matters() {
        let mut a = RuleKey::builder();
        a.set_str("x", "1").set_str("y", "2");
        let mut b = RuleKey::builder();
        b.set_str("y", "2").set_str("x", "1");
        assert_ne!(a.build(), b.build());
    }

    #[test]
    fn value_changes_key() {
        let mut a = RuleKey::builder();
        a.set_str("srcs", "A.java");
        let mut b = RuleKey::builder();
        b.set_str("srcs", "B.java");
        assert_ne!(a.build(), b.build());
    }

    #[test]
    fn type_tag_distinguishes_values() {
        let mut a = RuleKey::builder();
        a.set_str("v", "1");
        let mut b = RuleKey::builder();
        b.set_int("v", 1);
        assert_ne!(a.build(), b.build());
    }

    #[test]
    fn none_and_empty_string_differ() {
        let mut a = RuleKey::builder();
        a.set_opt_str("v", None);
        let mut b = RuleKey::builder();
        b.set_opt_str("v", Some(""));
        assert_ne!(a.build(), b.build());
    }

    #[test]
    fn list_boundaries_are_unambiguous() {
        let mut a = RuleKey::builder();
        a.set_strings("v", vec!["ab", "c"]);
        let mut b = RuleKey::builder();
        b.set_strings("v", vec!["a", "bc"]);
        assert_ne!(a.build(), b.build());
    }

    #[test]
    #[should_panic(expected = "duplicate rule key field")]
    fn duplicate_field_panics() {
        let mut b = RuleKey::builder();
        b.set_str("name", "x").set_str("name", "y");
    }

    #[test]
    fn source_path_hash_covers_rename_and_edit() {
        let content = Sha1HashCode::of_bytes(b"class A {}");
        let mut a = RuleKey::builder();
        a.set_source_path("src", "A.java", content);
        let mut renamed = RuleKey::builder();
        renamed.set_source_path("src", "B.java", content);
        let mut edited = RuleKey::builder();
        edited.set_source_path("src", "A.java", Sha1HashCode::of_bytes(b"class A { int x; }"));
        let a = a.build();
        assert_ne!(a, renamed.build());
        assert_ne!(a, edited.build());
    }

    #[test]
    fn hex_round_trip() {
        let key = {
            let mut b = RuleKey::builder();
            b.set_str("name", "//:a");
            b.build()
        };
        assert_eq!(RuleKey::from_hex(&key.to_hex()), Ok(key));
        assert!(RuleKey::from_hex("zz").is_err());
    }
}
