//! Coercers from raw [`AttrValue`]s into declared field types.
//!
//! Container coercers delegate to element coercers and propagate the inner
//! error untouched: diagnostics quote the innermost failure verbatim.

use std::path::{Path, PathBuf};

use kiln_target::BuildTarget;

use super::{AttrValue, CoerceError, CoercionCtx, Either};

pub fn string(value: &AttrValue) -> Result<String, CoerceError> {
    match value {
        AttrValue::String(s) => Ok(s.clone()),
        other => Err(wrong_type("string", other)),
    }
}

pub fn integer(value: &AttrValue) -> Result<i64, CoerceError> {
    match value {
        AttrValue::Int(i) => Ok(*i),
        other => Err(wrong_type("integer", other)),
    }
}

pub fn boolean(value: &AttrValue) -> Result<bool, CoerceError> {
    match value {
        AttrValue::Bool(b) => Ok(*b),
        other => Err(wrong_type("boolean", other)),
    }
}

/// Coerces a path declared relative to the build file's package. The empty
/// string is an invalid path, and the file must exist on disk; rules that
/// name outputs use plain strings instead.
pub fn path(ctx: &CoercionCtx<'_>, value: &AttrValue) -> Result<PathBuf, CoerceError> {
    let s = string(value)?;
    if s.is_empty() {
        return Err(CoerceError::InvalidPath(s));
    }
    let relative = if ctx.base_path.is_empty() {
        PathBuf::from(&s)
    } else {
        Path::new(ctx.base_path).join(&s)
    };
    if !ctx.project_root.join(&relative).exists() {
        return Err(CoerceError::MissingFile(relative));
    }
    Ok(relative)
}

/// Coerces a reference to another rule, either `:name` (package-relative)
/// or fully qualified. Whether the referenced rule exists is checked later
/// by the resolver; this only validates the name's shape.
pub fn target(ctx: &CoercionCtx<'_>, value: &AttrValue) -> Result<BuildTarget, CoerceError> {
    let s = string(value)?;
    BuildTarget::parse_with_base(ctx.base_path, &s)
        .map_err(|e| CoerceError::InvalidTarget(e.to_string()))
}

/// An absent attribute, or one holding a default-primitive value (`""`,
/// `0`, `false`), coerces to `None`; anything else coerces the element and
/// wraps it.
pub fn optional<T>(
    value: Option<&AttrValue>,
    element: impl FnOnce(&AttrValue) -> Result<T, CoerceError>,
) -> Result<Option<T>, CoerceError> {
    match value {
        None => Ok(None),
        Some(v) if v.is_default_primitive() => Ok(None),
        Some(v) => element(v).map(Some),
    }
}

pub fn list<T>(
    value: &AttrValue,
    element: impl Fn(&AttrValue) -> Result<T, CoerceError>,
) -> Result<Vec<T>, CoerceError> {
    match value {
        AttrValue::List(items) => items.iter().map(element).collect(),
        other => Err(wrong_type("list", other)),
    }
}

/// A set keeps first occurrences and silently drops later duplicates.
pub fn set<T: PartialEq>(
    value: &AttrValue,
    element: impl Fn(&AttrValue) -> Result<T, CoerceError>,
) -> Result<Vec<T>, CoerceError> {
    let all = list(value, element)?;
    let mut result = Vec::with_capacity(all.len());
    for item in all {
        if !result.contains(&item) {
            result.push(item);
        }
    }
    Ok(result)
}

/// A sorted set rejects duplicates outright and returns elements in order.
pub fn sorted_set<T: Ord>(
    value: &AttrValue,
    element: impl Fn(&AttrValue) -> Result<T, CoerceError>,
) -> Result<Vec<T>, CoerceError> {
    let items = match value {
        AttrValue::List(items) => items,
        other => return Err(wrong_type("sorted set", other)),
    };
    let mut result: Vec<T> = Vec::with_capacity(items.len());
    for raw in items {
        let item = element(raw)?;
        if result.contains(&item) {
            return Err(CoerceError::DuplicateElement(raw.to_display_string()));
        }
        result.push(item);
    }
    result.sort();
    Ok(result)
}

/// Map keys must be non-optional scalars; entry order is preserved.
pub fn map<K, V>(
    value: &AttrValue,
    key: impl Fn(&AttrValue) -> Result<K, CoerceError>,
    val: impl Fn(&AttrValue) -> Result<V, CoerceError>,
) -> Result<Vec<(K, V)>, CoerceError> {
    match value {
        AttrValue::Map(entries) => {
            entries.iter().map(|(k, v)| Ok((key(k)?, val(v)?))).collect()
        }
        other => Err(wrong_type("map", other)),
    }
}

/// A pair is sourced from an exactly-2-element list.
pub fn pair<A, B>(
    value: &AttrValue,
    first: impl FnOnce(&AttrValue) -> Result<A, CoerceError>,
    second: impl FnOnce(&AttrValue) -> Result<B, CoerceError>,
) -> Result<(A, B), CoerceError> {
    match value {
        AttrValue::List(items) if items.len() == 2 => {
            Ok((first(&items[0])?, second(&items[1])?))
        }
        AttrValue::List(items) => Err(CoerceError::WrongPairArity(items.len())),
        other => Err(wrong_type("pair", other)),
    }
}

/// Tries the left coercer first, falling back to the right. When both fail,
/// the left error is reported if the input is structured (a list or map) -
/// the shape that the more specific left alternative usually declares -
/// otherwise the right error wins.
pub fn either<L, R>(
    value: &AttrValue,
    left: impl FnOnce(&AttrValue) -> Result<L, CoerceError>,
    right: impl FnOnce(&AttrValue) -> Result<R, CoerceError>,
) -> Result<Either<L, R>, CoerceError> {
    let left_err = match left(value) {
        Ok(l) => return Ok(Either::Left(l)),
        Err(e) => e,
    };
    match right(value) {
        Ok(r) => Ok(Either::Right(r)),
        Err(right_err) => match value {
            AttrValue::List(_) | AttrValue::Map(_) => Err(left_err),
            _ => Err(right_err),
        },
    }
}

/// Case-insensitive enum matching, locale-independent: only ASCII case is
/// folded, so the comparison is immune to Turkic-locale lowercasing rules.
/// Returns the canonical declared variant.
pub fn enumeration(
    value: &AttrValue,
    variants: &[&'static str],
) -> Result<&'static str, CoerceError> {
    let s = string(value)?;
    variants
        .iter()
        .find(|variant| variant.eq_ignore_ascii_case(&s))
        .copied()
        .ok_or_else(|| CoerceError::UnknownEnumVariant {
            value: s,
            variants: variants.to_vec(),
        })
}

fn wrong_type(expected: &'static str, found: &AttrValue) -> CoerceError {
    CoerceError::WrongType { expected, found: format!("{} '{}'", found.kind(), found.to_display_string()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(root: &'a Path) -> CoercionCtx<'a> {
        CoercionCtx { base_path: "java/app", project_root: root }
    }

    #[test]
    fn primitives() {
        assert_eq!(string(&AttrValue::String("x".into())), Ok("x".to_owned()));
        assert_eq!(integer(&AttrValue::Int(7)), Ok(7));
        assert_eq!(boolean(&AttrValue::Bool(true)), Ok(true));
        assert!(string(&AttrValue::Int(7)).is_err());
    }

    #[test]
    fn paths_are_package_relative_and_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("java/app")).unwrap();
        std::fs::write(dir.path().join("java/app/A.java"), b"class A {}").unwrap();
        let ctx = ctx(dir.path());

        assert_eq!(
            path(&ctx, &AttrValue::String("A.java".into())),
            Ok(PathBuf::from("java/app/A.java"))
        );
        assert_eq!(
            path(&ctx, &AttrValue::String(String::new())),
            Err(CoerceError::InvalidPath(String::new()))
        );
        assert_eq!(
            path(&ctx, &AttrValue::String("B.java".into())),
            Err(CoerceError::MissingFile(PathBuf::from("java/app/B.java")))
        );
    }

    #[test]
    fn optional_treats_default_primitives_as_none() {
        assert_eq!(optional(None, string), Ok(None));
        assert_eq!(optional(Some(&AttrValue::String(String::new())), string), Ok(None));
        assert_eq!(
            optional(Some(&AttrValue::String("x".into())), string),
            Ok(Some("x".to_owned()))
        );
    }

    #[test]
    fn sorted_set_rejects_duplicates() {
        let value = AttrValue::List(vec![
            AttrValue::String("b".into()),
            AttrValue::String("a".into()),
            AttrValue::String("b".into()),
        ]);
        assert_eq!(
            sorted_set(&value, string),
            Err(CoerceError::DuplicateElement("b".to_owned()))
        );

        let value = AttrValue::List(vec![AttrValue::String("b".into()), AttrValue::String("a".into())]);
        assert_eq!(sorted_set(&value, string), Ok(vec!["a".to_owned(), "b".to_owned()]));
    }

    #[test]
    fn set_drops_duplicates_silently() {
        let value = AttrValue::List(vec![
            AttrValue::String("b".into()),
            AttrValue::String("a".into()),
            AttrValue::String("b".into()),
        ]);
        assert_eq!(set(&value, string), Ok(vec!["b".to_owned(), "a".to_owned()]));
    }

    #[test]
    fn pair_requires_two_elements() {
        let value = AttrValue::List(vec![AttrValue::String("k".into()), AttrValue::Int(3)]);
        assert_eq!(pair(&value, string, integer), Ok(("k".to_owned(), 3)));
        let value = AttrValue::List(vec![AttrValue::Int(1)]);
        assert_eq!(pair(&value, string, integer), Err(CoerceError::WrongPairArity(1)));
    }

    #[test]
    fn either_prefers_left_error_for_structured_input() {
        // Left expects a list of strings, right expects a single string.
        let bad_list = AttrValue::List(vec![AttrValue::Int(1)]);
        let err = either(&bad_list, |v| list(v, string), string).unwrap_err();
        assert!(matches!(err, CoerceError::WrongType { expected: "string", .. }));

        let bad_scalar = AttrValue::Int(1);
        let err = either(&bad_scalar, |v| list(v, string), string).unwrap_err();
        // Scalar input: the right (scalar) alternative's error wins.
        assert!(matches!(err, CoerceError::WrongType { expected: "string", .. }));

        assert_eq!(
            either(&AttrValue::String("x".into()), |v| list(v, string), string),
            Ok(Either::Right("x".to_owned()))
        );
    }

    #[test]
    fn enum_matching_is_ascii_case_insensitive() {
        let variants = &["debug", "release"];
        assert_eq!(enumeration(&AttrValue::String("RELEASE".into()), variants), Ok("release"));
        assert_eq!(enumeration(&AttrValue::String("Debug".into()), variants), Ok("debug"));
        // The dotless capital I from Turkic locales must not match; only
        // ASCII folding applies.
        assert!(enumeration(&AttrValue::String("RELEASE\u{130}".into()), variants).is_err());
        assert!(matches!(
            enumeration(&AttrValue::String("profile".into()), variants),
            Err(CoerceError::UnknownEnumVariant { .. })
        ));
    }

    #[test]
    fn map_preserves_order() {
        let value = AttrValue::Map(vec![
            (AttrValue::String("z".into()), AttrValue::Int(1)),
            (AttrValue::String("a".into()), AttrValue::Int(2)),
        ]);
        assert_eq!(
            map(&value, string, integer),
            Ok(vec![("z".to_owned(), 1), ("a".to_owned(), 2)])
        );
    }

    #[test]
    fn targets_resolve_against_the_declaring_package() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        assert_eq!(
            target(&ctx, &AttrValue::String(":util".into())),
            Ok(BuildTarget::parse("//java/app:util").unwrap())
        );
        assert_eq!(
            target(&ctx, &AttrValue::String("//other:lib".into())),
            Ok(BuildTarget::parse("//other:lib").unwrap())
        );
        assert!(target(&ctx, &AttrValue::String("util".into())).is_err());
    }
}
