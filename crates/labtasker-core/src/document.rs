//! Dotted-path traversal over JSON value trees.
//!
//! Task `args` and `metadata` are arbitrary JSON objects. Filters, required
//! fields, and partial updates all address into them with dotted paths such
//! as `args.lr` or `metadata.tag`. This module is the single implementation
//! of that addressing: reading a sub-value, setting a sub-value without
//! disturbing siblings, and validating path syntax.
//!
//! A path segment may not be empty, may not start with `$` (reserved for
//! filter operators), and a path may not start or end with a dot.

use serde_json::Value;

use crate::error::{Error, Result};

/// Validates a dotted path.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] when the path is empty, has an empty
/// segment, or has a segment starting with `$`.
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::invalid_input("field path must not be empty"));
    }
    for segment in path.split('.') {
        if segment.is_empty() {
            return Err(Error::invalid_input(format!(
                "field path '{path}' has an empty segment"
            )));
        }
        if segment.starts_with('$') {
            return Err(Error::invalid_input(format!(
                "field path '{path}' uses a reserved '$' segment"
            )));
        }
    }
    Ok(())
}

/// Reads the value at a dotted path.
///
/// Returns `None` when any intermediate segment is missing or is not an
/// object. A present-but-null leaf is returned as `Some(&Value::Null)`;
/// callers that treat null as absent should check with [`path_exists`].
#[must_use]
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Returns true when the path resolves to a present, non-null value.
#[must_use]
pub fn path_exists(doc: &Value, path: &str) -> bool {
    matches!(get_path(doc, path), Some(v) if !v.is_null())
}

/// Sets the value at a dotted path, creating intermediate objects as needed.
///
/// Sibling keys at every level are left untouched. Intermediate segments
/// that already exist must be objects.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] when the path is malformed, or when an
/// intermediate segment resolves to a non-object value (setting `a.b` while
/// `a` is the number 3 would have to destroy `a`).
pub fn set_path(doc: &mut Value, path: &str, value: Value) -> Result<()> {
    validate_path(path)?;

    let mut current = doc;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let map = current.as_object_mut().ok_or_else(|| {
            Error::invalid_input(format!(
                "field path '{path}' traverses a non-object value at '{segment}'"
            ))
        })?;

        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return Ok(());
        }

        let entry = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !entry.is_object() {
            return Err(Error::invalid_input(format!(
                "field path '{path}' traverses a non-object value at '{segment}'"
            )));
        }
        current = entry;
    }

    unreachable!("validate_path guarantees at least one segment")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_path_reads_nested_values() {
        let doc = json!({"args": {"lr": 0.1, "model": {"depth": 4}}});
        assert_eq!(get_path(&doc, "args.lr"), Some(&json!(0.1)));
        assert_eq!(get_path(&doc, "args.model.depth"), Some(&json!(4)));
        assert_eq!(get_path(&doc, "args.missing"), None);
        assert_eq!(get_path(&doc, "args.lr.deeper"), None);
    }

    #[test]
    fn path_exists_treats_null_as_absent() {
        let doc = json!({"args": {"a": null, "b": 1}});
        assert!(!path_exists(&doc, "args.a"));
        assert!(path_exists(&doc, "args.b"));
        assert!(!path_exists(&doc, "args.c"));
    }

    #[test]
    fn set_path_preserves_siblings() {
        let mut doc = json!({"args": {"lr": 0.1, "batch": 32}});
        set_path(&mut doc, "args.lr", json!(0.2)).unwrap();
        assert_eq!(doc, json!({"args": {"lr": 0.2, "batch": 32}}));
    }

    #[test]
    fn set_path_creates_intermediate_objects() {
        let mut doc = json!({});
        set_path(&mut doc, "metadata.run.tag", json!("v2")).unwrap();
        assert_eq!(doc, json!({"metadata": {"run": {"tag": "v2"}}}));
    }

    #[test]
    fn set_path_rejects_non_object_intermediate() {
        let mut doc = json!({"args": {"lr": 0.1}});
        let err = set_path(&mut doc, "args.lr.nested", json!(1)).unwrap_err();
        assert!(err.to_string().contains("non-object"));
        // Document unchanged.
        assert_eq!(doc, json!({"args": {"lr": 0.1}}));
    }

    #[test]
    fn validate_path_rejects_malformed_paths() {
        assert!(validate_path("").is_err());
        assert!(validate_path("a..b").is_err());
        assert!(validate_path(".a").is_err());
        assert!(validate_path("a.").is_err());
        assert!(validate_path("$set").is_err());
        assert!(validate_path("args.$gt").is_err());
        assert!(validate_path("args.lr").is_ok());
    }
}
