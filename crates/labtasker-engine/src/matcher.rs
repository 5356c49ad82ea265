//! Query matcher: a small boolean expression language over JSON documents.
//!
//! Filters address into documents with dotted paths (`args.lr`,
//! `metadata.tag`) and support equality, ordered comparisons, set
//! membership, existence tests, and logical combinators:
//!
//! ```json
//! {
//!   "$or": [
//!     {"args.lr": {"$lt": 0.01}},
//!     {"metadata.tag": {"$in": ["baseline", "ablation"]}}
//!   ],
//!   "args.batch": {"$exists": true}
//! }
//! ```
//!
//! Multiple entries in one object are an implicit AND. A missing or null
//! path is "not present": every comparison against it is false, and
//! `{"$exists": false}` is the only way to match it.
//!
//! The matcher is pure. It parses a filter document once and evaluates it
//! against task or worker documents; it also applies flat update documents
//! (dotted path to new value) producing a new document with the named
//! sub-paths set and every sibling untouched.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use labtasker_core::document::{get_path, path_exists, set_path, validate_path};

use crate::error::{Error, Result};

/// Comparison operators usable on a field path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// Equal.
    Eq,
    /// Present and not equal.
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
}

/// A parsed filter expression.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Matches every document (the empty filter).
    All,
    /// All sub-filters must match.
    And(Vec<Filter>),
    /// At least one sub-filter must match.
    Or(Vec<Filter>),
    /// The sub-filter must not match.
    Not(Box<Filter>),
    /// Compares the value at a path against a literal.
    Compare {
        /// Dotted field path.
        path: String,
        /// Comparison operator.
        op: CompareOp,
        /// Literal operand.
        value: Value,
    },
    /// The value at a path must equal one of the listed literals.
    In {
        /// Dotted field path.
        path: String,
        /// Allowed literals.
        values: Vec<Value>,
    },
    /// Presence test for a path (null counts as absent).
    Exists {
        /// Dotted field path.
        path: String,
        /// Whether the path must be present (true) or absent (false).
        expected: bool,
    },
}

impl Filter {
    /// Parses a filter document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] on unknown operators, malformed
    /// field paths, or operands of the wrong shape.
    pub fn parse(filter: &Value) -> Result<Self> {
        let obj = filter
            .as_object()
            .ok_or_else(|| Error::invalid_argument("filter must be a JSON object"))?;
        if obj.is_empty() {
            return Ok(Self::All);
        }

        let mut clauses = Vec::with_capacity(obj.len());
        for (key, value) in obj {
            if let Some(op) = key.strip_prefix('$') {
                clauses.push(Self::parse_combinator(op, value)?);
            } else {
                validate_path(key)?;
                clauses.push(Self::parse_field(key, value)?);
            }
        }

        Ok(if clauses.len() == 1 {
            clauses.into_iter().next().expect("one clause")
        } else {
            Self::And(clauses)
        })
    }

    /// Parses an optional filter; `None` matches everything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the filter is present but
    /// malformed.
    pub fn parse_optional(filter: Option<&Value>) -> Result<Self> {
        match filter {
            None | Some(Value::Null) => Ok(Self::All),
            Some(value) => Self::parse(value),
        }
    }

    fn parse_combinator(op: &str, value: &Value) -> Result<Self> {
        match op {
            "and" | "or" => {
                let filters = value
                    .as_array()
                    .ok_or_else(|| {
                        Error::invalid_argument(format!("${op} expects an array of filters"))
                    })?
                    .iter()
                    .map(Self::parse)
                    .collect::<Result<Vec<_>>>()?;
                if filters.is_empty() {
                    return Err(Error::invalid_argument(format!(
                        "${op} expects at least one filter"
                    )));
                }
                Ok(if op == "and" {
                    Self::And(filters)
                } else {
                    Self::Or(filters)
                })
            }
            "not" => Ok(Self::Not(Box::new(Self::parse(value)?))),
            other => Err(Error::invalid_argument(format!(
                "unknown filter operator ${other}"
            ))),
        }
    }

    fn parse_field(path: &str, value: &Value) -> Result<Self> {
        let Some(ops) = operator_object(value) else {
            // Plain literal: equality.
            return Ok(Self::Compare {
                path: path.to_string(),
                op: CompareOp::Eq,
                value: value.clone(),
            });
        };

        let mut clauses = Vec::with_capacity(ops.len());
        for (op, operand) in ops {
            let clause = match op.as_str() {
                "$eq" => Self::compare(path, CompareOp::Eq, operand),
                "$ne" => Self::compare(path, CompareOp::Ne, operand),
                "$gt" => Self::compare(path, CompareOp::Gt, operand),
                "$gte" => Self::compare(path, CompareOp::Gte, operand),
                "$lt" => Self::compare(path, CompareOp::Lt, operand),
                "$lte" => Self::compare(path, CompareOp::Lte, operand),
                "$in" => {
                    let values = operand.as_array().ok_or_else(|| {
                        Error::invalid_argument(format!("$in on '{path}' expects an array"))
                    })?;
                    Self::In {
                        path: path.to_string(),
                        values: values.clone(),
                    }
                }
                "$exists" => {
                    let expected = operand.as_bool().ok_or_else(|| {
                        Error::invalid_argument(format!("$exists on '{path}' expects a boolean"))
                    })?;
                    Self::Exists {
                        path: path.to_string(),
                        expected,
                    }
                }
                other => {
                    return Err(Error::invalid_argument(format!(
                        "unknown comparison operator {other} on '{path}'"
                    )))
                }
            };
            clauses.push(clause);
        }

        Ok(if clauses.len() == 1 {
            clauses.into_iter().next().expect("one clause")
        } else {
            Self::And(clauses)
        })
    }

    fn compare(path: &str, op: CompareOp, value: &Value) -> Self {
        Self::Compare {
            path: path.to_string(),
            op,
            value: value.clone(),
        }
    }

    /// Evaluates the filter against a document.
    #[must_use]
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Self::All => true,
            Self::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(doc)),
            Self::Not(filter) => !filter.matches(doc),
            Self::Compare { path, op, value } => {
                let Some(actual) = present_value(doc, path) else {
                    return false;
                };
                match op {
                    CompareOp::Eq => values_equal(actual, value),
                    CompareOp::Ne => !values_equal(actual, value),
                    CompareOp::Gt => values_cmp(actual, value) == Some(Ordering::Greater),
                    CompareOp::Gte => matches!(
                        values_cmp(actual, value),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                    CompareOp::Lt => values_cmp(actual, value) == Some(Ordering::Less),
                    CompareOp::Lte => matches!(
                        values_cmp(actual, value),
                        Some(Ordering::Less | Ordering::Equal)
                    ),
                }
            }
            Self::In { path, values } => {
                let Some(actual) = present_value(doc, path) else {
                    return false;
                };
                values.iter().any(|v| values_equal(actual, v))
            }
            Self::Exists { path, expected } => path_exists(doc, path) == *expected,
        }
    }
}

/// Returns the field's operator object, if the value is one.
///
/// An object whose keys all start with `$` is an operator set; an object
/// with no `$` keys is an equality literal. A mixed object is treated as a
/// literal.
fn operator_object(value: &Value) -> Option<&Map<String, Value>> {
    let obj = value.as_object()?;
    if !obj.is_empty() && obj.keys().all(|k| k.starts_with('$')) {
        Some(obj)
    } else {
        None
    }
}

fn present_value<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    get_path(doc, path).filter(|v| !v.is_null())
}

/// Equality with numeric normalization: `1` equals `1.0`.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64() == b.as_f64(),
        _ => a == b,
    }
}

/// Ordering for numbers and strings; everything else is incomparable.
fn values_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Applies a flat update document (dotted path to new value) to a document,
/// returning the new document with every other sibling untouched.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] when a path is malformed or traverses
/// a non-object value.
pub fn apply_update(doc: &Value, updates: &Map<String, Value>) -> Result<Value> {
    let mut result = doc.clone();
    for (path, value) in updates {
        set_path(&mut result, path, value.clone())?;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "args": {"lr": 0.1, "batch": 32, "model": {"depth": 4}},
            "metadata": {"tag": "baseline", "null_field": null},
            "priority": 10,
        })
    }

    #[test]
    fn empty_filter_matches_everything() {
        let f = Filter::parse(&json!({})).unwrap();
        assert!(f.matches(&doc()));
        assert!(Filter::parse_optional(None).unwrap().matches(&doc()));
    }

    #[test]
    fn literal_equality() {
        let f = Filter::parse(&json!({"args.lr": 0.1})).unwrap();
        assert!(f.matches(&doc()));

        let f = Filter::parse(&json!({"args.lr": 0.2})).unwrap();
        assert!(!f.matches(&doc()));
    }

    #[test]
    fn numeric_equality_normalizes_int_and_float() {
        let f = Filter::parse(&json!({"args.batch": 32.0})).unwrap();
        assert!(f.matches(&doc()));
    }

    #[test]
    fn ordered_comparisons() {
        assert!(Filter::parse(&json!({"args.lr": {"$lt": 0.5}}))
            .unwrap()
            .matches(&doc()));
        assert!(Filter::parse(&json!({"args.batch": {"$gte": 32}}))
            .unwrap()
            .matches(&doc()));
        assert!(!Filter::parse(&json!({"args.batch": {"$gt": 32}}))
            .unwrap()
            .matches(&doc()));
        assert!(Filter::parse(&json!({"metadata.tag": {"$gt": "aaa"}}))
            .unwrap()
            .matches(&doc()));
    }

    #[test]
    fn cross_type_comparison_is_false() {
        let f = Filter::parse(&json!({"metadata.tag": {"$gt": 5}})).unwrap();
        assert!(!f.matches(&doc()));
    }

    #[test]
    fn comparisons_against_missing_paths_are_false() {
        assert!(!Filter::parse(&json!({"args.missing": {"$lt": 1}}))
            .unwrap()
            .matches(&doc()));
        assert!(!Filter::parse(&json!({"args.missing": {"$ne": 1}}))
            .unwrap()
            .matches(&doc()));
        // Null is treated as absent.
        assert!(!Filter::parse(&json!({"metadata.null_field": {"$eq": null}}))
            .unwrap()
            .matches(&doc()));
    }

    #[test]
    fn set_membership() {
        let f = Filter::parse(&json!({"metadata.tag": {"$in": ["baseline", "other"]}})).unwrap();
        assert!(f.matches(&doc()));

        let f = Filter::parse(&json!({"metadata.tag": {"$in": ["other"]}})).unwrap();
        assert!(!f.matches(&doc()));
    }

    #[test]
    fn existence_tests() {
        assert!(Filter::parse(&json!({"args.batch": {"$exists": true}}))
            .unwrap()
            .matches(&doc()));
        assert!(Filter::parse(&json!({"args.missing": {"$exists": false}}))
            .unwrap()
            .matches(&doc()));
        assert!(Filter::parse(&json!({"metadata.null_field": {"$exists": false}}))
            .unwrap()
            .matches(&doc()));
    }

    #[test]
    fn logical_combinators() {
        let f = Filter::parse(&json!({
            "$or": [
                {"args.lr": {"$gt": 1.0}},
                {"metadata.tag": "baseline"},
            ]
        }))
        .unwrap();
        assert!(f.matches(&doc()));

        let f = Filter::parse(&json!({"$not": {"metadata.tag": "baseline"}})).unwrap();
        assert!(!f.matches(&doc()));

        // Implicit AND across top-level entries.
        let f = Filter::parse(&json!({"args.lr": 0.1, "args.batch": 32})).unwrap();
        assert!(f.matches(&doc()));
        let f = Filter::parse(&json!({"args.lr": 0.1, "args.batch": 33})).unwrap();
        assert!(!f.matches(&doc()));
    }

    #[test]
    fn multiple_operators_on_one_path_are_anded() {
        let f = Filter::parse(&json!({"args.batch": {"$gte": 16, "$lte": 64}})).unwrap();
        assert!(f.matches(&doc()));
        let f = Filter::parse(&json!({"args.batch": {"$gte": 16, "$lte": 16}})).unwrap();
        assert!(!f.matches(&doc()));
    }

    #[test]
    fn unknown_operators_rejected() {
        assert!(Filter::parse(&json!({"$nor": []})).is_err());
        assert!(Filter::parse(&json!({"args.lr": {"$regex": ".*"}})).is_err());
        assert!(Filter::parse(&json!({"$and": "not-an-array"})).is_err());
        assert!(Filter::parse(&json!({"args.$gt": 1})).is_err());
        assert!(Filter::parse(&json!("just a string")).is_err());
    }

    #[test]
    fn object_literal_equality_still_works() {
        let f = Filter::parse(&json!({"args.model": {"depth": 4}})).unwrap();
        assert!(f.matches(&doc()));
    }

    #[test]
    fn apply_update_sets_subpaths_without_disturbing_siblings() {
        let updates = json!({"args.lr": 0.2, "metadata.tag": "sweep"});
        let updated = apply_update(&doc(), updates.as_object().unwrap()).unwrap();
        assert_eq!(updated["args"]["lr"], json!(0.2));
        assert_eq!(updated["args"]["batch"], json!(32));
        assert_eq!(updated["metadata"]["tag"], json!("sweep"));
    }

    #[test]
    fn apply_update_rejects_bad_paths() {
        let updates = json!({"args.$set": 1});
        assert!(apply_update(&doc(), updates.as_object().unwrap()).is_err());
    }
}
