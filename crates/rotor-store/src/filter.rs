//! Composable query predicates over JSON documents.
//!
//! A [`Filter`] is a shape-preserving tree: combinators never flatten or
//! reorder the groupings a caller builds, so a composed query renders exactly
//! the way it was written. Rendering ([`Filter::to_json`]) follows the
//! conventional `$`-operator document form.
//!
//! Comparison semantics for list-valued fields: `$lt`/`$gt` compare against
//! the *smallest* element. For a time-ascending schedule list that is the
//! head, and an empty list satisfies no bound at all, which is what keeps a
//! parked entity out of due queries.

use serde_json::{Map, Value};

/// A predicate over a JSON document.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every document. Identity for [`and`](Filter::and) / [`or`](Filter::or).
    All,
    /// Field equals the value.
    Eq { field: String, value: Value },
    /// Field (or its smallest element) is strictly less than the value.
    Lt { field: String, value: Value },
    /// Field (or its smallest element) is strictly greater than the value.
    Gt { field: String, value: Value },
    /// Field presence. `exists: false` matches a missing key or JSON null.
    Exists { field: String, exists: bool },
    /// Every child matches.
    And(Vec<Filter>),
    /// At least one child matches.
    Or(Vec<Filter>),
}

impl Filter {
    pub fn all() -> Filter {
        Filter::All
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Filter {
        Filter::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Filter {
        Filter::Lt {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Filter {
        Filter::Gt {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn exists(field: impl Into<String>, exists: bool) -> Filter {
        Filter::Exists {
            field: field.into(),
            exists,
        }
    }

    /// Conjunction. `All` is absorbed; everything else keeps its grouping.
    pub fn and(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (a, b) => Filter::And(vec![a, b]),
        }
    }

    /// Disjunction. `All` is absorbed; everything else keeps its grouping.
    pub fn or(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (a, b) => Filter::Or(vec![a, b]),
        }
    }

    /// Render the conventional `$`-operator document form.
    ///
    /// An `And` renders as a single key-merged document when its children
    /// contribute disjoint keys, and falls back to an explicit `$and` array
    /// when keys collide (two predicates on the same field must both survive).
    pub fn to_json(&self) -> Value {
        match self {
            Filter::All => Value::Object(Map::new()),
            Filter::Eq { field, value } => obj(field, value.clone()),
            Filter::Lt { field, value } => obj(field, obj("$lt", value.clone())),
            Filter::Gt { field, value } => obj(field, obj("$gt", value.clone())),
            Filter::Exists { field, exists } => obj(field, obj("$exists", Value::Bool(*exists))),
            Filter::Or(children) => obj(
                "$or",
                Value::Array(children.iter().map(Filter::to_json).collect()),
            ),
            Filter::And(children) => {
                let rendered: Vec<Value> = children.iter().map(Filter::to_json).collect();
                let mut merged = Map::new();
                for child in &rendered {
                    let Value::Object(entries) = child else {
                        unreachable!("filters always render to objects");
                    };
                    for (k, v) in entries {
                        if merged.contains_key(k) {
                            // Key collision: merging would drop a predicate.
                            return obj("$and", Value::Array(rendered));
                        }
                        merged.insert(k.clone(), v.clone());
                    }
                }
                Value::Object(merged)
            }
        }
    }

    /// Evaluate the predicate against a JSON object.
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq { field, value } => doc.get(field).is_some_and(|v| v == value),
            Filter::Lt { field, value } => {
                comparable(doc.get(field)).is_some_and(|v| scalar_lt(&v, value))
            }
            Filter::Gt { field, value } => {
                comparable(doc.get(field)).is_some_and(|v| scalar_lt(value, &v))
            }
            Filter::Exists { field, exists } => {
                let present = doc.get(field).is_some_and(|v| !v.is_null());
                present == *exists
            }
            Filter::And(children) => children.iter().all(|c| c.matches(doc)),
            Filter::Or(children) => children.iter().any(|c| c.matches(doc)),
        }
    }
}

fn obj(key: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}

/// The value a range predicate compares against: the field itself, or the
/// smallest element for arrays. `None` for missing, null, or empty-array
/// fields, which satisfy no bound.
fn comparable(field: Option<&Value>) -> Option<Value> {
    match field? {
        Value::Null => None,
        Value::Array(items) => items
            .iter()
            .filter(|v| !v.is_null())
            .min_by(|a, b| {
                scalar_cmp(a, b).unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned(),
        scalar => Some(scalar.clone()),
    }
}

fn scalar_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64().partial_cmp(&y.as_f64()),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn scalar_lt(a: &Value, b: &Value) -> bool {
    scalar_cmp(a, b) == Some(std::cmp::Ordering::Less)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn eq_renders_as_plain_pair() {
        let f = Filter::eq("name", "foo");
        assert_eq!(f.to_json(), json!({"name": "foo"}));
    }

    #[test]
    fn range_and_exists_render_with_operators() {
        assert_eq!(
            Filter::lt("next_check", 1000).to_json(),
            json!({"next_check": {"$lt": 1000}})
        );
        assert_eq!(
            Filter::gt("next_check", 500).to_json(),
            json!({"next_check": {"$gt": 500}})
        );
        assert_eq!(
            Filter::exists("next_check", false).to_json(),
            json!({"next_check": {"$exists": false}})
        );
    }

    #[test]
    fn and_merges_disjoint_keys() {
        let f = Filter::eq("name", "foo").and(Filter::or(
            Filter::lt("next_check", 1000),
            Filter::exists("next_check", false),
        ));
        assert_eq!(
            f.to_json(),
            json!({
                "name": "foo",
                "$or": [
                    {"next_check": {"$lt": 1000}},
                    {"next_check": {"$exists": false}}
                ]
            })
        );
    }

    #[test]
    fn and_falls_back_on_key_collision() {
        let f = Filter::eq("status", "a").and(Filter::eq("status", "b"));
        assert_eq!(
            f.to_json(),
            json!({"$and": [{"status": "a"}, {"status": "b"}]})
        );
    }

    #[test]
    fn all_is_identity_for_combinators() {
        let f = Filter::all().and(Filter::eq("name", "foo"));
        assert_eq!(f, Filter::eq("name", "foo"));
        let f = Filter::eq("name", "foo").or(Filter::all());
        assert_eq!(f, Filter::eq("name", "foo"));
        assert_eq!(Filter::all().to_json(), json!({}));
    }

    #[test]
    fn nested_groupings_are_preserved() {
        let inner = Filter::And(vec![Filter::eq("a", 1), Filter::eq("b", 2)]);
        let f = inner.clone().and(Filter::lt("t", 5));
        assert_eq!(f, Filter::And(vec![inner, Filter::lt("t", 5)]));
    }

    #[test]
    fn lt_compares_scalars_and_list_heads() {
        let f = Filter::lt("t", 100);
        assert!(f.matches(&json!({"t": 99})));
        assert!(!f.matches(&json!({"t": 100})));
        assert!(f.matches(&json!({"t": [99, 500, 900]})));
        assert!(!f.matches(&json!({"t": [100, 500]})));
    }

    #[test]
    fn empty_list_matches_no_bound() {
        // A parked entity carries an empty list: not less-than, not
        // greater-than, and not "missing" either.
        let doc = json!({"t": []});
        assert!(!Filter::lt("t", i64::MAX).matches(&doc));
        assert!(!Filter::gt("t", i64::MIN).matches(&doc));
        assert!(!Filter::exists("t", false).matches(&doc));
        assert!(Filter::exists("t", true).matches(&doc));
    }

    #[test]
    fn exists_false_matches_missing_or_null() {
        let f = Filter::exists("t", false);
        assert!(f.matches(&json!({})));
        assert!(f.matches(&json!({"t": null})));
        assert!(!f.matches(&json!({"t": 1})));
    }

    #[test]
    fn and_or_evaluate_over_documents() {
        let f = Filter::eq("status", "active").and(Filter::or(
            Filter::lt("t", 100),
            Filter::exists("t", false),
        ));
        assert!(f.matches(&json!({"status": "active", "t": 50})));
        assert!(f.matches(&json!({"status": "active"})));
        assert!(!f.matches(&json!({"status": "idle", "t": 50})));
        assert!(!f.matches(&json!({"status": "active", "t": 200})));
    }
}
