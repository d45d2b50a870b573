//! Subscription filter engine.
//!
//! Evaluates Mongo-style predicates against flattened event payloads and
//! headers. Both payloads and filter bodies reduce to a flat mapping from
//! dot-paths (`a.b.0.c`) to scalar leaves before evaluation, so nested and
//! pre-flattened filters behave identically.
//!
//! Supported operators: `$eq`, `$ne`, `$in`, `$nin`, `$gt`, `$gte`, `$lt`,
//! `$lte`, `$regex`, `$exists`, `$and`, `$or`, `$not`. Anything else is
//! rejected when the subscription is written, never at match time.

use std::{
    collections::BTreeMap,
    sync::{Mutex, OnceLock},
};

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{CoreError, Result};

const SUPPORTED_OPERATORS: &[&str] = &[
    "$eq", "$ne", "$in", "$nin", "$gt", "$gte", "$lt", "$lte", "$regex", "$exists", "$and", "$or",
    "$not",
];

/// Checks an event type against a subscription's `event_types` list.
///
/// A `*` entry (or an empty list) matches every event type.
pub fn matches_event_type(candidate: &str, event_types: &[String]) -> bool {
    if event_types.is_empty() {
        return true;
    }
    event_types.iter().any(|t| t == "*" || t == candidate)
}

/// Evaluates a subscription filter against a payload.
///
/// `is_flattened` marks filters stored in dot-path canonical form; filters
/// without the flag are flattened on read. Evaluation is deterministic:
/// the same (payload, filter) pair always yields the same result.
pub fn matches_filter(payload: &Value, filter: &Value, is_flattened: bool) -> bool {
    let Some(conditions) = filter.as_object() else {
        // Non-object filters (including null) place no constraints.
        return true;
    };
    if conditions.is_empty() {
        return true;
    }

    let flat_payload = flatten(payload);
    let flat_filter = if is_flattened {
        conditions.clone()
    } else {
        flatten_filter(filter)
    };

    eval_conditions(&flat_payload, &flat_filter)
}

/// Validates a filter body at subscription write time.
///
/// Rejects unsupported operators and malformed regex patterns so that match
/// time never sees an invalid predicate.
pub fn validate_filter(filter: &Value) -> Result<()> {
    match filter {
        Value::Object(map) => {
            for (key, value) in map {
                if key.starts_with('$') {
                    if !SUPPORTED_OPERATORS.contains(&key.as_str()) {
                        return Err(CoreError::invalid_filter(format!(
                            "unsupported operator: {key}"
                        )));
                    }
                    match key.as_str() {
                        "$and" | "$or" => {
                            let Some(branches) = value.as_array() else {
                                return Err(CoreError::invalid_filter(format!(
                                    "{key} expects an array of filters"
                                )));
                            };
                            for branch in branches {
                                validate_filter(branch)?;
                            }
                        },
                        "$regex" => {
                            let Some(pattern) = value.as_str() else {
                                return Err(CoreError::invalid_filter(
                                    "$regex expects a string pattern",
                                ));
                            };
                            compile_anchored(pattern).map_err(|e| {
                                CoreError::invalid_filter(format!("malformed regex: {e}"))
                            })?;
                        },
                        "$not" => validate_filter(value)?,
                        _ => {},
                    }
                } else {
                    validate_filter(value)?;
                }
            }
            Ok(())
        },
        _ => Ok(()),
    }
}

/// Flattens a JSON value into dot-path -> scalar-leaf entries.
///
/// Array elements contribute their index as a path segment. Scalars at the
/// root flatten to a single entry with an empty path.
pub fn flatten(value: &Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    flatten_into(&mut out, String::new(), value, false);
    out
}

/// Expands a flattened map back into nested JSON.
///
/// Inverse of [`flatten`] for well-formed records: numeric path segments
/// rebuild arrays, the rest rebuild objects.
pub fn expand(flat: &BTreeMap<String, Value>) -> Value {
    let mut root = Value::Object(Map::new());
    for (path, leaf) in flat {
        if path.is_empty() {
            return leaf.clone();
        }
        insert_path(&mut root, &path.split('.').collect::<Vec<_>>(), leaf);
    }
    root
}

/// Flattens a filter body, stopping at operator objects.
///
/// `{"a": {"b": {"$gt": 5}}}` becomes `{"a.b": {"$gt": 5}}` rather than
/// `{"a.b.$gt": 5}`, keeping operators evaluable. Top-level `$and`/`$or`
/// keys are preserved as-is; their branches flatten recursively at
/// evaluation time.
fn flatten_filter(filter: &Value) -> Map<String, Value> {
    let Some(conditions) = filter.as_object() else {
        return Map::new();
    };

    let mut map = Map::new();
    for (key, value) in conditions {
        if key.starts_with('$') {
            map.insert(key.clone(), value.clone());
            continue;
        }
        let mut out = BTreeMap::new();
        flatten_into(&mut out, key.clone(), value, true);
        for (path, leaf) in out {
            map.insert(path, leaf);
        }
    }
    map
}

fn flatten_into(out: &mut BTreeMap<String, Value>, prefix: String, value: &Value, filter: bool) {
    match value {
        Value::Object(map) => {
            if map.is_empty() || (filter && map.keys().any(|k| k.starts_with('$'))) {
                if !prefix.is_empty() || filter {
                    out.insert(prefix, value.clone());
                }
                return;
            }
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(out, path, child, filter);
            }
        },
        Value::Array(items) if !filter => {
            if items.is_empty() {
                out.insert(prefix, value.clone());
                return;
            }
            for (index, child) in items.iter().enumerate() {
                let path = if prefix.is_empty() {
                    index.to_string()
                } else {
                    format!("{prefix}.{index}")
                };
                flatten_into(out, path, child, filter);
            }
        },
        _ => {
            out.insert(prefix, value.clone());
        },
    }
}

fn insert_path(node: &mut Value, segments: &[&str], leaf: &Value) {
    let (head, rest) = match segments {
        [head, rest @ ..] => (*head, rest),
        [] => return,
    };

    if rest.is_empty() {
        match node {
            Value::Object(map) => {
                map.insert(head.to_string(), leaf.clone());
            },
            Value::Array(items) => {
                if let Ok(index) = head.parse::<usize>() {
                    while items.len() <= index {
                        items.push(Value::Null);
                    }
                    items[index] = leaf.clone();
                }
            },
            _ => {},
        }
        return;
    }

    let next_is_index = rest[0].parse::<usize>().is_ok();
    let child = match node {
        Value::Object(map) => map.entry(head.to_string()).or_insert_with(|| {
            if next_is_index {
                Value::Array(Vec::new())
            } else {
                Value::Object(Map::new())
            }
        }),
        Value::Array(items) => {
            let Ok(index) = head.parse::<usize>() else { return };
            while items.len() <= index {
                items.push(Value::Null);
            }
            if items[index].is_null() {
                items[index] = if next_is_index {
                    Value::Array(Vec::new())
                } else {
                    Value::Object(Map::new())
                };
            }
            &mut items[index]
        },
        _ => return,
    };
    insert_path(child, rest, leaf);
}

fn eval_conditions(flat_payload: &BTreeMap<String, Value>, conditions: &Map<String, Value>) -> bool {
    conditions.iter().all(|(key, condition)| match key.as_str() {
        "$or" => condition
            .as_array()
            .is_some_and(|branches| branches.iter().any(|b| eval_branch(flat_payload, b))),
        "$and" => condition
            .as_array()
            .is_some_and(|branches| branches.iter().all(|b| eval_branch(flat_payload, b))),
        _ => eval_condition(flat_payload.get(key), condition),
    })
}

fn eval_branch(flat_payload: &BTreeMap<String, Value>, branch: &Value) -> bool {
    let Some(branch) = branch.as_object() else {
        return false;
    };
    eval_conditions(flat_payload, &flatten_filter(&Value::Object(branch.clone())))
}

/// Evaluates one condition against an (optionally missing) leaf.
///
/// Missing leaves fail every positive operator and satisfy the negative
/// ones (`$ne`, `$nin`, `$exists: false`, `$not`).
fn eval_condition(leaf: Option<&Value>, condition: &Value) -> bool {
    let Some(ops) = condition.as_object().filter(|m| m.keys().any(|k| k.starts_with('$'))) else {
        // Bare value: leaf equality.
        return leaf.is_some_and(|v| values_equal(v, condition));
    };

    ops.iter().all(|(op, operand)| match op.as_str() {
        "$eq" => leaf.is_some_and(|v| values_equal(v, operand)),
        "$ne" => !leaf.is_some_and(|v| values_equal(v, operand)),
        "$in" => leaf.is_some_and(|v| {
            operand.as_array().is_some_and(|set| set.iter().any(|m| values_equal(v, m)))
        }),
        "$nin" => !leaf.is_some_and(|v| {
            operand.as_array().is_some_and(|set| set.iter().any(|m| values_equal(v, m)))
        }),
        "$gt" => compare(leaf, operand).is_some_and(|o| o == std::cmp::Ordering::Greater),
        "$gte" => compare(leaf, operand).is_some_and(|o| o != std::cmp::Ordering::Less),
        "$lt" => compare(leaf, operand).is_some_and(|o| o == std::cmp::Ordering::Less),
        "$lte" => compare(leaf, operand).is_some_and(|o| o != std::cmp::Ordering::Greater),
        "$exists" => operand.as_bool().is_some_and(|wanted| leaf.is_some() == wanted),
        "$regex" => leaf.and_then(Value::as_str).is_some_and(|s| {
            operand.as_str().is_some_and(|pattern| regex_matches(pattern, s))
        }),
        "$not" => !eval_condition(leaf, operand),
        _ => false,
    })
}

/// Value equality with numeric coercion: `1` equals `1.0`.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordering for `$gt`-family operators.
///
/// Numbers coerce to f64; strings compare lexicographically. Mixed or
/// non-comparable types yield no ordering, which fails the operator.
fn compare(leaf: Option<&Value>, operand: &Value) -> Option<std::cmp::Ordering> {
    let leaf = leaf?;
    if let (Some(x), Some(y)) = (leaf.as_f64(), operand.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (leaf.as_str(), operand.as_str()) {
        return Some(x.cmp(y));
    }
    None
}

fn regex_cache() -> &'static Mutex<std::collections::HashMap<String, Regex>> {
    static CACHE: OnceLock<Mutex<std::collections::HashMap<String, Regex>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(std::collections::HashMap::new()))
}

/// Compiles a pattern anchored at both ends. The `regex` crate has no
/// backreferences, which keeps matching linear and deterministic.
fn compile_anchored(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

fn regex_matches(pattern: &str, candidate: &str) -> bool {
    let mut cache = match regex_cache().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(re) = cache.get(pattern) {
        return re.is_match(candidate);
    }
    let Ok(re) = compile_anchored(pattern) else {
        // Unreachable for validated subscriptions; fail closed otherwise.
        return false;
    };
    let matched = re.is_match(candidate);
    cache.insert(pattern.to_string(), re);
    matched
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn event_type_wildcard_matches_all() {
        assert!(matches_event_type("user.created", &["*".to_string()]));
        assert!(matches_event_type("user.created", &[]));
        assert!(matches_event_type(
            "user.created",
            &["invoice.paid".to_string(), "*".to_string()]
        ));
        assert!(!matches_event_type("user.created", &["invoice.paid".to_string()]));
    }

    #[test]
    fn flatten_produces_dot_paths() {
        let flat = flatten(&json!({"a": {"b": [{"c": 1}, 2]}, "d": "x"}));
        assert_eq!(flat.get("a.b.0.c"), Some(&json!(1)));
        assert_eq!(flat.get("a.b.1"), Some(&json!(2)));
        assert_eq!(flat.get("d"), Some(&json!("x")));
    }

    #[test]
    fn equality_matches_leaf() {
        let payload = json!({"data": {"amount": 100, "currency": "USD"}});
        assert!(matches_filter(&payload, &json!({"data.currency": "USD"}), true));
        assert!(!matches_filter(&payload, &json!({"data.currency": "EUR"}), true));
    }

    #[test]
    fn nested_filters_flatten_on_read() {
        let payload = json!({"data": {"amount": 150}});
        let nested = json!({"data": {"amount": {"$gte": 100}}});
        assert!(matches_filter(&payload, &nested, false));
    }

    #[test]
    fn gte_rejects_below_threshold() {
        let payload = json!({"data": {"amount": 50}});
        let filter = json!({"data.amount": {"$gte": 100}});
        assert!(!matches_filter(&payload, &filter, true));
    }

    #[test]
    fn in_and_nin_operate_on_sets() {
        let payload = json!({"data": {"currency": "USD"}});
        assert!(matches_filter(
            &payload,
            &json!({"data.currency": {"$in": ["USD", "EUR"]}}),
            true
        ));
        assert!(!matches_filter(
            &payload,
            &json!({"data.currency": {"$nin": ["USD", "EUR"]}}),
            true
        ));
    }

    #[test]
    fn missing_leaves_fail_positive_operators() {
        let payload = json!({"data": {}});
        assert!(!matches_filter(&payload, &json!({"data.amount": {"$gte": 1}}), true));
        assert!(!matches_filter(&payload, &json!({"data.amount": {"$eq": null}}), true));
        assert!(!matches_filter(&payload, &json!({"data.amount": {"$exists": true}}), true));
        // Negative operators are satisfied by absence.
        assert!(matches_filter(&payload, &json!({"data.amount": {"$ne": 5}}), true));
        assert!(matches_filter(&payload, &json!({"data.amount": {"$exists": false}}), true));
    }

    #[test]
    fn numeric_coercion_equates_int_and_float() {
        let payload = json!({"n": 1});
        assert!(matches_filter(&payload, &json!({"n": 1.0}), true));
        assert!(matches_filter(&payload, &json!({"n": {"$lte": 1.5}}), true));
    }

    #[test]
    fn regex_is_anchored() {
        let payload = json!({"kind": "user.created"});
        assert!(matches_filter(&payload, &json!({"kind": {"$regex": "user\\..*"}}), true));
        // Without explicit wildcards a partial match fails.
        assert!(!matches_filter(&payload, &json!({"kind": {"$regex": "user"}}), true));
    }

    #[test]
    fn or_and_not_combine_branches() {
        let payload = json!({"data": {"amount": 250, "currency": "GBP"}});
        let filter = json!({
            "$or": [
                {"data.currency": "USD"},
                {"data.amount": {"$gt": 200}}
            ]
        });
        assert!(matches_filter(&payload, &filter, true));

        let filter = json!({
            "$and": [
                {"data.currency": "GBP"},
                {"data.amount": {"$not": {"$lt": 100}}}
            ]
        });
        assert!(matches_filter(&payload, &filter, true));
    }

    #[test]
    fn match_is_deterministic_across_invocations() {
        let payload = json!({"data": {"amount": 99.5}});
        let filter = json!({"data.amount": {"$gt": 10, "$lt": 100}});
        let first = matches_filter(&payload, &filter, true);
        for _ in 0..50 {
            assert_eq!(matches_filter(&payload, &filter, true), first);
        }
    }

    #[test]
    fn validation_rejects_unknown_operators() {
        assert!(validate_filter(&json!({"a": {"$near": 1}})).is_err());
        assert!(validate_filter(&json!({"a": {"$regex": "("}})).is_err());
        assert!(validate_filter(&json!({"$or": {"not": "an array"}})).is_err());
        assert!(validate_filter(&json!({"a": {"$gte": 10}, "$or": [{"b": 1}]})).is_ok());
    }

    fn scalar_leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::from),
            any::<i32>().prop_map(Value::from),
            "[a-z]{1,8}".prop_map(Value::from),
        ]
    }

    fn well_formed_record() -> impl Strategy<Value = Value> {
        // Objects with non-numeric keys and scalar or one-level-nested values.
        prop::collection::btree_map(
            "[a-z]{1,6}",
            prop_oneof![
                scalar_leaf(),
                prop::collection::btree_map("[a-z]{1,6}", scalar_leaf(), 1..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ],
            1..5,
        )
        .prop_map(|m| Value::Object(m.into_iter().collect()))
    }

    proptest! {
        #[test]
        fn flatten_expand_round_trips(record in well_formed_record()) {
            let flat = flatten(&record);
            prop_assert_eq!(expand(&flat), record);
        }

        #[test]
        fn flatten_is_stable(record in well_formed_record()) {
            prop_assert_eq!(flatten(&record), flatten(&record));
        }
    }
}
