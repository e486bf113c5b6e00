//! Conditional edge routing, ported from `ConditionalRouter` in
//! `agent_executor.py`: a fixed operator table plus a `regex` special
//! case, always falling back rather than raising on a bad operator or
//! a comparison that can't be evaluated.

use serde_json::Value;

use crate::definition::ConditionDef;

/// Evaluate `condition` against `actual`. An unknown operator or a
/// comparison that can't be evaluated (e.g. `gt` on two objects)
/// returns `false` rather than propagating an error — both fold into
/// "take the fallback edge" at the call site.
pub fn evaluate(condition: &ConditionDef, actual: &Value) -> bool {
    let expected = &condition.value;

    match condition.operator.as_str() {
        "eq" => actual == expected,
        "neq" => actual != expected,
        "gt" => compare(actual, expected, |a, b| a > b),
        "lt" => compare(actual, expected, |a, b| a < b),
        "gte" => compare(actual, expected, |a, b| a >= b),
        "lte" => compare(actual, expected, |a, b| a <= b),
        "contains" => contains(actual, expected),
        "is_set" => !actual.is_null(),
        "regex" => regex_match(actual, expected),
        other => {
            tracing::warn!(operator = other, "unknown routing operator, using fallback");
            false
        }
    }
}

/// Resolve a conditional edge's target: `target` if `condition`
/// evaluates true against `actual`, else `fallback_target`.
pub fn route<'a>(
    condition: &ConditionDef,
    actual: &Value,
    target: &'a str,
    fallback_target: &'a str,
) -> &'a str {
    if evaluate(condition, actual) {
        target
    } else {
        fallback_target
    }
}

fn compare(a: &Value, b: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => needle.as_str().map(|n| s.contains(n)).unwrap_or(false),
        Value::Array(items) => items.contains(needle),
        _ => false,
    }
}

fn regex_match(actual: &Value, pattern: &Value) -> bool {
    let (Some(actual), Some(pattern)) = (actual.as_str(), pattern.as_str()) else {
        return false;
    };
    match regex::Regex::new(pattern) {
        Ok(re) => re.is_match(actual),
        Err(err) => {
            tracing::warn!(pattern, %err, "invalid regex in conditional edge, using fallback");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(operator: &str, value: Value) -> ConditionDef {
        ConditionDef {
            variable: "x".into(),
            operator: operator.into(),
            value,
        }
    }

    #[test]
    fn eq_matches_equal_values() {
        assert!(evaluate(&cond("eq", serde_json::json!("done")), &serde_json::json!("done")));
        assert!(!evaluate(&cond("eq", serde_json::json!("done")), &serde_json::json!("pending")));
    }

    #[test]
    fn gt_compares_numbers() {
        assert!(evaluate(&cond("gt", serde_json::json!(5)), &serde_json::json!(10)));
        assert!(!evaluate(&cond("gt", serde_json::json!(50)), &serde_json::json!(10)));
    }

    #[test]
    fn gt_on_non_numbers_falls_back() {
        assert!(!evaluate(&cond("gt", serde_json::json!("a")), &serde_json::json!("b")));
    }

    #[test]
    fn is_set_checks_non_null() {
        assert!(evaluate(&cond("is_set", Value::Null), &serde_json::json!("x")));
        assert!(!evaluate(&cond("is_set", Value::Null), &Value::Null));
    }

    #[test]
    fn contains_checks_substrings_and_arrays() {
        assert!(evaluate(&cond("contains", serde_json::json!("lo")), &serde_json::json!("hello")));
        assert!(evaluate(&cond("contains", serde_json::json!(2)), &serde_json::json!([1, 2, 3])));
        assert!(!evaluate(&cond("contains", serde_json::json!(9)), &serde_json::json!([1, 2, 3])));
    }

    #[test]
    fn regex_matches_pattern() {
        assert!(evaluate(&cond("regex", serde_json::json!("^err")), &serde_json::json!("error: boom")));
        assert!(!evaluate(&cond("regex", serde_json::json!("^ok")), &serde_json::json!("error: boom")));
    }

    #[test]
    fn unknown_operator_falls_back() {
        assert!(!evaluate(&cond("startswith", serde_json::json!("x")), &serde_json::json!("xyz")));
    }

    #[test]
    fn route_picks_fallback_on_false() {
        let target = route(&cond("eq", serde_json::json!(1)), &serde_json::json!(2), "a", "b");
        assert_eq!(target, "b");
    }
}
