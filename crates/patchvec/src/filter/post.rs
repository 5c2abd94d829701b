use chrono::NaiveDateTime;
use serde_json::Value;
use std::cmp::Ordering;

use super::{CmpOp, Specifier};

/// Evaluate a specifier against a hydrated metadata value. A missing value
/// never matches: a filter on a field the hit does not carry excludes it.
pub fn eval(spec: &Specifier, actual: Option<&Value>) -> bool {
    let Some(actual) = actual else {
        return false;
    };

    // An array value matches when any element does.
    if let Value::Array(items) = actual {
        return items.iter().any(|item| eval(spec, Some(item)));
    }

    let Some(actual) = value_str(actual) else {
        return false;
    };

    match spec {
        Specifier::Eq(want) => actual == *want,
        Specifier::Ne(want) => actual != *want,
        Specifier::Cmp(op, operand) => compare_ordered(&actual, operand, *op),
        Specifier::Wildcard(pattern) => wildcard_match(&actual, pattern),
        Specifier::AnyOf(items) => items
            .iter()
            .any(|s| eval(s, Some(&Value::String(actual.clone())))),
    }
}

fn value_str(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Ordered comparison: numeric when both sides parse as numbers, ISO-8601
/// datetime when both parse as timestamps, otherwise no match.
fn compare_ordered(actual: &str, operand: &str, op: CmpOp) -> bool {
    if let (Ok(a), Ok(b)) = (actual.parse::<f64>(), operand.parse::<f64>()) {
        return apply_op(op, a.partial_cmp(&b));
    }
    if let (Some(a), Some(b)) = (parse_datetime(actual), parse_datetime(operand)) {
        return apply_op(op, Some(a.cmp(&b)));
    }
    false
}

/// The operator lookup table. Comparators are dispatched by tag, never by
/// evaluating a constructed expression.
fn apply_op(op: CmpOp, ordering: Option<Ordering>) -> bool {
    match (op, ordering) {
        (CmpOp::Lt, Some(Ordering::Less)) => true,
        (CmpOp::Le, Some(Ordering::Less | Ordering::Equal)) => true,
        (CmpOp::Gt, Some(Ordering::Greater)) => true,
        (CmpOp::Ge, Some(Ordering::Greater | Ordering::Equal)) => true,
        _ => false,
    }
}

/// Accept RFC 3339, `YYYY-MM-DDTHH:MM:SS`, and bare `YYYY-MM-DD` forms.
fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt);
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0);
    }
    None
}

/// Anchored wildcard match: `*` is any run, `?` is a single character.
fn wildcard_match(actual: &str, pattern: &str) -> bool {
    let mut re = String::with_capacity(pattern.len() + 2);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    regex::Regex::new(&re)
        .map(|r| r.is_match(actual))
        .unwrap_or(false)
}
