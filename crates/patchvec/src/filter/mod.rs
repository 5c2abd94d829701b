pub mod planner;
pub mod post;

use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{EngineError, EngineResult};

/// A filter expression: field name to value specifier. Ordered so plans and
/// match reasons are deterministic.
pub type FilterMap = BTreeMap<String, Value>;

/// Ordered comparison operators. Dispatch is always through an explicit
/// table ([`post::apply_op`]); specifier strings are never evaluated as
/// expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// Parsed value specifier.
#[derive(Debug, Clone, PartialEq)]
pub enum Specifier {
    /// Literal equality.
    Eq(String),
    /// Negated literal (`!value`).
    Ne(String),
    /// Numeric or ISO-8601 datetime comparison (`>v`, `>=v`, `<v`, `<=v`).
    Cmp(CmpOp, String),
    /// Wildcard pattern containing `*` (any run) or `?` (single char).
    Wildcard(String),
    /// OR-list.
    AnyOf(Vec<Specifier>),
}

impl Specifier {
    /// Parse the JSON value form used in search requests.
    pub fn parse(value: &Value) -> EngineResult<Self> {
        let spec = match value {
            Value::String(s) => Self::parse_str(s),
            Value::Number(n) => Self::Eq(n.to_string()),
            Value::Bool(b) => Self::Eq(b.to_string()),
            Value::Array(items) => {
                if items.is_empty() {
                    return Err(EngineError::InvalidFilter(
                        "empty OR-list in filter".to_string(),
                    ));
                }
                Self::AnyOf(
                    items
                        .iter()
                        .map(Self::parse)
                        .collect::<EngineResult<Vec<_>>>()?,
                )
            }
            other => {
                return Err(EngineError::InvalidFilter(format!(
                    "unsupported filter value: {other}"
                )))
            }
        };
        spec.reject_control_chars()?;
        Ok(spec)
    }

    fn parse_str(s: &str) -> Self {
        if let Some(rest) = s.strip_prefix("!") {
            return Self::Ne(rest.to_string());
        }
        if let Some(rest) = s.strip_prefix(">=") {
            return Self::Cmp(CmpOp::Ge, rest.trim().to_string());
        }
        if let Some(rest) = s.strip_prefix("<=") {
            return Self::Cmp(CmpOp::Le, rest.trim().to_string());
        }
        if let Some(rest) = s.strip_prefix('>') {
            return Self::Cmp(CmpOp::Gt, rest.trim().to_string());
        }
        if let Some(rest) = s.strip_prefix('<') {
            return Self::Cmp(CmpOp::Lt, rest.trim().to_string());
        }
        if s.contains('*') || s.contains('?') {
            return Self::Wildcard(s.to_string());
        }
        Self::Eq(s.to_string())
    }

    fn reject_control_chars(&self) -> EngineResult<()> {
        let check = |s: &str| {
            if s.chars().any(char::is_control) {
                Err(EngineError::InvalidFilter(
                    "filter value contains control characters".to_string(),
                ))
            } else {
                Ok(())
            }
        };
        match self {
            Self::Eq(s) | Self::Ne(s) | Self::Wildcard(s) | Self::Cmp(_, s) => check(s),
            Self::AnyOf(items) => items.iter().try_for_each(Self::reject_control_chars),
        }
    }

    /// Human-readable form used in match reasons.
    pub fn display(&self) -> String {
        match self {
            Self::Eq(v) => v.clone(),
            Self::Ne(v) => format!("!{v}"),
            Self::Cmp(op, v) => format!("{}{v}", op.symbol()),
            Self::Wildcard(p) => p.clone(),
            Self::AnyOf(items) => items
                .iter()
                .map(Self::display)
                .collect::<Vec<_>>()
                .join("|"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_forms_parse() {
        assert_eq!(
            Specifier::parse(&json!("en")).unwrap(),
            Specifier::Eq("en".into())
        );
        assert_eq!(
            Specifier::parse(&json!("!en")).unwrap(),
            Specifier::Ne("en".into())
        );
        assert_eq!(
            Specifier::parse(&json!(">2")).unwrap(),
            Specifier::Cmp(CmpOp::Gt, "2".into())
        );
        assert_eq!(
            Specifier::parse(&json!(">=2024-01-01T00:00:00Z")).unwrap(),
            Specifier::Cmp(CmpOp::Ge, "2024-01-01T00:00:00Z".into())
        );
        assert_eq!(
            Specifier::parse(&json!("ver*")).unwrap(),
            Specifier::Wildcard("ver*".into())
        );
        assert_eq!(
            Specifier::parse(&json!("n?mo")).unwrap(),
            Specifier::Wildcard("n?mo".into())
        );
    }

    #[test]
    fn scalar_forms_parse() {
        assert_eq!(
            Specifier::parse(&json!(7)).unwrap(),
            Specifier::Eq("7".into())
        );
        assert_eq!(
            Specifier::parse(&json!(true)).unwrap(),
            Specifier::Eq("true".into())
        );
    }

    #[test]
    fn or_lists_parse_recursively() {
        let spec = Specifier::parse(&json!(["en", "!pt", "d*"])).unwrap();
        let Specifier::AnyOf(items) = spec else {
            panic!("expected AnyOf");
        };
        assert_eq!(items.len(), 3);
        assert_eq!(items[1], Specifier::Ne("pt".into()));
    }

    #[test]
    fn rejected_forms() {
        assert_eq!(
            Specifier::parse(&json!([])).unwrap_err().code(),
            "invalid_filter"
        );
        assert_eq!(
            Specifier::parse(&json!({"nested": true})).unwrap_err().code(),
            "invalid_filter"
        );
        assert_eq!(
            Specifier::parse(&json!("bad\nvalue")).unwrap_err().code(),
            "invalid_filter"
        );
    }
}
