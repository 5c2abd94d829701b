use std::collections::HashSet;
use std::sync::OnceLock;

use crate::error::{EngineError, EngineResult};
use crate::types::WELL_KNOWN_FIELDS;

use super::{FilterMap, Specifier};

/// What the vector backend can evaluate natively. Operators outside this set
/// route to the post-filter, so partial SQL support degrades gracefully
/// instead of dropping filters.
#[derive(Debug, Clone)]
pub struct BackendCaps {
    pub equality: bool,
    pub not_equal: bool,
    pub in_list: bool,
    pub indexed_fields: HashSet<String>,
}

impl BackendCaps {
    /// Capabilities of the Lance backend: equality forms on every
    /// denormalised column.
    pub fn lance() -> Self {
        let mut indexed_fields: HashSet<String> =
            WELL_KNOWN_FIELDS.iter().map(|f| f.to_string()).collect();
        indexed_fields.insert("docid".to_string());
        Self {
            equality: true,
            not_equal: true,
            in_list: true,
            indexed_fields,
        }
    }
}

/// The split plan: a SQL predicate for the backend plus the in-process rest.
#[derive(Debug, Clone, Default)]
pub struct FilterPlan {
    pub pre_sql: Option<String>,
    pub post: Vec<(String, Specifier)>,
}

impl FilterPlan {
    pub fn is_empty(&self) -> bool {
        self.pre_sql.is_none() && self.post.is_empty()
    }
}

fn field_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_]+$").expect("valid field regex"))
}

/// Reject field names outside the SQL-safe alphabet.
fn sanitize_field(field: &str) -> EngineResult<()> {
    if field_re().is_match(field) {
        Ok(())
    } else {
        Err(EngineError::InvalidFilter(format!(
            "filter field '{field}' must match [A-Za-z0-9_]+"
        )))
    }
}

/// Quote a literal for the backend predicate, doubling any quote characters.
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Split a filter expression into backend (`pre`) and in-process (`post`)
/// halves. The pre-filter is always a necessary condition: anything the
/// backend cannot express stays in `post`, and unknown fields default to
/// `post` where a missing value excludes the hit.
pub fn plan(filters: &FilterMap, caps: &BackendCaps) -> EngineResult<FilterPlan> {
    let mut pre = Vec::new();
    let mut post = Vec::new();

    for (field, value) in filters {
        sanitize_field(field)?;
        let spec = Specifier::parse(value)?;
        let indexed = caps.indexed_fields.contains(field.as_str());

        match &spec {
            Specifier::Eq(v) if indexed && caps.equality => {
                pre.push(format!("{field} = {}", quote_literal(v)));
            }
            Specifier::Ne(v) if indexed && caps.not_equal => {
                pre.push(format!("{field} <> {}", quote_literal(v)));
            }
            Specifier::AnyOf(items)
                if indexed
                    && caps.in_list
                    && items.iter().all(|s| matches!(s, Specifier::Eq(_))) =>
            {
                let literals: Vec<String> = items
                    .iter()
                    .map(|s| match s {
                        Specifier::Eq(v) => quote_literal(v),
                        _ => unreachable!("guarded by all-literal check"),
                    })
                    .collect();
                pre.push(format!("{field} IN ({})", literals.join(", ")));
            }
            _ => post.push((field.clone(), spec)),
        }
    }

    Ok(FilterPlan {
        pre_sql: if pre.is_empty() {
            None
        } else {
            Some(pre.join(" AND "))
        },
        post,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::CmpOp;
    use serde_json::json;

    fn plan_of(filters: serde_json::Value) -> FilterPlan {
        let map: FilterMap = serde_json::from_value(filters).unwrap();
        plan(&map, &BackendCaps::lance()).unwrap()
    }

    #[test]
    fn indexed_equality_goes_pre() {
        let p = plan_of(json!({"lang": "en"}));
        assert_eq!(p.pre_sql.as_deref(), Some("lang = 'en'"));
        assert!(p.post.is_empty());
    }

    #[test]
    fn negation_goes_pre_with_not_equal() {
        let p = plan_of(json!({"lang": "!en"}));
        assert_eq!(p.pre_sql.as_deref(), Some("lang <> 'en'"));
        assert!(p.post.is_empty());
    }

    #[test]
    fn literal_or_list_goes_pre_as_in() {
        let p = plan_of(json!({"lang": ["en", "pt"]}));
        assert_eq!(p.pre_sql.as_deref(), Some("lang IN ('en', 'pt')"));
        assert!(p.post.is_empty());
    }

    #[test]
    fn mixed_or_list_goes_post() {
        let p = plan_of(json!({"lang": ["en", "p*"]}));
        assert!(p.pre_sql.is_none());
        assert_eq!(p.post.len(), 1);
    }

    #[test]
    fn comparisons_and_wildcards_go_post() {
        let p = plan_of(json!({"page": ">2", "title": "ver*"}));
        assert!(p.pre_sql.is_none());
        assert_eq!(p.post.len(), 2);
        assert_eq!(p.post[0].0, "page");
        assert_eq!(p.post[0].1, Specifier::Cmp(CmpOp::Gt, "2".into()));
    }

    #[test]
    fn unknown_field_goes_post() {
        let p = plan_of(json!({"category": "science"}));
        assert!(p.pre_sql.is_none());
        assert_eq!(p.post, vec![("category".into(), Specifier::Eq("science".into()))]);
    }

    #[test]
    fn multiple_pre_predicates_join_with_and() {
        let p = plan_of(json!({"author": "verne", "lang": "en"}));
        // BTreeMap ordering makes the rendering deterministic
        assert_eq!(
            p.pre_sql.as_deref(),
            Some("author = 'verne' AND lang = 'en'")
        );
    }

    #[test]
    fn quotes_are_doubled() {
        let p = plan_of(json!({"lang": "en' OR 1=1 --"}));
        assert_eq!(p.pre_sql.as_deref(), Some("lang = 'en'' OR 1=1 --'"));
    }

    #[test]
    fn bad_field_names_are_rejected() {
        let map: FilterMap = serde_json::from_value(json!({"lang; DROP": "en"})).unwrap();
        let err = plan(&map, &BackendCaps::lance()).unwrap_err();
        assert_eq!(err.code(), "invalid_filter");
    }

    #[test]
    fn capability_gating_demotes_to_post() {
        let caps = BackendCaps {
            not_equal: false,
            ..BackendCaps::lance()
        };
        let map: FilterMap = serde_json::from_value(json!({"lang": "!en"})).unwrap();
        let p = plan(&map, &caps).unwrap();
        assert!(p.pre_sql.is_none());
        assert_eq!(p.post.len(), 1);
    }
}
