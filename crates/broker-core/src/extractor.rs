//! Expression-to-Parameter Extractor (spec.md §4.7)
//!
//! Walks the (already-rewritten) expression tree to emit a deduplicated,
//! order-preserving list of `(name, value)` sub-query parameters.

use broker_model::{BoolOp, Expression, StringOp};
use std::collections::HashSet;

/// `Some(values)` if every child is an `Equals` leaf — the shape the Chain
/// Resolver rewrites a resolved chain into. Collapsed to one comma-joined
/// parameter rather than N separate ones, matching the FHIR convention
/// that a comma-joined value on one param name means OR.
fn as_or_of_equals(children: &[Expression]) -> Option<Vec<String>> {
    children
        .iter()
        .map(|c| match c {
            Expression::String { op: StringOp::Equals, value, .. } => Some(value.clone()),
            _ => None,
        })
        .collect()
}

pub struct Extracted {
    pub params: Vec<(String, String)>,
    /// Target types seen at system scope with no known context resource
    /// type, to be folded into a `_type=` parameter by the caller.
    pub system_scope_types: Vec<String>,
}

/// Extract sub-query parameters from `expr`. `context_resource_type`
/// is `Some` when the outer search already scopes to one resource type
/// (in which case `_type` must be suppressed).
#[must_use]
pub fn extract(expr: &Expression, context_resource_type: Option<&str>) -> Extracted {
    let mut params: Vec<(String, String)> = Vec::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut system_scope_types: Vec<String> = Vec::new();
    let mut push = |name: String, value: String, params: &mut Vec<(String, String)>, seen: &mut HashSet<(String, String)>| {
        if seen.insert((name.clone(), value.clone())) {
            params.push((name, value));
        }
    };

    walk_extract(expr, context_resource_type, &mut params, &mut seen, &mut system_scope_types);

    if context_resource_type.is_none() && !system_scope_types.is_empty() {
        let mut types = system_scope_types.clone();
        types.sort();
        types.dedup();
        push("_type".into(), types.join(","), &mut params, &mut seen);
    }

    Extracted { params, system_scope_types }
}

fn walk_extract(
    expr: &Expression,
    context_resource_type: Option<&str>,
    params: &mut Vec<(String, String)>,
    seen: &mut HashSet<(String, String)>,
    system_scope_types: &mut Vec<String>,
) {
    match expr {
        Expression::SearchParam { name, child } => match child.as_ref() {
            // A reference-valued leaf under a named param keeps the whole
            // `Type/id` value — never split the type suffix off it.
            Expression::String { value, .. } => {
                push_dedup(name.clone(), value.clone(), params, seen);
            }
            Expression::Multiary { op: BoolOp::Or, children } if as_or_of_equals(children).is_some() => {
                let values = as_or_of_equals(children).unwrap_or_default();
                push_dedup(name.clone(), values.join(","), params, seen);
            }
            _ => walk_extract(child, context_resource_type, params, seen, system_scope_types),
        },
        Expression::String { op, field, value, .. } => {
            let (name, emitted_value) = match op {
                StringOp::Equals => (field.clone(), value.clone()),
                StringOp::StartsWith => (field.clone(), format!("{value}*")),
                StringOp::Contains => (format!("{field}:contains"), value.clone()),
            };
            push_dedup(name, emitted_value, params, seen);
        }
        Expression::Multiary { children, .. } => {
            for c in children {
                walk_extract(c, context_resource_type, params, seen, system_scope_types);
            }
        }
        Expression::Chained { ref_param, target_types, child, .. } => {
            // This path is only reached for a chain the resolver left
            // unresolved (e.g. PASSTHROUGH mode); DISTRIBUTED mode always
            // rewrites chains to `SearchParam` before extraction runs.
            if target_types.len() > 1 && context_resource_type.is_none() {
                system_scope_types.extend(target_types.iter().cloned());
            }
            let key = if let Some(target) = target_types.first() {
                format!("{ref_param}:{target}")
            } else {
                ref_param.clone()
            };
            if let Expression::String { value, .. } = child.as_ref() {
                push_dedup(key, value.clone(), params, seen);
            }
        }
        Expression::Include { .. } => {}
    }
}

fn push_dedup(name: String, value: String, params: &mut Vec<(String, String)>, seen: &mut HashSet<(String, String)>) {
    if seen.insert((name.clone(), value.clone())) {
        params.push((name, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_model::Expression;

    #[test]
    fn reference_value_is_preserved_whole() {
        let expr = Expression::search_param("subject", Expression::string_eq("reference", "Patient/p1"));
        let extracted = extract(&expr, Some("Observation"));
        assert_eq!(extracted.params, vec![("subject".to_string(), "Patient/p1".to_string())]);
    }

    #[test]
    fn starts_with_appends_wildcard_and_contains_suffixes_key() {
        let expr = Expression::and(vec![
            Expression::String { op: StringOp::StartsWith, field: "name".into(), value: "Jo".into(), ignore_case: true },
            Expression::String { op: StringOp::Contains, field: "address".into(), value: "Main".into(), ignore_case: true },
        ]);
        let extracted = extract(&expr, Some("Patient"));
        assert!(extracted.params.contains(&("name".to_string(), "Jo*".to_string())));
        assert!(extracted.params.contains(&("address:contains".to_string(), "Main".to_string())));
    }

    #[test]
    fn dedup_preserves_first_insertion_order() {
        let expr = Expression::and(vec![
            Expression::string_eq("status", "active"),
            Expression::string_eq("status", "active"),
            Expression::string_eq("name", "John"),
        ]);
        let extracted = extract(&expr, Some("Patient"));
        assert_eq!(
            extracted.params,
            vec![("status".to_string(), "active".to_string()), ("name".to_string(), "John".to_string())]
        );
    }

    #[test]
    fn resolved_chain_id_filter_collapses_to_one_comma_joined_param() {
        let resolved = Expression::search_param(
            "subject",
            Expression::or(vec![
                Expression::string_eq("id", "p1"),
                Expression::string_eq("id", "p2"),
                Expression::string_eq("id", "p3"),
            ]),
        );
        let extracted = extract(&resolved, Some("DiagnosticReport"));
        assert_eq!(extracted.params, vec![("subject".to_string(), "p1,p2,p3".to_string())]);
    }

    #[test]
    fn system_scope_multi_type_chain_emits_type_param() {
        let chain = Expression::Chained {
            resource_types: vec![],
            ref_param: "subject".into(),
            target_types: vec!["Patient".into(), "Group".into()],
            reversed: false,
            child: std::sync::Arc::new(Expression::string_eq("name", "x")),
        };
        let extracted = extract(&chain, None);
        assert!(extracted.params.iter().any(|(n, v)| n == "_type" && v == "Group,Patient"));
    }
}
