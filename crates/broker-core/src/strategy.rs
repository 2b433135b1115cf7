//! Strategy Analyzer — chooses `PARALLEL` vs `SEQUENTIAL` fan-out
//!
//! Walks the expression tree with one visitor per signal (sort presence
//! is read off the request, not the tree) and applies the first-match
//! decision table from spec.md §4.2. Unknown/irrelevant nodes fall
//! through every visitor without altering any signal, the same
//! sum-type-plus-`walk` shape `Expression::walk` already provides.

use broker_model::{Expression, SearchRequest, StringOp, Strategy};

pub struct StrategyAnalyzer {
    parallel_threshold: u32,
    sequential_threshold: u32,
}

impl StrategyAnalyzer {
    #[must_use]
    pub fn new(parallel_threshold: u32, sequential_threshold: u32) -> Self {
        Self { parallel_threshold, sequential_threshold }
    }

    #[must_use]
    pub fn analyze(&self, request: &SearchRequest) -> Strategy {
        if !request.sort.is_empty() {
            return Strategy::Parallel;
        }

        if let Some(expr) = &request.expression {
            if has_chain(expr) {
                return Strategy::Parallel;
            }
            if has_exact_id_equality(expr) {
                return Strategy::Parallel;
            }
        }

        if request.max_item_count <= self.parallel_threshold {
            return Strategy::Parallel;
        }
        if request.max_item_count > self.sequential_threshold {
            return Strategy::Sequential;
        }

        if let Some(expr) = &request.expression {
            if has_broad_text_or_status_only(expr) {
                return Strategy::Sequential;
            }
        }

        Strategy::Parallel
    }
}

fn has_chain(expr: &Expression) -> bool {
    let mut found = false;
    expr.walk(&mut |node| {
        if node.is_chained() {
            found = true;
        }
    });
    found
}

fn has_exact_id_equality(expr: &Expression) -> bool {
    let mut found = false;
    expr.walk(&mut |node| {
        if let Expression::String { op: StringOp::Equals, field, .. } = node {
            if field == "_id" || field.ends_with("identifier") {
                found = true;
            }
        }
    });
    found
}

fn has_broad_text_or_status_only(expr: &Expression) -> bool {
    let mut contains_predicates = 0u32;
    let mut total_leaves = 0u32;
    let mut status_only = true;
    expr.walk(&mut |node| {
        if let Expression::String { op, field, .. } = node {
            total_leaves += 1;
            if matches!(op, StringOp::Contains) {
                contains_predicates += 1;
            }
            if field != "status" {
                status_only = false;
            }
        }
    });
    contains_predicates > 0 || (total_leaves > 0 && status_only)
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_model::{Expression, SearchRequest, SortKey};
    use std::sync::Arc;

    fn analyzer() -> StrategyAnalyzer {
        StrategyAnalyzer::new(10, 20)
    }

    #[test]
    fn sort_forces_parallel_regardless_of_page_size() {
        let req = SearchRequest::new(Some("Patient".into()))
            .with_max_item_count(50)
            .with_sort(vec![SortKey::asc("name")]);
        assert_eq!(analyzer().analyze(&req), Strategy::Parallel);
    }

    #[test]
    fn chain_forces_parallel() {
        let chain = Expression::Chained {
            resource_types: vec!["DiagnosticReport".into()],
            ref_param: "subject".into(),
            target_types: vec!["Patient".into()],
            reversed: false,
            child: Arc::new(Expression::string_eq("name", "Sarah")),
        };
        let req = SearchRequest::new(Some("DiagnosticReport".into()))
            .with_expression(chain)
            .with_max_item_count(50);
        assert_eq!(analyzer().analyze(&req), Strategy::Parallel);
    }

    #[test]
    fn small_page_is_parallel_large_page_is_sequential() {
        let small = SearchRequest::new(None).with_max_item_count(10);
        assert_eq!(analyzer().analyze(&small), Strategy::Parallel);

        let large = SearchRequest::new(None).with_max_item_count(21);
        assert_eq!(analyzer().analyze(&large), Strategy::Sequential);
    }

    #[test]
    fn broad_text_predicate_in_mid_range_is_sequential() {
        let req = SearchRequest::new(Some("Patient".into()))
            .with_expression(Expression::String {
                op: StringOp::Contains,
                field: "name".into(),
                value: "oh".into(),
                ignore_case: true,
            })
            .with_max_item_count(15);
        assert_eq!(analyzer().analyze(&req), Strategy::Sequential);
    }

    #[test]
    fn status_only_predicate_in_mid_range_is_sequential() {
        let req = SearchRequest::new(Some("Patient".into()))
            .with_expression(Expression::string_eq("status", "active"))
            .with_max_item_count(15);
        assert_eq!(analyzer().analyze(&req), Strategy::Sequential);
    }

    #[test]
    fn otherwise_defaults_to_parallel() {
        let req = SearchRequest::new(Some("Patient".into()))
            .with_expression(Expression::string_eq("name", "John"))
            .with_max_item_count(15);
        assert_eq!(analyzer().analyze(&req), Strategy::Parallel);
    }
}
