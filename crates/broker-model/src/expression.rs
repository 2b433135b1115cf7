//! The parsed search-predicate tree
//!
//! Built upstream (grammar parsing is out of scope for the broker) and
//! traversed read-only by the resolvers and extractor; every resolver
//! rewrite produces a *new* tree rather than mutating in place, so nodes
//! are cheaply `Clone`-able and safe to share across the concurrent
//! sub-queries spawned during chain/include resolution.

use std::sync::Arc;

/// String comparison operator for a leaf predicate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StringOp {
    Equals,
    StartsWith,
    Contains,
}

/// Boolean combinator for a `Multiary` node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

/// One node of the parsed search-predicate tree
#[derive(Clone, Debug)]
pub enum Expression {
    /// A named search parameter wrapping a child predicate, e.g. `subject`
    /// wrapping the reference-equality leaf under it.
    SearchParam { name: String, child: Arc<Expression> },

    /// A leaf string/reference comparison: `field OP value`.
    String {
        op: StringOp,
        field: String,
        value: String,
        ignore_case: bool,
    },

    /// A boolean combination of child predicates.
    Multiary { op: BoolOp, children: Vec<Expression> },

    /// A chained predicate: `ref:Target.param = V`, meaning "find `Target`
    /// resources satisfying `child`, then filter the outer query by
    /// `refParam ∈ {ids}`".
    Chained {
        resource_types: Vec<String>,
        ref_param: String,
        target_types: Vec<String>,
        reversed: bool,
        child: Arc<Expression>,
    },

    /// An `_include`/`_revinclude` directive.
    Include {
        source_type: Option<String>,
        ref_param: String,
        target_type: Option<String>,
        iterate: bool,
        wildcard: bool,
        circular: bool,
        allowed_scopes: Vec<String>,
    },
}

impl Expression {
    #[must_use]
    pub fn search_param(name: impl Into<String>, child: Expression) -> Self {
        Self::SearchParam { name: name.into(), child: Arc::new(child) }
    }

    #[must_use]
    pub fn string_eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::String {
            op: StringOp::Equals,
            field: field.into(),
            value: value.into(),
            ignore_case: false,
        }
    }

    #[must_use]
    pub fn and(children: Vec<Expression>) -> Self {
        Self::Multiary { op: BoolOp::And, children }
    }

    #[must_use]
    pub fn or(children: Vec<Expression>) -> Self {
        Self::Multiary { op: BoolOp::Or, children }
    }

    /// True if this node (or, for combinators, any direct child) is a
    /// `Chained` predicate. Used by the Strategy Analyzer's chain-presence
    /// signal without a full recursive walk.
    #[must_use]
    pub fn is_chained(&self) -> bool {
        matches!(self, Self::Chained { .. })
    }

    /// Depth-first walk invoking `visit` on every node, including self.
    /// Resolvers compose several single-purpose visitors over one walk
    /// rather than hand-rolling a traversal per concern.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Expression)) {
        visit(self);
        match self {
            Self::SearchParam { child, .. } => child.walk(visit),
            Self::Chained { child, .. } => child.walk(visit),
            Self::Multiary { children, .. } => {
                for c in children {
                    c.walk(visit);
                }
            }
            Self::String { .. } | Self::Include { .. } => {}
        }
    }

    /// Count chain nesting depth: the number of `Chained` ancestors
    /// stacked through `child` links, used to enforce `maxChainDepth`
    /// before any I/O.
    #[must_use]
    pub fn chain_depth(&self) -> u32 {
        match self {
            Self::Chained { child, .. } => 1 + child.chain_depth(),
            Self::SearchParam { child, .. } => child.chain_depth(),
            Self::Multiary { children, .. } => {
                children.iter().map(Self::chain_depth).max().unwrap_or(0)
            }
            Self::String { .. } | Self::Include { .. } => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_depth_counts_nesting() {
        let inner = Expression::Chained {
            resource_types: vec!["DiagnosticReport".into()],
            ref_param: "subject".into(),
            target_types: vec!["Patient".into()],
            reversed: false,
            child: Arc::new(Expression::string_eq("name", "Sarah")),
        };
        let outer = Expression::Chained {
            resource_types: vec!["Observation".into()],
            ref_param: "subject".into(),
            target_types: vec!["DiagnosticReport".into()],
            reversed: false,
            child: Arc::new(inner),
        };
        assert_eq!(outer.chain_depth(), 2);
    }

    #[test]
    fn walk_visits_every_node_once() {
        let expr = Expression::and(vec![
            Expression::string_eq("name", "John"),
            Expression::string_eq("status", "active"),
        ]);
        let mut count = 0;
        expr.walk(&mut |_| count += 1);
        assert_eq!(count, 3); // Multiary + 2 leaves
    }
}
