//! The client's translated search request

use crate::expression::Expression;

/// Sort direction for one sort key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// One `(paramName, direction)` entry of `request.sort`, applied in
/// declared order by the Aggregator's global sort.
#[derive(Clone, Debug)]
pub struct SortKey {
    pub param: String,
    pub direction: SortDirection,
}

impl SortKey {
    #[must_use]
    pub fn asc(param: impl Into<String>) -> Self {
        Self { param: param.into(), direction: SortDirection::Asc }
    }

    #[must_use]
    pub fn desc(param: impl Into<String>) -> Self {
        Self { param: param.into(), direction: SortDirection::Desc }
    }

    /// `_sort` wire representation: `-param` for descending, `param` for ascending
    #[must_use]
    pub fn signed(&self) -> String {
        match self.direction {
            SortDirection::Asc => self.param.clone(),
            SortDirection::Desc => format!("-{}", self.param),
        }
    }
}

/// Version requirement on the search — the engine only ever supports
/// `Latest`; anything else is a fatal `REQUEST_TOO_COSTLY` at admission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum VersionRequirement {
    #[default]
    Latest,
    AtVersion,
    AnyVersion,
}

/// The client's search request, immutable for the lifetime of the operation
#[derive(Clone, Debug)]
pub struct SearchRequest {
    pub resource_type: Option<String>,
    pub expression: Option<Expression>,
    pub unsupported_params: Vec<(String, String)>,
    pub max_item_count: u32,
    pub sort: Vec<SortKey>,
    pub only_ids: bool,
    pub continuation_token: Option<String>,
    pub version_requirement: VersionRequirement,
}

impl SearchRequest {
    #[must_use]
    pub fn new(resource_type: Option<String>) -> Self {
        Self {
            resource_type,
            expression: None,
            unsupported_params: Vec::new(),
            max_item_count: 20,
            sort: Vec::new(),
            only_ids: false,
            continuation_token: None,
            version_requirement: VersionRequirement::Latest,
        }
    }

    #[must_use]
    pub fn with_expression(mut self, expr: Expression) -> Self {
        self.expression = Some(expr);
        self
    }

    #[must_use]
    pub fn with_max_item_count(mut self, n: u32) -> Self {
        self.max_item_count = n;
        self
    }

    #[must_use]
    pub fn with_sort(mut self, sort: Vec<SortKey>) -> Self {
        self.sort = sort;
        self
    }

    #[must_use]
    pub fn with_continuation_token(mut self, token: impl Into<String>) -> Self {
        self.continuation_token = Some(token.into());
        self
    }

    /// Declared chain depth across the whole expression tree, checked by
    /// the Protection Gate before any I/O.
    #[must_use]
    pub fn declared_chain_depth(&self) -> u32 {
        self.expression.as_ref().map_or(0, Expression::chain_depth)
    }
}

/// Options accompanying a search operation (spec.md §6)
#[derive(Clone, Debug, Default)]
pub struct SearchOptions {
    pub is_async: bool,
    pub version_requirement: VersionRequirement,
    pub only_ids: bool,
    pub is_includes_operation: bool,
}
