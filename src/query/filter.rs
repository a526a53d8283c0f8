use serde_json::Value;

use crate::core::path::{get_value, FieldMap};
use crate::core::types::ID_FIELD;

/// Equality filter over document paths.
///
/// The full query-operator grammar belongs to the underlying store; this
/// layer only ever needs identity matches and simple path equality.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    /// Matches every document.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl std::fmt::Display) -> Self {
        Self::new().eq(ID_FIELD, Value::String(id.to_string()))
    }

    pub fn eq(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((path.into(), value.into()));
        self
    }

    pub fn clauses(&self) -> &[(String, Value)] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// The `_id` this filter pins, when it pins one.
    pub fn id(&self) -> Option<&str> {
        self.clauses
            .iter()
            .find(|(path, _)| path == ID_FIELD)
            .and_then(|(_, value)| value.as_str())
    }

    pub fn matches(&self, doc: &FieldMap) -> bool {
        self.clauses.iter().all(|(path, expected)| {
            match get_value(doc, path) {
                Some(actual) => actual == expected,
                // A null clause matches an absent field, as the store does.
                None => expected.is_null(),
            }
        })
    }
}

/// Options applied to a find operation.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Top-level fields to include; `_id` is always kept.
    pub projection: Option<Vec<String>>,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn projection(mut self, fields: Vec<String>) -> Self {
        self.projection = Some(fields);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
