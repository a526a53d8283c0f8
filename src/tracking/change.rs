// ============================================================================
// Recorded Document Changes
// ============================================================================
//
// Implements the Command Pattern for document mutations. Each ChangeEntry
// is recorded as the application mutates a document, compiled into update
// operators on save, and discarded on transaction rollback.
//
// ============================================================================

use serde_json::{Number, Value};

/// A single pending mutation kind for one path.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeOp {
    /// Replace the value at the path.
    Set(Value),
    /// Remove the value at the path.
    Unset,
    /// Append values to the array at the path.
    Push(Vec<Value>),
    /// Remove all occurrences of the given values from the array at the path.
    PullAll(Vec<Value>),
    /// Add a numeric delta to the value at the path.
    Inc(Number),
}

impl ChangeOp {
    /// Array-accumulation ops compose with each other on one path; Set and
    /// Unset are exclusive with everything.
    pub fn is_array_op(&self) -> bool {
        matches!(self, ChangeOp::Push(_) | ChangeOp::PullAll(_))
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, ChangeOp::Set(_) | ChangeOp::Unset)
    }
}

/// One dirty path with its pending operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    pub path: String,
    pub op: ChangeOp,
}

/// Ordered snapshot of a tracker's pending changes.
///
/// Order is the insertion order in which paths first became dirty; the
/// compiler relies on it for deterministic operator batches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    entries: Vec<ChangeEntry>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, path: impl Into<String>, op: ChangeOp) {
        self.entries.push(ChangeEntry {
            path: path.into(),
            op,
        });
    }

    pub fn entries(&self) -> &[ChangeEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Add two JSON numbers, staying integral when both sides are.
pub(crate) fn add_numbers(a: &Number, b: &Number) -> Number {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Number::from(sum);
        }
    }
    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    Number::from_f64(sum).unwrap_or_else(|| Number::from(0))
}
