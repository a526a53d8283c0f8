use serde_json::{json, Map, Value};

use super::change::{ChangeOp, ChangeSet};

/// Update-operator family understood by the destination store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Set,
    Unset,
    Push,
    PullAll,
    Inc,
}

impl Operator {
    pub fn keyword(&self) -> &'static str {
        match self {
            Operator::Set => "$set",
            Operator::Unset => "$unset",
            Operator::Push => "$push",
            Operator::PullAll => "$pullAll",
            Operator::Inc => "$inc",
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.keyword())
    }
}

/// A compiled batch of update operators, grouped by family.
///
/// Families appear in the order their first entry occurred; within a family,
/// entries keep path insertion order. The destination store does not care,
/// but tests do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateBatch {
    groups: Vec<(Operator, Vec<(String, Value)>)>,
}

impl UpdateBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn insert(&mut self, op: Operator, path: impl Into<String>, value: Value) {
        let path = path.into();
        match self.groups.iter_mut().find(|(o, _)| *o == op) {
            Some((_, entries)) => match entries.iter_mut().find(|(p, _)| *p == path) {
                Some((_, existing)) => *existing = value,
                None => entries.push((path, value)),
            },
            None => self.groups.push((op, vec![(path, value)])),
        }
    }

    /// Operator families in first-occurrence order.
    pub fn operators(&self) -> Vec<Operator> {
        self.groups.iter().map(|(op, _)| *op).collect()
    }

    pub fn entries(&self, op: Operator) -> &[(String, Value)] {
        self.groups
            .iter()
            .find(|(o, _)| *o == op)
            .map(|(_, entries)| entries.as_slice())
            .unwrap_or(&[])
    }

    pub fn get(&self, op: Operator, path: &str) -> Option<&Value> {
        self.entries(op)
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, v)| v)
    }

    /// Render as the store-level update document, e.g.
    /// `{"$set": {"name": "x"}, "$push": {"arr": {"$each": [1]}}}`.
    pub fn to_document(&self) -> Value {
        let mut doc = Map::new();
        for (op, entries) in &self.groups {
            let mut family = Map::new();
            for (path, value) in entries {
                family.insert(path.clone(), value.clone());
            }
            doc.insert(op.keyword().to_string(), Value::Object(family));
        }
        Value::Object(doc)
    }
}

/// Compile a tracker snapshot into an operator batch.
///
/// The tracker already guarantees a path never carries both an exclusive op
/// and array ops; this stage asserts that invariant rather than resolving
/// conflicts.
pub fn compile(change_set: &ChangeSet) -> UpdateBatch {
    let mut batch = UpdateBatch::new();
    for entry in change_set.entries() {
        match &entry.op {
            ChangeOp::Set(value) => batch.insert(Operator::Set, &entry.path, value.clone()),
            ChangeOp::Unset => batch.insert(Operator::Unset, &entry.path, Value::Bool(true)),
            ChangeOp::Push(values) => {
                batch.insert(Operator::Push, &entry.path, json!({ "$each": values }))
            }
            ChangeOp::PullAll(values) => {
                batch.insert(Operator::PullAll, &entry.path, Value::Array(values.clone()))
            }
            ChangeOp::Inc(amount) => {
                batch.insert(Operator::Inc, &entry.path, Value::Number(amount.clone()))
            }
        }
    }

    debug_assert!(
        batch.entries(Operator::Set).iter().all(|(path, _)| {
            batch.get(Operator::Push, path).is_none()
                && batch.get(Operator::PullAll, path).is_none()
        }),
        "tracker emitted $set and an array op for the same path"
    );

    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::tracker::PathTracker;
    use serde_json::json;

    #[test]
    fn test_pull_then_push_yields_both_operators() {
        let mut tracker = PathTracker::new();
        tracker.record_array_pull("arr", vec![json!("x")]);
        tracker.record_array_push("arr", vec![json!("y")]);

        let batch = compile(&tracker.snapshot());
        assert_eq!(
            batch.to_document(),
            json!({
                "$pullAll": { "arr": ["x"] },
                "$push": { "arr": { "$each": ["y"] } }
            })
        );
        assert_eq!(batch.operators(), vec![Operator::PullAll, Operator::Push]);
    }

    #[test]
    fn test_set_supersedes_array_ops_in_output() {
        let mut tracker = PathTracker::new();
        tracker.record_array_push("arr", vec![json!("a")]);
        tracker.record_set("arr", json!(["b"]));

        let batch = compile(&tracker.snapshot());
        assert_eq!(batch.to_document(), json!({ "$set": { "arr": ["b"] } }));
    }

    #[test]
    fn test_family_order_is_first_occurrence() {
        let mut tracker = PathTracker::new();
        tracker.record_unset("legacy");
        tracker.record_set("name", json!("a"));
        tracker.record_increment("count", 1.into());
        tracker.record_unset("other");

        let batch = compile(&tracker.snapshot());
        assert_eq!(
            batch.operators(),
            vec![Operator::Unset, Operator::Set, Operator::Inc]
        );
        assert_eq!(batch.get(Operator::Unset, "other"), Some(&json!(true)));
    }

    #[test]
    fn test_empty_changes_compile_to_empty_batch() {
        let tracker = PathTracker::new();
        let batch = compile(&tracker.snapshot());
        assert!(batch.is_empty());
        assert_eq!(batch.to_document(), json!({}));
    }
}
