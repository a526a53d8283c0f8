use serde_json::{Number, Value};

use super::change::{add_numbers, ChangeOp, ChangeSet};
use crate::core::path::is_strict_ancestor;

/// Pending operation recorded for a single path.
///
/// A path holds either one exclusive operation (Set/Unset), one accumulated
/// increment, or accumulated array pushes/pulls. Never a mix.
#[derive(Debug, Clone)]
enum PathState {
    Set(Value),
    Unset,
    Inc(Number),
    Array {
        pushes: Vec<Value>,
        pulls: Vec<Value>,
        pull_first: bool,
    },
}

/// Per-document dirty-path bookkeeping.
///
/// Owned exclusively by one document handle. Entries keep the position of
/// their first occurrence so snapshots are deterministic. `clear` is the
/// only operation that empties tracked state; a failed save leaves the
/// tracker untouched so the caller can retry.
#[derive(Debug, Clone, Default)]
pub struct PathTracker {
    entries: Vec<(String, PathState)>,
}

impl PathTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn index_of(&self, path: &str) -> Option<usize> {
        self.entries.iter().position(|(p, _)| p == path)
    }

    /// Nearest recorded path whose pending Set/Unset already covers `path`
    /// (the path itself or a strict ancestor).
    ///
    /// When a covering exclusive op exists, later writes beneath it must not
    /// record separate ops; the caller instead refreshes the covering Set
    /// with the materialized value.
    pub fn exclusive_covering(&self, path: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(p, state)| {
                matches!(state, PathState::Set(_) | PathState::Unset)
                    && (p == path || is_strict_ancestor(p, path))
            })
            .map(|(p, _)| p.as_str())
    }

    fn record_exclusive(&mut self, path: &str, state: PathState) {
        // A pending Set/Unset on an ancestor already materializes this write.
        if self
            .entries
            .iter()
            .any(|(p, s)| {
                matches!(s, PathState::Set(_) | PathState::Unset)
                    && is_strict_ancestor(p, path)
            })
        {
            return;
        }

        // This write supersedes everything recorded beneath it.
        self.entries
            .retain(|(p, _)| !is_strict_ancestor(path, p));

        match self.index_of(path) {
            Some(index) => self.entries[index].1 = state,
            None => self.entries.push((path.to_string(), state)),
        }
    }

    pub fn record_set(&mut self, path: &str, value: Value) {
        self.record_exclusive(path, PathState::Set(value));
    }

    pub fn record_unset(&mut self, path: &str) {
        self.record_exclusive(path, PathState::Unset);
    }

    pub fn record_array_push(&mut self, path: &str, values: Vec<Value>) {
        if self.exclusive_covering(path).is_some() {
            return;
        }
        match self.index_of(path) {
            Some(index) => match &mut self.entries[index].1 {
                PathState::Array { pushes, .. } => pushes.extend(values),
                state => {
                    *state = PathState::Array {
                        pushes: values,
                        pulls: Vec::new(),
                        pull_first: false,
                    }
                }
            },
            None => self.entries.push((
                path.to_string(),
                PathState::Array {
                    pushes: values,
                    pulls: Vec::new(),
                    pull_first: false,
                },
            )),
        }
    }

    /// Accumulate values to pull. Values are kept as given: no
    /// deduplication, no batch cap.
    pub fn record_array_pull(&mut self, path: &str, values: Vec<Value>) {
        if self.exclusive_covering(path).is_some() {
            return;
        }
        match self.index_of(path) {
            Some(index) => match &mut self.entries[index].1 {
                PathState::Array { pulls, .. } => pulls.extend(values),
                state => {
                    *state = PathState::Array {
                        pushes: Vec::new(),
                        pulls: values,
                        pull_first: true,
                    }
                }
            },
            None => self.entries.push((
                path.to_string(),
                PathState::Array {
                    pushes: Vec::new(),
                    pulls: values,
                    pull_first: true,
                },
            )),
        }
    }

    pub fn record_increment(&mut self, path: &str, amount: Number) {
        if self.exclusive_covering(path).is_some() {
            return;
        }
        match self.index_of(path) {
            Some(index) => match &mut self.entries[index].1 {
                PathState::Inc(total) => *total = add_numbers(total, &amount),
                // An increment of a previously unset field starts from zero,
                // which is a plain Set of the delta.
                state @ PathState::Unset => *state = PathState::Set(Value::Number(amount)),
                state => *state = PathState::Inc(amount),
            },
            None => self
                .entries
                .push((path.to_string(), PathState::Inc(amount))),
        }
    }

    pub fn modified_paths(&self) -> Vec<&str> {
        self.entries.iter().map(|(p, _)| p.as_str()).collect()
    }

    /// True when `path`, one of its ancestors, or one of its descendants has
    /// a pending operation.
    pub fn is_dirty(&self, path: &str) -> bool {
        self.entries.iter().any(|(p, _)| {
            p == path || is_strict_ancestor(p, path) || is_strict_ancestor(path, p)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pure read of pending changes in first-occurrence order.
    ///
    /// Accumulated array ops expand into up to two entries; whichever kind
    /// was recorded first on the path comes first.
    pub fn snapshot(&self) -> ChangeSet {
        let mut set = ChangeSet::new();
        for (path, state) in &self.entries {
            match state {
                PathState::Set(value) => set.push(path.clone(), ChangeOp::Set(value.clone())),
                PathState::Unset => set.push(path.clone(), ChangeOp::Unset),
                PathState::Inc(amount) => {
                    set.push(path.clone(), ChangeOp::Inc(amount.clone()))
                }
                PathState::Array {
                    pushes,
                    pulls,
                    pull_first,
                } => {
                    let pull = (!pulls.is_empty())
                        .then(|| ChangeOp::PullAll(pulls.clone()));
                    let push = (!pushes.is_empty())
                        .then(|| ChangeOp::Push(pushes.clone()));
                    let ordered = if *pull_first {
                        [pull, push]
                    } else {
                        [push, pull]
                    };
                    for op in ordered.into_iter().flatten() {
                        set.push(path.clone(), op);
                    }
                }
            }
        }
        set
    }

    /// Drop all tracked state. Called only after confirmed persistence or
    /// abort-driven rollback.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
