pub mod change;
pub mod compiler;
pub mod tracker;

pub use change::{ChangeEntry, ChangeOp, ChangeSet};
pub use compiler::{compile, Operator, UpdateBatch};
pub use tracker::PathTracker;
