//! Incremental view changes produced by one apply step

use super::message::Message;
use serde::{Deserialize, Serialize};

/// A single positional change to the ordered conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffOp {
    /// `message` now sits at `index`; later items shift right
    Insert { index: usize, message: Message },

    /// The item at `index` was replaced in place
    Update { index: usize, message: Message },

    /// The item at `index` is gone; later items shift left
    Remove { index: usize },
}

impl DiffOp {
    pub fn index(&self) -> usize {
        match self {
            DiffOp::Insert { index, .. } => *index,
            DiffOp::Update { index, .. } => *index,
            DiffOp::Remove { index } => *index,
        }
    }
}

/// Ordered list of ops that turns the previous view into the current one.
///
/// Ops are meant to be replayed in order against a copy of the view as it was
/// before the apply step. An empty diff means nothing visible changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    ops: Vec<DiffOp>,
}

impl Diff {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insert(index: usize, message: Message) -> Self {
        Self {
            ops: vec![DiffOp::Insert { index, message }],
        }
    }

    pub fn update(index: usize, message: Message) -> Self {
        Self {
            ops: vec![DiffOp::Update { index, message }],
        }
    }

    pub fn remove(index: usize) -> Self {
        Self {
            ops: vec![DiffOp::Remove { index }],
        }
    }

    /// Remove at `from`, then insert at `to` (indices relative to the
    /// intermediate view)
    pub fn relocate(from: usize, to: usize, message: Message) -> Self {
        Self {
            ops: vec![
                DiffOp::Remove { index: from },
                DiffOp::Insert { index: to, message },
            ],
        }
    }

    pub fn ops(&self) -> &[DiffOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<DiffOp> {
        self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Replay this diff onto a view
    pub fn apply_to(&self, view: &mut Vec<Message>) {
        for op in &self.ops {
            match op {
                DiffOp::Insert { index, message } => view.insert(*index, message.clone()),
                DiffOp::Update { index, message } => view[*index] = message.clone(),
                DiffOp::Remove { index } => {
                    view.remove(*index);
                }
            }
        }
    }
}
