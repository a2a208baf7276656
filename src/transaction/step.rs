//! Steps and node addressing

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

pub type NodeId = Uuid;

/// A cluster member as the engine dials it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub address: String,
}

/// One ordered unit of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Registered step function run on every target node
    pub do_func: String,
    /// Compensation run on rollback; empty means none
    pub undo_func: String,
    pub nodes: Vec<NodeId>,
}

impl Step {
    pub fn new(do_func: impl Into<String>, nodes: Vec<NodeId>) -> Self {
        Self {
            do_func: do_func.into(),
            undo_func: String::new(),
            nodes,
        }
    }

    pub fn with_undo(mut self, undo_func: impl Into<String>) -> Self {
        self.undo_func = undo_func.into();
        self
    }

    pub fn has_undo(&self) -> bool {
        !self.undo_func.is_empty()
    }

    /// Target nodes, each once, in id order
    pub fn targets(&self) -> BTreeSet<NodeId> {
        self.nodes.iter().copied().collect()
    }
}
