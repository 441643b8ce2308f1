// This module defines the error taxonomy of the lowering stage using thiserror. LowerError
// covers the five ways a kernel can fail to lower: an operation, type or special register the
// backend has no rendering for (Unsupported), a shared-memory request above the ISA ceiling
// (CapacityExceeded), a value node without a result type (MissingType), an operand read before
// any register was bound to it (MissingRegister), and any other broken graph contract such as a
// wrong operand count or argument payload (Malformed). Each variant carries the node id and
// context needed to point at the offending node. LowerResult<T> is the shared alias used by
// the rewrite pass, the lowering engine and every backend operation.

//! Error types for the lowering stage.
//!
//! Every failure is fatal for the kernel being lowered: the pass is pure and
//! deterministic, so the same graph always fails the same way and no partial
//! output is returned.

use thiserror::Error;

use crate::graph::NodeId;
use crate::ops::UOp;

/// Main error type for graph lowering.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LowerError {
    #[error("unsupported: {what}")]
    Unsupported { what: String },

    #[error("local memory request of {requested} bytes exceeds the {limit} byte limit")]
    CapacityExceeded { requested: usize, limit: usize },

    #[error("{op} node {node} has no result type")]
    MissingType { node: NodeId, op: UOp },

    #[error("node {node} is read before a register was assigned to it")]
    MissingRegister { node: NodeId },

    #[error("malformed node {node}: {reason}")]
    Malformed { node: NodeId, reason: String },
}

impl LowerError {
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported { what: what.into() }
    }

    pub fn malformed(node: NodeId, reason: impl Into<String>) -> Self {
        Self::Malformed { node, reason: reason.into() }
    }
}

/// Result type alias for lowering operations.
pub type LowerResult<T> = Result<T, LowerError>;
