// This module gathers the target-independent half of the lowering pipeline. The rewrite pass
// fixes up node shapes a target cannot express directly (boolean comparisons, boolean memory
// access, byte-offset pointer arithmetic). The lowering engine then walks the graph once and
// emits text through the AsmBackend trait, keeping all of its mutable state in a per-run
// LoweringSession backed by a bumpalo arena. Errors from every stage share one LowerError type.

//! Target-independent lowering infrastructure.
//!
//! - [`rewrite`] - peephole pre-transform over a [`KernelGraph`](crate::graph::KernelGraph)
//! - [`lower`] - single-pass lowering to assembly text
//! - [`backend`] - capability contract a concrete ISA implements
//! - [`session`] - per-run register, label and parameter tables
//! - [`error`] - failure taxonomy

pub mod backend;
pub mod error;
pub mod lower;
pub mod rewrite;
pub mod session;

pub use backend::{AluTemplate, AsmBackend, IsaFacts};
pub use error::{LowerError, LowerResult};
pub use lower::{render, uops_to_asm};
pub use rewrite::pretransform;
pub use session::{Binding, LoweringSession, RegGroup, SessionStats};
