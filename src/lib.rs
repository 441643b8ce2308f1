//! uopasm - lowering of tensor-kernel UOp graphs to GPU assembly.
//!
//! A kernel arrives as a linear [`graph::KernelGraph`] of UOps. A peephole pass
//! rewrites the shapes the target cannot express natively, then a single
//! forward pass emits assembly text through an [`core::AsmBackend`].
//!
//! # Primary Usage
//!
//! ```
//! use uopasm::{parse_graph, uops_to_asm, PtxBackend};
//!
//! let mut graph = parse_graph(
//!     "%buf = DEFINE_GLOBAL *i32 : 0 data0
//!      %idx = CONST i32 : 0
//!      %val = CONST i32 : 5
//!      STORE _ %buf, %idx, %val",
//! )?;
//! let ptx = uops_to_asm(&PtxBackend::new(), "store_five", &mut graph)?;
//! assert!(ptx.contains(".visible .entry store_five("));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Architecture
//!
//! - [`dtype`] - value types
//! - [`ops`] - opcodes and ALU operators
//! - [`graph`] - the kernel graph with position-aware insertion
//! - [`core`] - rewrite pass, lowering engine, backend contract
//! - [`ptx`] - the PTX backend
//! - [`text_ir`] - textual listings for tests and the command line

pub mod core;
pub mod dtype;
pub mod graph;
pub mod ops;
pub mod ptx;
pub mod text_ir;

pub use crate::core::{pretransform, render, uops_to_asm, AsmBackend, LowerError, LowerResult};
pub use dtype::DType;
pub use graph::{KernelGraph, NodeId};
pub use ptx::PtxBackend;
pub use text_ir::{parse_graph, print_graph, ParseError};
