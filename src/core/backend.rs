// This module defines the capability contract between the lowering engine and a concrete
// assembly backend. It is split in two halves. IsaFacts is an immutable record of target
// facts the engine consults directly: the kernel prologue, the barrier instruction, the
// label prefix, whether parameters must be loaded from the parameter space, the three-axis
// names of the group-id/group-dim/local-id special registers, which value types need a
// constant materialized in a register, the per-operator instruction templates, the ISA
// type names, the set of operators that accept half-precision operands directly, and the
// shared-memory ceiling. AsmBackend is the trait of rendering operations; every method is
// required, so a backend that lacks a capability does not compile rather than failing at
// first use. Lookups that can still miss at run time (a type or operator absent from the
// tables) return LowerError::Unsupported.

//! Backend capability contract.

use hashbrown::HashMap;

use super::error::{LowerError, LowerResult};
use super::session::RegGroup;
use crate::dtype::DType;
use crate::graph::AddrSpace;
use crate::ops::{AluOp, ConstValue};

/// Instruction template for one ALU operator.
///
/// Receives the destination register, the operand registers (exactly
/// [`AluOp::arity`] of them), the type the instruction operates on and that
/// type's ISA name.
pub type AluTemplate = fn(dest: &str, srcs: &[&str], dtype: DType, ty: &str) -> String;

/// Immutable description of a target ISA.
#[derive(Debug, Clone)]
pub struct IsaFacts {
    pub kernel_prefix: String,
    /// Empty when the target has no barrier.
    pub barrier: String,
    pub label_prefix: String,
    /// Parameters are loaded from the parameter space before use.
    pub load_global: bool,
    pub gid: [String; 3],
    pub gdim: [String; 3],
    pub lid: [String; 3],
    pub const_requires_mov: Vec<DType>,
    pub asm_for_op: HashMap<AluOp, AluTemplate>,
    pub types: HashMap<DType, &'static str>,
    pub supports_half: Vec<AluOp>,
    /// Largest DEFINE_LOCAL allocation in bytes.
    pub max_local_bytes: usize,
}

impl IsaFacts {
    /// ISA type name of a scalar value type.
    pub fn type_name(&self, dtype: DType) -> LowerResult<&'static str> {
        self.types
            .get(&dtype)
            .copied()
            .ok_or_else(|| LowerError::unsupported(format!("no register type for {dtype}")))
    }

    pub fn template(&self, op: AluOp) -> LowerResult<AluTemplate> {
        self.asm_for_op
            .get(&op)
            .copied()
            .ok_or_else(|| LowerError::unsupported(format!("no instruction for {op}")))
    }

    pub fn const_requires_mov(&self, dtype: DType) -> bool {
        self.const_requires_mov.contains(&dtype)
    }

    pub fn supports_half(&self, op: AluOp) -> bool {
        self.supports_half.contains(&op)
    }
}

/// Rendering operations a concrete backend supplies.
///
/// Methods return instruction lines; a single entry may itself contain
/// several newline-separated instructions.
pub trait AsmBackend {
    fn isa(&self) -> &IsaFacts;

    /// Inline literal for `value` as `dtype`.
    fn render_const(&self, value: ConstValue, dtype: DType) -> LowerResult<String>;

    /// Materialize `value` into register `dest`.
    fn render_const_into(&self, dest: &str, value: ConstValue, dtype: DType) -> LowerResult<Vec<String>>;

    /// Declare a shared allocation `name` of `bytes` bytes and move its address into `dest`.
    /// The size has already been checked against [`IsaFacts::max_local_bytes`].
    fn render_local(&self, dest: &str, name: &str, bytes: usize) -> LowerResult<Vec<String>>;

    fn render_loop(&self, idx: &str, start: &str, label: &str) -> Vec<String>;

    /// Branch to `target`, or with `cond = Some((pred, otherwise))` to
    /// `target` when `pred` holds and to `otherwise` when it does not.
    fn render_bra(&self, target: &str, cond: Option<(&str, &str)>) -> Vec<String>;

    /// Scalar load of `[loc+offset]` into `dest`. With `gate = Some((pred, alt))`
    /// the load only happens under `pred`, otherwise `dest` receives `alt`.
    fn render_load(
        &self,
        loc: &str,
        dest: &str,
        dtype: DType,
        gate: Option<(&str, &str)>,
        space: Option<AddrSpace>,
        offset: i64,
    ) -> LowerResult<Vec<String>>;

    /// Scalar store of `val` to `[loc+offset]`. For a boolean `dtype`, `val`
    /// holds the value already widened to a 16-bit 0/1 register.
    fn render_store(
        &self,
        loc: &str,
        val: &str,
        dtype: DType,
        gate: Option<&str>,
        space: Option<AddrSpace>,
        offset: i64,
    ) -> LowerResult<Vec<String>>;

    /// Convert (or with `bitcast`, reinterpret) `src` of type `from` into `dest` of type `to`.
    /// `pred` is set when the result feeds a branch predicate.
    fn render_cast(
        &self,
        dest: &str,
        src: &str,
        to: DType,
        from: DType,
        bitcast: bool,
        pred: bool,
    ) -> LowerResult<Vec<String>>;

    /// Assemble the final kernel text.
    fn render_kernel(
        &self,
        kernel: &[String],
        function_name: &str,
        params: &[(String, DType)],
        regs: &[RegGroup],
    ) -> LowerResult<String>;

    /// Memory-operand type name of `dtype` for loads and stores.
    fn mem_type(&self, dtype: DType) -> LowerResult<&'static str>;

    /// State-space qualifier appended to load/store mnemonics.
    fn state_space(&self, space: Option<AddrSpace>) -> &'static str;
}
