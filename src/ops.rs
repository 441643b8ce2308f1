// This module defines the closed opcode set of the kernel graph (UOp), the ALU operator set
// with its arity and comparison flag (AluOp), and the literal values CONST and DEFINE_ACC
// nodes carry (ConstValue). Opcode and operator names match the listing format so they can be
// parsed and printed by name. Effect opcodes (stores, loop/branch markers, barriers) are the
// ones allowed to have no result type.

//! Opcode and operator surface of the kernel graph.

use std::fmt;

/// Closed set of graph opcodes understood by the lowering pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UOp {
    DefineGlobal,
    DefineVar,
    DefineLocal,
    DefineAcc,
    Special,
    Const,
    Load,
    Store,
    Alu,
    Cast,
    Bitcast,
    Gep,
    Phi,
    Loop,
    EndLoop,
    If,
    EndIf,
    Barrier,
}

impl UOp {
    pub const ALL: [UOp; 18] = [
        UOp::DefineGlobal,
        UOp::DefineVar,
        UOp::DefineLocal,
        UOp::DefineAcc,
        UOp::Special,
        UOp::Const,
        UOp::Load,
        UOp::Store,
        UOp::Alu,
        UOp::Cast,
        UOp::Bitcast,
        UOp::Gep,
        UOp::Phi,
        UOp::Loop,
        UOp::EndLoop,
        UOp::If,
        UOp::EndIf,
        UOp::Barrier,
    ];

    pub const fn name(self) -> &'static str {
        use UOp::*;
        match self {
            DefineGlobal => "DEFINE_GLOBAL",
            DefineVar => "DEFINE_VAR",
            DefineLocal => "DEFINE_LOCAL",
            DefineAcc => "DEFINE_ACC",
            Special => "SPECIAL",
            Const => "CONST",
            Load => "LOAD",
            Store => "STORE",
            Alu => "ALU",
            Cast => "CAST",
            Bitcast => "BITCAST",
            Gep => "GEP",
            Phi => "PHI",
            Loop => "LOOP",
            EndLoop => "ENDLOOP",
            If => "IF",
            EndIf => "ENDIF",
            Barrier => "BARRIER",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == s)
    }

    /// Opcodes that never produce a value.
    pub const fn is_effect(self) -> bool {
        matches!(self, UOp::Store | UOp::EndLoop | UOp::If | UOp::EndIf | UOp::Barrier)
    }
}

impl fmt::Display for UOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Unary, binary and ternary ALU operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    Neg,
    Exp2,
    Log2,
    Sin,
    Sqrt,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Max,
    Xor,
    CmpLt,
    CmpEq,
    Where,
}

impl AluOp {
    pub const ALL: [AluOp; 15] = [
        AluOp::Neg,
        AluOp::Exp2,
        AluOp::Log2,
        AluOp::Sin,
        AluOp::Sqrt,
        AluOp::Add,
        AluOp::Sub,
        AluOp::Mul,
        AluOp::Div,
        AluOp::Mod,
        AluOp::Max,
        AluOp::Xor,
        AluOp::CmpLt,
        AluOp::CmpEq,
        AluOp::Where,
    ];

    pub const fn arity(self) -> usize {
        use AluOp::*;
        match self {
            Neg | Exp2 | Log2 | Sin | Sqrt => 1,
            Add | Sub | Mul | Div | Mod | Max | Xor | CmpLt | CmpEq => 2,
            Where => 3,
        }
    }

    /// Comparisons produce a boolean but are rendered with the operand type.
    pub const fn is_comparison(self) -> bool {
        matches!(self, AluOp::CmpLt | AluOp::CmpEq)
    }

    pub const fn name(self) -> &'static str {
        use AluOp::*;
        match self {
            Neg => "neg",
            Exp2 => "exp2",
            Log2 => "log2",
            Sin => "sin",
            Sqrt => "sqrt",
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            Div => "div",
            Mod => "mod",
            Max => "max",
            Xor => "xor",
            CmpLt => "cmplt",
            CmpEq => "cmpeq",
            Where => "where",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == s)
    }
}

impl fmt::Display for AluOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Literal payload of CONST and DEFINE_ACC nodes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstValue {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl ConstValue {
    pub fn as_f64(self) -> f64 {
        match self {
            ConstValue::Int(v) => v as f64,
            ConstValue::Float(v) => v,
            ConstValue::Bool(v) => f64::from(u8::from(v)),
        }
    }

    /// Integer view; floats truncate toward zero.
    pub fn as_i64(self) -> i64 {
        match self {
            ConstValue::Int(v) => v,
            ConstValue::Float(v) => v as i64,
            ConstValue::Bool(v) => i64::from(v),
        }
    }

    pub fn is_truthy(self) -> bool {
        match self {
            ConstValue::Int(v) => v != 0,
            ConstValue::Float(v) => v != 0.0,
            ConstValue::Bool(v) => v,
        }
    }
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Int(v) => write!(f, "{v}"),
            ConstValue::Float(v) if v.fract() == 0.0 && v.is_finite() => write!(f, "{v:.1}"),
            ConstValue::Float(v) => write!(f, "{v}"),
            ConstValue::Bool(v) => write!(f, "{v}"),
        }
    }
}
