// This module defines the kernel graph the whole pipeline operates on. Nodes are stored in an
// append-only arena and addressed by NodeId handles that never move, while a separate order
// list records emission order. The peephole pass inserts nodes before or after existing ones;
// each insertion looks the anchor up in the current order list, so a run of insertions around
// the same node lands in the order it was issued. Node carries the opcode, optional result
// type, operand handles and an opcode-specific Arg payload. A few builder helpers cover the
// node shapes tests and callers construct most often.

//! Kernel graph: the linearized UOp sequence of one GPU kernel.
//!
//! Nodes live in an arena addressed by stable [`NodeId`] handles. A separate
//! order list gives the emission order, which is also dataflow order:
//! operands always refer to nodes placed earlier. Insertion splices a new
//! handle into the order list at the anchor's position as it is *at that
//! moment*, so consecutive insertions around the same node stack up the way
//! the peephole pass expects.

use std::fmt;

use crate::dtype::DType;
use crate::ops::{AluOp, ConstValue, UOp};

/// Stable handle of a node in a [`KernelGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Memory region addressed by a load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrSpace {
    Global,
    Shared,
    Param,
}

impl AddrSpace {
    pub const fn name(self) -> &'static str {
        match self {
            AddrSpace::Global => "global",
            AddrSpace::Shared => "shared",
            AddrSpace::Param => "param",
        }
    }
}

/// Opcode-specific payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    None,
    /// ALU operator.
    Alu(AluOp),
    /// CONST / DEFINE_ACC literal.
    Const(ConstValue),
    /// SPECIAL: axis index and register name (`gidx0`, `lidx1`).
    Special { axis: usize, name: String },
    /// DEFINE_GLOBAL: buffer index and parameter name.
    Global { index: usize, name: String },
    /// DEFINE_VAR: parameter name.
    Var { name: String },
    /// DEFINE_LOCAL: symbol name and element count.
    Local { name: String, size: usize },
    /// GEP lane index.
    Lane(usize),
    /// LOAD / STORE address space, attached by the peephole pass.
    Space(AddrSpace),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub op: UOp,
    pub dtype: Option<DType>,
    pub src: Vec<NodeId>,
    pub arg: Arg,
}

impl Node {
    pub fn new(op: UOp, dtype: Option<DType>, src: Vec<NodeId>, arg: Arg) -> Self {
        Self { op, dtype, src, arg }
    }

    pub fn alu_op(&self) -> Option<AluOp> {
        match self.arg {
            Arg::Alu(op) if self.op == UOp::Alu => Some(op),
            _ => None,
        }
    }

    pub fn const_value(&self) -> Option<ConstValue> {
        match self.arg {
            Arg::Const(v) if self.op == UOp::Const => Some(v),
            _ => None,
        }
    }
}

/// Where to place a node relative to an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    End,
    Before(NodeId),
    After(NodeId),
}

#[derive(Debug, Clone, Default)]
pub struct KernelGraph {
    nodes: Vec<Node>,
    order: Vec<NodeId>,
}

impl KernelGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes in emission order.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.order.iter().map(move |&id| (id, self.node(id)))
    }

    /// Current position of `id` in emission order.
    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.order.iter().position(|&n| n == id)
    }

    /// Add a node at `at`. Anchors are resolved against the current order.
    ///
    /// # Panics
    ///
    /// Panics if the anchor is not part of the graph.
    pub fn add(&mut self, at: Position, op: UOp, dtype: Option<DType>, src: Vec<NodeId>, arg: Arg) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node::new(op, dtype, src, arg));
        let idx = match at {
            Position::End => self.order.len(),
            Position::Before(anchor) => self.position(anchor).expect("insertion anchor not in graph"),
            Position::After(anchor) => self.position(anchor).expect("insertion anchor not in graph") + 1,
        };
        self.order.insert(idx, id);
        id
    }

    pub fn push(&mut self, op: UOp, dtype: Option<DType>, src: Vec<NodeId>, arg: Arg) -> NodeId {
        self.add(Position::End, op, dtype, src, arg)
    }

    pub fn define_global(&mut self, index: usize, name: &str, elem: DType) -> NodeId {
        self.push(
            UOp::DefineGlobal,
            Some(DType::ptr(elem)),
            vec![],
            Arg::Global { index, name: name.to_string() },
        )
    }

    pub fn constant(&mut self, dtype: DType, value: ConstValue) -> NodeId {
        self.push(UOp::Const, Some(dtype), vec![], Arg::Const(value))
    }

    pub fn alu(&mut self, op: AluOp, dtype: DType, src: Vec<NodeId>) -> NodeId {
        self.push(UOp::Alu, Some(dtype), src, Arg::Alu(op))
    }

    pub fn load(&mut self, dtype: DType, src: Vec<NodeId>) -> NodeId {
        self.push(UOp::Load, Some(dtype), src, Arg::None)
    }

    pub fn store(&mut self, src: Vec<NodeId>) -> NodeId {
        self.push(UOp::Store, None, src, Arg::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::{FLOAT32, INT32};

    #[test]
    fn test_insert_resolves_position_each_call() {
        let mut g = KernelGraph::new();
        let a = g.constant(INT32, ConstValue::Int(1));
        let b = g.constant(INT32, ConstValue::Int(2));

        let x = g.add(Position::Before(b), UOp::Const, Some(INT32), vec![], Arg::Const(ConstValue::Int(3)));
        let y = g.add(Position::Before(b), UOp::Const, Some(INT32), vec![], Arg::Const(ConstValue::Int(4)));
        let z = g.add(Position::After(a), UOp::Const, Some(INT32), vec![], Arg::Const(ConstValue::Int(5)));

        assert_eq!(g.order(), &[a, z, x, y, b]);
        assert_eq!(g.position(b), Some(4));
    }

    #[test]
    fn test_handles_stay_stable() {
        let mut g = KernelGraph::new();
        let buf = g.define_global(0, "data0", FLOAT32);
        let idx = g.constant(INT32, ConstValue::Int(0));
        let ld = g.load(FLOAT32, vec![buf, idx]);
        g.add(Position::Before(buf), UOp::Barrier, None, vec![], Arg::None);

        assert_eq!(g.node(ld).src, vec![buf, idx]);
        assert_eq!(g.node(buf).dtype, Some(DType::ptr(FLOAT32)));
        assert_eq!(g.len(), 4);
    }
}
