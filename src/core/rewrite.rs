// This module implements the peephole pass that runs before lowering. PTX has no boolean
// memory type, addresses memory in bytes through 64-bit pointers and has no direct forms for
// some boolean comparisons, so a few node shapes are rewritten in place first. Rules are an
// ordered list of guarded functions; the first rule whose guard matches a node is applied and
// no other rule is tried for that node. A rule may return a replacement node, in which case
// every later operand reference to the original is redirected to it. The sweep visits each
// node of the original order exactly once; nodes inserted by a rule are never matched.

//! Peephole pre-transform of the kernel graph.

use log::{debug, trace};

use super::error::{LowerError, LowerResult};
use crate::dtype::{DType, BOOL, INT32, UINT64, UINT8};
use crate::graph::{AddrSpace, Arg, KernelGraph, NodeId, Position};
use crate::ops::{AluOp, ConstValue, UOp};

type Guard = fn(&KernelGraph, NodeId) -> bool;
type Apply = fn(&mut KernelGraph, NodeId) -> LowerResult<Option<NodeId>>;

struct RewriteRule {
    name: &'static str,
    guard: Guard,
    apply: Apply,
}

const RULES: &[RewriteRule] = &[
    RewriteRule { name: "bool_cmpeq", guard: is_bool_cmpeq, apply: bool_cmpeq },
    RewriteRule { name: "bool_cmplt", guard: is_bool_cmplt, apply: bool_cmplt },
    RewriteRule { name: "bool_load_bool_default", guard: is_bool_load_bool_default, apply: bool_load_bool_default },
    RewriteRule { name: "bool_load_gated", guard: is_bool_load_gated, apply: bool_load },
    RewriteRule { name: "bool_load", guard: is_bool_load, apply: bool_load },
    RewriteRule { name: "store_address", guard: is_store, apply: address_only },
    RewriteRule { name: "load_address", guard: is_load, apply: address_only },
];

/// Rewrite `graph` in place. Returns the number of rules applied.
pub fn pretransform(graph: &mut KernelGraph) -> LowerResult<usize> {
    let visit: Vec<NodeId> = graph.order().to_vec();
    let mut replace: Vec<(NodeId, NodeId)> = Vec::new();
    let mut applied = 0;

    for id in visit {
        for &(old, new) in &replace {
            if id == new {
                continue;
            }
            for src in graph.node_mut(id).src.iter_mut() {
                if *src == old {
                    *src = new;
                }
            }
        }

        if let Some(rule) = RULES.iter().find(|rule| (rule.guard)(&*graph, id)) {
            trace!("rewrite {} on {}", rule.name, id);
            applied += 1;
            if let Some(new) = (rule.apply)(graph, id)? {
                debug!("{} replaced by {} ({})", id, new, rule.name);
                replace.push((id, new));
            }
        }
    }

    debug!("pretransform: {applied} rewrites over {} nodes", graph.len());
    Ok(applied)
}

fn operand_dtype(graph: &KernelGraph, id: NodeId, i: usize) -> Option<DType> {
    let src = *graph.node(id).src.get(i)?;
    graph.get(src)?.dtype
}

fn is_bool_cmpeq(graph: &KernelGraph, id: NodeId) -> bool {
    graph.node(id).alu_op() == Some(AluOp::CmpEq) && operand_dtype(graph, id, 0) == Some(BOOL)
}

fn is_bool_cmplt(graph: &KernelGraph, id: NodeId) -> bool {
    graph.node(id).alu_op() == Some(AluOp::CmpLt) && operand_dtype(graph, id, 0) == Some(BOOL)
}

fn is_bool_load(graph: &KernelGraph, id: NodeId) -> bool {
    let node = graph.node(id);
    node.op == UOp::Load && node.dtype == Some(BOOL) && node.src.len() == 2
}

fn is_bool_load_gated(graph: &KernelGraph, id: NodeId) -> bool {
    let node = graph.node(id);
    node.op == UOp::Load && node.dtype == Some(BOOL) && node.src.len() == 4
}

fn is_bool_load_bool_default(graph: &KernelGraph, id: NodeId) -> bool {
    is_bool_load_gated(graph, id) && operand_dtype(graph, id, 3) == Some(BOOL)
}

fn is_store(graph: &KernelGraph, id: NodeId) -> bool {
    graph.node(id).op == UOp::Store
}

fn is_load(graph: &KernelGraph, id: NodeId) -> bool {
    graph.node(id).op == UOp::Load
}

/// `a == b` on booleans becomes `not (a xor b)`.
fn bool_cmpeq(graph: &mut KernelGraph, root: NodeId) -> LowerResult<Option<NodeId>> {
    graph.node_mut(root).arg = Arg::Alu(AluOp::Xor);
    let not = graph.add(Position::After(root), UOp::Alu, Some(BOOL), vec![root], Arg::Alu(AluOp::Neg));
    Ok(Some(not))
}

/// `a < b` on booleans becomes `(not a) and b`, computed by `root` itself.
fn bool_cmplt(graph: &mut KernelGraph, root: NodeId) -> LowerResult<Option<NodeId>> {
    let a = graph.node(root).src[0];
    let not = graph.add(Position::Before(root), UOp::Alu, Some(BOOL), vec![a], Arg::Alu(AluOp::Neg));
    let node = graph.node_mut(root);
    node.src[0] = not;
    node.arg = Arg::Alu(AluOp::Mul);
    Ok(None)
}

/// Gated boolean load whose default is itself a boolean: narrow the default to 8 bits first.
fn bool_load_bool_default(graph: &mut KernelGraph, root: NodeId) -> LowerResult<Option<NodeId>> {
    let alt = graph.node(root).src[3];
    let alt8 = graph.add(Position::Before(root), UOp::Cast, Some(UINT8), vec![alt], Arg::None);
    graph.node_mut(root).src[3] = alt8;
    bool_load(graph, root)
}

/// Load the boolean as a byte and compare it against zero.
fn bool_load(graph: &mut KernelGraph, root: NodeId) -> LowerResult<Option<NodeId>> {
    graph.node_mut(root).dtype = Some(UINT8);
    let truth = graph.add(Position::After(root), UOp::Cast, Some(BOOL), vec![root], Arg::None);
    pointer_arithmetic(graph, root)?;
    Ok(Some(truth))
}

fn address_only(graph: &mut KernelGraph, root: NodeId) -> LowerResult<Option<NodeId>> {
    pointer_arithmetic(graph, root)?;
    Ok(None)
}

/// Turn the element index of a load/store into a byte offset.
///
/// Constant offsets stay as the node's offset operand. Anything else is
/// widened to 64 bits and added to the base pointer, leaving a zero offset.
fn pointer_arithmetic(graph: &mut KernelGraph, root: NodeId) -> LowerResult<()> {
    let (buf, idx) = match graph.node(root).src[..] {
        [buf, idx, ..] => (buf, idx),
        _ => return Err(LowerError::malformed(root, "memory access needs a buffer and an index")),
    };
    let base = graph.get(buf).ok_or_else(|| LowerError::malformed(root, "buffer operand out of range"))?;
    let space = if base.op == UOp::DefineLocal { AddrSpace::Shared } else { AddrSpace::Global };
    let elem = base.dtype.ok_or(LowerError::MissingType { node: buf, op: base.op })?;
    graph.node_mut(root).arg = Arg::Space(space);

    let size = elem.itemsize();
    let offset = if size > 1 {
        match graph.node(idx).const_value() {
            Some(c) => {
                let bytes = i64::try_from(size)
                    .ok()
                    .and_then(|size| c.as_i64().checked_mul(size))
                    .ok_or_else(|| LowerError::malformed(root, format!("byte offset of index {c} overflows")))?;
                graph.add(Position::Before(root), UOp::Const, Some(INT32), vec![], Arg::Const(ConstValue::Int(bytes)))
            }
            None => {
                let scale = graph.add(
                    Position::Before(root),
                    UOp::Const,
                    Some(INT32),
                    vec![],
                    Arg::Const(ConstValue::Int(size as i64)),
                );
                graph.add(Position::Before(root), UOp::Alu, Some(INT32), vec![idx, scale], Arg::Alu(AluOp::Mul))
            }
        }
    } else {
        idx
    };

    if graph.node(offset).op == UOp::Const {
        graph.node_mut(root).src[1] = offset;
        return Ok(());
    }

    let zero = graph.add(Position::Before(root), UOp::Const, Some(INT32), vec![], Arg::Const(ConstValue::Int(0)));
    let wide = graph.add(Position::Before(root), UOp::Cast, Some(UINT64), vec![offset], Arg::None);
    let addr = graph.add(Position::Before(root), UOp::Alu, Some(UINT64), vec![buf, wide], Arg::Alu(AluOp::Add));
    let node = graph.node_mut(root);
    node.src[0] = addr;
    node.src[1] = zero;
    Ok(())
}
