//! Behaviour of the rewrite pass, checked by evaluating the rewritten graph
//! and by inspecting the PTX it lowers to.

use uopasm::dtype::{BOOL, FLOAT32, INT32, INT8};
use uopasm::graph::{Arg, KernelGraph, NodeId};
use uopasm::ops::{AluOp, ConstValue, UOp};
use uopasm::{pretransform, uops_to_asm, PtxBackend};

/// Boolean interpreter for the operators the rewrite pass produces.
///
/// Comparisons are deliberately unsupported: after the pass none may remain.
fn eval(graph: &KernelGraph, id: NodeId) -> bool {
    let node = graph.node(id);
    match node.op {
        UOp::Const => node.const_value().expect("literal").is_truthy(),
        UOp::Alu => {
            let v: Vec<bool> = node.src.iter().map(|&s| eval(graph, s)).collect();
            match node.alu_op().expect("operator") {
                AluOp::Neg => !v[0],
                AluOp::Xor => v[0] ^ v[1],
                AluOp::Mul => v[0] && v[1],
                AluOp::Add => v[0] || v[1],
                op => panic!("{op} left in rewritten graph"),
            }
        }
        op => panic!("cannot evaluate {op}"),
    }
}

/// `data0[0] = a <op> b` for boolean literals; returns the graph and the store.
fn compare_kernel(op: AluOp, a: bool, b: bool) -> (KernelGraph, NodeId) {
    let mut g = KernelGraph::new();
    let buf = g.define_global(0, "data0", BOOL);
    let a = g.constant(BOOL, ConstValue::Bool(a));
    let b = g.constant(BOOL, ConstValue::Bool(b));
    let r = g.alu(op, BOOL, vec![a, b]);
    let zero = g.constant(INT32, ConstValue::Int(0));
    let st = g.store(vec![buf, zero, r]);
    (g, st)
}

#[test]
fn test_bool_less_than_truth_table() {
    for (a, b) in [(false, false), (false, true), (true, false), (true, true)] {
        let (mut g, st) = compare_kernel(AluOp::CmpLt, a, b);
        pretransform(&mut g).unwrap();
        let result = g.node(st).src[2];
        assert_eq!(eval(&g, result), !a && b, "{a} < {b}");
        assert_eq!(g.node(result).alu_op(), Some(AluOp::Mul));
    }
}

#[test]
fn test_bool_equality_truth_table() {
    for (a, b) in [(false, false), (false, true), (true, false), (true, true)] {
        let (mut g, st) = compare_kernel(AluOp::CmpEq, a, b);
        pretransform(&mut g).unwrap();
        let result = g.node(st).src[2];
        assert_eq!(eval(&g, result), a == b, "{a} == {b}");
        assert_eq!(g.node(result).alu_op(), Some(AluOp::Neg));
    }
}

#[test]
fn test_bool_compares_lower_to_predicate_logic() {
    let (mut g, _) = compare_kernel(AluOp::CmpLt, false, true);
    let asm = uops_to_asm(&PtxBackend::new(), "lt", &mut g).unwrap();
    assert!(asm.contains("not.pred\t%alu_pred_0, %const_pred_0;"));
    assert!(asm.contains("and.pred\t%alu_pred_1, %alu_pred_0, %const_pred_1;"));
    assert!(!asm.contains("setp.lt"));

    let (mut g, _) = compare_kernel(AluOp::CmpEq, true, true);
    let asm = uops_to_asm(&PtxBackend::new(), "eq", &mut g).unwrap();
    assert!(asm.contains("xor.pred\t%alu_pred_0, %const_pred_0, %const_pred_1;"));
    assert!(asm.contains("not.pred\t%alu_pred_1, %alu_pred_0;"));
    assert!(asm.contains("selp.b16\t%cast_s16_0, 1, 0, %alu_pred_1;"));
    assert!(asm.contains("st.global.s8\t[%dat_u64_0+0], %cast_s16_0;"));
    assert!(!asm.contains("setp.eq"));
}

fn count(asm: &str, mnemonic: &str) -> usize {
    asm.lines().filter(|l| l.trim_start().starts_with(mnemonic)).count()
}

/// `data0[idx]` loaded from a buffer of `elem`, indexed by the group id or a literal.
fn load_kernel(elem: uopasm::DType, literal_index: Option<i64>) -> String {
    let mut g = KernelGraph::new();
    let buf = g.define_global(0, "data0", elem);
    let idx = match literal_index {
        Some(i) => g.constant(INT32, ConstValue::Int(i)),
        None => g.push(UOp::Special, Some(INT32), vec![], Arg::Special { axis: 0, name: "gidx0".into() }),
    };
    g.load(elem, vec![buf, idx]);
    uops_to_asm(&PtxBackend::new(), "load", &mut g).unwrap()
}

#[test]
fn test_dynamic_index_scaled_and_widened() {
    let asm = load_kernel(FLOAT32, None);
    assert_eq!(count(&asm, "mul.lo.s32"), 1);
    assert_eq!(count(&asm, "cvt.u64.s32"), 1);
    assert_eq!(count(&asm, "add.u64"), 1);
    assert!(asm.contains("mov.b32\t\t%const_s32_0, 4;"));
    assert!(asm.contains("mul.lo.s32\t%alu_s32_0, %gidx0, %const_s32_0;"));
    assert!(asm.contains("ld.global.f32\t%val_f32_0, [%alu_u64_0+0];"));
}

#[test]
fn test_byte_index_not_scaled() {
    let asm = load_kernel(INT8, None);
    assert_eq!(count(&asm, "mul"), 0);
    assert_eq!(count(&asm, "cvt.u64.s32"), 1);
    assert_eq!(count(&asm, "add.u64"), 1);
    assert!(asm.contains("cvt.u64.s32\t%cast_u64_0, %gidx0;"));
    assert!(asm.contains("ld.global.s8\t%val_s16_0, [%alu_u64_0+0];"));
}

#[test]
fn test_literal_index_folds_into_offset() {
    let asm = load_kernel(FLOAT32, Some(5));
    assert!(asm.contains("ld.global.f32\t%val_f32_0, [%dat_u64_0+20];"));
    assert_eq!(count(&asm, "mul"), 0);
    assert_eq!(count(&asm, "cvt"), 0);
    assert_eq!(count(&asm, "add"), 0);
    assert_eq!(count(&asm, "mov"), 0);

    let asm = load_kernel(INT8, Some(5));
    assert!(asm.contains("ld.global.s8\t%val_s16_0, [%dat_u64_0+5];"));
}

#[test]
fn test_shared_memory_access() {
    let mut g = KernelGraph::new();
    let local = g.push(UOp::DefineLocal, Some(FLOAT32), vec![], Arg::Local { name: "temp".into(), size: 16 });
    let idx = g.constant(INT32, ConstValue::Int(2));
    let val = g.constant(FLOAT32, ConstValue::Float(1.0));
    g.store(vec![local, idx, val]);
    g.push(UOp::Barrier, None, vec![], Arg::None);
    g.load(FLOAT32, vec![local, idx]);

    let asm = uops_to_asm(&PtxBackend::new(), "shared", &mut g).unwrap();
    assert!(asm.contains(".shared\t\t.align 4 .b8 temp[64];"));
    assert!(asm.contains("mov.u64\t\t%local_u64_0, temp[0];"));
    assert!(asm.contains("st.shared.f32\t[%local_u64_0+8], %const_f32_0;"));
    assert!(asm.contains("bar.sync\t0;"));
    assert!(asm.contains("ld.shared.f32\t%val_f32_0, [%local_u64_0+8];"));
}
