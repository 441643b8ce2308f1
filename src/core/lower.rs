// This module is the lowering engine. It walks the pre-transformed kernel graph once, in
// order, and turns each node into instruction text through an AsmBackend. Every value gets
// exactly one symbolic register (or one per lane for vectors) the first time it is produced;
// registers are never reused or coloured. Labels are recorded for LOOP and IF nodes so the
// matching ENDLOOP/ENDIF can find them. DEFINE_GLOBAL and DEFINE_VAR nodes build the ordered
// parameter list. Vector loads and stores are emitted directly as `.v<N>` forms; scalar
// memory access, casts, constants, locals, loops and branches are delegated to the backend.
// Half-precision ALU operations that the target cannot do natively are computed in f32 and
// converted back. When the walk is done the backend assembles the kernel text from the
// collected lines, the parameter list and the register usage counts.

//! Graph to assembly lowering.

use bumpalo::Bump;
use hashbrown::HashSet;
use log::{debug, trace};

use super::backend::{AsmBackend, IsaFacts};
use super::error::{LowerError, LowerResult};
use super::rewrite::pretransform;
use super::session::{Binding, LoweringSession};
use crate::dtype::{DType, BOOL, FLOAT16, FLOAT32, INT16, INT32, UINT64};
use crate::graph::{AddrSpace, Arg, KernelGraph, Node, NodeId};
use crate::ops::{AluOp, ConstValue, UOp};

/// Run the peephole pass on `graph`, then lower it to assembly text.
pub fn uops_to_asm<B: AsmBackend + ?Sized>(
    backend: &B,
    function_name: &str,
    graph: &mut KernelGraph,
) -> LowerResult<String> {
    let rewrites = pretransform(graph)?;
    let arena = Bump::new();
    let mut lowerer = Lowerer::new(backend, graph, &arena);
    lowerer.session.record_rewrites(rewrites);
    lowerer.run(function_name)
}

/// Lower an already pre-transformed graph.
pub fn render<B: AsmBackend + ?Sized>(backend: &B, function_name: &str, graph: &KernelGraph) -> LowerResult<String> {
    let arena = Bump::new();
    Lowerer::new(backend, graph, &arena).run(function_name)
}

struct Lowerer<'a, 'arena, B: ?Sized> {
    backend: &'a B,
    isa: &'a IsaFacts,
    graph: &'a KernelGraph,
    session: LoweringSession<'arena>,
    kernel: Vec<String>,
    /// Declarations of named special registers, placed ahead of the body.
    specials: Vec<String>,
    /// Constants rendered inline, never materialized.
    immediates: HashSet<NodeId>,
}

impl<'a, 'arena, B: AsmBackend + ?Sized> Lowerer<'a, 'arena, B> {
    fn new(backend: &'a B, graph: &'a KernelGraph, arena: &'arena Bump) -> Self {
        Self {
            backend,
            isa: backend.isa(),
            graph,
            session: LoweringSession::new(arena),
            kernel: Vec::new(),
            specials: Vec::new(),
            immediates: immediate_constants(graph),
        }
    }

    fn run(mut self, function_name: &str) -> LowerResult<String> {
        debug!("lowering kernel {} ({} nodes)", function_name, self.graph.len());

        let graph = self.graph;
        for &id in graph.order() {
            let node = graph.node(id);
            trace!("{} = {} {:?}", id, node.op, node.dtype);
            self.lower_node(id, node)?;
            self.session.record_node_lowered();
        }

        let mut lines = std::mem::take(&mut self.specials);
        lines.append(&mut self.kernel);
        let params = self.session.params();
        debug!("kernel {}: {} parameters\n{}", function_name, params.len(), self.session.stats());
        self.backend
            .render_kernel(&lines, function_name, params, &self.session.reg_groups())
    }

    fn kk<I: IntoIterator<Item = String>>(&mut self, lines: I) {
        let before = self.kernel.len();
        self.kernel.extend(lines);
        for line in &self.kernel[before..] {
            trace!("  {line}");
        }
        self.session.record_lines(self.kernel.len() - before);
    }

    fn ty(&self, dtype: DType) -> LowerResult<&'static str> {
        self.isa.type_name(dtype)
    }

    fn dtype_of(&self, id: NodeId) -> LowerResult<DType> {
        let node = self.graph.node(id);
        node.dtype.ok_or(LowerError::MissingType { node: id, op: node.op })
    }

    fn src(&self, id: NodeId, node: &Node, i: usize) -> LowerResult<NodeId> {
        node.src
            .get(i)
            .copied()
            .ok_or_else(|| LowerError::malformed(id, format!("{} expects operand {}", node.op, i)))
    }

    /// Allocate a register for `node` (or an anonymous one) in `category`.
    fn ssa(&mut self, node: Option<NodeId>, category: &str, ty: &str) -> LowerResult<&'arena str> {
        let reg = self.session.fresh_reg(category, ty);
        if let Some(node) = node {
            self.session.bind(node, Binding::Scalar(reg))?;
        }
        Ok(reg)
    }

    /// A constant operand: inline literal, or a register when forced or required.
    fn constant(&mut self, value: ConstValue, dtype: DType, force: bool) -> LowerResult<&'arena str> {
        if force || self.isa.const_requires_mov(dtype) {
            let dest = self.session.fresh_reg("const", self.ty(dtype)?);
            let lines = self.backend.render_const_into(dest, value, dtype)?;
            self.kk(lines);
            Ok(dest)
        } else {
            let literal = self.backend.render_const(value, dtype)?;
            Ok(self.session.intern(&literal))
        }
    }

    fn cast(
        &mut self,
        src: &'arena str,
        to: DType,
        from: DType,
        bitcast: bool,
        node: Option<NodeId>,
        pred: bool,
    ) -> LowerResult<&'arena str> {
        if to == from {
            if let Some(node) = node {
                self.session.bind(node, Binding::Scalar(src))?;
            }
            return Ok(src);
        }
        let dest = self.ssa(node, "cast", self.ty(to)?)?;
        let lines = self.backend.render_cast(dest, src, to, from, bitcast, pred)?;
        self.kk(lines);
        Ok(dest)
    }

    fn mov_suffix(&self, dtype: DType) -> LowerResult<String> {
        let ty = self.ty(dtype)?;
        Ok(if dtype.is_bool() { ty.to_string() } else { format!("b{}", &ty[1..]) })
    }

    fn offset_of(&self, id: NodeId, node: &Node) -> LowerResult<i64> {
        let off = self.src(id, node, 1)?;
        self.graph
            .node(off)
            .const_value()
            .map(ConstValue::as_i64)
            .ok_or_else(|| LowerError::malformed(id, "memory offset operand is not a constant"))
    }

    fn space_of(node: &Node) -> Option<AddrSpace> {
        match node.arg {
            Arg::Space(space) => Some(space),
            _ => None,
        }
    }

    fn lower_node(&mut self, id: NodeId, node: &'a Node) -> LowerResult<()> {
        let dtype = match node.dtype {
            Some(dtype) => dtype,
            None if node.op.is_effect() => BOOL,
            None => return Err(LowerError::MissingType { node: id, op: node.op }),
        };

        match node.op {
            UOp::If => self.lower_if(id, node),
            UOp::Barrier => {
                if !self.isa.barrier.is_empty() {
                    self.kk([self.isa.barrier.clone()]);
                }
                Ok(())
            }
            UOp::EndLoop => self.lower_endloop(id, node),
            UOp::EndIf => {
                let label = self.session.label(self.src(id, node, 0)?)?;
                self.kk([format!("{label}:")]);
                Ok(())
            }
            UOp::Store => self.lower_store(id, node),
            UOp::Loop => {
                let idx = self.ssa(Some(id), "ridx", self.ty(dtype)?)?;
                let start = self.session.reg(self.src(id, node, 0)?)?;
                let label = self.session.fresh_label(id, &self.isa.label_prefix, "loop");
                let lines = self.backend.render_loop(idx, start, label);
                self.kk(lines);
                Ok(())
            }
            UOp::Alu => self.lower_alu(id, node, dtype),
            UOp::DefineAcc => {
                let value = match node.arg {
                    Arg::Const(value) => value,
                    _ => return Err(LowerError::malformed(id, "DEFINE_ACC needs a literal")),
                };
                let scalar = dtype.scalar();
                let mov = self.mov_suffix(scalar)?;
                if dtype.count > 1 {
                    let lanes = self.session.fresh_lanes("acc", self.ty(scalar)?, dtype.count);
                    for lane in lanes {
                        let init = self.constant(value, scalar, false)?;
                        self.kk([format!("mov.{mov} {lane}, {init};")]);
                    }
                    self.session.bind(id, Binding::Lanes(lanes))
                } else {
                    let acc = self.ssa(Some(id), "acc", self.ty(dtype)?)?;
                    let init = self.constant(value, dtype, false)?;
                    self.kk([format!("mov.{mov} {acc}, {init};")]);
                    Ok(())
                }
            }
            UOp::Special => self.lower_special(id, node),
            UOp::Const => {
                let value = node
                    .const_value()
                    .ok_or_else(|| LowerError::malformed(id, "CONST needs a literal"))?;
                if self.immediates.contains(&id) {
                    let literal = self.backend.render_const(value, dtype)?;
                    let literal = self.session.intern(&literal);
                    self.session.bind(id, Binding::Scalar(literal))
                } else if dtype.count > 1 {
                    let mut lanes = Vec::with_capacity(dtype.count);
                    for _ in 0..dtype.count {
                        lanes.push(self.constant(value, dtype.scalar(), true)?);
                    }
                    let lanes = self.session.lanes_of(&lanes);
                    self.session.bind(id, Binding::Lanes(lanes))
                } else {
                    let reg = self.constant(value, dtype, true)?;
                    self.session.bind(id, Binding::Scalar(reg))
                }
            }
            UOp::Gep => {
                let lane = match node.arg {
                    Arg::Lane(lane) => lane,
                    _ => return Err(LowerError::malformed(id, "GEP needs a lane index")),
                };
                let lanes = self.session.lanes(self.src(id, node, 0)?)?;
                let reg = *lanes
                    .get(lane)
                    .ok_or_else(|| LowerError::malformed(id, format!("lane {lane} out of range")))?;
                self.session.bind(id, Binding::Scalar(reg))
            }
            UOp::Load => self.lower_load(id, node, dtype),
            UOp::Phi => {
                let acc = self.src(id, node, 0)?;
                let val = self.src(id, node, 1)?;
                let mov = self.mov_suffix(dtype.scalar())?;
                match (self.session.binding(acc)?, self.session.binding(val)?) {
                    (Binding::Lanes(dst), Binding::Lanes(src)) if dst.len() == src.len() => {
                        self.kk(dst.iter().zip(src).map(|(d, s)| format!("mov.{mov} {d}, {s};")));
                    }
                    (Binding::Scalar(dst), Binding::Scalar(src)) => {
                        self.kk([format!("mov.{mov} {dst}, {src};")]);
                    }
                    _ => return Err(LowerError::malformed(id, "PHI operands disagree in width")),
                }
                let binding = self.session.binding(acc)?;
                self.session.bind(id, binding)
            }
            UOp::Cast | UOp::Bitcast => {
                if dtype.count > 1 {
                    let mut lanes = Vec::with_capacity(node.src.len());
                    for &src in &node.src {
                        lanes.push(self.session.reg(src)?);
                    }
                    let lanes = self.session.lanes_of(&lanes);
                    self.session.bind(id, Binding::Lanes(lanes))
                } else {
                    let src = self.src(id, node, 0)?;
                    let from = self.dtype_of(src)?;
                    let reg = self.session.reg(src)?;
                    self.cast(reg, dtype, from, node.op == UOp::Bitcast, Some(id), false)?;
                    Ok(())
                }
            }
            UOp::DefineLocal => {
                let (name, size) = match &node.arg {
                    Arg::Local { name, size } => (name.as_str(), *size),
                    _ => return Err(LowerError::malformed(id, "DEFINE_LOCAL needs a name and size")),
                };
                let limit = self.isa.max_local_bytes;
                let bytes = match size.checked_mul(dtype.itemsize()) {
                    Some(bytes) if bytes <= limit => bytes,
                    Some(requested) => return Err(LowerError::CapacityExceeded { requested, limit }),
                    None => return Err(LowerError::CapacityExceeded { requested: usize::MAX, limit }),
                };
                let dest = self.ssa(Some(id), "local", self.ty(UINT64)?)?;
                let lines = self.backend.render_local(dest, name, bytes)?;
                self.kk(lines);
                Ok(())
            }
            UOp::DefineVar => {
                let name = match &node.arg {
                    Arg::Var { name } => name.as_str(),
                    _ => return Err(LowerError::malformed(id, "DEFINE_VAR needs a name")),
                };
                self.define_param(id, name, dtype, dtype)
            }
            UOp::DefineGlobal => {
                let name = match &node.arg {
                    Arg::Global { name, .. } => name.as_str(),
                    _ => return Err(LowerError::malformed(id, "DEFINE_GLOBAL needs a name")),
                };
                let loaded = if dtype.is_ptr { UINT64 } else { dtype };
                self.define_param(id, name, dtype, loaded)
            }
        }
    }

    fn define_param(&mut self, id: NodeId, name: &str, dtype: DType, loaded: DType) -> LowerResult<()> {
        self.session.add_param(name, dtype);
        if self.isa.load_global {
            let dest = self.ssa(Some(id), "dat", self.ty(loaded)?)?;
            let lines = self
                .backend
                .render_load(name, dest, loaded, None, Some(AddrSpace::Param), 0)?;
            self.kk(lines);
            Ok(())
        } else {
            let reg = self.session.intern(&format!("%{name}"));
            self.session.bind(id, Binding::Scalar(reg))
        }
    }

    fn lower_if(&mut self, id: NodeId, node: &Node) -> LowerResult<()> {
        let cond = self.src(id, node, 0)?;
        let from = self.dtype_of(cond)?;
        let reg = self.session.reg(cond)?;
        let pred = self.cast(reg, BOOL, from, false, Some(id), true)?;
        let label = self.session.fresh_label(id, &self.isa.label_prefix, "if");
        let taken = format!("{label}_true");
        let lines = self.backend.render_bra(&taken, Some((pred, label)));
        self.kk(lines);
        self.kk([format!("{taken}:")]);
        Ok(())
    }

    fn lower_endloop(&mut self, id: NodeId, node: &Node) -> LowerResult<()> {
        let lp = self.src(id, node, 0)?;
        let loop_node = self.graph.node(lp);
        if loop_node.op != UOp::Loop {
            return Err(LowerError::malformed(id, "ENDLOOP must refer to a LOOP"));
        }
        let dtype = loop_node.dtype.unwrap_or(INT32);
        let ty = self.ty(dtype)?;
        let idx = self.session.reg(lp)?;
        let bound = self.session.reg(self.src(lp, loop_node, 1)?)?;
        let add = self.isa.template(AluOp::Add)?;
        let cmp = self.isa.template(AluOp::CmpLt)?;
        let pred = self.session.fresh_reg("pred", self.ty(BOOL)?);
        self.kk([add(idx, &[idx, "1"], dtype, ty), cmp(pred, &[idx, bound], dtype, ty)]);

        let label = self.session.label(lp)?;
        let exit = format!("{label}_exit");
        let lines = self.backend.render_bra(label, Some((pred, exit.as_str())));
        self.kk(lines);
        self.kk([format!("{exit}:")]);
        Ok(())
    }

    fn lower_store(&mut self, id: NodeId, node: &Node) -> LowerResult<()> {
        for i in 0..3 {
            self.dtype_of(self.src(id, node, i)?)?;
        }
        let val = node.src[2];
        let vdt = self.dtype_of(val)?;
        let loc = self.session.reg(node.src[0])?;
        let offset = self.offset_of(id, node)?;
        let space = Self::space_of(node);
        let gate = match node.src.get(3) {
            Some(&g) => Some(self.session.reg(g)?),
            None => None,
        };

        if vdt.count > 1 {
            let lanes = self.session.lanes(val)?;
            let line = format!(
                "{}st{}.v{}.{} [{}+{}], {{{}}};",
                gate.map(|g| format!("@{g} ")).unwrap_or_default(),
                self.backend.state_space(space),
                vdt.count,
                self.backend.mem_type(vdt.scalar())?,
                loc,
                offset,
                lanes.join(", "),
            );
            self.kk([line]);
        } else {
            let mut reg = self.session.reg(val)?;
            if vdt == BOOL {
                // predicates have no memory form; store them as 0/1 bytes
                reg = self.cast(reg, INT16, BOOL, false, None, false)?;
            }
            let lines = self.backend.render_store(loc, reg, vdt, gate, space, offset)?;
            self.kk(lines);
        }
        Ok(())
    }

    fn lower_load(&mut self, id: NodeId, node: &Node, dtype: DType) -> LowerResult<()> {
        let loc = self.session.reg(self.src(id, node, 0)?)?;
        let offset = self.offset_of(id, node)?;
        let space = Self::space_of(node);
        let gated = node.src.len() > 3;

        if dtype.count > 1 {
            let scalar = dtype.scalar();
            let lanes = self.session.fresh_lanes("val", self.ty(scalar)?, dtype.count);
            let mut prefix = String::new();
            if gated {
                let mov = self.mov_suffix(scalar)?;
                let fill: Vec<&str> = match self.session.binding(node.src[3])? {
                    Binding::Lanes(alt) if alt.len() == lanes.len() => alt.to_vec(),
                    Binding::Lanes(_) => return Err(LowerError::malformed(id, "default value lane count mismatch")),
                    Binding::Scalar(alt) => vec![alt; lanes.len()],
                };
                self.kk(lanes.iter().zip(fill).map(|(lane, alt)| format!("mov.{mov} {lane}, {alt};")));
                prefix = format!("@{} ", self.session.reg(node.src[2])?);
            }
            let line = format!(
                "{}ld{}.v{}.{} {{{}}}, [{}+{}];",
                prefix,
                self.backend.state_space(space),
                dtype.count,
                self.backend.mem_type(scalar)?,
                lanes.join(", "),
                loc,
                offset,
            );
            self.kk([line]);
            self.session.bind(id, Binding::Lanes(lanes))
        } else {
            let gate = if gated {
                Some((self.session.reg(node.src[2])?, self.session.reg(node.src[3])?))
            } else {
                None
            };
            let dest = self.ssa(Some(id), "val", self.ty(dtype)?)?;
            let lines = self.backend.render_load(loc, dest, dtype, gate, space, offset)?;
            self.kk(lines);
            Ok(())
        }
    }

    fn lower_alu(&mut self, id: NodeId, node: &Node, dtype: DType) -> LowerResult<()> {
        let op = node
            .alu_op()
            .ok_or_else(|| LowerError::malformed(id, "ALU node without an operator"))?;
        if node.src.len() != op.arity() {
            return Err(LowerError::malformed(
                id,
                format!("{op} takes {} operands, got {}", op.arity(), node.src.len()),
            ));
        }
        let template = self.isa.template(op)?;
        let mut operands = Vec::with_capacity(node.src.len());
        for &src in &node.src {
            operands.push(self.session.reg(src)?);
        }

        let out = self.ssa(Some(id), "alu", self.ty(dtype)?)?;
        let upcast = dtype == FLOAT16 && !self.isa.supports_half(op);
        let (compute, dest) = if upcast {
            let f32_ty = self.ty(FLOAT32)?;
            let dest = self.session.fresh_reg("alu_cast", f32_ty);
            for (operand, &src) in operands.iter_mut().zip(&node.src) {
                let from = self.dtype_of(src)?;
                let wide = self.session.fresh_reg("alu_cast", f32_ty);
                let lines = self.backend.render_cast(wide, *operand, FLOAT32, from, false, false)?;
                self.kk(lines);
                *operand = wide;
            }
            (FLOAT32, dest)
        } else {
            (dtype, out)
        };

        let tdt = if op.is_comparison() { self.dtype_of(node.src[0])? } else { compute };
        let line = template(dest, &operands, tdt, self.ty(tdt)?);
        self.kk([line]);

        if upcast {
            let lines = self.backend.render_cast(out, dest, FLOAT16, FLOAT32, false, false)?;
            self.kk(lines);
        }
        Ok(())
    }

    fn lower_special(&mut self, id: NodeId, node: &Node) -> LowerResult<()> {
        let (axis, name) = match &node.arg {
            Arg::Special { axis, name } => (*axis, name.as_str()),
            _ => return Err(LowerError::malformed(id, "SPECIAL needs an axis and a name")),
        };
        let table = match name.chars().next() {
            Some('g') => &self.isa.gid,
            Some('l') => &self.isa.lid,
            _ => return Err(LowerError::unsupported(format!("special register {name}"))),
        };
        let source = table
            .get(axis)
            .ok_or_else(|| LowerError::malformed(id, format!("axis {axis} out of range")))?;
        let line = format!("mov.u32 %{name}, {source};");
        self.kk([line]);
        self.specials.push(format!(".reg .u32 %{name};"));
        let reg = self.session.intern(&format!("%{name}"));
        self.session.bind(id, Binding::Scalar(reg))
    }
}

/// Constants never read as a register operand: load/store offsets, or
/// values left dead by the rewrite pass.
fn immediate_constants(graph: &KernelGraph) -> HashSet<NodeId> {
    let mut register_uses = HashSet::new();
    for (_, node) in graph.iter() {
        for (i, &src) in node.src.iter().enumerate() {
            if !(i == 1 && matches!(node.op, UOp::Load | UOp::Store)) {
                register_uses.insert(src);
            }
        }
    }
    graph
        .iter()
        .filter(|(id, node)| node.op == UOp::Const && !register_uses.contains(id))
        .map(|(id, _)| id)
        .collect()
}
