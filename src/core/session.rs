// This module holds all mutable state of one lowering run. LoweringSession borrows a bumpalo
// arena that lives exactly as long as the run; every register and label name is interned
// there, so bindings are plain `&'arena str` handles that can be copied freely while the
// instruction stream is being built. The session tracks node-to-register bindings (scalar or
// per-lane), per-(category, type) register counters in first-use order so the final register
// declarations are deterministic, per-category label counters, the ordered kernel parameter
// list, and a few statistics that are logged at the end of a run. Nothing here is shared
// between runs, so independent kernels can be lowered concurrently.

//! Per-lowering symbol tables and fresh-name allocation.

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;
use hashbrown::HashMap;
use std::fmt;

use super::error::{LowerError, LowerResult};
use crate::dtype::DType;
use crate::graph::NodeId;

/// Register(s) bound to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding<'arena> {
    /// One register name, or an inline literal for immediate-only constants.
    Scalar(&'arena str),
    /// One register per vector lane.
    Lanes(&'arena [&'arena str]),
}

/// A declared register group: `%{category}_{ty}_<count>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegGroup {
    pub category: String,
    pub ty: String,
    pub count: usize,
}

/// Statistics of one lowering run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub nodes_lowered: usize,
    pub lines_emitted: usize,
    pub registers_allocated: usize,
    pub labels_allocated: usize,
    pub rewrites_applied: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Nodes lowered: {}", self.nodes_lowered)?;
        writeln!(f, "Lines emitted: {}", self.lines_emitted)?;
        writeln!(f, "Registers allocated: {}", self.registers_allocated)?;
        writeln!(f, "Labels allocated: {}", self.labels_allocated)?;
        write!(f, "Rewrites applied: {}", self.rewrites_applied)
    }
}

pub struct LoweringSession<'arena> {
    arena: &'arena Bump,

    bindings: HashMap<NodeId, Binding<'arena>>,

    /// Register counters keyed by (category, type), in first-use order.
    reg_groups: Vec<(&'arena str, &'arena str, usize)>,

    labels: HashMap<NodeId, &'arena str>,
    label_counts: HashMap<&'arena str, usize>,

    params: Vec<(String, DType)>,

    stats: SessionStats,
}

impl<'arena> LoweringSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            bindings: HashMap::new(),
            reg_groups: Vec::new(),
            labels: HashMap::new(),
            label_counts: HashMap::new(),
            params: Vec::new(),
            stats: SessionStats::default(),
        }
    }

    /// Copy a string into the session arena.
    pub fn intern(&self, s: &str) -> &'arena str {
        self.arena.alloc_str(s)
    }

    /// Allocate a fresh register `%{category}_{ty}_{n}`.
    pub fn fresh_reg(&mut self, category: &str, ty: &str) -> &'arena str {
        let slot = match self.reg_groups.iter().position(|&(c, t, _)| c == category && t == ty) {
            Some(slot) => slot,
            None => {
                let (c, t) = (self.intern(category), self.intern(ty));
                self.reg_groups.push((c, t, 0));
                self.reg_groups.len() - 1
            }
        };
        let n = self.reg_groups[slot].2;
        self.reg_groups[slot].2 += 1;
        self.stats.registers_allocated += 1;
        self.arena.alloc_str(&format!("%{category}_{ty}_{n}"))
    }

    /// Allocate `count` fresh registers of the same group.
    pub fn fresh_lanes(&mut self, category: &str, ty: &str, count: usize) -> &'arena [&'arena str] {
        let mut lanes = BumpVec::with_capacity_in(count, self.arena);
        for _ in 0..count {
            lanes.push(self.fresh_reg(category, ty));
        }
        lanes.into_bump_slice()
    }

    /// Collect already-interned names into an arena slice.
    pub fn lanes_of(&self, names: &[&'arena str]) -> &'arena [&'arena str] {
        self.arena.alloc_slice_copy(names)
    }

    /// Bind `node` to its register(s). Each node is bound at most once.
    pub fn bind(&mut self, node: NodeId, binding: Binding<'arena>) -> LowerResult<()> {
        if self.bindings.contains_key(&node) {
            return Err(LowerError::malformed(node, "register assigned twice"));
        }
        self.bindings.insert(node, binding);
        Ok(())
    }

    pub fn binding(&self, node: NodeId) -> LowerResult<Binding<'arena>> {
        self.bindings
            .get(&node)
            .copied()
            .ok_or(LowerError::MissingRegister { node })
    }

    /// Scalar register of `node`.
    pub fn reg(&self, node: NodeId) -> LowerResult<&'arena str> {
        match self.binding(node)? {
            Binding::Scalar(name) => Ok(name),
            Binding::Lanes(_) => Err(LowerError::malformed(node, "vector value used as a scalar")),
        }
    }

    /// Per-lane registers of `node`.
    pub fn lanes(&self, node: NodeId) -> LowerResult<&'arena [&'arena str]> {
        match self.binding(node)? {
            Binding::Lanes(lanes) => Ok(lanes),
            Binding::Scalar(_) => Err(LowerError::malformed(node, "scalar value used as a vector")),
        }
    }

    /// Allocate `{prefix}{category}_{n}` and record it for `node`.
    pub fn fresh_label(&mut self, node: NodeId, prefix: &str, category: &str) -> &'arena str {
        let n = match self.label_counts.get_mut(category) {
            Some(count) => {
                *count += 1;
                *count - 1
            }
            None => {
                let key = self.intern(category);
                self.label_counts.insert(key, 1);
                0
            }
        };
        let label = self.arena.alloc_str(&format!("{prefix}{category}_{n}"));
        self.labels.insert(node, label);
        self.stats.labels_allocated += 1;
        label
    }

    pub fn label(&self, node: NodeId) -> LowerResult<&'arena str> {
        self.labels
            .get(&node)
            .copied()
            .ok_or_else(|| LowerError::malformed(node, "no label recorded for this node"))
    }

    pub fn add_param(&mut self, name: &str, dtype: DType) {
        self.params.push((name.to_string(), dtype));
    }

    pub fn params(&self) -> &[(String, DType)] {
        &self.params
    }

    /// Register groups with their final counts, in first-use order.
    pub fn reg_groups(&self) -> Vec<RegGroup> {
        self.reg_groups
            .iter()
            .map(|&(category, ty, count)| RegGroup { category: category.to_string(), ty: ty.to_string(), count })
            .collect()
    }

    pub fn record_node_lowered(&mut self) {
        self.stats.nodes_lowered += 1;
    }

    pub fn record_lines(&mut self, count: usize) {
        self.stats.lines_emitted += count;
    }

    pub fn record_rewrites(&mut self, count: usize) {
        self.stats.rewrites_applied += count;
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::{FLOAT32, INT32};

    #[test]
    fn test_fresh_registers_are_unique_per_group() {
        let arena = Bump::new();
        let mut session = LoweringSession::new(&arena);

        let a = session.fresh_reg("alu", "f32");
        let b = session.fresh_reg("alu", "f32");
        let c = session.fresh_reg("alu", "s32");
        let d = session.fresh_reg("const", "f32");

        assert_eq!(a, "%alu_f32_0");
        assert_eq!(b, "%alu_f32_1");
        assert_eq!(c, "%alu_s32_0");
        assert_eq!(d, "%const_f32_0");

        let groups = session.reg_groups();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0], RegGroup { category: "alu".into(), ty: "f32".into(), count: 2 });
        assert_eq!(groups[2].category, "const");
        assert_eq!(session.stats().registers_allocated, 4);
    }

    #[test]
    fn test_bind_once() {
        let arena = Bump::new();
        let mut session = LoweringSession::new(&arena);
        let reg = session.fresh_reg("val", "f32");

        session.bind(NodeId(3), Binding::Scalar(reg)).unwrap();
        assert_eq!(session.reg(NodeId(3)).unwrap(), "%val_f32_0");
        assert!(matches!(session.bind(NodeId(3), Binding::Scalar(reg)), Err(LowerError::Malformed { .. })));
        assert_eq!(session.reg(NodeId(4)), Err(LowerError::MissingRegister { node: NodeId(4) }));
    }

    #[test]
    fn test_lanes() {
        let arena = Bump::new();
        let mut session = LoweringSession::new(&arena);
        let lanes = session.fresh_lanes("acc", "f32", 4);
        session.bind(NodeId(0), Binding::Lanes(lanes)).unwrap();

        assert_eq!(session.lanes(NodeId(0)).unwrap()[3], "%acc_f32_3");
        assert!(session.reg(NodeId(0)).is_err());
    }

    #[test]
    fn test_labels_and_params() {
        let arena = Bump::new();
        let mut session = LoweringSession::new(&arena);

        assert_eq!(session.fresh_label(NodeId(1), "$", "loop"), "$loop_0");
        assert_eq!(session.fresh_label(NodeId(2), "$", "if"), "$if_0");
        assert_eq!(session.fresh_label(NodeId(5), "$", "loop"), "$loop_1");
        assert_eq!(session.label(NodeId(5)).unwrap(), "$loop_1");
        assert!(session.label(NodeId(9)).is_err());

        session.add_param("data0", FLOAT32);
        session.add_param("n", INT32);
        assert_eq!(session.params()[1], ("n".to_string(), INT32));
    }

    #[test]
    fn test_statistics_display() {
        let arena = Bump::new();
        let mut session = LoweringSession::new(&arena);
        session.record_node_lowered();
        session.record_lines(3);
        session.record_rewrites(2);

        let output = format!("{}", session.stats());
        assert!(output.contains("Nodes lowered: 1"));
        assert!(output.contains("Lines emitted: 3"));
        assert!(output.contains("Rewrites applied: 2"));
    }
}
