// This module implements the textual listing format used by tests and the command line. The
// parser reads one node per line, resolves `%name` operands through a table of earlier
// definitions and reports failures with the offending line number. The printer writes a graph
// back in the same format, naming each node after its emission position, so a pre-transformed
// graph can be dumped, inspected and read back unchanged.

//! Textual kernel-graph listings.
//!
//! One node per line, `;` starts a comment:
//!
//! ```text
//! %buf = DEFINE_GLOBAL *f32 : 0 data0
//! %idx = CONST i32 : 0
//! %val = CONST f32 : 5.0
//! %st  = STORE _ %buf, %idx, %val
//! ```
//!
//! The line shape is `[%name =] OPCODE dtype|_ [%operand, ...] [: argument]`.
//! The printer names nodes by their emission position, so printing a parsed
//! listing and parsing it again yields the same graph.

use hashbrown::HashMap;
use std::fmt::Write as _;
use thiserror::Error;

use crate::dtype::DType;
use crate::graph::{AddrSpace, Arg, KernelGraph, NodeId};
use crate::ops::{AluOp, ConstValue, UOp};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

type ParseResult<T> = Result<T, ParseError>;

pub fn parse_graph(text: &str) -> ParseResult<KernelGraph> {
    Parser::new().parse(text)
}

struct Parser<'a> {
    graph: KernelGraph,
    values: HashMap<&'a str, NodeId>,
    line: usize,
}

impl<'a> Parser<'a> {
    fn new() -> Self {
        Self { graph: KernelGraph::new(), values: HashMap::new(), line: 0 }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError { line: self.line, message: message.into() }
    }

    fn parse(mut self, text: &'a str) -> ParseResult<KernelGraph> {
        for (i, raw) in text.lines().enumerate() {
            self.line = i + 1;
            let line = raw.split(';').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            self.parse_line(line)?;
        }
        Ok(self.graph)
    }

    fn parse_line(&mut self, line: &'a str) -> ParseResult<()> {
        let (name, rest) = match line.split_once('=') {
            Some((lhs, rhs)) if lhs.trim_start().starts_with('%') => (Some(lhs.trim()), rhs.trim()),
            _ => (None, line),
        };
        let (body, arg) = match rest.split_once(':') {
            Some((body, arg)) => (body.trim(), Some(arg.trim())),
            None => (rest, None),
        };

        let (op_name, rest) = body.split_once(char::is_whitespace).unwrap_or((body, ""));
        let op = UOp::from_name(op_name).ok_or_else(|| self.error(format!("unknown opcode '{op_name}'")))?;
        let rest = rest.trim_start();
        let (ty, operands) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let dtype = match ty {
            "" => return Err(self.error("missing result type")),
            "_" => None,
            ty => Some(ty.parse::<DType>().map_err(|e| self.error(e))?),
        };

        let mut src = Vec::new();
        for operand in operands.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let id = self
                .values
                .get(operand)
                .copied()
                .ok_or_else(|| self.error(format!("undefined operand {operand}")))?;
            src.push(id);
        }

        let arg = self.parse_arg(op, dtype, arg)?;
        let id = self.graph.push(op, dtype, src, arg);
        if let Some(name) = name {
            if self.values.insert(name, id).is_some() {
                return Err(self.error(format!("{name} defined twice")));
            }
        }
        Ok(())
    }

    fn parse_arg(&self, op: UOp, dtype: Option<DType>, arg: Option<&str>) -> ParseResult<Arg> {
        let need = |what: &str| self.error(format!("{op} needs {what}"));
        let arg = match (op, arg) {
            (UOp::Const | UOp::DefineAcc, Some(lit)) => Arg::Const(self.literal(lit, dtype)?),
            (UOp::Const | UOp::DefineAcc, None) => return Err(need("a literal")),
            (UOp::Alu, Some(name)) => {
                Arg::Alu(AluOp::from_name(name).ok_or_else(|| self.error(format!("unknown operator '{name}'")))?)
            }
            (UOp::Alu, None) => return Err(need("an operator")),
            (UOp::Special, Some(a)) => {
                let (axis, name) = self.pair(a)?;
                Arg::Special { axis, name: name.to_string() }
            }
            (UOp::DefineGlobal, Some(a)) => {
                let (index, name) = self.pair(a)?;
                Arg::Global { index, name: name.to_string() }
            }
            (UOp::DefineVar, Some(name)) => Arg::Var { name: name.to_string() },
            (UOp::DefineLocal, Some(a)) => {
                let (name, size) = a.split_once(' ').ok_or_else(|| need("a name and a size"))?;
                let size = size.trim().parse().map_err(|_| self.error(format!("bad size '{size}'")))?;
                Arg::Local { name: name.to_string(), size }
            }
            (UOp::Gep, Some(lane)) => Arg::Lane(lane.parse().map_err(|_| self.error(format!("bad lane '{lane}'")))?),
            (UOp::Special | UOp::DefineGlobal | UOp::DefineVar | UOp::DefineLocal | UOp::Gep, None) => {
                return Err(need("an argument"))
            }
            (UOp::Load | UOp::Store, Some(space)) => Arg::Space(match space {
                "global" => AddrSpace::Global,
                "shared" => AddrSpace::Shared,
                "param" => AddrSpace::Param,
                _ => return Err(self.error(format!("unknown address space '{space}'"))),
            }),
            (_, Some(a)) => return Err(self.error(format!("{op} takes no argument, got '{a}'"))),
            (_, None) => Arg::None,
        };
        Ok(arg)
    }

    /// `<number> <name>`
    fn pair<'s>(&self, a: &'s str) -> ParseResult<(usize, &'s str)> {
        let (n, name) = a
            .split_once(' ')
            .ok_or_else(|| self.error(format!("expected '<index> <name>', got '{a}'")))?;
        let n = n.parse().map_err(|_| self.error(format!("bad index '{n}'")))?;
        Ok((n, name.trim()))
    }

    fn literal(&self, lit: &str, dtype: Option<DType>) -> ParseResult<ConstValue> {
        if let Ok(v) = lit.parse::<i64>() {
            if dtype.is_some_and(DType::is_float) {
                return Ok(ConstValue::Float(v as f64));
            }
            return Ok(ConstValue::Int(v));
        }
        match lit {
            "true" => Ok(ConstValue::Bool(true)),
            "false" => Ok(ConstValue::Bool(false)),
            _ => lit
                .parse::<f64>()
                .map(ConstValue::Float)
                .map_err(|_| self.error(format!("bad literal '{lit}'"))),
        }
    }
}

/// Render `graph` as a listing. Nodes are named `%<position>`.
pub fn print_graph(graph: &KernelGraph) -> String {
    let names: HashMap<NodeId, usize> = graph.order().iter().enumerate().map(|(i, &id)| (id, i)).collect();
    let mut out = String::new();

    for (i, (_, node)) in graph.iter().enumerate() {
        let _ = write!(out, "%{i} = {} ", node.op);
        match node.dtype {
            Some(dtype) => {
                let _ = write!(out, "{dtype}");
            }
            None => out.push('_'),
        }
        let operands: Vec<String> = node.src.iter().map(|s| format!("%{}", names[s])).collect();
        if !operands.is_empty() {
            let _ = write!(out, " {}", operands.join(", "));
        }
        let arg = match &node.arg {
            Arg::None => None,
            Arg::Alu(op) => Some(op.to_string()),
            Arg::Const(value) => Some(value.to_string()),
            Arg::Special { axis, name } => Some(format!("{axis} {name}")),
            Arg::Global { index, name } => Some(format!("{index} {name}")),
            Arg::Var { name } => Some(name.clone()),
            Arg::Local { name, size } => Some(format!("{name} {size}")),
            Arg::Lane(lane) => Some(lane.to_string()),
            Arg::Space(space) => Some(space.name().to_string()),
        };
        if let Some(arg) = arg {
            let _ = write!(out, " : {arg}");
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::{FLOAT32, INT32};

    const STORE_FIVE: &str = "
        ; write 5 to data0[0]
        %buf = DEFINE_GLOBAL *i32 : 0 data0
        %idx = CONST i32 : 0
        %val = CONST i32 : 5
        STORE _ %buf, %idx, %val
    ";

    #[test]
    fn test_parse_simple() {
        let g = parse_graph(STORE_FIVE).unwrap();
        assert_eq!(g.len(), 4);

        let order = g.order();
        assert_eq!(g.node(order[0]).arg, Arg::Global { index: 0, name: "data0".into() });
        assert_eq!(g.node(order[0]).dtype, Some(DType::ptr(INT32)));
        assert_eq!(g.node(order[2]).const_value(), Some(ConstValue::Int(5)));
        assert_eq!(g.node(order[3]).op, UOp::Store);
        assert_eq!(g.node(order[3]).src, vec![order[0], order[1], order[2]]);
        assert_eq!(g.node(order[3]).dtype, None);
    }

    #[test]
    fn test_parse_arguments() {
        let g = parse_graph(
            "%g = SPECIAL i32 : 1 gidx1
             %l = DEFINE_LOCAL f32 : temp 16
             %v = DEFINE_VAR i32 : n
             %a = DEFINE_ACC f32x4 : 0.5
             %e = GEP f32 %a : 2
             %c = CONST f32 : 2
             %x = ALU f32 %e, %c : max",
        )
        .unwrap();
        let nodes: Vec<_> = g.iter().map(|(_, n)| n.clone()).collect();

        assert_eq!(nodes[0].arg, Arg::Special { axis: 1, name: "gidx1".into() });
        assert_eq!(nodes[1].arg, Arg::Local { name: "temp".into(), size: 16 });
        assert_eq!(nodes[2].arg, Arg::Var { name: "n".into() });
        assert_eq!(nodes[3].dtype, Some(FLOAT32.vec(4)));
        assert_eq!(nodes[4].arg, Arg::Lane(2));
        assert_eq!(nodes[5].arg, Arg::Const(ConstValue::Float(2.0)));
        assert_eq!(nodes[6].alu_op(), Some(AluOp::Max));
    }

    #[test]
    fn test_parse_errors() {
        let err = parse_graph("%a = CONST i32 : 1\n%b = FROB i32").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("FROB"));

        let err = parse_graph("%a = ALU f32 %missing, %missing : add").unwrap_err();
        assert!(err.message.contains("%missing"));

        let err = parse_graph("%a = CONST i32 : 1\n%a = CONST i32 : 2").unwrap_err();
        assert!(err.to_string().starts_with("line 2:"));

        assert!(parse_graph("%a = CONST i32").is_err());
        assert!(parse_graph("%a = BARRIER _ : 3").is_err());
    }

    #[test]
    fn test_print_reparses() {
        let g = parse_graph(STORE_FIVE).unwrap();
        let text = print_graph(&g);
        assert_eq!(
            text,
            "%0 = DEFINE_GLOBAL *i32 : 0 data0\n\
             %1 = CONST i32 : 0\n\
             %2 = CONST i32 : 5\n\
             %3 = STORE _ %0, %1, %2\n"
        );
        assert_eq!(print_graph(&parse_graph(&text).unwrap()), text);
    }
}
