// This module is the PTX backend. It fills IsaFacts with the PTX conventions (entry prologue,
// bar.sync barrier, `$` labels, explicit ld.param of every kernel parameter, %ctaid/%nctaid/%tid
// special registers) and implements every AsmBackend rendering operation as PTX text.
// PTX has no boolean memory type, so predicates go through 16-bit registers and 8-bit memory
// forms; 8-bit integers are likewise held in 16-bit registers. Literal values are rendered as
// exact bit patterns for floats. Casts pick their rounding qualifier by rule: float to integer
// truncates toward zero, integer to float or a narrowing float conversion rounds to nearest,
// and widening float conversions need no qualifier. The final kernel text declares each
// register group with its count, wraps the body in a parameterized entry header and aligns
// mnemonics with tabs.

//! PTX assembly backend.

use hashbrown::HashMap;

use crate::core::backend::{AluTemplate, AsmBackend, IsaFacts};
use crate::core::error::{LowerError, LowerResult};
use crate::core::session::RegGroup;
use crate::dtype::{
    DType, BOOL, FLOAT16, FLOAT32, FLOAT64, INT16, INT32, INT64, INT8, UINT16, UINT32, UINT64, UINT8,
};
use crate::graph::AddrSpace;
use crate::ops::{AluOp, ConstValue};

/// Shared memory available to one PTX thread block.
pub const MAX_LOCAL_BYTES: usize = 0xC000;

const DEFAULT_VERSION: (u32, u32) = (7, 5);
const DEFAULT_TARGET: &str = "TARGET";

#[derive(Debug, Clone)]
pub struct PtxBackend {
    isa: IsaFacts,
    version: (u32, u32),
    target: String,
}

impl Default for PtxBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PtxBackend {
    /// PTX ISA 7.5 with a `TARGET` placeholder the loader substitutes.
    pub fn new() -> Self {
        let version = DEFAULT_VERSION;
        let target = DEFAULT_TARGET.to_string();
        Self { isa: ptx_facts(&kernel_prefix(version, &target)), version, target }
    }

    /// Emit `.target arch` instead of the placeholder.
    pub fn with_target(mut self, arch: &str) -> Self {
        self.target = arch.to_string();
        self.isa.kernel_prefix = kernel_prefix(self.version, &self.target);
        self
    }

    pub fn with_version(mut self, major: u32, minor: u32) -> Self {
        self.version = (major, minor);
        self.isa.kernel_prefix = kernel_prefix(self.version, &self.target);
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn bits(&self, dtype: DType) -> LowerResult<&'static str> {
        Ok(&self.isa.type_name(dtype)?[1..])
    }
}

fn kernel_prefix((major, minor): (u32, u32), target: &str) -> String {
    format!(".version {major}.{minor}\n.target {target}\n.address_size 64\n.visible .entry")
}

fn ptx_facts(kernel_prefix: &str) -> IsaFacts {
    let templates: [(AluOp, AluTemplate); 15] = [
        (AluOp::Neg, |d, s, _, ty| {
            if ty == "pred" {
                format!("not.pred {d}, {};", s[0])
            } else {
                format!("neg.{ty} {d}, {};", s[0])
            }
        }),
        (AluOp::Exp2, |d, s, _, ty| format!("ex2.approx.{ty} {d}, {};", s[0])),
        (AluOp::Log2, |d, s, _, ty| format!("lg2.approx.{ty} {d}, {};", s[0])),
        (AluOp::Sin, |d, s, _, ty| format!("sin.approx.{ty} {d}, {};", s[0])),
        (AluOp::Sqrt, |d, s, _, ty| format!("sqrt.approx.{ty} {d}, {};", s[0])),
        (AluOp::Add, |d, s, _, ty| {
            let op = if ty == "pred" { "or" } else { "add" };
            format!("{op}.{ty} {d}, {}, {};", s[0], s[1])
        }),
        (AluOp::Sub, |d, s, _, ty| format!("sub.{ty} {d}, {}, {};", s[0], s[1])),
        (AluOp::Mul, |d, s, dt, ty| {
            let op = if dt == BOOL { "and" } else { "mul" };
            let lo = if dt.is_int() { ".lo" } else { "" };
            format!("{op}{lo}.{ty} {d}, {}, {};", s[0], s[1])
        }),
        (AluOp::Div, |d, s, dt, ty| {
            let approx = if dt.is_float() { ".approx" } else { "" };
            format!("div{approx}.{ty} {d}, {}, {};", s[0], s[1])
        }),
        (AluOp::Mod, |d, s, _, ty| format!("rem.{ty} {d}, {}, {};", s[0], s[1])),
        (AluOp::Max, |d, s, _, ty| format!("max.{ty} {d}, {}, {};", s[0], s[1])),
        (AluOp::Xor, |d, s, _, ty| {
            if ty == "pred" {
                format!("xor.pred {d}, {}, {};", s[0], s[1])
            } else {
                format!("xor.b{} {d}, {}, {};", &ty[1..], s[0], s[1])
            }
        }),
        (AluOp::CmpLt, |d, s, _, ty| format!("setp.lt.{ty} {d}, {}, {};", s[0], s[1])),
        (AluOp::CmpEq, |d, s, _, ty| format!("setp.eq.{ty} {d}, {}, {};", s[0], s[1])),
        (AluOp::Where, |d, s, _, ty| {
            if ty == "pred" {
                format!("@{0} mov.{ty} {d}, {1};\n@!{0} mov.{ty} {d}, {2};", s[0], s[1], s[2])
            } else {
                let sel = if ty == "f16" { "b16" } else { ty };
                format!("selp.{sel} {d}, {}, {}, {};", s[1], s[2], s[0])
            }
        }),
    ];

    // 8-bit integers live in 16-bit registers.
    let types = [
        (INT8, "s16"),
        (INT16, "s16"),
        (INT32, "s32"),
        (INT64, "s64"),
        (UINT8, "u16"),
        (UINT16, "u16"),
        (UINT32, "u32"),
        (UINT64, "u64"),
        (FLOAT16, "f16"),
        (FLOAT32, "f32"),
        (FLOAT64, "f64"),
        (BOOL, "pred"),
    ];

    let axes = |base: &str| ['x', 'y', 'z'].map(|c| format!("%{base}.{c}"));

    IsaFacts {
        kernel_prefix: kernel_prefix.to_string(),
        barrier: "bar.sync\t0;".to_string(),
        label_prefix: "$".to_string(),
        load_global: true,
        gid: axes("ctaid"),
        gdim: axes("nctaid"),
        lid: axes("tid"),
        const_requires_mov: vec![FLOAT16, BOOL],
        asm_for_op: templates.into_iter().collect(),
        types: types.into_iter().collect::<HashMap<_, _>>(),
        supports_half: vec![
            AluOp::Neg,
            AluOp::Exp2,
            AluOp::Add,
            AluOp::Sub,
            AluOp::Mul,
            AluOp::Max,
            AluOp::CmpLt,
            AluOp::Where,
        ],
        max_local_bytes: MAX_LOCAL_BYTES,
    }
}

/// Render `value` as a PTX literal of type `dtype`.
///
/// Floats are written as their exact bit pattern (`0f3F800000`, `0d...`, and
/// `0x3C00` for halves); integers in decimal with a `U` suffix when unsigned.
pub fn render_val(value: ConstValue, dtype: DType) -> String {
    let dtype = dtype.scalar();
    if dtype.is_float() {
        let x = value.as_f64();
        if dtype == FLOAT64 {
            format!("0d{:016X}", x.to_bits())
        } else if dtype == FLOAT16 {
            format!("0x{:04X}", f16_bits(x))
        } else {
            format!("0f{:08X}", (x as f32).to_bits())
        }
    } else {
        let suffix = if dtype.is_unsigned() { "U" } else { "" };
        format!("{}{}", value.as_i64(), suffix)
    }
}

/// IEEE binary16 bits of `value`, rounded to nearest even in a single step.
pub fn f16_bits(value: f64) -> u16 {
    let x = value.to_bits();
    let sign = ((x >> 48) & 0x8000) as u16;
    let exp = ((x >> 52) & 0x7ff) as i32;
    let man = x & 0x000f_ffff_ffff_ffff;

    if exp == 0x7ff {
        let nan = if man != 0 { 0x0200 } else { 0 };
        return sign | 0x7c00 | nan;
    }

    let e = exp - 1023 + 15;
    if e >= 0x1f {
        return sign | 0x7c00;
    }
    // 52 mantissa bits in, 10 out: normals drop 42, subnormals more
    let (full, shift) = if e <= 0 {
        if e < -10 {
            return sign;
        }
        (man | 1 << 52, (43 - e) as u32)
    } else {
        ((e as u64) << 52 | man, 42)
    };
    let half = full >> shift;
    let rem = full & ((1 << shift) - 1);
    let halfway = 1 << (shift - 1);
    // a carry out of the mantissa bumps the exponent, up to infinity
    let rounded = if rem > halfway || (rem == halfway && half & 1 == 1) { half + 1 } else { half };
    sign | rounded as u16
}

/// Rounding qualifier of a `cvt` from `from` to `to`.
fn rounding(to: DType, from: DType) -> &'static str {
    if to.is_int() && from.is_float() {
        ".rzi"
    } else if to.is_float() && (to.itemsize() < from.itemsize() || from.is_int() || from.is_bool()) {
        ".rn"
    } else {
        ""
    }
}

/// Indent a kernel line and align its operands.
fn fmt_line(line: &str, label_prefix: &str) -> String {
    if line.starts_with(label_prefix) {
        return line.to_string();
    }
    match line.split_once(' ') {
        Some((mnemonic, rest)) => {
            let sep = if mnemonic.len() > 7 { "\t" } else { "\t\t" };
            format!("\t{mnemonic}{sep}{rest}")
        }
        None => format!("\t{line}"),
    }
}

impl AsmBackend for PtxBackend {
    fn isa(&self) -> &IsaFacts {
        &self.isa
    }

    fn render_const(&self, value: ConstValue, dtype: DType) -> LowerResult<String> {
        Ok(render_val(value, dtype))
    }

    fn render_const_into(&self, dest: &str, value: ConstValue, dtype: DType) -> LowerResult<Vec<String>> {
        let val = render_val(value, dtype);
        if dtype == BOOL {
            return Ok(vec![format!("setp.ne.s16 {dest}, {val}, 0;")]);
        }
        Ok(vec![format!("mov.b{} {dest}, {val};", self.bits(dtype)?)])
    }

    fn render_local(&self, dest: &str, name: &str, bytes: usize) -> LowerResult<Vec<String>> {
        Ok(vec![
            format!(".shared .align 4 .b8 {name}[{bytes}];"),
            format!("mov.u64 {dest}, {name}[0];"),
        ])
    }

    fn render_loop(&self, idx: &str, start: &str, label: &str) -> Vec<String> {
        vec![format!("mov.u32 {idx}, {start};"), format!("{label}:")]
    }

    fn render_bra(&self, target: &str, cond: Option<(&str, &str)>) -> Vec<String> {
        match cond {
            Some((pred, otherwise)) => vec![format!("@{pred} bra {target};"), format!("@!{pred} bra {otherwise};")],
            None => vec![format!("bra {target};")],
        }
    }

    fn render_load(
        &self,
        loc: &str,
        dest: &str,
        dtype: DType,
        gate: Option<(&str, &str)>,
        space: Option<AddrSpace>,
        offset: i64,
    ) -> LowerResult<Vec<String>> {
        if dtype == BOOL {
            return Err(LowerError::unsupported("boolean memory load"));
        }
        let ss = self.state_space(space);
        let mem = self.mem_type(dtype)?;
        Ok(match gate {
            Some((pred, alt)) => vec![
                format!("@{pred} ld{ss}.{mem} {dest}, [{loc}+{offset}];"),
                format!("@!{pred} mov.b{} {dest}, {alt};", self.bits(dtype)?),
            ],
            None => vec![format!("ld{ss}.{mem} {dest}, [{loc}+{offset}];")],
        })
    }

    fn render_store(
        &self,
        loc: &str,
        val: &str,
        dtype: DType,
        gate: Option<&str>,
        space: Option<AddrSpace>,
        offset: i64,
    ) -> LowerResult<Vec<String>> {
        let ss = self.state_space(space);
        let mem = self.mem_type(dtype)?;
        let gate = gate.map(|g| format!("@{g} ")).unwrap_or_default();
        Ok(vec![format!("{gate}st{ss}.{mem} [{loc}+{offset}], {val};")])
    }

    fn render_cast(
        &self,
        dest: &str,
        src: &str,
        to: DType,
        from: DType,
        bitcast: bool,
        _pred: bool,
    ) -> LowerResult<Vec<String>> {
        if bitcast {
            return Ok(vec![format!("mov.b{} {dest}, {src};", self.bits(to)?)]);
        }
        if from == BOOL {
            let (one, zero) = (render_val(ConstValue::Int(1), to), render_val(ConstValue::Int(0), to));
            return Ok(vec![format!("selp.b{} {dest}, {one}, {zero}, {src};", self.bits(to)?)]);
        }
        if to == BOOL {
            let zero = self.render_const(ConstValue::Int(0), from)?;
            return Ok(vec![format!("setp.ne.b{} {dest}, {src}, {zero};", self.bits(from)?)]);
        }
        let (t, f) = (self.isa.type_name(to)?, self.isa.type_name(from)?);
        Ok(vec![format!("cvt{}.{t}.{f} {dest}, {src};", rounding(to, from))])
    }

    fn render_kernel(
        &self,
        kernel: &[String],
        function_name: &str,
        params: &[(String, DType)],
        regs: &[RegGroup],
    ) -> LowerResult<String> {
        let params = params
            .iter()
            .map(|(name, dtype)| -> LowerResult<String> {
                let ty = if dtype.is_ptr { "u64" } else { self.isa.type_name(*dtype)? };
                Ok(format!(".param .{ty} {name}"))
            })
            .collect::<LowerResult<Vec<_>>>()?;

        let decls = regs
            .iter()
            .map(|r| format!(".reg .{} %{}_{}_<{}>;", r.ty, r.category, r.ty, r.count));
        let body = decls
            .chain(kernel.iter().cloned())
            .chain(std::iter::once("ret;".to_string()))
            .flat_map(|op| op.lines().map(|l| fmt_line(l, &self.isa.label_prefix)).collect::<Vec<_>>())
            .collect::<Vec<_>>()
            .join("\n");

        Ok(format!(
            "{} {}(\n\t{}\n)\n{{\n{}\n}}",
            self.isa.kernel_prefix,
            function_name,
            params.join(",\n\t"),
            body
        ))
    }

    fn mem_type(&self, dtype: DType) -> LowerResult<&'static str> {
        if dtype.itemsize() == 1 {
            Ok("s8")
        } else if dtype == FLOAT16 {
            Ok("b16")
        } else {
            self.isa.type_name(dtype)
        }
    }

    fn state_space(&self, space: Option<AddrSpace>) -> &'static str {
        match space {
            Some(AddrSpace::Global) => ".global",
            Some(AddrSpace::Shared) => ".shared",
            Some(AddrSpace::Param) => ".param",
            None => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_val() {
        assert_eq!(render_val(ConstValue::Float(1.0), FLOAT32), "0f3F800000");
        assert_eq!(render_val(ConstValue::Float(-2.5), FLOAT64), "0dC004000000000000");
        assert_eq!(render_val(ConstValue::Float(1.0), FLOAT16), "0x3C00");
        assert_eq!(render_val(ConstValue::Int(2), FLOAT32), "0f40000000");
        assert_eq!(render_val(ConstValue::Int(-7), INT32), "-7");
        assert_eq!(render_val(ConstValue::Int(7), UINT64), "7U");
        assert_eq!(render_val(ConstValue::Bool(true), BOOL), "1");
        assert_eq!(render_val(ConstValue::Bool(false), BOOL), "0");
    }

    #[test]
    fn test_f16_bits() {
        assert_eq!(f16_bits(0.0), 0x0000);
        assert_eq!(f16_bits(-0.0), 0x8000);
        assert_eq!(f16_bits(0.5), 0x3800);
        assert_eq!(f16_bits(-2.0), 0xC000);
        assert_eq!(f16_bits(65504.0), 0x7BFF);
        assert_eq!(f16_bits(65520.0), 0x7C00);
        assert_eq!(f16_bits(1.0e6), 0x7C00);
        assert_eq!(f16_bits(f64::NEG_INFINITY), 0xFC00);
        assert_eq!(f16_bits(f64::NAN) & 0x7E00, 0x7E00);
        // smallest subnormal, and half of it rounding to even (zero)
        assert_eq!(f16_bits(2.0f64.powi(-24)), 0x0001);
        assert_eq!(f16_bits(2.0f64.powi(-25)), 0x0000);
        assert_eq!(f16_bits(3.0 * 2.0f64.powi(-26)), 0x0001);
        assert_eq!(f16_bits(2.0f64.powi(-14)), 0x0400);
        // 1 + 2^-11 is a tie between 1.0 and the next half, rounds to even
        assert_eq!(f16_bits(1.0 + 2.0f64.powi(-11)), 0x3C00);
        assert_eq!(f16_bits(1.0 + 3.0 * 2.0f64.powi(-11)), 0x3C02);
    }

    #[test]
    fn test_f16_bits_single_rounding() {
        // just above the tie; an f32 detour would lose the 2^-40 and round down
        let x = 1.0 + 2.0f64.powi(-11) + 2.0f64.powi(-40);
        assert_eq!(f16_bits(x), 0x3C01);
        assert_eq!(render_val(ConstValue::Float(x), FLOAT16), "0x3C01");
        assert_eq!(f16_bits(-x), 0xBC01);
    }

    #[test]
    fn test_cast_rounding() {
        let ptx = PtxBackend::new();
        let cast = |to, from| ptx.render_cast("%d", "%a", to, from, false, false).unwrap()[0].clone();

        assert_eq!(cast(INT32, FLOAT32), "cvt.rzi.s32.f32 %d, %a;");
        assert_eq!(cast(FLOAT32, INT32), "cvt.rn.f32.s32 %d, %a;");
        assert_eq!(cast(FLOAT16, FLOAT32), "cvt.rn.f16.f32 %d, %a;");
        assert_eq!(cast(FLOAT32, FLOAT16), "cvt.f32.f16 %d, %a;");
        assert_eq!(cast(INT64, INT32), "cvt.s64.s32 %d, %a;");
        assert_eq!(cast(INT32, BOOL), "selp.b32 %d, 1, 0, %a;");
        assert_eq!(cast(FLOAT32, BOOL), "selp.b32 %d, 0f3F800000, 0f00000000, %a;");
        assert_eq!(cast(BOOL, UINT8), "setp.ne.b16 %d, %a, 0U;");
        assert_eq!(
            ptx.render_cast("%d", "%a", UINT32, FLOAT32, true, false).unwrap(),
            vec!["mov.b32 %d, %a;"]
        );
    }

    #[test]
    fn test_templates() {
        let ptx = PtxBackend::new();
        let isa = ptx.isa();
        let t = |op| isa.template(op).unwrap();

        assert_eq!(t(AluOp::Neg)("%d", &["%a"], BOOL, "pred"), "not.pred %d, %a;");
        assert_eq!(t(AluOp::Neg)("%d", &["%a"], FLOAT32, "f32"), "neg.f32 %d, %a;");
        assert_eq!(t(AluOp::Add)("%d", &["%a", "%b"], BOOL, "pred"), "or.pred %d, %a, %b;");
        assert_eq!(t(AluOp::Mul)("%d", &["%a", "%b"], INT32, "s32"), "mul.lo.s32 %d, %a, %b;");
        assert_eq!(t(AluOp::Mul)("%d", &["%a", "%b"], BOOL, "pred"), "and.pred %d, %a, %b;");
        assert_eq!(t(AluOp::Mul)("%d", &["%a", "%b"], FLOAT32, "f32"), "mul.f32 %d, %a, %b;");
        assert_eq!(t(AluOp::Div)("%d", &["%a", "%b"], FLOAT32, "f32"), "div.approx.f32 %d, %a, %b;");
        assert_eq!(t(AluOp::Div)("%d", &["%a", "%b"], INT32, "s32"), "div.s32 %d, %a, %b;");
        assert_eq!(t(AluOp::Xor)("%d", &["%a", "%b"], INT32, "s32"), "xor.b32 %d, %a, %b;");
        assert_eq!(t(AluOp::Mod)("%d", &["%a", "%b"], INT32, "s32"), "rem.s32 %d, %a, %b;");
        assert_eq!(
            t(AluOp::Where)("%d", &["%p", "%a", "%b"], FLOAT16, "f16"),
            "selp.b16 %d, %a, %b, %p;"
        );
        assert_eq!(
            t(AluOp::Where)("%d", &["%p", "%a", "%b"], BOOL, "pred"),
            "@%p mov.pred %d, %a;\n@!%p mov.pred %d, %b;"
        );
    }

    #[test]
    fn test_memory_forms() {
        let ptx = PtxBackend::new();
        assert_eq!(ptx.mem_type(UINT8).unwrap(), "s8");
        assert_eq!(ptx.mem_type(BOOL).unwrap(), "s8");
        assert_eq!(ptx.mem_type(FLOAT16).unwrap(), "b16");
        assert_eq!(ptx.mem_type(FLOAT32).unwrap(), "f32");

        let gated = ptx
            .render_load("%p", "%v", FLOAT32, Some(("%g", "%alt")), Some(AddrSpace::Global), 8)
            .unwrap();
        assert_eq!(gated, vec!["@%g ld.global.f32 %v, [%p+8];", "@!%g mov.b32 %v, %alt;"]);
        assert!(matches!(
            ptx.render_load("%p", "%v", BOOL, None, None, 0),
            Err(LowerError::Unsupported { .. })
        ));

        let store = ptx.render_store("%p", "%b", BOOL, Some("%g"), Some(AddrSpace::Shared), 0).unwrap();
        assert_eq!(store, vec!["@%g st.shared.s8 [%p+0], %b;"]);
    }

    #[test]
    fn test_constants() {
        let ptx = PtxBackend::new();
        assert_eq!(
            ptx.render_const_into("%c", ConstValue::Bool(true), BOOL).unwrap(),
            vec!["setp.ne.s16 %c, 1, 0;"]
        );
        assert_eq!(
            ptx.render_const_into("%c", ConstValue::Float(1.0), FLOAT16).unwrap(),
            vec!["mov.b16 %c, 0x3C00;"]
        );
        assert_eq!(
            ptx.render_local("%l", "temp", 64).unwrap(),
            vec![".shared .align 4 .b8 temp[64];", "mov.u64 %l, temp[0];"]
        );
    }

    #[test]
    fn test_format_line() {
        assert_eq!(fmt_line("$loop_0:", "$"), "$loop_0:");
        assert_eq!(fmt_line("add.s32 %a, %b, 1;", "$"), "\tadd.s32\t\t%a, %b, 1;");
        assert_eq!(fmt_line("ld.global.f32 %a, [%b+0];", "$"), "\tld.global.f32\t%a, [%b+0];");
        assert_eq!(fmt_line("ret;", "$"), "\tret;");
    }

    #[test]
    fn test_kernel_header() {
        let ptx = PtxBackend::new().with_target("sm_80").with_version(8, 0);
        let regs = [RegGroup { category: "dat".into(), ty: "u64".into(), count: 1 }];
        let params = [("data0".to_string(), DType::ptr(FLOAT32)), ("n".to_string(), INT32)];
        let text = ptx
            .render_kernel(&["ld.param.u64 %dat_u64_0, [data0+0];".to_string()], "k", &params, &regs)
            .unwrap();

        assert_eq!(
            text,
            ".version 8.0\n.target sm_80\n.address_size 64\n.visible .entry k(\n\
             \t.param .u64 data0,\n\t.param .s32 n\n)\n{\n\
             \t.reg\t\t.u64 %dat_u64_<1>;\n\
             \tld.param.u64\t%dat_u64_0, [data0+0];\n\
             \tret;\n}"
        );
    }
}
