//! OpenCL C code generation
//!
//! Renders a [`KernelIr`] and its [`LaunchPlan`] into one OpenCL C program
//! containing every kernel the plan launches.

use crate::ast::expr::{BinaryOp, MathFn, UnaryOp};
use crate::device::ir::{KernelExpr, KernelIr, KernelStmt, Terminal};
use crate::device::plan::{Kernel, LaunchPlan, cl_type};
use crate::value::{ElemType, Value};

/// Code generator for device programs
pub struct CodeGenerator {
    /// Generated code buffer
    code: String,
    /// Indentation level
    indent: usize,
}

impl Default for CodeGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn literal(value: &Value, ty: &ElemType) -> String {
    match (value, ty) {
        (Value::Bool(b), _) => b.to_string(),
        (Value::Int(v), _) => v.to_string(),
        (Value::Long(v), _) => format!("{}L", v),
        (Value::Float(v), _) => float_literal(f64::from(v.0), format!("{:?}f", v.0)),
        (Value::Double(v), _) => float_literal(v.0, format!("{:?}", v.0)),
        (other, ty) => format!("(({}){})", cl_type(ty), other),
    }
}

fn float_literal(v: f64, finite: String) -> String {
    if v.is_nan() {
        "NAN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "INFINITY" } else { "(-INFINITY)" }.to_string()
    } else {
        finite
    }
}

impl CodeGenerator {
    /// Create a new code generator
    pub fn new() -> Self {
        Self {
            code: String::new(),
            indent: 0,
        }
    }

    /// Generate the program for `ir` scheduled by `plan`
    pub fn generate(&mut self, ir: &KernelIr, plan: &LaunchPlan, fp64: bool) -> String {
        self.code.clear();
        self.indent = 0;

        self.add_line("// generated by pipefuse");
        if fp64 && ir.uses_fp64() {
            self.add_line("#pragma OPENCL EXTENSION cl_khr_fp64 : enable");
        }
        self.add_line(&format!("#define PF_WG {}", plan.work_group_size));
        self.add_line("");

        let kernels = plan.kernels();
        self.generate_map(ir);
        if kernels.contains(&Kernel::TileCount) {
            self.add_line("");
            self.generate_tree_reduce(Kernel::TileCount, "int", false, true, "tile_sums");
            self.add_line("");
            self.generate_tile_scan();
            self.add_line("");
            self.generate_compact(cl_type(&ir.elem));
        }
        if kernels.contains(&Kernel::Reduce) {
            let t = cl_type(&ir.reduce_type());
            let values = ir.terminal == Terminal::Sum;
            let marks = ir.filtered || ir.terminal == Terminal::Count;
            self.add_line("");
            self.generate_tree_reduce(Kernel::Reduce, t, values, marks, "partials");
            self.add_line("");
            self.generate_reduce_final(t);
        }
        self.code.clone()
    }

    /// Element-wise kernel: inputs, scalar arguments, then its outputs
    fn generate_map(&mut self, ir: &KernelIr) {
        let mut params = Vec::new();
        for (i, buffer) in ir.buffers.iter().enumerate() {
            params.push(format!("__global const {}* in{}", cl_type(buffer.elem_type()), i));
        }
        for (i, (_, ty)) in ir.args.iter().enumerate() {
            params.push(format!("const {} a{}", cl_type(ty), i));
        }
        let writes_values = ir.terminal != Terminal::Count;
        let writes_marks = ir.filtered || ir.terminal == Terminal::Count;
        if writes_values {
            params.push(format!("__global {}* values", cl_type(&ir.elem)));
        }
        if writes_marks {
            params.push("__global int* marks".to_string());
        }
        params.push("const int n".to_string());

        self.add_line(&format!("__kernel void {}({})", Kernel::Map.entry(), params.join(", ")));
        self.add_line("{");
        self.indent += 1;
        self.add_line("const int gid = get_global_id(0);");
        self.add_line("if (gid >= n) return;");
        for stmt in &ir.body {
            match stmt {
                KernelStmt::Let(local, value) => {
                    let line = format!(
                        "const {} l{} = {};",
                        cl_type(&ir.locals[*local]),
                        local,
                        Self::expr(value, &ir.locals)
                    );
                    self.add_line(&line);
                }
                KernelStmt::Guard(cond) => {
                    let line = format!("if (!{}) {{", Self::expr(cond, &ir.locals));
                    self.add_line(&line);
                    self.indent += 1;
                    self.add_line("marks[gid] = 0;");
                    self.add_line("return;");
                    self.indent -= 1;
                    self.add_line("}");
                }
            }
        }
        if writes_values {
            let line = format!("values[gid] = {};", Self::expr(&ir.result, &ir.locals));
            self.add_line(&line);
        }
        if writes_marks {
            self.add_line("marks[gid] = 1;");
        }
        self.indent -= 1;
        self.add_line("}");
    }

    /// First-pass work-group tree reduction of values, marks, or both
    fn generate_tree_reduce(&mut self, kernel: Kernel, t: &str, values: bool, marks: bool, out: &str) {
        let mut params = Vec::new();
        if values {
            params.push(format!("__global const {}* values", t));
        }
        if marks {
            params.push("__global const int* marks".to_string());
        }
        params.push(format!("__global {}* {}", t, out));
        params.push("const int n".to_string());

        self.add_line(&format!("__kernel void {}({})", kernel.entry(), params.join(", ")));
        self.add_line("{");
        self.indent += 1;
        self.add_line(&format!("__local {} scratch[PF_WG];", t));
        self.add_line("const int gid = get_global_id(0);");
        self.add_line("const int lid = get_local_id(0);");
        self.add_line(&format!("{} v = 0;", t));
        let load = match (values, marks) {
            (true, true) => "if (gid < n && marks[gid]) v = values[gid];",
            (true, false) => "if (gid < n) v = values[gid];",
            _ => "if (gid < n) v = marks[gid];",
        };
        self.add_line(load);
        self.generate_local_tree(out, "get_group_id(0)");
        self.indent -= 1;
        self.add_line("}");
    }

    fn generate_reduce_final(&mut self, t: &str) {
        self.add_line(&format!(
            "__kernel void {}(__global const {}* partials, __global {}* result, const int groups)",
            Kernel::ReduceFinal.entry(),
            t,
            t
        ));
        self.add_line("{");
        self.indent += 1;
        self.add_line(&format!("__local {} scratch[PF_WG];", t));
        self.add_line("const int lid = get_local_id(0);");
        self.add_line(&format!("{} v = 0;", t));
        self.add_line("for (int i = lid; i < groups; i += PF_WG) v += partials[i];");
        self.generate_local_tree("result", "0");
        self.indent -= 1;
        self.add_line("}");
    }

    /// `scratch[lid] = v`, halving tree, lane 0 stores
    fn generate_local_tree(&mut self, out: &str, slot: &str) {
        self.add_line("scratch[lid] = v;");
        self.add_line("barrier(CLK_LOCAL_MEM_FENCE);");
        self.add_line("for (int s = PF_WG / 2; s > 0; s >>= 1) {");
        self.indent += 1;
        self.add_line("if (lid < s) scratch[lid] += scratch[lid + s];");
        self.add_line("barrier(CLK_LOCAL_MEM_FENCE);");
        self.indent -= 1;
        self.add_line("}");
        self.add_line(&format!("if (lid == 0) {}[{}] = scratch[0];", out, slot));
    }

    fn generate_tile_scan(&mut self) {
        self.add_line(&format!(
            "__kernel void {}(__global const int* marks, __global const int* tile_prefix, \
             __global int* positions, const int n)",
            Kernel::TileScan.entry()
        ));
        self.add_line("{");
        self.indent += 1;
        self.add_line("__local int scratch[PF_WG];");
        self.add_line("const int gid = get_global_id(0);");
        self.add_line("const int lid = get_local_id(0);");
        self.add_line("const int m = gid < n ? marks[gid] : 0;");
        self.add_line("scratch[lid] = m;");
        self.add_line("barrier(CLK_LOCAL_MEM_FENCE);");
        self.add_line("for (int offset = 1; offset < PF_WG; offset <<= 1) {");
        self.indent += 1;
        self.add_line("const int t = lid >= offset ? scratch[lid - offset] : 0;");
        self.add_line("barrier(CLK_LOCAL_MEM_FENCE);");
        self.add_line("scratch[lid] += t;");
        self.add_line("barrier(CLK_LOCAL_MEM_FENCE);");
        self.indent -= 1;
        self.add_line("}");
        self.add_line("if (gid < n) positions[gid] = tile_prefix[get_group_id(0)] + scratch[lid] - m;");
        self.indent -= 1;
        self.add_line("}");
    }

    fn generate_compact(&mut self, t: &str) {
        self.add_line(&format!(
            "__kernel void {}(__global const {}* values, __global const int* marks, \
             __global const int* positions, __global {}* compacted, const int n)",
            Kernel::Compact.entry(),
            t,
            t
        ));
        self.add_line("{");
        self.indent += 1;
        self.add_line("const int gid = get_global_id(0);");
        self.add_line("if (gid < n && marks[gid]) compacted[positions[gid]] = values[gid];");
        self.indent -= 1;
        self.add_line("}");
    }

    fn expr(expr: &KernelExpr, locals: &[ElemType]) -> String {
        let floating = |e: &KernelExpr| Self::type_of(e, locals).is_some_and(|t| t.is_floating());
        match expr {
            KernelExpr::Lit(value, ty) => literal(value, ty),
            KernelExpr::Local(i) => format!("l{}", i),
            KernelExpr::Arg(i) => format!("a{}", i),
            KernelExpr::Gid => "gid".to_string(),
            KernelExpr::Read { buffer, index } => {
                format!("in{}[{}]", buffer, Self::expr(index, locals))
            }
            KernelExpr::Unary(UnaryOp::Neg, a) => format!("(-{})", Self::expr(a, locals)),
            KernelExpr::Unary(UnaryOp::Not, a) => format!("(!{})", Self::expr(a, locals)),
            KernelExpr::Binary(BinaryOp::Rem, a, b) if floating(a) => format!(
                "fmod({}, {})",
                Self::expr(a, locals),
                Self::expr(b, locals)
            ),
            KernelExpr::Binary(op, a, b) => format!(
                "({} {} {})",
                Self::expr(a, locals),
                op.symbol(),
                Self::expr(b, locals)
            ),
            KernelExpr::Cond(c, t, e) => format!(
                "({} ? {} : {})",
                Self::expr(c, locals),
                Self::expr(t, locals),
                Self::expr(e, locals)
            ),
            KernelExpr::Math(func, args) => {
                let float_args = args.first().is_some_and(floating);
                let name = match func {
                    MathFn::Abs if float_args => "fabs",
                    MathFn::Min if float_args => "fmin",
                    MathFn::Max if float_args => "fmax",
                    other => other.name(),
                };
                let args: Vec<String> = args.iter().map(|a| Self::expr(a, locals)).collect();
                format!("{}({})", name, args.join(", "))
            }
            KernelExpr::Convert(a, to) => format!("(({}){})", cl_type(to), Self::expr(a, locals)),
        }
    }

    /// Static type of a kernel expression where it is cheap to know
    fn type_of(expr: &KernelExpr, locals: &[ElemType]) -> Option<ElemType> {
        match expr {
            KernelExpr::Lit(_, ty) | KernelExpr::Convert(_, ty) => Some(ty.clone()),
            KernelExpr::Local(i) => locals.get(*i).cloned(),
            KernelExpr::Gid => Some(ElemType::Int),
            KernelExpr::Unary(UnaryOp::Neg, a) => Self::type_of(a, locals),
            KernelExpr::Unary(UnaryOp::Not, _) => Some(ElemType::Bool),
            KernelExpr::Binary(op, _, _) if op.is_comparison() => Some(ElemType::Bool),
            KernelExpr::Binary(BinaryOp::And | BinaryOp::Or, _, _) => Some(ElemType::Bool),
            KernelExpr::Binary(_, a, b) => {
                Self::type_of(a, locals).or_else(|| Self::type_of(b, locals))
            }
            KernelExpr::Cond(_, t, e) => Self::type_of(t, locals).or_else(|| Self::type_of(e, locals)),
            KernelExpr::Math(_, args) => args.first().and_then(|a| Self::type_of(a, locals)),
            KernelExpr::Arg(_) | KernelExpr::Read { .. } => None,
        }
    }

    /// Add a line with proper indentation
    fn add_line(&mut self, line: &str) {
        for _ in 0..self.indent {
            self.code.push_str("    ");
        }
        self.code.push_str(line);
        self.code.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::node::{Query, QueryNode};
    use crate::config::DeviceConfig;
    use crate::device::{DeviceContext, ir};

    fn source(node: QueryNode) -> String {
        let config = DeviceConfig::default();
        let ir = ir::lower(&Query::new(node), 0, &config).unwrap();
        let plan = LaunchPlan::build(&ir, config.work_group_size);
        CodeGenerator::new().generate(&ir, &plan, config.enable_fp64)
    }

    #[test]
    fn test_map_kernel_text() {
        let ctx = DeviceContext::new();
        let buf = ctx.create_ints(&[1, 2, 3]).unwrap();
        let text = source(
            QueryNode::from_buffer(&buf)
                .filter(|x| (x % 2).equals(1))
                .unwrap()
                .select(|x| x * 3)
                .unwrap()
                .to_array()
                .unwrap(),
        );
        assert!(text.contains("__kernel void pf_map(__global const int* in0, __global int* values, __global int* marks, const int n)"));
        assert!(text.contains("marks[gid] = 0;"));
        assert!(text.contains("__kernel void pf_tile_scan"));
        assert!(text.contains("__kernel void pf_compact"));
        assert!(!text.contains("cl_khr_fp64"));
    }

    #[test]
    fn test_double_sum_kernels() {
        let ctx = DeviceContext::new();
        let buf = ctx.create_doubles(&[1.5, 2.5]).unwrap();
        let text = source(
            QueryNode::from_buffer(&buf)
                .select(|x| x.sqrt().max(1.0))
                .unwrap()
                .sum()
                .unwrap(),
        );
        assert!(text.contains("#pragma OPENCL EXTENSION cl_khr_fp64 : enable"));
        assert!(text.contains("fmax(sqrt("));
        assert!(text.contains("__kernel void pf_reduce(__global const double* values, __global double* partials, const int n)"));
        assert!(text.contains("__kernel void pf_reduce_final"));
        assert!(text.contains("#define PF_WG 64"));
    }

    #[test]
    fn test_literals() {
        assert_eq!(literal(&Value::Long(3), &ElemType::Long), "3L");
        assert_eq!(literal(&Value::float(2.0), &ElemType::Float), "2.0f");
        assert_eq!(literal(&Value::double(f64::INFINITY), &ElemType::Double), "INFINITY");
    }
}
