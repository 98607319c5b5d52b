//! Device lowering
//!
//! Checks that a query stays inside the device subset and flattens its
//! element-wise part into straight-line kernel statements over the global
//! id. Everything outside the subset is rejected with
//! [`Error::UnsupportedForDevice`] before any code is generated.

use crate::ast::expr::{BinaryOp, Expr, Lambda, MathFn, UnaryOp, Var};
use crate::ast::node::{Query, QueryNode, Source, Step};
use crate::config::DeviceConfig;
use crate::device::DeviceBuffer;
use crate::error::{Error, Result};
use crate::value::{ElemType, Value};
use std::sync::Arc;
use tracing::debug;

/// What the kernel pipeline ends in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// Elements written back to an array
    Array,
    /// Work-group tree sum
    Sum,
    /// Work-group tree count
    Count,
}

/// Kernel expression
#[derive(Debug, Clone, PartialEq)]
pub enum KernelExpr {
    /// Literal
    Lit(Value, ElemType),
    /// Kernel local
    Local(usize),
    /// Scalar kernel argument
    Arg(usize),
    /// Global id of the work item
    Gid,
    /// Read from a bound input buffer
    Read {
        /// Position in [`KernelIr::buffers`]
        buffer: usize,
        /// Int position
        index: Box<KernelExpr>,
    },
    /// Unary operator
    Unary(UnaryOp, Box<KernelExpr>),
    /// Binary operator
    Binary(BinaryOp, Box<KernelExpr>, Box<KernelExpr>),
    /// Ternary select
    Cond(Box<KernelExpr>, Box<KernelExpr>, Box<KernelExpr>),
    /// Math builtin
    Math(MathFn, Vec<KernelExpr>),
    /// Numeric cast
    Convert(Box<KernelExpr>, ElemType),
}

/// Kernel statement
#[derive(Debug, Clone, PartialEq)]
pub enum KernelStmt {
    /// Assign a local
    Let(usize, KernelExpr),
    /// Drop the element unless the condition holds
    Guard(KernelExpr),
}

/// Element-wise kernel body plus everything the launch plan needs
#[derive(Debug, Clone)]
pub struct KernelIr {
    /// Input buffers; the source first, the right side of a zip second
    pub buffers: Vec<DeviceBuffer>,
    /// Whether buffers 0 and 1 are zipped
    pub zipped: bool,
    /// Host expressions evaluated once per run into scalar kernel arguments
    pub args: Vec<(Expr, ElemType)>,
    /// Types of the kernel locals
    pub locals: Vec<ElemType>,
    /// Statements per work item
    pub body: Vec<KernelStmt>,
    /// Element produced by a surviving work item
    pub result: KernelExpr,
    /// Type of `result`
    pub elem: ElemType,
    /// Whether any guard can drop elements
    pub filtered: bool,
    /// Terminal operator
    pub terminal: Terminal,
    /// Number of work items
    pub n: usize,
}

impl KernelIr {
    /// Whether double precision is needed anywhere in the kernel
    pub fn uses_fp64(&self) -> bool {
        self.elem == ElemType::Double
            || self.locals.contains(&ElemType::Double)
            || self.args.iter().any(|(_, ty)| *ty == ElemType::Double)
            || self.buffers.iter().any(|b| *b.elem_type() == ElemType::Double)
    }

    /// Type of the value the reduction kernels combine
    pub fn reduce_type(&self) -> ElemType {
        match self.terminal {
            Terminal::Count => ElemType::Int,
            _ => self.elem.clone(),
        }
    }
}

fn unsupported(what: impl Into<String>) -> Error {
    Error::unsupported_for_device(what)
}

struct DeviceLowering<'q> {
    hoisted: &'q [(Var, Expr)],
    arity: usize,
    fp64: bool,
    env: Vec<(Arc<str>, usize)>,
    buffers: Vec<DeviceBuffer>,
    args: Vec<(Expr, ElemType)>,
    locals: Vec<ElemType>,
    body: Vec<KernelStmt>,
    filtered: bool,
}

impl<'q> DeviceLowering<'q> {
    fn scalar(&self, ty: &ElemType) -> Result<()> {
        match ty {
            ElemType::Bool | ElemType::Int | ElemType::Long | ElemType::Float => Ok(()),
            ElemType::Double if self.fp64 => Ok(()),
            ElemType::Double => Err(unsupported("double precision is disabled for this device")),
            other => Err(unsupported(format!("{} values cannot live on the device", other))),
        }
    }

    fn element(&self, ty: &ElemType) -> Result<()> {
        self.scalar(ty)?;
        if *ty == ElemType::Bool {
            return Err(unsupported("bool elements cannot be stored in device buffers"));
        }
        Ok(())
    }

    fn local(&mut self, ty: ElemType, value: KernelExpr) -> usize {
        self.locals.push(ty);
        let id = self.locals.len() - 1;
        self.body.push(KernelStmt::Let(id, value));
        id
    }

    fn arg(&mut self, expr: Expr, ty: ElemType) -> usize {
        if let Some(i) = self.args.iter().position(|(e, _)| *e == expr) {
            return i;
        }
        self.args.push((expr, ty));
        self.args.len() - 1
    }

    fn bind_buffer(&mut self, buffer: &DeviceBuffer) -> Result<usize> {
        self.element(buffer.elem_type())?;
        if let Some(i) = self.buffers.iter().position(|b| b == buffer) {
            return Ok(i);
        }
        self.buffers.push(buffer.clone());
        Ok(self.buffers.len() - 1)
    }

    /// Bind the lambda's parameters to fresh locals and lower its body
    fn apply(&mut self, lambda: &Lambda, args: Vec<KernelExpr>) -> Result<KernelExpr> {
        let mark = self.env.len();
        for (param, arg) in lambda.params.iter().zip(args) {
            self.scalar(&param.ty)?;
            let local = self.local(param.ty.clone(), arg);
            self.env.push((param.name.clone(), local));
        }
        let body = self.expr(&lambda.body);
        self.env.truncate(mark);
        body
    }

    fn expr(&mut self, expr: &Expr) -> Result<KernelExpr> {
        let ty = expr.infer()?;
        self.scalar(&ty)?;
        Ok(match expr {
            Expr::Const { value, ty } | Expr::Captured { value, ty, .. } => {
                KernelExpr::Lit(value.clone(), ty.clone())
            }
            Expr::Var(var) => {
                if let Some((_, local)) = self.env.iter().rev().find(|(n, _)| *n == var.name) {
                    KernelExpr::Local(*local)
                } else if self.hoisted.iter().any(|(v, _)| v.name == var.name) {
                    KernelExpr::Arg(self.arg(expr.clone(), ty))
                } else {
                    return Err(Error::compile(format!("unbound variable {}", var.name)));
                }
            }
            Expr::Param { index, .. } => {
                if *index >= self.arity {
                    return Err(Error::compile(format!(
                        "template parameter {} out of range for {} argument(s)",
                        index, self.arity
                    )));
                }
                KernelExpr::Arg(self.arg(expr.clone(), ty))
            }
            Expr::Unary { op, operand } => KernelExpr::Unary(*op, Box::new(self.expr(operand)?)),
            Expr::Binary { op, lhs, rhs } => {
                KernelExpr::Binary(*op, Box::new(self.expr(lhs)?), Box::new(self.expr(rhs)?))
            }
            Expr::Cond {
                cond,
                then,
                otherwise,
            } => KernelExpr::Cond(
                Box::new(self.expr(cond)?),
                Box::new(self.expr(then)?),
                Box::new(self.expr(otherwise)?),
            ),
            Expr::Math { func, args } => KernelExpr::Math(
                *func,
                args.iter().map(|a| self.expr(a)).collect::<Result<_>>()?,
            ),
            Expr::Convert { expr: inner, to } => {
                let from = inner.infer()?;
                if to == &ElemType::Bool || (!from.is_numeric() && from != ElemType::Bool) {
                    return Err(unsupported(format!("conversion from {} to {}", from, to)));
                }
                KernelExpr::Convert(Box::new(self.expr(inner)?), to.clone())
            }
            Expr::Index { seq, index } => match &**seq {
                Expr::Buffer(buffer) => {
                    let buffer = self.bind_buffer(buffer)?;
                    KernelExpr::Read {
                        buffer,
                        index: Box::new(self.expr(index)?),
                    }
                }
                _ => return Err(unsupported("indexing anything but a device buffer")),
            },
            Expr::Tuple(_) | Expr::Field { .. } => {
                return Err(unsupported("tuples outside decomposed locals"));
            }
            Expr::Query(_) => return Err(unsupported("nested queries")),
            Expr::Host { func, .. } => {
                return Err(unsupported(format!("host function {}", func.name())));
            }
            Expr::Buffer(_) => return Err(unsupported("a device buffer used as a value")),
        })
    }

    fn indexed(&self, what: &str) -> Result<()> {
        if self.filtered {
            return Err(unsupported(format!("{} after a filter", what)));
        }
        Ok(())
    }

    fn map(&mut self, f: &Lambda, current: KernelExpr) -> Result<KernelExpr> {
        self.apply(f, vec![current])
    }

    fn filter(&mut self, p: &Lambda, ty: &ElemType, current: KernelExpr) -> Result<KernelExpr> {
        let element = self.local(ty.clone(), current);
        let cond = self.apply(p, vec![KernelExpr::Local(element)])?;
        self.body.push(KernelStmt::Guard(cond));
        self.filtered = true;
        Ok(KernelExpr::Local(element))
    }

    fn steps(&mut self, steps: &[Step], input: &ElemType, mut current: KernelExpr) -> Result<KernelExpr> {
        let mark = self.env.len();
        let mut ty = input.clone();
        for step in steps {
            match step {
                Step::Map(f) => {
                    current = self.map(f, current)?;
                    ty = f.return_type()?;
                }
                Step::MapIndexed(f) => {
                    self.indexed("indexed map")?;
                    current = self.apply(f, vec![current, KernelExpr::Gid])?;
                    ty = f.return_type()?;
                }
                Step::Filter(p) => current = self.filter(p, &ty, current)?,
                Step::FilterIndexed(p) => {
                    self.indexed("indexed filter")?;
                    let element = self.local(ty.clone(), current);
                    let cond = self.apply(p, vec![KernelExpr::Local(element), KernelExpr::Gid])?;
                    self.body.push(KernelStmt::Guard(cond));
                    self.filtered = true;
                    current = KernelExpr::Local(element);
                }
                Step::Bind { param, locals } => {
                    self.scalar(&ty)?;
                    let element = self.local(ty.clone(), current.clone());
                    self.env.push((param.name.clone(), element));
                    for (var, e) in locals {
                        let value = self.expr(e)?;
                        let local = self.local(var.ty.clone(), value);
                        self.env.push((var.name.clone(), local));
                    }
                }
                Step::MapLocals(e) => {
                    ty = e.infer()?;
                    current = self.expr(e)?;
                }
                Step::FilterLocals(e) => {
                    let cond = self.expr(e)?;
                    self.body.push(KernelStmt::Guard(cond));
                    self.filtered = true;
                }
            }
        }
        self.env.truncate(mark);
        Ok(current)
    }

    /// Lower the streaming part; returns the element expression and type
    fn stream(&mut self, node: &QueryNode) -> Result<(KernelExpr, ElemType, usize)> {
        match node {
            QueryNode::Source {
                source: Source::Device(buffer),
                elem,
            } => {
                let slot = self.bind_buffer(buffer)?;
                let read = KernelExpr::Read {
                    buffer: slot,
                    index: Box::new(KernelExpr::Gid),
                };
                Ok((read, elem.clone(), buffer.len()))
            }
            QueryNode::Source { .. } => Err(unsupported("host-resident sources")),
            QueryNode::ZipWith {
                left,
                right,
                combiner,
                elem,
            } => {
                let (
                    QueryNode::Source {
                        source: Source::Device(a),
                        ..
                    },
                    QueryNode::Source {
                        source: Source::Device(b),
                        ..
                    },
                ) = (&**left, &**right)
                else {
                    return Err(unsupported("zip of anything but two device buffers"));
                };
                if !self.buffers.is_empty() {
                    return Err(Error::internal("zip lowered after other buffers were bound"));
                }
                self.element(a.elem_type())?;
                self.element(b.elem_type())?;
                self.buffers.push(a.clone());
                self.buffers.push(b.clone());
                let read = |buffer| KernelExpr::Read {
                    buffer,
                    index: Box::new(KernelExpr::Gid),
                };
                let value = self.apply(combiner, vec![read(0), read(1)])?;
                Ok((value, elem.clone(), a.len().min(b.len())))
            }
            QueryNode::Transform {
                input, selector, elem,
            } => {
                let (current, _, n) = self.stream(input)?;
                Ok((self.map(selector, current)?, elem.clone(), n))
            }
            QueryNode::TransformIndexed {
                input, selector, elem,
            } => {
                let (current, _, n) = self.stream(input)?;
                self.indexed("indexed map")?;
                Ok((self.apply(selector, vec![current, KernelExpr::Gid])?, elem.clone(), n))
            }
            QueryNode::Filter { input, predicate } => {
                let (current, ty, n) = self.stream(input)?;
                Ok((self.filter(predicate, &ty, current)?, ty, n))
            }
            QueryNode::FilterIndexed { input, predicate } => {
                let (current, ty, n) = self.stream(input)?;
                self.indexed("indexed filter")?;
                let element = self.local(ty.clone(), current);
                let cond = self.apply(predicate, vec![KernelExpr::Local(element), KernelExpr::Gid])?;
                self.body.push(KernelStmt::Guard(cond));
                self.filtered = true;
                Ok((KernelExpr::Local(element), ty, n))
            }
            QueryNode::Fused { input, steps, elem } => {
                let (current, ty, n) = self.stream(input)?;
                Ok((self.steps(steps, &ty, current)?, elem.clone(), n))
            }
            other => Err(unsupported(format!("{} on the device", other.name()))),
        }
    }
}

/// Lower `query` into a kernel pipeline for `arity` scalar template arguments
pub fn lower(query: &Query, arity: usize, config: &DeviceConfig) -> Result<KernelIr> {
    let (terminal, input) = match &query.root {
        QueryNode::Sum { input, .. } => (Terminal::Sum, &**input),
        QueryNode::Count { input } => (Terminal::Count, &**input),
        QueryNode::ToList { input } | QueryNode::ToArray { input } => (Terminal::Array, &**input),
        QueryNode::Aggregate { .. } | QueryNode::ForEach { .. } => {
            return Err(unsupported(format!("{} on the device", query.root.name())));
        }
        stream => (Terminal::Array, stream),
    };

    let mut lowering = DeviceLowering {
        hoisted: &query.hoisted,
        arity,
        fp64: config.enable_fp64,
        env: Vec::new(),
        buffers: Vec::new(),
        args: Vec::new(),
        locals: Vec::new(),
        body: Vec::new(),
        filtered: false,
    };
    let zipped = matches!(leaf(input), QueryNode::ZipWith { .. });
    let (result, elem, n) = lowering.stream(input)?;
    match terminal {
        Terminal::Count => lowering.scalar(&elem)?,
        _ => lowering.element(&elem)?,
    }

    let ir = KernelIr {
        buffers: lowering.buffers,
        zipped,
        args: lowering.args,
        locals: lowering.locals,
        body: lowering.body,
        result,
        elem,
        filtered: lowering.filtered,
        terminal,
        n,
    };
    debug!(
        n = ir.n,
        locals = ir.locals.len(),
        buffers = ir.buffers.len(),
        args = ir.args.len(),
        filtered = ir.filtered,
        "lowered device kernel"
    );
    Ok(ir)
}

/// Bottom of the element-wise chain
fn leaf(node: &QueryNode) -> &QueryNode {
    match node {
        QueryNode::Transform { input, .. }
        | QueryNode::TransformIndexed { input, .. }
        | QueryNode::Filter { input, .. }
        | QueryNode::FilterIndexed { input, .. }
        | QueryNode::Fused { input, .. } => leaf(input),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceContext;

    fn lower_default(node: QueryNode) -> Result<KernelIr> {
        lower(&Query::new(node), 0, &DeviceConfig::default())
    }

    #[test]
    fn test_map_filter_sum() {
        let ctx = DeviceContext::new();
        let buf = ctx.create_ints(&[1, 2, 3, 4]).unwrap();
        let ir = lower_default(
            QueryNode::from_buffer(&buf)
                .filter(|x| (x % 2).equals(0))
                .unwrap()
                .select(|x| x * 2)
                .unwrap()
                .sum()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(ir.terminal, Terminal::Sum);
        assert!(ir.filtered);
        assert_eq!(ir.n, 4);
        assert_eq!(ir.elem, ElemType::Int);
        assert!(matches!(ir.body.last(), Some(KernelStmt::Let(..))));
    }

    #[test]
    fn test_rejects_strings_and_host_sources() {
        let ctx = DeviceContext::new();
        let buf = ctx.create_ints(&[1]).unwrap();
        let err = lower_default(
            QueryNode::from_buffer(&buf)
                .select(|x| x.to_str())
                .unwrap()
                .to_list()
                .unwrap(),
        )
        .unwrap_err();
        assert!(err.is_unsupported_for_device());

        let err = lower_default(QueryNode::from_ints(&[1]).sum().unwrap()).unwrap_err();
        assert!(err.is_unsupported_for_device());
    }

    #[test]
    fn test_indexed_map_after_filter_is_rejected() {
        let ctx = DeviceContext::new();
        let buf = ctx.create_ints(&[1, 2]).unwrap();
        let err = lower_default(
            QueryNode::from_buffer(&buf)
                .filter(|x| x.gt(1))
                .unwrap()
                .select_indexed(|x, i| x + i)
                .unwrap()
                .to_array()
                .unwrap(),
        )
        .unwrap_err();
        assert!(err.is_unsupported_for_device());
    }

    #[test]
    fn test_fp64_toggle() {
        let ctx = DeviceContext::new();
        let buf = ctx.create_doubles(&[1.0]).unwrap();
        let node = QueryNode::from_buffer(&buf).sum().unwrap();
        let config = DeviceConfig {
            enable_fp64: false,
            ..DeviceConfig::default()
        };
        let err = lower(&Query::new(node.clone()), 0, &config).unwrap_err();
        assert!(err.is_unsupported_for_device());
        assert!(lower_default(node).unwrap().uses_fp64());
    }

    #[test]
    fn test_zip_and_buffer_reads() {
        let ctx = DeviceContext::new();
        let a = ctx.create_floats(&[1.0, 2.0, 3.0]).unwrap();
        let b = ctx.create_floats(&[4.0, 5.0]).unwrap();
        let table = ctx.create_floats(&[10.0, 20.0]).unwrap();
        let ir = lower_default(
            QueryNode::from_buffer(&a)
                .zip_with(QueryNode::from_buffer(&b), |x, y| x * y)
                .unwrap()
                .select(|v| v + Expr::Buffer(table.clone()).at(0))
                .unwrap()
                .to_array()
                .unwrap(),
        )
        .unwrap();
        assert!(ir.zipped);
        assert_eq!(ir.n, 2);
        assert_eq!(ir.buffers.len(), 3);
    }
}
