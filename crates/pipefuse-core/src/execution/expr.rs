//! Expression compilation
//!
//! Turns [`Expr`] trees into closures over a [`Frame`]. Variables resolve to
//! frame slots at compile time, so evaluating a lambda body does no name
//! lookups.

use crate::ast::expr::{BinaryOp, Expr, Lambda};
use crate::error::{Error, Result};
use crate::execution::frame::Frame;
use crate::execution::sequential::Lowerer;
use crate::ops;
use crate::value::Value;
use std::sync::Arc;

/// Compiled expression
pub type Eval = Arc<dyn Fn(&mut Frame) -> Result<Value> + Send + Sync>;

/// Compiled lambda: parameter slots plus body
#[derive(Clone)]
pub struct CompiledLambda {
    slots: Vec<usize>,
    body: Eval,
}

impl CompiledLambda {
    /// Call with one argument
    pub fn call1(&self, frame: &mut Frame, a: Value) -> Result<Value> {
        frame.values[self.slots[0]] = a;
        (self.body)(frame)
    }

    /// Call with two arguments
    pub fn call2(&self, frame: &mut Frame, a: Value, b: Value) -> Result<Value> {
        frame.values[self.slots[0]] = a;
        frame.values[self.slots[1]] = b;
        (self.body)(frame)
    }

    /// Call a one-argument predicate
    pub fn test1(&self, frame: &mut Frame, a: Value) -> Result<bool> {
        ops::truthy(&self.call1(frame, a)?)
    }

    /// Call a two-argument predicate
    pub fn test2(&self, frame: &mut Frame, a: Value, b: Value) -> Result<bool> {
        ops::truthy(&self.call2(frame, a, b)?)
    }
}

fn evals(lowerer: &mut Lowerer, exprs: &[Expr]) -> Result<Vec<Eval>> {
    exprs.iter().map(|e| lowerer.compile_expr(e)).collect()
}

fn run_all(evals: &[Eval], frame: &mut Frame) -> Result<Vec<Value>> {
    evals.iter().map(|e| e(frame)).collect()
}

impl Lowerer {
    /// Compile a lambda; its parameters get fresh slots visible only in the body
    pub fn compile_lambda(&mut self, lambda: &Lambda) -> Result<CompiledLambda> {
        let mark = self.env_mark();
        let slots: Vec<usize> = lambda
            .params
            .iter()
            .map(|p| self.bind(&p.name))
            .collect();
        let body = self.compile_expr(&lambda.body);
        self.unbind_to(mark);
        Ok(CompiledLambda { slots, body: body? })
    }

    /// Compile an expression against the current variable scope
    pub fn compile_expr(&mut self, expr: &Expr) -> Result<Eval> {
        Ok(match expr {
            Expr::Const { value, .. } | Expr::Captured { value, .. } => {
                let value = value.clone();
                Arc::new(move |_| Ok(value.clone()))
            }
            Expr::Var(var) => {
                let slot = self.lookup(&var.name)?;
                Arc::new(move |f| Ok(f.values[slot].clone()))
            }
            Expr::Param { index, .. } => {
                let slot = self.param_slot(*index)?;
                Arc::new(move |f| Ok(f.values[slot].clone()))
            }
            Expr::Unary { op, operand } => {
                let op = *op;
                let a = self.compile_expr(operand)?;
                Arc::new(move |f| ops::unary(op, &a(f)?))
            }
            Expr::Binary { op, lhs, rhs } => {
                let op = *op;
                let a = self.compile_expr(lhs)?;
                let b = self.compile_expr(rhs)?;
                match op {
                    BinaryOp::And => Arc::new(move |f| {
                        Ok(Value::Bool(ops::truthy(&a(f)?)? && ops::truthy(&b(f)?)?))
                    }),
                    BinaryOp::Or => Arc::new(move |f| {
                        Ok(Value::Bool(ops::truthy(&a(f)?)? || ops::truthy(&b(f)?)?))
                    }),
                    _ => Arc::new(move |f| {
                        let l = a(f)?;
                        ops::binary(op, &l, &b(f)?)
                    }),
                }
            }
            Expr::Cond {
                cond,
                then,
                otherwise,
            } => {
                let c = self.compile_expr(cond)?;
                let t = self.compile_expr(then)?;
                let e = self.compile_expr(otherwise)?;
                Arc::new(move |f| {
                    if ops::truthy(&c(f)?)? {
                        t(f)
                    } else {
                        e(f)
                    }
                })
            }
            Expr::Math { func, args } => {
                let func = *func;
                let args = evals(self, args)?;
                Arc::new(move |f| ops::math(func, &run_all(&args, f)?))
            }
            Expr::Convert { expr, to } => {
                let to = to.clone();
                let a = self.compile_expr(expr)?;
                Arc::new(move |f| ops::convert(&a(f)?, &to))
            }
            Expr::Tuple(fields) => {
                let fields = evals(self, fields)?;
                Arc::new(move |f| Ok(Value::tuple(run_all(&fields, f)?)))
            }
            Expr::Field { expr, index } => {
                let index = *index;
                let a = self.compile_expr(expr)?;
                Arc::new(move |f| ops::field(&a(f)?, index))
            }
            Expr::Index { seq, index } => {
                let s = self.compile_expr(seq)?;
                let i = self.compile_expr(index)?;
                Arc::new(move |f| {
                    let seq = s(f)?;
                    ops::index(&seq, &i(f)?)
                })
            }
            Expr::Query(node) => self.lower_value(node)?,
            Expr::Host { func, args } => {
                let func = func.clone();
                let args = evals(self, args)?;
                Arc::new(move |f| func.call(&run_all(&args, f)?))
            }
            Expr::Buffer(_) => {
                return Err(Error::compile(
                    "device buffers can only be read by the device backend",
                ));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::expr::Var;
    use crate::execution::frame::Frame;
    use crate::value::ElemType;

    fn eval(expr: &Expr) -> Result<Value> {
        let mut lowerer = Lowerer::new(0);
        let compiled = lowerer.compile_expr(expr)?;
        let mut frame = Frame::new(lowerer.layout());
        compiled(&mut frame)
    }

    #[test]
    fn test_arithmetic_and_strings() {
        assert_eq!(eval(&(Expr::int(6) * 7)).unwrap(), Value::Int(42));
        assert_eq!(
            eval(&(Expr::int(8).to_str() + "!")).unwrap(),
            Value::str("8!")
        );
    }

    #[test]
    fn test_short_circuit() {
        let boom = (Expr::int(1) / 0).equals(0);
        assert_eq!(
            eval(&Expr::bool(false).and(boom.clone())).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(eval(&Expr::bool(true).or(boom.clone())).unwrap(), Value::Bool(true));
        assert!(eval(&Expr::bool(true).and(boom)).is_err());
    }

    #[test]
    fn test_cond_is_lazy() {
        let e = Expr::if_then_else(Expr::bool(true), Expr::int(1), Expr::int(1) / 0);
        assert_eq!(eval(&e).unwrap(), Value::Int(1));
    }

    #[test]
    fn test_lambda_slots() {
        let mut lowerer = Lowerer::new(0);
        let lambda = Lambda::binary(ElemType::Int, ElemType::Int, |a, b| a - b);
        let compiled = lowerer.compile_lambda(&lambda).unwrap();
        let mut frame = Frame::new(lowerer.layout());
        assert_eq!(
            compiled.call2(&mut frame, Value::Int(5), Value::Int(3)).unwrap(),
            Value::Int(2)
        );
    }

    #[test]
    fn test_unbound_variable_is_compile_error() {
        let mut lowerer = Lowerer::new(0);
        let x = Var::new("nowhere", ElemType::Int);
        assert!(lowerer.compile_expr(&x.expr()).is_err());
        assert!(lowerer.compile_expr(&Expr::param(2, ElemType::Int)).is_err());
    }
}
