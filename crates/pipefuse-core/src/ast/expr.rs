//! Lambda expression IR
//!
//! Lambdas are not opaque closures: they are small typed expression trees,
//! which is what lets the optimizer fuse, detuple and hoist them and lets
//! the device backend print them as kernel source. Host code that cannot be
//! expressed in the IR enters through [`HostFn`].

use crate::ast::node::QueryNode;
use crate::ast::visit::{Rewriter, Substitute, VarUses, Visitor};
use crate::device::DeviceBuffer;
use crate::error::{Error, Result};
use crate::value::{ElemType, Value};
use std::fmt;
use std::ops;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_VAR: AtomicU64 = AtomicU64::new(0);

/// A named, typed variable bound by a lambda or a nested query
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Var {
    /// Variable name; unique within a query when created through [`Var::fresh`]
    pub name: Arc<str>,
    /// Declared type
    pub ty: ElemType,
}

impl Var {
    /// Variable with an explicit name
    pub fn new(name: impl AsRef<str>, ty: ElemType) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            ty,
        }
    }

    /// Variable with a process-unique name derived from `prefix`
    pub fn fresh(prefix: &str, ty: ElemType) -> Self {
        let n = NEXT_VAR.fetch_add(1, Ordering::Relaxed);
        Self::new(format!("{}{}", prefix, n), ty)
    }

    /// Reference to this variable as an expression
    pub fn expr(&self) -> Expr {
        Expr::Var(self.clone())
    }
}

/// Parameterized expression
#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    /// Bound parameters
    pub params: Vec<Var>,
    /// Body
    pub body: Expr,
}

impl Lambda {
    /// Lambda from explicit parameters and body
    pub fn new(params: Vec<Var>, body: Expr) -> Self {
        Self { params, body }
    }

    /// One-parameter lambda built from a Rust closure over the parameter
    pub fn unary(ty: ElemType, f: impl FnOnce(Expr) -> Expr) -> Self {
        let x = Var::fresh("x", ty);
        let body = f(x.expr());
        Self::new(vec![x], body)
    }

    /// Two-parameter lambda built from a Rust closure over the parameters
    pub fn binary(a: ElemType, b: ElemType, f: impl FnOnce(Expr, Expr) -> Expr) -> Self {
        let x = Var::fresh("x", a);
        let y = Var::fresh("y", b);
        let body = f(x.expr(), y.expr());
        Self::new(vec![x, y], body)
    }

    /// Number of parameters
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Type of the body
    pub fn return_type(&self) -> Result<ElemType> {
        self.body.infer()
    }

    /// Check parameter count and types against `expected`, returning the body type
    pub fn check(&self, expected: &[ElemType]) -> Result<ElemType> {
        if self.params.len() != expected.len() {
            return Err(Error::construction(format!(
                "lambda takes {} parameter(s), operator supplies {}",
                self.params.len(),
                expected.len()
            )));
        }
        for (param, ty) in self.params.iter().zip(expected) {
            if &param.ty != ty {
                return Err(Error::type_mismatch(ty, &param.ty));
            }
        }
        self.body.infer()
    }

    /// Check a predicate: parameters as [`Lambda::check`], body must be bool
    pub fn check_predicate(&self, expected: &[ElemType]) -> Result<()> {
        let ty = self.check(expected)?;
        if ty != ElemType::Bool {
            return Err(Error::type_mismatch(ElemType::Bool, ty));
        }
        Ok(())
    }

    /// Substitute `args` for the parameters, yielding the body
    pub fn apply(&self, args: &[Expr]) -> Expr {
        let mut body = self.body.clone();
        for (param, arg) in self.params.iter().zip(args) {
            body = body.subst(&param.name, arg);
        }
        body
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    /// Arithmetic negation
    Neg,
    /// Logical not
    Not,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    /// Addition; concatenation on strings
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Division (integer division by zero fails)
    Div,
    /// Remainder (integer remainder by zero fails)
    Rem,
    /// Equality
    Eq,
    /// Inequality
    Ne,
    /// Less than
    Lt,
    /// Less or equal
    Le,
    /// Greater than
    Gt,
    /// Greater or equal
    Ge,
    /// Short-circuit and
    And,
    /// Short-circuit or
    Or,
}

impl BinaryOp {
    /// Operator symbol
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    /// Comparison operators
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    /// Result type for operand types, or a construction error
    pub fn result_type(&self, lhs: &ElemType, rhs: &ElemType) -> Result<ElemType> {
        if lhs != rhs {
            return Err(Error::type_mismatch(lhs, rhs));
        }
        match self {
            BinaryOp::Add if *lhs == ElemType::Str => Ok(ElemType::Str),
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
                if lhs.is_numeric() {
                    Ok(lhs.clone())
                } else {
                    Err(Error::construction(format!(
                        "operator {} is not defined on {}",
                        self.symbol(),
                        lhs
                    )))
                }
            }
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                Ok(ElemType::Bool)
            }
            BinaryOp::And | BinaryOp::Or => {
                if *lhs == ElemType::Bool {
                    Ok(ElemType::Bool)
                } else {
                    Err(Error::type_mismatch(ElemType::Bool, lhs))
                }
            }
        }
    }
}

/// Elementary numeric functions available on every backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathFn {
    /// Sine
    Sin,
    /// Cosine
    Cos,
    /// Tangent
    Tan,
    /// Floor
    Floor,
    /// Ceiling
    Ceil,
    /// Square root
    Sqrt,
    /// Exponential
    Exp,
    /// Natural logarithm
    Log,
    /// Power (two arguments)
    Pow,
    /// Absolute value
    Abs,
    /// Minimum (two arguments)
    Min,
    /// Maximum (two arguments)
    Max,
}

impl MathFn {
    /// Number of arguments
    pub fn arity(&self) -> usize {
        match self {
            MathFn::Pow | MathFn::Min | MathFn::Max => 2,
            _ => 1,
        }
    }

    /// Lower-case function name
    pub fn name(&self) -> &'static str {
        match self {
            MathFn::Sin => "sin",
            MathFn::Cos => "cos",
            MathFn::Tan => "tan",
            MathFn::Floor => "floor",
            MathFn::Ceil => "ceil",
            MathFn::Sqrt => "sqrt",
            MathFn::Exp => "exp",
            MathFn::Log => "log",
            MathFn::Pow => "pow",
            MathFn::Abs => "abs",
            MathFn::Min => "min",
            MathFn::Max => "max",
        }
    }

    /// Whether integer arguments are accepted
    pub fn accepts_integers(&self) -> bool {
        matches!(self, MathFn::Abs | MathFn::Min | MathFn::Max)
    }
}

/// Opaque host function callable from a lambda body
#[derive(Clone)]
pub struct HostFn {
    name: Arc<str>,
    params: Vec<ElemType>,
    ret: ElemType,
    func: Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>,
}

impl HostFn {
    /// Wrap a Rust function with its declared signature
    pub fn new(
        name: impl AsRef<str>,
        params: Vec<ElemType>,
        ret: ElemType,
        func: impl Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            params,
            ret,
            func: Arc::new(func),
        }
    }

    /// Function name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared parameter types
    pub fn param_types(&self) -> &[ElemType] {
        &self.params
    }

    /// Declared return type
    pub fn return_type(&self) -> &ElemType {
        &self.ret
    }

    /// Invoke the function; its errors propagate unchanged
    pub fn call(&self, args: &[Value]) -> Result<Value> {
        (self.func)(args)
    }

    /// Call expression with the given arguments
    pub fn apply(&self, args: Vec<Expr>) -> Expr {
        Expr::Host {
            func: self.clone(),
            args,
        }
    }
}

impl PartialEq for HostFn {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

impl fmt::Debug for HostFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFn({})", self.name)
    }
}

/// Expression node
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal
    Const {
        /// Value
        value: Value,
        /// Declared type
        ty: ElemType,
    },
    /// Bound variable
    Var(Var),
    /// Positional template parameter, supplied at each invocation
    Param {
        /// Position
        index: usize,
        /// Declared type
        ty: ElemType,
    },
    /// Value captured from the enclosing scope when the query was built
    Captured {
        /// Name in the enclosing scope
        name: Arc<str>,
        /// Captured value
        value: Value,
        /// Declared type
        ty: ElemType,
    },
    /// Unary operator
    Unary {
        /// Operator
        op: UnaryOp,
        /// Operand
        operand: Box<Expr>,
    },
    /// Binary operator
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        lhs: Box<Expr>,
        /// Right operand
        rhs: Box<Expr>,
    },
    /// Conditional; only the taken branch is evaluated
    Cond {
        /// Condition
        cond: Box<Expr>,
        /// Value when true
        then: Box<Expr>,
        /// Value when false
        otherwise: Box<Expr>,
    },
    /// Elementary numeric function
    Math {
        /// Function
        func: MathFn,
        /// Arguments
        args: Vec<Expr>,
    },
    /// Type conversion; conversion to string uses display formatting
    Convert {
        /// Operand
        expr: Box<Expr>,
        /// Target type
        to: ElemType,
    },
    /// Tuple construction
    Tuple(Vec<Expr>),
    /// Tuple field, or group key (0) and members (1)
    Field {
        /// Tuple or group expression
        expr: Box<Expr>,
        /// Field position
        index: usize,
    },
    /// Indexed read from a sequence or device buffer
    Index {
        /// Sequence expression
        seq: Box<Expr>,
        /// Int position
        index: Box<Expr>,
    },
    /// Nested query evaluated as a value
    Query(Box<QueryNode>),
    /// Host function call
    Host {
        /// Function
        func: HostFn,
        /// Arguments
        args: Vec<Expr>,
    },
    /// Device-resident buffer
    Buffer(DeviceBuffer),
}

impl Expr {
    /// Literal with explicit type
    pub fn constant(value: Value, ty: ElemType) -> Self {
        Expr::Const { value, ty }
    }

    /// Int literal
    pub fn int(v: i32) -> Self {
        Self::constant(Value::Int(v), ElemType::Int)
    }

    /// Long literal
    pub fn long(v: i64) -> Self {
        Self::constant(Value::Long(v), ElemType::Long)
    }

    /// Float literal
    pub fn float(v: f32) -> Self {
        Self::constant(Value::float(v), ElemType::Float)
    }

    /// Double literal
    pub fn double(v: f64) -> Self {
        Self::constant(Value::double(v), ElemType::Double)
    }

    /// Bool literal
    pub fn bool(v: bool) -> Self {
        Self::constant(Value::Bool(v), ElemType::Bool)
    }

    /// String literal
    pub fn str(v: impl AsRef<str>) -> Self {
        Self::constant(Value::str(v), ElemType::Str)
    }

    /// Template parameter placeholder
    pub fn param(index: usize, ty: ElemType) -> Self {
        Expr::Param { index, ty }
    }

    /// Captured environment value; its type is inferred from the value
    pub fn captured(name: impl AsRef<str>, value: impl Into<Value>) -> Self {
        let value = value.into();
        let ty = value.infer_type().unwrap_or(ElemType::Unit);
        Self::captured_as(name, value, ty)
    }

    /// Captured environment value with an explicit type
    pub fn captured_as(name: impl AsRef<str>, value: Value, ty: ElemType) -> Self {
        Expr::Captured {
            name: Arc::from(name.as_ref()),
            value,
            ty,
        }
    }

    /// Nested query as a value: a scalar for scalar terminals, otherwise a sequence
    pub fn query(node: QueryNode) -> Self {
        Expr::Query(Box::new(node))
    }

    /// Conditional expression
    pub fn if_then_else(cond: Expr, then: Expr, otherwise: Expr) -> Self {
        Expr::Cond {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }

    /// Tuple construction
    pub fn tuple(fields: Vec<Expr>) -> Self {
        Expr::Tuple(fields)
    }

    fn binary(self, op: BinaryOp, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(self),
            rhs: Box::new(rhs),
        }
    }

    fn math(func: MathFn, args: Vec<Expr>) -> Self {
        Expr::Math { func, args }
    }

    /// `self == rhs`
    pub fn equals(self, rhs: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Eq, rhs.into())
    }

    /// `self != rhs`
    pub fn not_equals(self, rhs: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ne, rhs.into())
    }

    /// `self < rhs`
    pub fn lt(self, rhs: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Lt, rhs.into())
    }

    /// `self <= rhs`
    pub fn le(self, rhs: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Le, rhs.into())
    }

    /// `self > rhs`
    pub fn gt(self, rhs: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Gt, rhs.into())
    }

    /// `self >= rhs`
    pub fn ge(self, rhs: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ge, rhs.into())
    }

    /// `self && rhs`
    pub fn and(self, rhs: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::And, rhs.into())
    }

    /// `self || rhs`
    pub fn or(self, rhs: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Or, rhs.into())
    }

    /// Tuple field or group component
    pub fn field(self, index: usize) -> Self {
        Expr::Field {
            expr: Box::new(self),
            index,
        }
    }

    /// Indexed read
    pub fn at(self, index: impl Into<Expr>) -> Self {
        Expr::Index {
            seq: Box::new(self),
            index: Box::new(index.into()),
        }
    }

    /// Conversion to `to`
    pub fn convert(self, to: ElemType) -> Self {
        Expr::Convert {
            expr: Box::new(self),
            to,
        }
    }

    /// Display conversion to string
    pub fn to_str(self) -> Self {
        self.convert(ElemType::Str)
    }

    /// Sine
    pub fn sin(self) -> Self {
        Self::math(MathFn::Sin, vec![self])
    }

    /// Cosine
    pub fn cos(self) -> Self {
        Self::math(MathFn::Cos, vec![self])
    }

    /// Tangent
    pub fn tan(self) -> Self {
        Self::math(MathFn::Tan, vec![self])
    }

    /// Floor
    pub fn floor(self) -> Self {
        Self::math(MathFn::Floor, vec![self])
    }

    /// Ceiling
    pub fn ceil(self) -> Self {
        Self::math(MathFn::Ceil, vec![self])
    }

    /// Square root
    pub fn sqrt(self) -> Self {
        Self::math(MathFn::Sqrt, vec![self])
    }

    /// Exponential
    pub fn exp(self) -> Self {
        Self::math(MathFn::Exp, vec![self])
    }

    /// Natural logarithm
    pub fn ln(self) -> Self {
        Self::math(MathFn::Log, vec![self])
    }

    /// Power
    pub fn pow(self, exponent: impl Into<Expr>) -> Self {
        Self::math(MathFn::Pow, vec![self, exponent.into()])
    }

    /// Absolute value
    pub fn abs(self) -> Self {
        Self::math(MathFn::Abs, vec![self])
    }

    /// Minimum
    pub fn min(self, other: impl Into<Expr>) -> Self {
        Self::math(MathFn::Min, vec![self, other.into()])
    }

    /// Maximum
    pub fn max(self, other: impl Into<Expr>) -> Self {
        Self::math(MathFn::Max, vec![self, other.into()])
    }

    /// Infer the expression type, failing on ill-typed expressions
    pub fn infer(&self) -> Result<ElemType> {
        match self {
            Expr::Const { value, ty } | Expr::Captured { value, ty, .. } => {
                if value.conforms(ty) {
                    Ok(ty.clone())
                } else {
                    Err(Error::type_mismatch(ty, value.kind()))
                }
            }
            Expr::Var(var) => Ok(var.ty.clone()),
            Expr::Param { ty, .. } => Ok(ty.clone()),
            Expr::Unary { op, operand } => {
                let ty = operand.infer()?;
                match op {
                    UnaryOp::Neg if ty.is_numeric() => Ok(ty),
                    UnaryOp::Not if ty == ElemType::Bool => Ok(ty),
                    UnaryOp::Neg => Err(Error::construction(format!("cannot negate {}", ty))),
                    UnaryOp::Not => Err(Error::type_mismatch(ElemType::Bool, ty)),
                }
            }
            Expr::Binary { op, lhs, rhs } => op.result_type(&lhs.infer()?, &rhs.infer()?),
            Expr::Cond {
                cond,
                then,
                otherwise,
            } => {
                let cond_ty = cond.infer()?;
                if cond_ty != ElemType::Bool {
                    return Err(Error::type_mismatch(ElemType::Bool, cond_ty));
                }
                let then_ty = then.infer()?;
                let else_ty = otherwise.infer()?;
                if then_ty != else_ty {
                    return Err(Error::type_mismatch(then_ty, else_ty));
                }
                Ok(then_ty)
            }
            Expr::Math { func, args } => {
                if args.len() != func.arity() {
                    return Err(Error::construction(format!(
                        "{} takes {} argument(s), got {}",
                        func.name(),
                        func.arity(),
                        args.len()
                    )));
                }
                let first = args[0].infer()?;
                let accepted = first.is_floating() || (func.accepts_integers() && first.is_numeric());
                if !accepted {
                    return Err(Error::construction(format!(
                        "{} is not defined on {}",
                        func.name(),
                        first
                    )));
                }
                for arg in &args[1..] {
                    let ty = arg.infer()?;
                    if ty != first {
                        return Err(Error::type_mismatch(&first, ty));
                    }
                }
                Ok(first)
            }
            Expr::Convert { expr, to } => {
                let from = expr.infer()?;
                let ok = &from == to
                    || *to == ElemType::Str
                    || (to.is_numeric()
                        && (from.is_numeric() || from == ElemType::Bool || from == ElemType::Str));
                if ok {
                    Ok(to.clone())
                } else {
                    Err(Error::construction(format!("cannot convert {} to {}", from, to)))
                }
            }
            Expr::Tuple(fields) => Ok(ElemType::Tuple(
                fields.iter().map(Expr::infer).collect::<Result<_>>()?,
            )),
            Expr::Field { expr, index } => match expr.infer()? {
                ElemType::Tuple(types) => types.get(*index).cloned().ok_or_else(|| {
                    Error::construction(format!(
                        "tuple of arity {} has no field {}",
                        types.len(),
                        index
                    ))
                }),
                ElemType::Group(key, elem) => match index {
                    0 => Ok(*key),
                    1 => Ok(ElemType::Seq(elem)),
                    _ => Err(Error::construction(format!("group has no field {}", index))),
                },
                other => Err(Error::construction(format!("{} has no fields", other))),
            },
            Expr::Index { seq, index } => {
                let index_ty = index.infer()?;
                if index_ty != ElemType::Int {
                    return Err(Error::type_mismatch(ElemType::Int, index_ty));
                }
                match seq.infer()? {
                    ElemType::Seq(elem) => Ok(*elem),
                    other => Err(Error::construction(format!("cannot index into {}", other))),
                }
            }
            Expr::Query(node) => Ok(node.result_type()),
            Expr::Host { func, args } => {
                if args.len() != func.param_types().len() {
                    return Err(Error::construction(format!(
                        "host function {} takes {} argument(s), got {}",
                        func.name(),
                        func.param_types().len(),
                        args.len()
                    )));
                }
                for (arg, ty) in args.iter().zip(func.param_types()) {
                    let actual = arg.infer()?;
                    if &actual != ty {
                        return Err(Error::type_mismatch(ty, actual));
                    }
                }
                Ok(func.return_type().clone())
            }
            Expr::Buffer(buffer) => Ok(ElemType::seq(buffer.elem_type().clone())),
        }
    }

    /// Replace free occurrences of variable `name` by `replacement`
    pub fn subst(&self, name: &str, replacement: &Expr) -> Expr {
        Substitute::new(name, replacement).rewrite_expr(self)
    }

    /// Whether variable `name` occurs in the expression, nested queries included
    pub fn references(&self, name: &str) -> bool {
        let mut finder = VarUses::new(name);
        finder.visit_expr(self);
        finder.total > 0
    }

    /// True for leaves that need no evaluation work
    pub fn is_atom(&self) -> bool {
        matches!(
            self,
            Expr::Const { .. } | Expr::Var(_) | Expr::Param { .. } | Expr::Captured { .. }
        )
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Self {
        Expr::int(v)
    }
}

impl From<i64> for Expr {
    fn from(v: i64) -> Self {
        Expr::long(v)
    }
}

impl From<f32> for Expr {
    fn from(v: f32) -> Self {
        Expr::float(v)
    }
}

impl From<f64> for Expr {
    fn from(v: f64) -> Self {
        Expr::double(v)
    }
}

impl From<bool> for Expr {
    fn from(v: bool) -> Self {
        Expr::bool(v)
    }
}

impl From<&str> for Expr {
    fn from(v: &str) -> Self {
        Expr::str(v)
    }
}

impl From<String> for Expr {
    fn from(v: String) -> Self {
        Expr::str(v)
    }
}

impl From<Var> for Expr {
    fn from(v: Var) -> Self {
        Expr::Var(v)
    }
}

impl From<&Var> for Expr {
    fn from(v: &Var) -> Self {
        v.expr()
    }
}

macro_rules! binary_operator {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<R: Into<Expr>> ops::$trait<R> for Expr {
            type Output = Expr;

            fn $method(self, rhs: R) -> Expr {
                self.binary($op, rhs.into())
            }
        }
    };
}

binary_operator!(Add, add, BinaryOp::Add);
binary_operator!(Sub, sub, BinaryOp::Sub);
binary_operator!(Mul, mul, BinaryOp::Mul);
binary_operator!(Div, div, BinaryOp::Div);
binary_operator!(Rem, rem, BinaryOp::Rem);

impl ops::Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        Expr::Unary {
            op: UnaryOp::Neg,
            operand: Box::new(self),
        }
    }
}

impl ops::Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        Expr::Unary {
            op: UnaryOp::Not,
            operand: Box::new(self),
        }
    }
}
