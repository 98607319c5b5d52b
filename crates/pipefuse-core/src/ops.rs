//! Operator semantics shared by every evaluator
//!
//! The sequential closures, the reference interpreter, the optimizer's
//! constant folder and the device emulator all call into these functions,
//! so an operator means the same thing on every backend. Integer arithmetic
//! wraps; integer division and remainder by zero fail.

use crate::ast::expr::{BinaryOp, MathFn, UnaryOp};
use crate::ast::node::Direction;
use crate::error::{Error, Result};
use crate::value::{ElemType, Value};
use std::cmp::Ordering;
use std::sync::Arc;

fn undefined(op: &str, lhs: &Value, rhs: &Value) -> Error {
    Error::runtime(format!(
        "operator {} is not defined for {} and {}",
        op,
        lhs.kind(),
        rhs.kind()
    ))
}

macro_rules! int_arith {
    ($op:expr, $a:expr, $b:expr, $wrap:path) => {
        match $op {
            BinaryOp::Add => Ok($wrap($a.wrapping_add($b))),
            BinaryOp::Sub => Ok($wrap($a.wrapping_sub($b))),
            BinaryOp::Mul => Ok($wrap($a.wrapping_mul($b))),
            BinaryOp::Div if $b == 0 => Err(Error::runtime("division by zero")),
            BinaryOp::Div => Ok($wrap($a.wrapping_div($b))),
            BinaryOp::Rem if $b == 0 => Err(Error::runtime("division by zero")),
            BinaryOp::Rem => Ok($wrap($a.wrapping_rem($b))),
            _ => Err(Error::internal("not an arithmetic operator")),
        }
    };
}

macro_rules! float_arith {
    ($op:expr, $a:expr, $b:expr, $wrap:path) => {
        match $op {
            BinaryOp::Add => Ok($wrap(($a + $b).into())),
            BinaryOp::Sub => Ok($wrap(($a - $b).into())),
            BinaryOp::Mul => Ok($wrap(($a * $b).into())),
            BinaryOp::Div => Ok($wrap(($a / $b).into())),
            BinaryOp::Rem => Ok($wrap(($a % $b).into())),
            _ => Err(Error::internal("not an arithmetic operator")),
        }
    };
}

fn arith(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => int_arith!(op, *a, *b, Value::Int),
        (Value::Long(a), Value::Long(b)) => int_arith!(op, *a, *b, Value::Long),
        (Value::Float(a), Value::Float(b)) => float_arith!(op, a.0, b.0, Value::Float),
        (Value::Double(a), Value::Double(b)) => float_arith!(op, a.0, b.0, Value::Double),
        (Value::Str(a), Value::Str(b)) if op == BinaryOp::Add => {
            let mut s = String::with_capacity(a.len() + b.len());
            s.push_str(a);
            s.push_str(b);
            Ok(Value::from(s))
        }
        _ => Err(undefined(op.symbol(), lhs, rhs)),
    }
}

/// Apply a binary operator to two evaluated operands
///
/// `And`/`Or` evaluate eagerly here; short-circuiting is the caller's job.
pub fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value> {
    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            arith(op, lhs, rhs)
        }
        BinaryOp::Eq => Ok(Value::Bool(lhs == rhs)),
        BinaryOp::Ne => Ok(Value::Bool(lhs != rhs)),
        BinaryOp::Lt => Ok(Value::Bool(lhs < rhs)),
        BinaryOp::Le => Ok(Value::Bool(lhs <= rhs)),
        BinaryOp::Gt => Ok(Value::Bool(lhs > rhs)),
        BinaryOp::Ge => Ok(Value::Bool(lhs >= rhs)),
        BinaryOp::And | BinaryOp::Or => match (lhs, rhs) {
            (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(if op == BinaryOp::And {
                *a && *b
            } else {
                *a || *b
            })),
            _ => Err(undefined(op.symbol(), lhs, rhs)),
        },
    }
}

/// Running-sum step used by `Sum` on every backend
pub fn add(lhs: &Value, rhs: &Value) -> Result<Value> {
    arith(BinaryOp::Add, lhs, rhs)
}

/// Apply a unary operator
pub fn unary(op: UnaryOp, operand: &Value) -> Result<Value> {
    match (op, operand) {
        (UnaryOp::Neg, Value::Int(v)) => Ok(Value::Int(v.wrapping_neg())),
        (UnaryOp::Neg, Value::Long(v)) => Ok(Value::Long(v.wrapping_neg())),
        (UnaryOp::Neg, Value::Float(v)) => Ok(Value::float(-v.0)),
        (UnaryOp::Neg, Value::Double(v)) => Ok(Value::double(-v.0)),
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (op, v) => Err(Error::runtime(format!(
            "operator {:?} is not defined for {}",
            op,
            v.kind()
        ))),
    }
}

macro_rules! float_math {
    ($func:expr, $a:expr, $b:expr) => {
        match $func {
            MathFn::Sin => $a.sin(),
            MathFn::Cos => $a.cos(),
            MathFn::Tan => $a.tan(),
            MathFn::Floor => $a.floor(),
            MathFn::Ceil => $a.ceil(),
            MathFn::Sqrt => $a.sqrt(),
            MathFn::Exp => $a.exp(),
            MathFn::Log => $a.ln(),
            MathFn::Pow => $a.powf($b),
            MathFn::Abs => $a.abs(),
            MathFn::Min => $a.min($b),
            MathFn::Max => $a.max($b),
        }
    };
}

/// Apply an elementary numeric function
pub fn math(func: MathFn, args: &[Value]) -> Result<Value> {
    if args.len() != func.arity() {
        return Err(Error::runtime(format!(
            "{} takes {} argument(s), got {}",
            func.name(),
            func.arity(),
            args.len()
        )));
    }
    let second = args.get(1);
    match (&args[0], second) {
        (Value::Double(a), None) => Ok(Value::double(float_math!(func, a.0, 0.0))),
        (Value::Double(a), Some(Value::Double(b))) => Ok(Value::double(float_math!(func, a.0, b.0))),
        (Value::Float(a), None) => Ok(Value::float(float_math!(func, a.0, 0.0f32))),
        (Value::Float(a), Some(Value::Float(b))) => Ok(Value::float(float_math!(func, a.0, b.0))),
        (Value::Int(a), None) if func == MathFn::Abs => Ok(Value::Int(a.wrapping_abs())),
        (Value::Long(a), None) if func == MathFn::Abs => Ok(Value::Long(a.wrapping_abs())),
        (Value::Int(a), Some(Value::Int(b))) if func == MathFn::Min => Ok(Value::Int(*a.min(b))),
        (Value::Int(a), Some(Value::Int(b))) if func == MathFn::Max => Ok(Value::Int(*a.max(b))),
        (Value::Long(a), Some(Value::Long(b))) if func == MathFn::Min => Ok(Value::Long(*a.min(b))),
        (Value::Long(a), Some(Value::Long(b))) if func == MathFn::Max => Ok(Value::Long(*a.max(b))),
        (a, _) => Err(Error::runtime(format!(
            "{} is not defined for {}",
            func.name(),
            a.kind()
        ))),
    }
}

fn parse_failure(s: &str, to: &ElemType) -> Error {
    Error::runtime(format!("cannot convert \"{}\" to {}", s, to))
}

/// Convert a value to `to`
pub fn convert(value: &Value, to: &ElemType) -> Result<Value> {
    if value.conforms(to) {
        return Ok(value.clone());
    }
    if *to == ElemType::Str {
        return Ok(Value::from(value.to_string()));
    }
    if let Value::Str(s) = value {
        let text = s.trim();
        return match to {
            ElemType::Int => text.parse().map(Value::Int).map_err(|_| parse_failure(s, to)),
            ElemType::Long => text.parse().map(Value::Long).map_err(|_| parse_failure(s, to)),
            ElemType::Float => text.parse().map(Value::float).map_err(|_| parse_failure(s, to)),
            ElemType::Double => text.parse().map(Value::double).map_err(|_| parse_failure(s, to)),
            _ => Err(parse_failure(s, to)),
        };
    }
    let (int, float) = match value {
        Value::Bool(b) => (*b as i64, *b as i64 as f64),
        Value::Int(v) => (*v as i64, *v as f64),
        Value::Long(v) => (*v, *v as f64),
        Value::Float(v) => (v.0 as i64, v.0 as f64),
        Value::Double(v) => (v.0 as i64, v.0),
        other => {
            return Err(Error::runtime(format!(
                "cannot convert {} to {}",
                other.kind(),
                to
            )));
        }
    };
    match to {
        ElemType::Int => Ok(Value::Int(match value {
            Value::Float(v) => v.0 as i32,
            Value::Double(v) => v.0 as i32,
            _ => int as i32,
        })),
        ElemType::Long => Ok(Value::Long(int)),
        ElemType::Float => Ok(Value::float(float as f32)),
        ElemType::Double => Ok(Value::double(float)),
        _ => Err(Error::runtime(format!(
            "cannot convert {} to {}",
            value.kind(),
            to
        ))),
    }
}

/// Tuple field, or group key (0) and members (1)
pub fn field(value: &Value, index: usize) -> Result<Value> {
    match value {
        Value::Tuple(fields) => fields.get(index).cloned().ok_or_else(|| {
            Error::runtime(format!(
                "tuple of arity {} has no field {}",
                fields.len(),
                index
            ))
        }),
        Value::Group(group) => match index {
            0 => Ok(group.key.clone()),
            1 => Ok(Value::Seq(group.items.clone())),
            _ => Err(Error::runtime(format!("group has no field {}", index))),
        },
        other => Err(Error::runtime(format!("{} has no fields", other.kind()))),
    }
}

/// Indexed read from a sequence or group
pub fn index(seq: &Value, position: &Value) -> Result<Value> {
    let items = items(seq)?;
    let i = position
        .as_i64()
        .ok_or_else(|| Error::runtime(format!("index must be int, got {}", position.kind())))?;
    usize::try_from(i)
        .ok()
        .and_then(|i| items.get(i).cloned())
        .ok_or_else(|| {
            Error::runtime(format!(
                "index {} out of range for sequence of length {}",
                i,
                items.len()
            ))
        })
}

/// Elements of an iterable value
pub fn items(value: &Value) -> Result<Arc<[Value]>> {
    match value {
        Value::Seq(items) => Ok(items.clone()),
        Value::Group(group) => Ok(group.items.clone()),
        other => Err(Error::runtime(format!("cannot iterate over {}", other.kind()))),
    }
}

/// Boolean payload of a predicate result
pub fn truthy(value: &Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| Error::runtime(format!("predicate returned {}", value.kind())))
}

/// Int count argument of Take/Skip/Range/Repeat
pub fn count_arg(value: &Value) -> Result<i64> {
    value
        .as_i64()
        .ok_or_else(|| Error::runtime(format!("count must be int, got {}", value.kind())))
}

/// Validated `Range` arguments: first value and element count
pub fn range_bounds(start: &Value, count: &Value) -> Result<(i32, usize)> {
    let first = start
        .as_i32()
        .ok_or_else(|| Error::runtime(format!("range start must be int, got {}", start.kind())))?;
    let n = count_arg(count)?;
    if n < 0 {
        return Err(Error::invalid_argument(format!(
            "range count must be non-negative, got {}",
            n
        )));
    }
    if first as i64 + n - 1 > i32::MAX as i64 {
        return Err(Error::invalid_argument(format!(
            "range of {} values from {} overflows int",
            n, first
        )));
    }
    Ok((first, n as usize))
}

/// Validated `Repeat` count
pub fn repeat_count(count: &Value) -> Result<usize> {
    let n = count_arg(count)?;
    usize::try_from(n).map_err(|_| {
        Error::invalid_argument(format!("repeat count must be non-negative, got {}", n))
    })
}

/// Number of elements a `Take`/`Skip` count admits; non-positive means none
pub fn window_count(count: &Value) -> Result<usize> {
    Ok(count_arg(count)?.max(0) as usize)
}

/// Multi-key comparison; `Descending` reverses only its own key
pub fn compare_keys(a: &[Value], b: &[Value], directions: &[Direction]) -> Ordering {
    for ((x, y), direction) in a.iter().zip(b).zip(directions) {
        let ord = match direction {
            Direction::Ascending => x.cmp(y),
            Direction::Descending => y.cmp(x),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_arithmetic_wraps() {
        let v = binary(BinaryOp::Add, &Value::Int(i32::MAX), &Value::Int(1)).unwrap();
        assert_eq!(v, Value::Int(i32::MIN));
        let v = binary(BinaryOp::Div, &Value::Int(i32::MIN), &Value::Int(-1)).unwrap();
        assert_eq!(v, Value::Int(i32::MIN));
    }

    #[test]
    fn test_division_by_zero() {
        assert!(binary(BinaryOp::Div, &Value::Int(1), &Value::Int(0)).is_err());
        assert!(binary(BinaryOp::Rem, &Value::Long(1), &Value::Long(0)).is_err());
        let inf = binary(BinaryOp::Div, &Value::double(1.0), &Value::double(0.0)).unwrap();
        assert_eq!(inf, Value::double(f64::INFINITY));
    }

    #[test]
    fn test_string_concat() {
        let v = binary(BinaryOp::Add, &Value::str("4"), &Value::str("!")).unwrap();
        assert_eq!(v, Value::str("4!"));
    }

    #[test]
    fn test_convert() {
        assert_eq!(convert(&Value::Int(8), &ElemType::Str).unwrap(), Value::str("8"));
        assert_eq!(convert(&Value::str(" 42 "), &ElemType::Int).unwrap(), Value::Int(42));
        assert!(convert(&Value::str("x"), &ElemType::Int).is_err());
        assert_eq!(convert(&Value::double(2.9), &ElemType::Int).unwrap(), Value::Int(2));
        assert_eq!(convert(&Value::Bool(true), &ElemType::Long).unwrap(), Value::Long(1));
        assert_eq!(convert(&Value::Int(3), &ElemType::Double).unwrap(), Value::double(3.0));
    }

    #[test]
    fn test_math() {
        let v = math(MathFn::Sqrt, &[Value::double(16.0)]).unwrap();
        assert_eq!(v, Value::double(4.0));
        let v = math(MathFn::Pow, &[Value::float(2.0), Value::float(3.0)]).unwrap();
        assert_eq!(v, Value::float(8.0));
        assert_eq!(math(MathFn::Abs, &[Value::Int(-3)]).unwrap(), Value::Int(3));
        assert!(math(MathFn::Sin, &[Value::Int(1)]).is_err());
    }

    #[test]
    fn test_index_and_field() {
        let seq = Value::from(vec![10, 20]);
        assert_eq!(index(&seq, &Value::Int(1)).unwrap(), Value::Int(20));
        assert!(index(&seq, &Value::Int(2)).is_err());
        assert!(index(&seq, &Value::Int(-1)).is_err());
        let group = Value::group(Value::str("k"), vec![Value::Int(1)]);
        assert_eq!(field(&group, 0).unwrap(), Value::str("k"));
        assert_eq!(field(&group, 1).unwrap(), Value::from(vec![1]));
    }

    #[test]
    fn test_generator_bounds() {
        assert_eq!(range_bounds(&Value::Int(3), &Value::Int(2)).unwrap(), (3, 2));
        assert!(range_bounds(&Value::Int(0), &Value::Int(-1)).unwrap_err().is_invalid_argument());
        assert!(range_bounds(&Value::Int(i32::MAX), &Value::Int(2)).is_err());
        assert_eq!(range_bounds(&Value::Int(i32::MAX), &Value::Int(1)).unwrap().1, 1);
        assert!(repeat_count(&Value::Int(-3)).unwrap_err().is_invalid_argument());
        assert_eq!(window_count(&Value::Int(-3)).unwrap(), 0);
    }

    #[test]
    fn test_compare_keys() {
        let dirs = [Direction::Ascending, Direction::Descending];
        let a = [Value::Int(1), Value::Int(5)];
        let b = [Value::Int(1), Value::Int(7)];
        assert_eq!(compare_keys(&a, &b, &dirs), Ordering::Greater);
        let c = [Value::Int(0), Value::Int(0)];
        assert_eq!(compare_keys(&c, &a, &dirs), Ordering::Less);
    }
}
