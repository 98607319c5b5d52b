//! Runtime values and element types
//!
//! Every element flowing through a compiled pipeline is a [`Value`]. Values
//! are totally ordered and hashable (floating point uses a total order) so
//! they can serve as group and sort keys without extra wrappers.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Declared element type of a stream or expression
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElemType {
    /// No value (result of `for_each`)
    Unit,
    /// Boolean
    Bool,
    /// 32-bit signed integer
    Int,
    /// 64-bit signed integer
    Long,
    /// 32-bit float
    Float,
    /// 64-bit float
    Double,
    /// Immutable string
    Str,
    /// Fixed-arity tuple
    Tuple(Vec<ElemType>),
    /// Materialized sequence
    Seq(Box<ElemType>),
    /// Group produced by `group_by`: key type and member type
    Group(Box<ElemType>, Box<ElemType>),
}

impl ElemType {
    /// Sequence of `elem`
    pub fn seq(elem: ElemType) -> Self {
        ElemType::Seq(Box::new(elem))
    }

    /// Group keyed by `key` with `elem` members
    pub fn group(key: ElemType, elem: ElemType) -> Self {
        ElemType::Group(Box::new(key), Box::new(elem))
    }

    /// Int, Long, Float or Double
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ElemType::Int | ElemType::Long | ElemType::Float | ElemType::Double
        )
    }

    /// Float or Double
    pub fn is_floating(&self) -> bool {
        matches!(self, ElemType::Float | ElemType::Double)
    }

    /// Fixed-size scalar (the only layouts a device buffer can hold)
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            ElemType::Bool | ElemType::Int | ElemType::Long | ElemType::Float | ElemType::Double
        )
    }

    /// Element type when iterating a value of this type, if iterable
    pub fn item_type(&self) -> Option<&ElemType> {
        match self {
            ElemType::Seq(elem) => Some(elem),
            ElemType::Group(_, elem) => Some(elem),
            _ => None,
        }
    }

    /// Additive identity for numeric types
    pub fn zero(&self) -> Option<Value> {
        match self {
            ElemType::Int => Some(Value::Int(0)),
            ElemType::Long => Some(Value::Long(0)),
            ElemType::Float => Some(Value::Float(OrderedFloat(0.0))),
            ElemType::Double => Some(Value::Double(OrderedFloat(0.0))),
            _ => None,
        }
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElemType::Unit => write!(f, "unit"),
            ElemType::Bool => write!(f, "bool"),
            ElemType::Int => write!(f, "int"),
            ElemType::Long => write!(f, "long"),
            ElemType::Float => write!(f, "float"),
            ElemType::Double => write!(f, "double"),
            ElemType::Str => write!(f, "string"),
            ElemType::Tuple(fields) => {
                write!(f, "(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                write!(f, ")")
            }
            ElemType::Seq(elem) => write!(f, "seq<{}>", elem),
            ElemType::Group(key, elem) => write!(f, "group<{}, {}>", key, elem),
        }
    }
}

/// Members of one group, in first-seen order
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Grouping {
    /// Group key
    pub key: Value,
    /// Members sharing the key
    pub items: Arc<[Value]>,
}

/// A runtime value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    /// No value
    Unit,
    /// Boolean
    Bool(bool),
    /// 32-bit integer
    Int(i32),
    /// 64-bit integer
    Long(i64),
    /// 32-bit float
    Float(OrderedFloat<f32>),
    /// 64-bit float
    Double(OrderedFloat<f64>),
    /// String (ordinal ordering)
    Str(Arc<str>),
    /// Tuple
    Tuple(Arc<[Value]>),
    /// Sequence
    Seq(Arc<[Value]>),
    /// Group
    Group(Arc<Grouping>),
}

impl Value {
    /// String value
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Arc::from(s.as_ref()))
    }

    /// Double value
    pub fn double(v: f64) -> Self {
        Value::Double(OrderedFloat(v))
    }

    /// Float value
    pub fn float(v: f32) -> Self {
        Value::Float(OrderedFloat(v))
    }

    /// Sequence value
    pub fn seq(items: Vec<Value>) -> Self {
        Value::Seq(Arc::from(items))
    }

    /// Tuple value
    pub fn tuple(fields: Vec<Value>) -> Self {
        Value::Tuple(Arc::from(fields))
    }

    /// Group value
    pub fn group(key: Value, items: Vec<Value>) -> Self {
        Value::Group(Arc::new(Grouping {
            key,
            items: Arc::from(items),
        }))
    }

    /// Short name of the value's variant, for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::Tuple(_) => "tuple",
            Value::Seq(_) => "seq",
            Value::Group(_) => "group",
        }
    }

    /// Boolean payload
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Int payload
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Int or Long payload widened to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v as i64),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Any numeric payload widened to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Long(v) => Some(*v as f64),
            Value::Float(v) => Some(v.0 as f64),
            Value::Double(v) => Some(v.0),
            _ => None,
        }
    }

    /// String payload
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Items of a sequence or members of a group
    pub fn as_items(&self) -> Option<&[Value]> {
        match self {
            Value::Seq(items) => Some(items),
            Value::Group(group) => Some(&group.items),
            _ => None,
        }
    }

    /// Tuple fields
    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(fields) => Some(fields),
            _ => None,
        }
    }

    /// Grouping payload
    pub fn as_group(&self) -> Option<&Grouping> {
        match self {
            Value::Group(group) => Some(group),
            _ => None,
        }
    }

    /// Type of a scalar value; `None` for composite values
    pub fn scalar_type(&self) -> Option<ElemType> {
        match self {
            Value::Bool(_) => Some(ElemType::Bool),
            Value::Int(_) => Some(ElemType::Int),
            Value::Long(_) => Some(ElemType::Long),
            Value::Float(_) => Some(ElemType::Float),
            Value::Double(_) => Some(ElemType::Double),
            _ => None,
        }
    }

    /// Best-effort type of the value; `None` when a sequence or group is empty
    pub fn infer_type(&self) -> Option<ElemType> {
        match self {
            Value::Unit => Some(ElemType::Unit),
            Value::Str(_) => Some(ElemType::Str),
            Value::Tuple(fields) => Some(ElemType::Tuple(
                fields.iter().map(Value::infer_type).collect::<Option<_>>()?,
            )),
            Value::Seq(items) => Some(ElemType::seq(items.first()?.infer_type()?)),
            Value::Group(group) => Some(ElemType::group(
                group.key.infer_type()?,
                group.items.first()?.infer_type()?,
            )),
            scalar => scalar.scalar_type(),
        }
    }

    /// Whether the value inhabits `ty`
    pub fn conforms(&self, ty: &ElemType) -> bool {
        match (self, ty) {
            (Value::Unit, ElemType::Unit)
            | (Value::Bool(_), ElemType::Bool)
            | (Value::Int(_), ElemType::Int)
            | (Value::Long(_), ElemType::Long)
            | (Value::Float(_), ElemType::Float)
            | (Value::Double(_), ElemType::Double)
            | (Value::Str(_), ElemType::Str) => true,
            (Value::Tuple(fields), ElemType::Tuple(types)) => {
                fields.len() == types.len()
                    && fields.iter().zip(types).all(|(v, t)| v.conforms(t))
            }
            (Value::Seq(items), ElemType::Seq(elem)) => items.iter().all(|v| v.conforms(elem)),
            (Value::Group(group), ElemType::Group(key, elem)) => {
                group.key.conforms(key) && group.items.iter().all(|v| v.conforms(elem))
            }
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, items: &[Value]) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", item)?;
            }
            Ok(())
        }

        match self {
            Value::Unit => write!(f, "()"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v.0),
            Value::Double(v) => write!(f, "{}", v.0),
            Value::Str(s) => write!(f, "{}", s),
            Value::Tuple(fields) => {
                write!(f, "(")?;
                list(f, fields)?;
                write!(f, ")")
            }
            Value::Seq(items) => {
                write!(f, "[")?;
                list(f, items)?;
                write!(f, "]")
            }
            Value::Group(group) => {
                write!(f, "{}: [", group.key)?;
                list(f, &group.items)?;
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::str(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(Arc::from(v))
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::seq(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conforms() {
        assert!(Value::Int(3).conforms(&ElemType::Int));
        assert!(!Value::Int(3).conforms(&ElemType::Long));
        let seq = Value::from(vec![1, 2, 3]);
        assert!(seq.conforms(&ElemType::seq(ElemType::Int)));
        assert!(!seq.conforms(&ElemType::seq(ElemType::Str)));
        let tuple = Value::tuple(vec![Value::Int(1), Value::str("a")]);
        assert!(tuple.conforms(&ElemType::Tuple(vec![ElemType::Int, ElemType::Str])));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::double(4.0).to_string(), "4");
        assert_eq!(Value::double(2.5).to_string(), "2.5");
        assert_eq!(Value::from(vec!["a", "b"]).to_string(), "[a, b]");
        assert_eq!(
            Value::group(Value::Int(1), vec![Value::Int(1), Value::Int(1)]).to_string(),
            "1: [1, 1]"
        );
        assert_eq!(
            ElemType::group(ElemType::Str, ElemType::Tuple(vec![ElemType::Int, ElemType::Double]))
                .to_string(),
            "group<string, (int, double)>"
        );
    }

    #[test]
    fn test_ordering_is_total() {
        let mut values = vec![Value::double(f64::NAN), Value::double(1.0), Value::double(-3.0)];
        values.sort();
        assert_eq!(values[0], Value::double(-3.0));
        assert_eq!(values[1], Value::double(1.0));
        assert!(Value::str("B") < Value::str("a"));
    }

    #[test]
    fn test_zero() {
        assert_eq!(ElemType::Long.zero(), Some(Value::Long(0)));
        assert_eq!(ElemType::Str.zero(), None);
    }
}
