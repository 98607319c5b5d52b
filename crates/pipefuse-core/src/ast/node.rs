//! Query AST
//!
//! A pipeline is a tree rooted at its terminal operator with a source leaf.
//! Every node owns its inputs; rewriting always produces a new tree.

use crate::ast::expr::{Expr, Lambda, Var};
use crate::device::DeviceBuffer;
use crate::error::{Error, Result};
use crate::value::{ElemType, Value};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Where a source leaf gets its elements
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// Literal sequence
    Values(Arc<[Value]>),
    /// Sequence-valued expression: a bound variable of a nested query, a
    /// template parameter, a captured collection or a nested pipeline
    Expr(Expr),
    /// Device-resident buffer (device backend only)
    Device(DeviceBuffer),
}

/// Sort direction of one OrderBy key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Smallest key first
    Ascending,
    /// Largest key first
    Descending,
}

/// One key of an OrderBy chain
#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    /// Key selector
    pub key: Lambda,
    /// Direction applied to this key only
    pub direction: Direction,
}

/// One step of a fused element-wise chain
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Projection
    Map(Lambda),
    /// Projection receiving the element index as second parameter
    MapIndexed(Lambda),
    /// Predicate
    Filter(Lambda),
    /// Predicate receiving the element index as second parameter
    FilterIndexed(Lambda),
    /// Bind the fields of a tuple the element would have become to locals;
    /// the element itself is not materialized until the next `MapLocals`
    Bind {
        /// Element parameter the local expressions read
        param: Var,
        /// Locals in evaluation order
        locals: Vec<(Var, Expr)>,
    },
    /// Projection over the bound locals
    MapLocals(Expr),
    /// Predicate over the bound locals
    FilterLocals(Expr),
}

impl Step {
    /// Whether the step reads the element position
    pub fn is_indexed(&self) -> bool {
        matches!(self, Step::MapIndexed(_) | Step::FilterIndexed(_))
    }

    /// Whether the step can drop elements
    pub fn is_filter(&self) -> bool {
        matches!(
            self,
            Step::Filter(_) | Step::FilterIndexed(_) | Step::FilterLocals(_)
        )
    }
}

/// One operator of a query pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum QueryNode {
    /// Sequence source
    Source {
        /// Elements
        source: Source,
        /// Element type
        elem: ElemType,
    },
    /// `count` consecutive ints starting at `start`
    Range {
        /// First value
        start: Expr,
        /// Number of values; negative fails at execution
        count: Expr,
    },
    /// `value` repeated `count` times
    Repeat {
        /// Repeated value
        value: Expr,
        /// Number of repetitions; negative fails at execution
        count: Expr,
        /// Element type
        elem: ElemType,
    },
    /// State machine source: `while condition(s) { yield selector(s); s = step(s) }`
    Generate {
        /// Initial state
        seed: Expr,
        /// Continue predicate over the state
        condition: Lambda,
        /// State transition
        step: Lambda,
        /// Element produced from each state
        selector: Lambda,
        /// Element type
        elem: ElemType,
    },
    /// Element-wise projection
    Transform {
        /// Input
        input: Box<QueryNode>,
        /// Projection
        selector: Lambda,
        /// Output element type
        elem: ElemType,
    },
    /// Element-wise projection with index
    TransformIndexed {
        /// Input
        input: Box<QueryNode>,
        /// Projection `(element, index)`
        selector: Lambda,
        /// Output element type
        elem: ElemType,
    },
    /// Element-wise predicate
    Filter {
        /// Input
        input: Box<QueryNode>,
        /// Predicate
        predicate: Lambda,
    },
    /// Element-wise predicate with index
    FilterIndexed {
        /// Input
        input: Box<QueryNode>,
        /// Predicate `(element, index)`
        predicate: Lambda,
    },
    /// Fused element-wise chain produced by the optimizer
    Fused {
        /// Input
        input: Box<QueryNode>,
        /// Steps in application order
        steps: Vec<Step>,
        /// Output element type
        elem: ElemType,
    },
    /// One-to-many expansion: for each input element bound to `var`, the
    /// elements of `nested`
    NestedQuery {
        /// Outer input
        input: Box<QueryNode>,
        /// Variable the outer element is bound to
        var: Var,
        /// Sub-tree evaluated per outer element
        nested: Box<QueryNode>,
        /// Output element type
        elem: ElemType,
    },
    /// One-to-many expansion with a result selector `(outer, inner)`
    NestedQueryTransform {
        /// Outer input
        input: Box<QueryNode>,
        /// Variable the outer element is bound to
        var: Var,
        /// Sub-tree evaluated per outer element
        nested: Box<QueryNode>,
        /// Result selector
        selector: Lambda,
        /// Output element type
        elem: ElemType,
    },
    /// First `count` elements
    Take {
        /// Input
        input: Box<QueryNode>,
        /// Int count; non-positive yields nothing
        count: Expr,
    },
    /// All but the first `count` elements
    Skip {
        /// Input
        input: Box<QueryNode>,
        /// Int count; non-positive skips nothing
        count: Expr,
    },
    /// Elements while the predicate holds
    TakeWhile {
        /// Input
        input: Box<QueryNode>,
        /// Predicate
        predicate: Lambda,
    },
    /// Elements after the predicate first fails
    SkipWhile {
        /// Input
        input: Box<QueryNode>,
        /// Predicate
        predicate: Lambda,
    },
    /// Left fold
    Aggregate {
        /// Input
        input: Box<QueryNode>,
        /// Initial accumulator
        seed: Expr,
        /// Accumulator update `(acc, element)`
        func: Lambda,
        /// Merge of two partial accumulators, used by partitioned execution
        combiner: Option<Lambda>,
        /// Accumulator type
        ty: ElemType,
    },
    /// Numeric sum
    Sum {
        /// Input
        input: Box<QueryNode>,
        /// Numeric element type
        ty: ElemType,
    },
    /// Element count
    Count {
        /// Input
        input: Box<QueryNode>,
    },
    /// Groups by key, in first-seen key order
    GroupBy {
        /// Input
        input: Box<QueryNode>,
        /// Key selector
        key: Lambda,
        /// `Group(key, element)` type
        elem: ElemType,
    },
    /// Stable multi-key sort
    OrderBy {
        /// Input
        input: Box<QueryNode>,
        /// Keys; later keys break ties of earlier ones
        keys: Vec<SortKey>,
    },
    /// Pairwise merge of two streams, as long as the shorter one
    ZipWith {
        /// Left stream
        left: Box<QueryNode>,
        /// Right stream
        right: Box<QueryNode>,
        /// Combiner `(left, right)`
        combiner: Lambda,
        /// Output element type
        elem: ElemType,
    },
    /// Materialize to a list
    ToList {
        /// Input
        input: Box<QueryNode>,
    },
    /// Materialize to an array
    ToArray {
        /// Input
        input: Box<QueryNode>,
    },
    /// Run an action per element
    ForEach {
        /// Input
        input: Box<QueryNode>,
        /// Action; its value is discarded
        action: Lambda,
    },
}

impl QueryNode {
    /// Operator name, for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            QueryNode::Source { .. } => "Source",
            QueryNode::Range { .. } => "Range",
            QueryNode::Repeat { .. } => "Repeat",
            QueryNode::Generate { .. } => "Generate",
            QueryNode::Transform { .. } => "Transform",
            QueryNode::TransformIndexed { .. } => "TransformIndexed",
            QueryNode::Filter { .. } => "Filter",
            QueryNode::FilterIndexed { .. } => "FilterIndexed",
            QueryNode::Fused { .. } => "Fused",
            QueryNode::NestedQuery { .. } => "NestedQuery",
            QueryNode::NestedQueryTransform { .. } => "NestedQueryTransform",
            QueryNode::Take { .. } => "Take",
            QueryNode::Skip { .. } => "Skip",
            QueryNode::TakeWhile { .. } => "TakeWhile",
            QueryNode::SkipWhile { .. } => "SkipWhile",
            QueryNode::Aggregate { .. } => "Aggregate",
            QueryNode::Sum { .. } => "Sum",
            QueryNode::Count { .. } => "Count",
            QueryNode::GroupBy { .. } => "GroupBy",
            QueryNode::OrderBy { .. } => "OrderBy",
            QueryNode::ZipWith { .. } => "ZipWith",
            QueryNode::ToList { .. } => "ToList",
            QueryNode::ToArray { .. } => "ToArray",
            QueryNode::ForEach { .. } => "ForEach",
        }
    }

    /// Whether the node ends a pipeline
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryNode::Aggregate { .. }
                | QueryNode::Sum { .. }
                | QueryNode::Count { .. }
                | QueryNode::ToList { .. }
                | QueryNode::ToArray { .. }
                | QueryNode::ForEach { .. }
        )
    }

    /// Whether the node is a leaf
    pub fn is_source(&self) -> bool {
        matches!(
            self,
            QueryNode::Source { .. }
                | QueryNode::Range { .. }
                | QueryNode::Repeat { .. }
                | QueryNode::Generate { .. }
        )
    }

    /// For a source over a nested pipeline, the part of that pipeline that
    /// streams its elements: the pipeline without a trailing list or array
    /// terminal. Every evaluator pulls nested pipelines through this part
    /// lazily, so an early exit above never runs the rest of it.
    pub fn nested_stream(&self) -> Option<&QueryNode> {
        let QueryNode::Source {
            source: Source::Expr(Expr::Query(nested)),
            elem,
        } = self
        else {
            return None;
        };
        let inner = match &**nested {
            QueryNode::ToList { input } | QueryNode::ToArray { input } => &**input,
            other => other,
        };
        (!inner.is_terminal() && inner.elem_type() == *elem).then_some(inner)
    }

    /// Primary input (the left input of a zip)
    pub fn input(&self) -> Option<&QueryNode> {
        match self {
            QueryNode::Source { .. }
            | QueryNode::Range { .. }
            | QueryNode::Repeat { .. }
            | QueryNode::Generate { .. } => None,
            QueryNode::ZipWith { left, .. } => Some(left),
            QueryNode::Transform { input, .. }
            | QueryNode::TransformIndexed { input, .. }
            | QueryNode::Filter { input, .. }
            | QueryNode::FilterIndexed { input, .. }
            | QueryNode::Fused { input, .. }
            | QueryNode::NestedQuery { input, .. }
            | QueryNode::NestedQueryTransform { input, .. }
            | QueryNode::Take { input, .. }
            | QueryNode::Skip { input, .. }
            | QueryNode::TakeWhile { input, .. }
            | QueryNode::SkipWhile { input, .. }
            | QueryNode::Aggregate { input, .. }
            | QueryNode::Sum { input, .. }
            | QueryNode::Count { input }
            | QueryNode::GroupBy { input, .. }
            | QueryNode::OrderBy { input, .. }
            | QueryNode::ToList { input }
            | QueryNode::ToArray { input }
            | QueryNode::ForEach { input, .. } => Some(input),
        }
    }

    /// Type of the elements this node produces; for terminals, the result type
    pub fn elem_type(&self) -> ElemType {
        match self {
            QueryNode::Source { elem, .. }
            | QueryNode::Repeat { elem, .. }
            | QueryNode::Generate { elem, .. }
            | QueryNode::Transform { elem, .. }
            | QueryNode::TransformIndexed { elem, .. }
            | QueryNode::Fused { elem, .. }
            | QueryNode::NestedQuery { elem, .. }
            | QueryNode::NestedQueryTransform { elem, .. }
            | QueryNode::GroupBy { elem, .. }
            | QueryNode::ZipWith { elem, .. } => elem.clone(),
            QueryNode::Range { .. } => ElemType::Int,
            QueryNode::Filter { input, .. }
            | QueryNode::FilterIndexed { input, .. }
            | QueryNode::Take { input, .. }
            | QueryNode::Skip { input, .. }
            | QueryNode::TakeWhile { input, .. }
            | QueryNode::SkipWhile { input, .. }
            | QueryNode::OrderBy { input, .. } => input.elem_type(),
            _ => self.result_type(),
        }
    }

    /// Type of the value a compiled routine for this tree returns
    pub fn result_type(&self) -> ElemType {
        match self {
            QueryNode::Aggregate { ty, .. } | QueryNode::Sum { ty, .. } => ty.clone(),
            QueryNode::Count { .. } => ElemType::Int,
            QueryNode::ForEach { .. } => ElemType::Unit,
            QueryNode::ToList { input } | QueryNode::ToArray { input } => {
                ElemType::seq(input.elem_type())
            }
            other => ElemType::seq(other.elem_type()),
        }
    }

    /// Number of nodes in the tree, nested sub-trees included
    pub fn node_count(&self) -> usize {
        let mut counter = crate::ast::visit::NodeCounter::default();
        crate::ast::visit::Visitor::visit_node(&mut counter, self);
        counter.count
    }

    /// Full recursive type check, returning [`QueryNode::elem_type`]
    ///
    /// The builder checks each node as it is appended; this re-checks a
    /// whole tree, which the optimizer uses to catch ill-typed rewrites.
    pub fn check(&self) -> Result<ElemType> {
        match self {
            QueryNode::Source { source, elem } => {
                match source {
                    Source::Values(values) => {
                        if let Some(bad) = values.iter().find(|v| !v.conforms(elem)) {
                            return Err(Error::type_mismatch(elem, bad.kind()));
                        }
                    }
                    Source::Expr(expr) => {
                        let ty = expr.infer()?;
                        if ty.item_type() != Some(elem) {
                            return Err(Error::type_mismatch(ElemType::seq(elem.clone()), ty));
                        }
                    }
                    Source::Device(buffer) => {
                        if buffer.elem_type() != elem {
                            return Err(Error::type_mismatch(elem, buffer.elem_type()));
                        }
                    }
                }
                Ok(elem.clone())
            }
            QueryNode::Range { start, count } => {
                expect_type(start, &ElemType::Int)?;
                expect_type(count, &ElemType::Int)?;
                Ok(ElemType::Int)
            }
            QueryNode::Repeat { value, count, elem } => {
                expect_type(value, elem)?;
                expect_type(count, &ElemType::Int)?;
                Ok(elem.clone())
            }
            QueryNode::Generate {
                seed,
                condition,
                step,
                selector,
                elem,
            } => {
                let state = seed.infer()?;
                condition.check_predicate(std::slice::from_ref(&state))?;
                expect_lambda(step, std::slice::from_ref(&state), &state)?;
                expect_lambda(selector, &[state], elem)?;
                Ok(elem.clone())
            }
            QueryNode::Transform {
                input,
                selector,
                elem,
            } => {
                let t = input.check_stream()?;
                expect_lambda(selector, &[t], elem)?;
                Ok(elem.clone())
            }
            QueryNode::TransformIndexed {
                input,
                selector,
                elem,
            } => {
                let t = input.check_stream()?;
                expect_lambda(selector, &[t, ElemType::Int], elem)?;
                Ok(elem.clone())
            }
            QueryNode::Filter { input, predicate } => {
                let t = input.check_stream()?;
                predicate.check_predicate(std::slice::from_ref(&t))?;
                Ok(t)
            }
            QueryNode::FilterIndexed { input, predicate } => {
                let t = input.check_stream()?;
                predicate.check_predicate(&[t.clone(), ElemType::Int])?;
                Ok(t)
            }
            QueryNode::Fused { input, steps, elem } => {
                let t = input.check_stream()?;
                let out = check_steps(steps, t)?;
                if &out != elem {
                    return Err(Error::type_mismatch(elem, out));
                }
                Ok(out)
            }
            QueryNode::NestedQuery {
                input,
                var,
                nested,
                elem,
            } => {
                let t = input.check_stream()?;
                if var.ty != t {
                    return Err(Error::type_mismatch(t, &var.ty));
                }
                let inner = nested.check_stream()?;
                if &inner != elem {
                    return Err(Error::type_mismatch(elem, inner));
                }
                Ok(inner)
            }
            QueryNode::NestedQueryTransform {
                input,
                var,
                nested,
                selector,
                elem,
            } => {
                let t = input.check_stream()?;
                if var.ty != t {
                    return Err(Error::type_mismatch(t, &var.ty));
                }
                let inner = nested.check_stream()?;
                expect_lambda(selector, &[t, inner], elem)?;
                Ok(elem.clone())
            }
            QueryNode::Take { input, count } | QueryNode::Skip { input, count } => {
                let t = input.check_stream()?;
                expect_type(count, &ElemType::Int)?;
                Ok(t)
            }
            QueryNode::TakeWhile { input, predicate } | QueryNode::SkipWhile { input, predicate } => {
                let t = input.check_stream()?;
                predicate.check_predicate(std::slice::from_ref(&t))?;
                Ok(t)
            }
            QueryNode::Aggregate {
                input,
                seed,
                func,
                combiner,
                ty,
            } => {
                let t = input.check_stream()?;
                expect_type(seed, ty)?;
                expect_lambda(func, &[ty.clone(), t], ty)?;
                if let Some(combiner) = combiner {
                    expect_lambda(combiner, &[ty.clone(), ty.clone()], ty)?;
                }
                Ok(ty.clone())
            }
            QueryNode::Sum { input, ty } => {
                let t = input.check_stream()?;
                if &t != ty || !t.is_numeric() {
                    return Err(Error::type_mismatch(ty, t));
                }
                Ok(t)
            }
            QueryNode::Count { input } => {
                input.check_stream()?;
                Ok(ElemType::Int)
            }
            QueryNode::GroupBy { input, key, elem } => {
                let t = input.check_stream()?;
                let k = key.check(std::slice::from_ref(&t))?;
                let expected = ElemType::group(k, t);
                if &expected != elem {
                    return Err(Error::type_mismatch(expected, elem));
                }
                Ok(expected)
            }
            QueryNode::OrderBy { input, keys } => {
                let t = input.check_stream()?;
                if keys.is_empty() {
                    return Err(Error::construction("OrderBy without keys"));
                }
                for key in keys {
                    key.key.check(std::slice::from_ref(&t))?;
                }
                Ok(t)
            }
            QueryNode::ZipWith {
                left,
                right,
                combiner,
                elem,
            } => {
                let l = left.check_stream()?;
                let r = right.check_stream()?;
                expect_lambda(combiner, &[l, r], elem)?;
                Ok(elem.clone())
            }
            QueryNode::ToList { input } | QueryNode::ToArray { input } => {
                let t = input.check_stream()?;
                Ok(ElemType::seq(t))
            }
            QueryNode::ForEach { input, action } => {
                let t = input.check_stream()?;
                action.check(&[t])?;
                Ok(ElemType::Unit)
            }
        }
    }

    /// Check a node used as the input of another node: must not be terminal
    fn check_stream(&self) -> Result<ElemType> {
        if self.is_terminal() {
            return Err(Error::construction(format!(
                "{} is terminal and cannot feed another operator",
                self.name()
            )));
        }
        self.check()
    }
}

fn expect_type(expr: &Expr, expected: &ElemType) -> Result<()> {
    let actual = expr.infer()?;
    if &actual != expected {
        return Err(Error::type_mismatch(expected, actual));
    }
    Ok(())
}

fn expect_lambda(lambda: &Lambda, params: &[ElemType], ret: &ElemType) -> Result<()> {
    let actual = lambda.check(params)?;
    if &actual != ret {
        return Err(Error::type_mismatch(ret, actual));
    }
    Ok(())
}

/// Type-check a fused step list over elements of type `input`
pub(crate) fn check_steps(steps: &[Step], input: ElemType) -> Result<ElemType> {
    // `None` while the element is carried as bound locals
    let mut current = Some(input);
    for step in steps {
        match (step, current.take()) {
            (Step::Map(f), Some(t)) => current = Some(f.check(&[t])?),
            (Step::MapIndexed(f), Some(t)) => current = Some(f.check(&[t, ElemType::Int])?),
            (Step::Filter(p), Some(t)) => {
                p.check_predicate(std::slice::from_ref(&t))?;
                current = Some(t);
            }
            (Step::FilterIndexed(p), Some(t)) => {
                p.check_predicate(&[t.clone(), ElemType::Int])?;
                current = Some(t);
            }
            (Step::Bind { param, locals }, Some(t)) => {
                if param.ty != t {
                    return Err(Error::type_mismatch(t, &param.ty));
                }
                for (var, expr) in locals {
                    expect_type(expr, &var.ty)?;
                }
            }
            (Step::FilterLocals(p), None) => expect_type(p, &ElemType::Bool)?,
            (Step::MapLocals(e), None) => current = Some(e.infer()?),
            (step, _) => {
                return Err(Error::internal(format!(
                    "step {:?} does not fit the element shape before it",
                    step
                )));
            }
        }
    }
    current.ok_or_else(|| Error::internal("fused chain ends with unmaterialized locals"))
}

/// An optimized query: the tree plus invariant bindings evaluated once per
/// invocation before the tree runs
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Pipeline tree
    pub root: QueryNode,
    /// Hoisted bindings, in evaluation order
    pub hoisted: Vec<(Var, Expr)>,
}

impl Query {
    /// Query without hoisted bindings
    pub fn new(root: QueryNode) -> Self {
        Self {
            root,
            hoisted: Vec::new(),
        }
    }

    /// Type check the tree and the hoisted bindings
    pub fn check(&self) -> Result<ElemType> {
        for (var, expr) in &self.hoisted {
            expect_type(expr, &var.ty)?;
        }
        self.root.check()
    }

    /// Result type of the root
    pub fn result_type(&self) -> ElemType {
        self.root.result_type()
    }
}

impl From<QueryNode> for Query {
    fn from(root: QueryNode) -> Self {
        Query::new(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[i32]) -> QueryNode {
        QueryNode::Source {
            source: Source::Values(values.iter().map(|v| Value::Int(*v)).collect()),
            elem: ElemType::Int,
        }
    }

    #[test]
    fn test_result_types() {
        let sum = QueryNode::Sum {
            input: Box::new(ints(&[1, 2])),
            ty: ElemType::Int,
        };
        assert_eq!(sum.result_type(), ElemType::Int);
        assert!(sum.is_terminal());

        let take = QueryNode::Take {
            input: Box::new(ints(&[1, 2])),
            count: Expr::int(1),
        };
        assert_eq!(take.result_type(), ElemType::seq(ElemType::Int));
        assert!(!take.is_terminal());
    }

    #[test]
    fn test_check_rejects_terminal_input() {
        let count = QueryNode::Count {
            input: Box::new(ints(&[1])),
        };
        let bad = QueryNode::Take {
            input: Box::new(count),
            count: Expr::int(1),
        };
        assert!(bad.check().is_err());
    }

    #[test]
    fn test_check_steps_with_locals() {
        let x = Var::new("x", ElemType::Int);
        let l0 = Var::new("l0", ElemType::Int);
        let steps = vec![
            Step::Bind {
                param: x.clone(),
                locals: vec![(l0.clone(), x.expr() * 2)],
            },
            Step::FilterLocals(l0.expr().gt(2)),
            Step::MapLocals(l0.expr().to_str()),
        ];
        assert_eq!(check_steps(&steps, ElemType::Int).unwrap(), ElemType::Str);

        let dangling = vec![Step::Bind {
            param: x,
            locals: vec![(l0, Expr::int(1))],
        }];
        assert!(check_steps(&dangling, ElemType::Int).is_err());
    }

    #[test]
    fn test_nested_stream_drops_list_terminal() {
        let range = QueryNode::range(0, 3).unwrap();
        let listed = QueryNode::from_expr(Expr::query(range.clone().to_list().unwrap())).unwrap();
        assert_eq!(listed.nested_stream(), Some(&range));
        let bare = QueryNode::from_expr(Expr::query(range.clone())).unwrap();
        assert_eq!(bare.nested_stream(), Some(&range));
        assert_eq!(ints(&[1]).nested_stream(), None);
        assert_eq!(range.nested_stream(), None);
    }

    #[test]
    fn test_source_value_mismatch() {
        let node = QueryNode::Source {
            source: Source::Values(Arc::from(vec![Value::str("a")])),
            elem: ElemType::Int,
        };
        assert!(node.check().is_err());
    }
}
