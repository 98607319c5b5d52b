//! Combinator surface
//!
//! Each combinator consumes a tree and returns it wrapped in one more node,
//! checking arity and element types on the way. Construction failures are
//! returned here and never reach the optimizer. Generator counts are the one
//! exception: a negative `range`/`repeat` count builds fine and fails when
//! the compiled routine runs.
//!
//! ```
//! use pipefuse_core::QueryNode;
//!
//! let query = QueryNode::from_ints(&[1, 2, 3, 4, 5])
//!     .filter(|x| (x % 2).equals(0))?
//!     .select(|x| x * 2)?
//!     .to_list()?;
//! assert!(query.is_terminal());
//! # Ok::<(), pipefuse_core::Error>(())
//! ```

use crate::ast::expr::{Expr, Lambda, Var};
use crate::ast::node::{Direction, QueryNode, SortKey, Source};
use crate::device::DeviceBuffer;
use crate::error::{Error, Result};
use crate::value::{ElemType, Value};

impl QueryNode {
    /// Source over literal values of type `elem`
    pub fn from_values(elem: ElemType, values: Vec<Value>) -> Result<Self> {
        if let Some(bad) = values.iter().find(|v| !v.conforms(&elem)) {
            return Err(Error::type_mismatch(&elem, bad.kind()));
        }
        Ok(QueryNode::Source {
            source: Source::Values(values.into()),
            elem,
        })
    }

    /// Source over ints
    pub fn from_ints(values: &[i32]) -> Self {
        Self::scalar_source(ElemType::Int, values.iter().map(|v| Value::Int(*v)))
    }

    /// Source over longs
    pub fn from_longs(values: &[i64]) -> Self {
        Self::scalar_source(ElemType::Long, values.iter().map(|v| Value::Long(*v)))
    }

    /// Source over doubles
    pub fn from_doubles(values: &[f64]) -> Self {
        Self::scalar_source(ElemType::Double, values.iter().map(|v| Value::double(*v)))
    }

    /// Source over strings
    pub fn from_strs(values: &[&str]) -> Self {
        Self::scalar_source(ElemType::Str, values.iter().map(|v| Value::str(v)))
    }

    fn scalar_source(elem: ElemType, values: impl Iterator<Item = Value>) -> Self {
        QueryNode::Source {
            source: Source::Values(values.collect()),
            elem,
        }
    }

    /// Source over a sequence- or group-typed expression
    pub fn from_expr(expr: Expr) -> Result<Self> {
        let ty = expr.infer()?;
        let elem = ty.item_type().cloned().ok_or_else(|| {
            Error::construction(format!("cannot iterate over a value of type {}", ty))
        })?;
        Ok(QueryNode::Source {
            source: Source::Expr(expr),
            elem,
        })
    }

    /// Source over a device-resident buffer
    pub fn from_buffer(buffer: &DeviceBuffer) -> Self {
        QueryNode::Source {
            elem: buffer.elem_type().clone(),
            source: Source::Device(buffer.clone()),
        }
    }

    /// `count` ints starting at `start`
    pub fn range(start: impl Into<Expr>, count: impl Into<Expr>) -> Result<Self> {
        let node = QueryNode::Range {
            start: start.into(),
            count: count.into(),
        };
        node.check()?;
        Ok(node)
    }

    /// `value` repeated `count` times
    pub fn repeat(value: impl Into<Expr>, count: impl Into<Expr>) -> Result<Self> {
        let value = value.into();
        let elem = value.infer()?;
        let node = QueryNode::Repeat {
            value,
            count: count.into(),
            elem,
        };
        node.check()?;
        Ok(node)
    }

    /// Unbounded state-machine source
    pub fn generate(
        seed: impl Into<Expr>,
        condition: impl FnOnce(Expr) -> Expr,
        step: impl FnOnce(Expr) -> Expr,
        selector: impl FnOnce(Expr) -> Expr,
    ) -> Result<Self> {
        let seed = seed.into();
        let state = seed.infer()?;
        let condition = Lambda::unary(state.clone(), condition);
        let step = Lambda::unary(state.clone(), step);
        let selector = Lambda::unary(state, selector);
        let elem = selector.return_type()?;
        let node = QueryNode::Generate {
            seed,
            condition,
            step,
            selector,
            elem,
        };
        node.check()?;
        Ok(node)
    }

    /// Element type of `self` when used as the input of `op`
    fn stream_type(&self, op: &str) -> Result<ElemType> {
        if self.is_terminal() {
            return Err(Error::construction(format!(
                "cannot apply {} after terminal {}",
                op,
                self.name()
            )));
        }
        Ok(self.elem_type())
    }

    /// Projection
    pub fn select(self, f: impl FnOnce(Expr) -> Expr) -> Result<Self> {
        let t = self.stream_type("select")?;
        self.select_lambda(Lambda::unary(t, f))
    }

    /// Projection whose body construction can fail
    pub fn try_select(self, f: impl FnOnce(Expr) -> Result<Expr>) -> Result<Self> {
        let t = self.stream_type("select")?;
        let x = Var::fresh("x", t);
        let body = f(x.expr())?;
        self.select_lambda(Lambda::new(vec![x], body))
    }

    /// Projection from a prebuilt lambda
    pub fn select_lambda(self, selector: Lambda) -> Result<Self> {
        let t = self.stream_type("select")?;
        let elem = selector.check(&[t])?;
        Ok(QueryNode::Transform {
            input: Box::new(self),
            selector,
            elem,
        })
    }

    /// Projection receiving `(element, index)`
    pub fn select_indexed(self, f: impl FnOnce(Expr, Expr) -> Expr) -> Result<Self> {
        let t = self.stream_type("select_indexed")?;
        let selector = Lambda::binary(t.clone(), ElemType::Int, f);
        let elem = selector.check(&[t, ElemType::Int])?;
        Ok(QueryNode::TransformIndexed {
            input: Box::new(self),
            selector,
            elem,
        })
    }

    /// Predicate
    pub fn filter(self, f: impl FnOnce(Expr) -> Expr) -> Result<Self> {
        let t = self.stream_type("filter")?;
        self.filter_lambda(Lambda::unary(t, f))
    }

    /// Predicate from a prebuilt lambda
    pub fn filter_lambda(self, predicate: Lambda) -> Result<Self> {
        let t = self.stream_type("filter")?;
        predicate.check_predicate(&[t])?;
        Ok(QueryNode::Filter {
            input: Box::new(self),
            predicate,
        })
    }

    /// Predicate receiving `(element, index)`
    pub fn filter_indexed(self, f: impl FnOnce(Expr, Expr) -> Expr) -> Result<Self> {
        let t = self.stream_type("filter_indexed")?;
        let predicate = Lambda::binary(t.clone(), ElemType::Int, f);
        predicate.check_predicate(&[t, ElemType::Int])?;
        Ok(QueryNode::FilterIndexed {
            input: Box::new(self),
            predicate,
        })
    }

    /// Flatten: for each element, the elements of the pipeline `f` builds
    pub fn select_many(self, f: impl FnOnce(Expr) -> Result<QueryNode>) -> Result<Self> {
        let (var, nested) = self.nested_pipeline(f)?;
        let elem = nested.elem_type();
        Ok(QueryNode::NestedQuery {
            input: Box::new(self),
            var,
            nested: Box::new(nested),
            elem,
        })
    }

    /// Flatten over a sequence-valued expression
    pub fn select_many_expr(self, f: impl FnOnce(Expr) -> Expr) -> Result<Self> {
        let t = self.stream_type("select_many")?;
        let var = Var::fresh("x", t);
        let nested = QueryNode::from_expr(f(var.expr()))?;
        let elem = nested.elem_type();
        Ok(QueryNode::NestedQuery {
            input: Box::new(self),
            var,
            nested: Box::new(nested),
            elem,
        })
    }

    /// Flatten with a result selector over `(outer, inner)`
    pub fn select_many_with(
        self,
        f: impl FnOnce(Expr) -> Result<QueryNode>,
        selector: impl FnOnce(Expr, Expr) -> Expr,
    ) -> Result<Self> {
        let (var, nested) = self.nested_pipeline(f)?;
        let selector = Lambda::binary(var.ty.clone(), nested.elem_type(), selector);
        let elem = selector.check(&[var.ty.clone(), nested.elem_type()])?;
        Ok(QueryNode::NestedQueryTransform {
            input: Box::new(self),
            var,
            nested: Box::new(nested),
            selector,
            elem,
        })
    }

    /// Bind a fresh variable and build the nested pipeline as a sequence
    /// expression; the optimizer turns it back into a sub-tree
    fn nested_pipeline(
        &self,
        f: impl FnOnce(Expr) -> Result<QueryNode>,
    ) -> Result<(Var, QueryNode)> {
        let t = self.stream_type("select_many")?;
        let var = Var::fresh("x", t);
        let pipeline = f(var.expr())?;
        let result = pipeline.result_type();
        if !matches!(result, ElemType::Seq(_)) {
            return Err(Error::construction(format!(
                "select_many body must produce a sequence, got {}",
                result
            )));
        }
        let nested = QueryNode::from_expr(Expr::query(pipeline))?;
        Ok((var, nested))
    }

    /// First `count` elements
    pub fn take(self, count: impl Into<Expr>) -> Result<Self> {
        self.stream_type("take")?;
        let count = count.into();
        expect_int(&count)?;
        Ok(QueryNode::Take {
            input: Box::new(self),
            count,
        })
    }

    /// All but the first `count` elements
    pub fn skip(self, count: impl Into<Expr>) -> Result<Self> {
        self.stream_type("skip")?;
        let count = count.into();
        expect_int(&count)?;
        Ok(QueryNode::Skip {
            input: Box::new(self),
            count,
        })
    }

    /// Leading elements while `f` holds
    pub fn take_while(self, f: impl FnOnce(Expr) -> Expr) -> Result<Self> {
        let t = self.stream_type("take_while")?;
        let predicate = Lambda::unary(t.clone(), f);
        predicate.check_predicate(&[t])?;
        Ok(QueryNode::TakeWhile {
            input: Box::new(self),
            predicate,
        })
    }

    /// Elements from the first one where `f` fails
    pub fn skip_while(self, f: impl FnOnce(Expr) -> Expr) -> Result<Self> {
        let t = self.stream_type("skip_while")?;
        let predicate = Lambda::unary(t.clone(), f);
        predicate.check_predicate(&[t])?;
        Ok(QueryNode::SkipWhile {
            input: Box::new(self),
            predicate,
        })
    }

    /// Left fold from `seed` with `f(acc, element)`
    pub fn aggregate(self, seed: impl Into<Expr>, f: impl FnOnce(Expr, Expr) -> Expr) -> Result<Self> {
        self.aggregate_impl(seed.into(), f, None::<fn(Expr, Expr) -> Expr>)
    }

    /// Left fold with a partial-accumulator combiner for partitioned runs
    ///
    /// Each partition folds its elements from `seed` and the partials are
    /// merged with `combiner` in partition order, so the result only stays
    /// independent of the partition count when `seed` is an identity of
    /// `combiner`. Without a combiner the fold always runs sequentially.
    pub fn aggregate_with_combiner(
        self,
        seed: impl Into<Expr>,
        f: impl FnOnce(Expr, Expr) -> Expr,
        combiner: impl FnOnce(Expr, Expr) -> Expr,
    ) -> Result<Self> {
        self.aggregate_impl(seed.into(), f, Some(combiner))
    }

    fn aggregate_impl<C: FnOnce(Expr, Expr) -> Expr>(
        self,
        seed: Expr,
        f: impl FnOnce(Expr, Expr) -> Expr,
        combiner: Option<C>,
    ) -> Result<Self> {
        let t = self.stream_type("aggregate")?;
        let ty = seed.infer()?;
        let func = Lambda::binary(ty.clone(), t.clone(), f);
        let ret = func.check(&[ty.clone(), t])?;
        if ret != ty {
            return Err(Error::type_mismatch(&ty, ret));
        }
        let combiner = match combiner {
            Some(c) => {
                let combiner = Lambda::binary(ty.clone(), ty.clone(), c);
                let ret = combiner.check(&[ty.clone(), ty.clone()])?;
                if ret != ty {
                    return Err(Error::type_mismatch(&ty, ret));
                }
                Some(combiner)
            }
            None => None,
        };
        Ok(QueryNode::Aggregate {
            input: Box::new(self),
            seed,
            func,
            combiner,
            ty,
        })
    }

    /// Numeric sum
    pub fn sum(self) -> Result<Self> {
        let t = self.stream_type("sum")?;
        if !t.is_numeric() {
            return Err(Error::construction(format!("cannot sum elements of type {}", t)));
        }
        Ok(QueryNode::Sum {
            input: Box::new(self),
            ty: t,
        })
    }

    /// Element count
    pub fn count(self) -> Result<Self> {
        self.stream_type("count")?;
        Ok(QueryNode::Count {
            input: Box::new(self),
        })
    }

    /// Group by key
    pub fn group_by(self, key: impl FnOnce(Expr) -> Expr) -> Result<Self> {
        let t = self.stream_type("group_by")?;
        let key = Lambda::unary(t.clone(), key);
        let k = key.check(std::slice::from_ref(&t))?;
        Ok(QueryNode::GroupBy {
            input: Box::new(self),
            key,
            elem: ElemType::group(k, t),
        })
    }

    /// Sort ascending by key
    pub fn order_by(self, key: impl FnOnce(Expr) -> Expr) -> Result<Self> {
        self.order_impl(key, Direction::Ascending, false)
    }

    /// Sort descending by key
    pub fn order_by_descending(self, key: impl FnOnce(Expr) -> Expr) -> Result<Self> {
        self.order_impl(key, Direction::Descending, false)
    }

    /// Secondary ascending key of a preceding sort
    pub fn then_by(self, key: impl FnOnce(Expr) -> Expr) -> Result<Self> {
        self.order_impl(key, Direction::Ascending, true)
    }

    /// Secondary descending key of a preceding sort
    pub fn then_by_descending(self, key: impl FnOnce(Expr) -> Expr) -> Result<Self> {
        self.order_impl(key, Direction::Descending, true)
    }

    fn order_impl(
        self,
        key: impl FnOnce(Expr) -> Expr,
        direction: Direction,
        chained: bool,
    ) -> Result<Self> {
        let t = self.stream_type("order_by")?;
        let key = Lambda::unary(t.clone(), key);
        let key_ty = key.check(&[t])?;
        if matches!(key_ty, ElemType::Unit) {
            return Err(Error::construction("sort key cannot be unit"));
        }
        let key = SortKey { key, direction };
        match (self, chained) {
            (QueryNode::OrderBy { input, mut keys }, true) => {
                keys.push(key);
                Ok(QueryNode::OrderBy { input, keys })
            }
            (_, true) => Err(Error::construction("then_by must follow order_by")),
            (node, false) => Ok(QueryNode::OrderBy {
                input: Box::new(node),
                keys: vec![key],
            }),
        }
    }

    /// Pairwise merge with `other`
    pub fn zip_with(self, other: QueryNode, f: impl FnOnce(Expr, Expr) -> Expr) -> Result<Self> {
        let l = self.stream_type("zip_with")?;
        let r = other.stream_type("zip_with")?;
        let combiner = Lambda::binary(l.clone(), r.clone(), f);
        let elem = combiner.check(&[l, r])?;
        Ok(QueryNode::ZipWith {
            left: Box::new(self),
            right: Box::new(other),
            combiner,
            elem,
        })
    }

    /// Materialize to a list
    pub fn to_list(self) -> Result<Self> {
        self.stream_type("to_list")?;
        Ok(QueryNode::ToList {
            input: Box::new(self),
        })
    }

    /// Materialize to an array
    pub fn to_array(self) -> Result<Self> {
        self.stream_type("to_array")?;
        Ok(QueryNode::ToArray {
            input: Box::new(self),
        })
    }

    /// Evaluate `f` per element for its effects
    pub fn for_each(self, f: impl FnOnce(Expr) -> Expr) -> Result<Self> {
        let t = self.stream_type("for_each")?;
        let action = Lambda::unary(t.clone(), f);
        action.check(&[t])?;
        Ok(QueryNode::ForEach {
            input: Box::new(self),
            action,
        })
    }
}

fn expect_int(expr: &Expr) -> Result<()> {
    let ty = expr.infer()?;
    if ty != ElemType::Int {
        return Err(Error::type_mismatch(ElemType::Int, ty));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_types() {
        let q = QueryNode::from_ints(&[1, 2, 3])
            .select(|x| x.to_str())
            .unwrap()
            .select(|s| s + "!")
            .unwrap();
        assert_eq!(q.elem_type(), ElemType::Str);
        let q = q.count().unwrap();
        assert_eq!(q.result_type(), ElemType::Int);
    }

    #[test]
    fn test_terminal_cannot_be_extended() {
        let err = QueryNode::from_ints(&[1]).sum().unwrap().take(1).unwrap_err();
        assert!(err.is_construction());
    }

    #[test]
    fn test_filter_requires_bool() {
        let err = QueryNode::from_ints(&[1]).filter(|x| x + 1).unwrap_err();
        assert!(err.is_construction());
    }

    #[test]
    fn test_sum_requires_numeric() {
        assert!(QueryNode::from_strs(&["a"]).sum().is_err());
        assert!(QueryNode::from_doubles(&[1.0]).sum().is_ok());
    }

    #[test]
    fn test_negative_range_builds() {
        let node = QueryNode::range(0, -1).unwrap();
        assert!(matches!(node, QueryNode::Range { .. }));
        assert!(QueryNode::repeat("a", -3).is_ok());
    }

    #[test]
    fn test_range_requires_int_arguments() {
        assert!(QueryNode::range(0i64, 3).is_err());
        assert!(QueryNode::repeat(1, 2.0).is_err());
    }

    #[test]
    fn test_then_by_needs_order_by() {
        let err = QueryNode::from_ints(&[1]).then_by(|x| x).unwrap_err();
        assert!(err.is_construction());

        let ordered = QueryNode::from_ints(&[1])
            .order_by(|x| x % 2)
            .unwrap()
            .then_by_descending(|x| x)
            .unwrap();
        match ordered {
            QueryNode::OrderBy { keys, .. } => {
                assert_eq!(keys.len(), 2);
                assert_eq!(keys[1].direction, Direction::Descending);
            }
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn test_select_many_body_must_be_sequence() {
        let err = QueryNode::from_ints(&[1, 2])
            .select_many(|_| QueryNode::from_ints(&[1]).sum())
            .unwrap_err();
        assert!(err.is_construction());

        let ok = QueryNode::from_ints(&[1, 2])
            .select_many(|x| QueryNode::range(0, x))
            .unwrap();
        assert_eq!(ok.elem_type(), ElemType::Int);
    }

    #[test]
    fn test_aggregate_types() {
        let q = QueryNode::from_ints(&[1, 2])
            .aggregate(0i64, |acc, x| acc + x.convert(ElemType::Long))
            .unwrap();
        assert_eq!(q.result_type(), ElemType::Long);

        let err = QueryNode::from_ints(&[1, 2])
            .aggregate(0i64, |_, x| x)
            .unwrap_err();
        assert!(err.is_construction());
    }

    #[test]
    fn test_group_by_type() {
        let q = QueryNode::from_strs(&["a", "bb"])
            .group_by(|s| s.equals("a"))
            .unwrap();
        assert_eq!(q.elem_type(), ElemType::group(ElemType::Bool, ElemType::Str));
    }

    #[test]
    fn test_from_values_checks_types() {
        assert!(QueryNode::from_values(ElemType::Int, vec![Value::Int(1), Value::str("x")]).is_err());
        assert!(QueryNode::from_expr(Expr::int(3)).is_err());
    }

    #[test]
    fn test_zip_with() {
        let q = QueryNode::from_ints(&[1, 2])
            .zip_with(QueryNode::from_strs(&["a", "b"]), |n, s| n.to_str() + s)
            .unwrap();
        assert_eq!(q.elem_type(), ElemType::Str);
        assert!(
            QueryNode::from_ints(&[1])
                .zip_with(QueryNode::from_ints(&[1]).count().unwrap(), |a, _| a)
                .is_err()
        );
    }
}
