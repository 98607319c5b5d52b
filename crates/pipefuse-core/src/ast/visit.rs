//! Tree traversal
//!
//! [`Visitor`] walks a tree by reference; [`Rewriter`] rebuilds it. Both
//! descend into lambda bodies, fused steps and nested queries inside
//! expressions, so a pass written against them sees the whole pipeline.

use crate::ast::expr::{Expr, Lambda};
use crate::ast::node::{QueryNode, SortKey, Source, Step};

/// Read-only traversal; override a method to observe, call the `walk_*`
/// function to keep descending
pub trait Visitor {
    /// Visit a node
    fn visit_node(&mut self, node: &QueryNode) {
        walk_node(self, node)
    }

    /// Visit a lambda
    fn visit_lambda(&mut self, lambda: &Lambda) {
        self.visit_expr(&lambda.body)
    }

    /// Visit an expression
    fn visit_expr(&mut self, expr: &Expr) {
        walk_expr(self, expr)
    }
}

/// Visit the children of `expr`
pub fn walk_expr<V: Visitor + ?Sized>(v: &mut V, expr: &Expr) {
    match expr {
        Expr::Const { .. }
        | Expr::Var(_)
        | Expr::Param { .. }
        | Expr::Captured { .. }
        | Expr::Buffer(_) => {}
        Expr::Unary { operand, .. } => v.visit_expr(operand),
        Expr::Binary { lhs, rhs, .. } => {
            v.visit_expr(lhs);
            v.visit_expr(rhs);
        }
        Expr::Cond {
            cond,
            then,
            otherwise,
        } => {
            v.visit_expr(cond);
            v.visit_expr(then);
            v.visit_expr(otherwise);
        }
        Expr::Math { args, .. } | Expr::Tuple(args) | Expr::Host { args, .. } => {
            for arg in args {
                v.visit_expr(arg);
            }
        }
        Expr::Convert { expr, .. } | Expr::Field { expr, .. } => v.visit_expr(expr),
        Expr::Index { seq, index } => {
            v.visit_expr(seq);
            v.visit_expr(index);
        }
        Expr::Query(node) => v.visit_node(node),
    }
}

fn walk_step<V: Visitor + ?Sized>(v: &mut V, step: &Step) {
    match step {
        Step::Map(f) | Step::MapIndexed(f) | Step::Filter(f) | Step::FilterIndexed(f) => {
            v.visit_lambda(f)
        }
        Step::Bind { locals, .. } => {
            for (_, expr) in locals {
                v.visit_expr(expr);
            }
        }
        Step::MapLocals(expr) | Step::FilterLocals(expr) => v.visit_expr(expr),
    }
}

/// Visit the inputs, lambdas and expressions of `node`
pub fn walk_node<V: Visitor + ?Sized>(v: &mut V, node: &QueryNode) {
    match node {
        QueryNode::Source { source, .. } => {
            if let Source::Expr(expr) = source {
                v.visit_expr(expr);
            }
        }
        QueryNode::Range { start, count } => {
            v.visit_expr(start);
            v.visit_expr(count);
        }
        QueryNode::Repeat { value, count, .. } => {
            v.visit_expr(value);
            v.visit_expr(count);
        }
        QueryNode::Generate {
            seed,
            condition,
            step,
            selector,
            ..
        } => {
            v.visit_expr(seed);
            v.visit_lambda(condition);
            v.visit_lambda(step);
            v.visit_lambda(selector);
        }
        QueryNode::Transform {
            input, selector, ..
        }
        | QueryNode::TransformIndexed {
            input, selector, ..
        } => {
            v.visit_node(input);
            v.visit_lambda(selector);
        }
        QueryNode::Filter { input, predicate }
        | QueryNode::FilterIndexed { input, predicate }
        | QueryNode::TakeWhile { input, predicate }
        | QueryNode::SkipWhile { input, predicate } => {
            v.visit_node(input);
            v.visit_lambda(predicate);
        }
        QueryNode::Fused { input, steps, .. } => {
            v.visit_node(input);
            for step in steps {
                walk_step(v, step);
            }
        }
        QueryNode::NestedQuery { input, nested, .. } => {
            v.visit_node(input);
            v.visit_node(nested);
        }
        QueryNode::NestedQueryTransform {
            input,
            nested,
            selector,
            ..
        } => {
            v.visit_node(input);
            v.visit_node(nested);
            v.visit_lambda(selector);
        }
        QueryNode::Take { input, count } | QueryNode::Skip { input, count } => {
            v.visit_node(input);
            v.visit_expr(count);
        }
        QueryNode::Aggregate {
            input,
            seed,
            func,
            combiner,
            ..
        } => {
            v.visit_node(input);
            v.visit_expr(seed);
            v.visit_lambda(func);
            if let Some(combiner) = combiner {
                v.visit_lambda(combiner);
            }
        }
        QueryNode::Sum { input, .. }
        | QueryNode::Count { input }
        | QueryNode::ToList { input }
        | QueryNode::ToArray { input } => v.visit_node(input),
        QueryNode::GroupBy { input, key, .. } => {
            v.visit_node(input);
            v.visit_lambda(key);
        }
        QueryNode::OrderBy { input, keys } => {
            v.visit_node(input);
            for key in keys {
                v.visit_lambda(&key.key);
            }
        }
        QueryNode::ZipWith {
            left,
            right,
            combiner,
            ..
        } => {
            v.visit_node(left);
            v.visit_node(right);
            v.visit_lambda(combiner);
        }
        QueryNode::ForEach { input, action } => {
            v.visit_node(input);
            v.visit_lambda(action);
        }
    }
}

/// Rebuilding traversal; every method defaults to rebuilding the children
pub trait Rewriter {
    /// Rewrite a node
    fn rewrite_node(&mut self, node: &QueryNode) -> QueryNode {
        rebuild_node(self, node)
    }

    /// Rewrite a lambda
    fn rewrite_lambda(&mut self, lambda: &Lambda) -> Lambda {
        Lambda::new(lambda.params.clone(), self.rewrite_expr(&lambda.body))
    }

    /// Rewrite an expression
    fn rewrite_expr(&mut self, expr: &Expr) -> Expr {
        rebuild_expr(self, expr)
    }

    /// Rewrite a fused step
    fn rewrite_step(&mut self, step: &Step) -> Step {
        rebuild_step(self, step)
    }
}

fn boxed<R: Rewriter + ?Sized>(r: &mut R, expr: &Expr) -> Box<Expr> {
    Box::new(r.rewrite_expr(expr))
}

fn node_box<R: Rewriter + ?Sized>(r: &mut R, node: &QueryNode) -> Box<QueryNode> {
    Box::new(r.rewrite_node(node))
}

/// Rebuild `expr` with rewritten children
pub fn rebuild_expr<R: Rewriter + ?Sized>(r: &mut R, expr: &Expr) -> Expr {
    match expr {
        Expr::Const { .. }
        | Expr::Var(_)
        | Expr::Param { .. }
        | Expr::Captured { .. }
        | Expr::Buffer(_) => expr.clone(),
        Expr::Unary { op, operand } => Expr::Unary {
            op: *op,
            operand: boxed(r, operand),
        },
        Expr::Binary { op, lhs, rhs } => Expr::Binary {
            op: *op,
            lhs: boxed(r, lhs),
            rhs: boxed(r, rhs),
        },
        Expr::Cond {
            cond,
            then,
            otherwise,
        } => Expr::Cond {
            cond: boxed(r, cond),
            then: boxed(r, then),
            otherwise: boxed(r, otherwise),
        },
        Expr::Math { func, args } => Expr::Math {
            func: *func,
            args: args.iter().map(|a| r.rewrite_expr(a)).collect(),
        },
        Expr::Convert { expr, to } => Expr::Convert {
            expr: boxed(r, expr),
            to: to.clone(),
        },
        Expr::Tuple(fields) => Expr::Tuple(fields.iter().map(|f| r.rewrite_expr(f)).collect()),
        Expr::Field { expr, index } => Expr::Field {
            expr: boxed(r, expr),
            index: *index,
        },
        Expr::Index { seq, index } => Expr::Index {
            seq: boxed(r, seq),
            index: boxed(r, index),
        },
        Expr::Query(node) => Expr::Query(node_box(r, node)),
        Expr::Host { func, args } => Expr::Host {
            func: func.clone(),
            args: args.iter().map(|a| r.rewrite_expr(a)).collect(),
        },
    }
}

/// Rebuild `step` with rewritten lambdas and expressions
pub fn rebuild_step<R: Rewriter + ?Sized>(r: &mut R, step: &Step) -> Step {
    match step {
        Step::Map(f) => Step::Map(r.rewrite_lambda(f)),
        Step::MapIndexed(f) => Step::MapIndexed(r.rewrite_lambda(f)),
        Step::Filter(p) => Step::Filter(r.rewrite_lambda(p)),
        Step::FilterIndexed(p) => Step::FilterIndexed(r.rewrite_lambda(p)),
        Step::Bind { param, locals } => Step::Bind {
            param: param.clone(),
            locals: locals
                .iter()
                .map(|(var, expr)| (var.clone(), r.rewrite_expr(expr)))
                .collect(),
        },
        Step::MapLocals(e) => Step::MapLocals(r.rewrite_expr(e)),
        Step::FilterLocals(e) => Step::FilterLocals(r.rewrite_expr(e)),
    }
}

/// Rebuild `node` with rewritten inputs, lambdas and expressions
pub fn rebuild_node<R: Rewriter + ?Sized>(r: &mut R, node: &QueryNode) -> QueryNode {
    match node {
        QueryNode::Source { source, elem } => QueryNode::Source {
            source: match source {
                Source::Expr(expr) => Source::Expr(r.rewrite_expr(expr)),
                other => other.clone(),
            },
            elem: elem.clone(),
        },
        QueryNode::Range { start, count } => QueryNode::Range {
            start: r.rewrite_expr(start),
            count: r.rewrite_expr(count),
        },
        QueryNode::Repeat { value, count, elem } => QueryNode::Repeat {
            value: r.rewrite_expr(value),
            count: r.rewrite_expr(count),
            elem: elem.clone(),
        },
        QueryNode::Generate {
            seed,
            condition,
            step,
            selector,
            elem,
        } => QueryNode::Generate {
            seed: r.rewrite_expr(seed),
            condition: r.rewrite_lambda(condition),
            step: r.rewrite_lambda(step),
            selector: r.rewrite_lambda(selector),
            elem: elem.clone(),
        },
        QueryNode::Transform {
            input,
            selector,
            elem,
        } => QueryNode::Transform {
            input: node_box(r, input),
            selector: r.rewrite_lambda(selector),
            elem: elem.clone(),
        },
        QueryNode::TransformIndexed {
            input,
            selector,
            elem,
        } => QueryNode::TransformIndexed {
            input: node_box(r, input),
            selector: r.rewrite_lambda(selector),
            elem: elem.clone(),
        },
        QueryNode::Filter { input, predicate } => QueryNode::Filter {
            input: node_box(r, input),
            predicate: r.rewrite_lambda(predicate),
        },
        QueryNode::FilterIndexed { input, predicate } => QueryNode::FilterIndexed {
            input: node_box(r, input),
            predicate: r.rewrite_lambda(predicate),
        },
        QueryNode::Fused { input, steps, elem } => QueryNode::Fused {
            input: node_box(r, input),
            steps: steps.iter().map(|s| r.rewrite_step(s)).collect(),
            elem: elem.clone(),
        },
        QueryNode::NestedQuery {
            input,
            var,
            nested,
            elem,
        } => QueryNode::NestedQuery {
            input: node_box(r, input),
            var: var.clone(),
            nested: node_box(r, nested),
            elem: elem.clone(),
        },
        QueryNode::NestedQueryTransform {
            input,
            var,
            nested,
            selector,
            elem,
        } => QueryNode::NestedQueryTransform {
            input: node_box(r, input),
            var: var.clone(),
            nested: node_box(r, nested),
            selector: r.rewrite_lambda(selector),
            elem: elem.clone(),
        },
        QueryNode::Take { input, count } => QueryNode::Take {
            input: node_box(r, input),
            count: r.rewrite_expr(count),
        },
        QueryNode::Skip { input, count } => QueryNode::Skip {
            input: node_box(r, input),
            count: r.rewrite_expr(count),
        },
        QueryNode::TakeWhile { input, predicate } => QueryNode::TakeWhile {
            input: node_box(r, input),
            predicate: r.rewrite_lambda(predicate),
        },
        QueryNode::SkipWhile { input, predicate } => QueryNode::SkipWhile {
            input: node_box(r, input),
            predicate: r.rewrite_lambda(predicate),
        },
        QueryNode::Aggregate {
            input,
            seed,
            func,
            combiner,
            ty,
        } => QueryNode::Aggregate {
            input: node_box(r, input),
            seed: r.rewrite_expr(seed),
            func: r.rewrite_lambda(func),
            combiner: combiner.as_ref().map(|c| r.rewrite_lambda(c)),
            ty: ty.clone(),
        },
        QueryNode::Sum { input, ty } => QueryNode::Sum {
            input: node_box(r, input),
            ty: ty.clone(),
        },
        QueryNode::Count { input } => QueryNode::Count {
            input: node_box(r, input),
        },
        QueryNode::GroupBy { input, key, elem } => QueryNode::GroupBy {
            input: node_box(r, input),
            key: r.rewrite_lambda(key),
            elem: elem.clone(),
        },
        QueryNode::OrderBy { input, keys } => QueryNode::OrderBy {
            input: node_box(r, input),
            keys: keys
                .iter()
                .map(|k| SortKey {
                    key: r.rewrite_lambda(&k.key),
                    direction: k.direction,
                })
                .collect(),
        },
        QueryNode::ZipWith {
            left,
            right,
            combiner,
            elem,
        } => QueryNode::ZipWith {
            left: node_box(r, left),
            right: node_box(r, right),
            combiner: r.rewrite_lambda(combiner),
            elem: elem.clone(),
        },
        QueryNode::ToList { input } => QueryNode::ToList {
            input: node_box(r, input),
        },
        QueryNode::ToArray { input } => QueryNode::ToArray {
            input: node_box(r, input),
        },
        QueryNode::ForEach { input, action } => QueryNode::ForEach {
            input: node_box(r, input),
            action: r.rewrite_lambda(action),
        },
    }
}

/// Capture-avoiding substitution of one variable
pub struct Substitute<'a> {
    name: &'a str,
    replacement: &'a Expr,
}

impl<'a> Substitute<'a> {
    /// Substitute `replacement` for `name`
    pub fn new(name: &'a str, replacement: &'a Expr) -> Self {
        Self { name, replacement }
    }
}

impl Rewriter for Substitute<'_> {
    fn rewrite_expr(&mut self, expr: &Expr) -> Expr {
        match expr {
            Expr::Var(var) if &*var.name == self.name => self.replacement.clone(),
            _ => rebuild_expr(self, expr),
        }
    }

    fn rewrite_lambda(&mut self, lambda: &Lambda) -> Lambda {
        if lambda.params.iter().any(|p| &*p.name == self.name) {
            return lambda.clone();
        }
        Lambda::new(lambda.params.clone(), self.rewrite_expr(&lambda.body))
    }
}

/// Counts occurrences of a variable, separating `Field(var, i)` reads from
/// whole-value uses
pub struct VarUses<'a> {
    name: &'a str,
    /// All occurrences
    pub total: usize,
    /// Occurrences read through a direct field access
    pub field_reads: usize,
}

impl<'a> VarUses<'a> {
    /// Count uses of `name`
    pub fn new(name: &'a str) -> Self {
        Self {
            name,
            total: 0,
            field_reads: 0,
        }
    }

    /// True when every occurrence is a field read
    pub fn only_fields(&self) -> bool {
        self.total == self.field_reads
    }
}

impl Visitor for VarUses<'_> {
    fn visit_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Var(var) if &*var.name == self.name => self.total += 1,
            Expr::Field { expr: inner, .. }
                if matches!(&**inner, Expr::Var(var) if &*var.name == self.name) =>
            {
                self.total += 1;
                self.field_reads += 1;
            }
            _ => walk_expr(self, expr),
        }
    }
}

/// Counts nodes, including nested sub-trees and queries inside expressions
#[derive(Default)]
pub struct NodeCounter {
    /// Nodes seen
    pub count: usize,
}

impl Visitor for NodeCounter {
    fn visit_node(&mut self, node: &QueryNode) {
        self.count += 1;
        walk_node(self, node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::expr::Var;
    use crate::value::ElemType;

    #[test]
    fn test_substitute_respects_shadowing() {
        let x = Var::new("x", ElemType::Int);
        let inner = Lambda::new(vec![x.clone()], x.expr() + 1);
        let node = QueryNode::Transform {
            input: Box::new(QueryNode::Range {
                start: x.expr(),
                count: Expr::int(2),
            }),
            selector: inner.clone(),
            elem: ElemType::Int,
        };
        let expr = Expr::query(node);
        let replaced = expr.subst("x", &Expr::int(7));
        match replaced {
            Expr::Query(node) => match *node {
                QueryNode::Transform {
                    input, selector, ..
                } => {
                    assert_eq!(selector, inner);
                    assert!(matches!(&*input, QueryNode::Range { start, .. } if *start == Expr::int(7)));
                }
                other => panic!("unexpected node {:?}", other),
            },
            other => panic!("unexpected expr {:?}", other),
        }
    }

    #[test]
    fn test_var_uses() {
        let t = Var::new("t", ElemType::Tuple(vec![ElemType::Int, ElemType::Int]));
        let fields_only = t.expr().field(0) + t.expr().field(1);
        let mut uses = VarUses::new("t");
        uses.visit_expr(&fields_only);
        assert_eq!(uses.total, 2);
        assert!(uses.only_fields());

        let whole = Expr::tuple(vec![t.expr(), t.expr().field(0)]);
        let mut uses = VarUses::new("t");
        uses.visit_expr(&whole);
        assert!(!uses.only_fields());
    }
}
