//! Constant folding and invariant hoisting
//!
//! Subexpressions built only from literals and captured values are folded
//! to literals. Maximal subexpressions that are invariant across elements
//! and read template parameters are moved into the query's hoisted bindings,
//! evaluated once per invocation. Anything that may fail or has effects
//! stays where it is.

use crate::ast::expr::{BinaryOp, Expr, Var};
use crate::ast::node::{Query, QueryNode};
use crate::ast::visit::{Rewriter, Visitor, rebuild_expr, walk_expr};
use crate::reference::{Env, eval_expr};
use crate::value::ElemType;
use std::collections::HashSet;
use std::sync::Arc;

/// Classification of an expression for lifting
#[derive(Debug, Clone, Copy)]
struct Shape {
    /// Every leaf is a literal, captured value, parameter or hoisted binding
    invariant: bool,
    /// Every leaf is a literal or captured value
    constant: bool,
    /// Reads a parameter or hoisted binding
    reads_env: bool,
    /// Cannot fail and has no effects
    safe: bool,
}

struct Classifier<'a> {
    hoisted: &'a HashSet<Arc<str>>,
    shape: Shape,
}

impl Visitor for Classifier<'_> {
    fn visit_node(&mut self, _node: &QueryNode) {
        self.shape.invariant = false;
        self.shape.constant = false;
        self.shape.safe = false;
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Var(var) => {
                self.shape.constant = false;
                if self.hoisted.contains(&var.name) {
                    self.shape.reads_env = true;
                } else {
                    self.shape.invariant = false;
                }
            }
            Expr::Param { .. } => {
                self.shape.constant = false;
                self.shape.reads_env = true;
            }
            Expr::Buffer(_) => {
                self.shape.invariant = false;
                self.shape.constant = false;
            }
            Expr::Host { .. } => {
                self.shape.constant = false;
                self.shape.safe = false;
                walk_expr(self, expr);
            }
            Expr::Index { .. } => {
                self.shape.safe = false;
                walk_expr(self, expr);
            }
            Expr::Binary {
                op: BinaryOp::Div | BinaryOp::Rem,
                lhs,
                ..
            } => {
                if !matches!(lhs.infer(), Ok(ty) if ty.is_floating()) {
                    self.shape.safe = false;
                }
                walk_expr(self, expr);
            }
            Expr::Convert { expr: inner, to } => {
                if to.is_numeric() && !matches!(inner.infer(), Ok(ty) if ty != ElemType::Str) {
                    self.shape.safe = false;
                }
                walk_expr(self, expr);
            }
            _ => walk_expr(self, expr),
        }
    }
}

/// Folds literals and hoists invariant subexpressions
pub struct Lifter {
    hoisted: Vec<(Var, Expr)>,
    names: HashSet<Arc<str>>,
    /// Subexpressions folded to literals
    pub folded: usize,
    /// New hoisted bindings
    pub lifted: usize,
}

impl Lifter {
    /// Lifter continuing the bindings already hoisted in `query`
    pub fn new(query: &Query) -> Self {
        Self {
            names: query.hoisted.iter().map(|(v, _)| v.name.clone()).collect(),
            hoisted: query.hoisted.clone(),
            folded: 0,
            lifted: 0,
        }
    }

    /// Rewrite the tree of `query`
    pub fn run(mut self, query: &Query) -> (Query, usize, usize) {
        let root = self.rewrite_node(&query.root);
        let (folded, lifted) = (self.folded, self.lifted);
        (
            Query {
                root,
                hoisted: self.hoisted,
            },
            folded,
            lifted,
        )
    }

    fn classify(&self, expr: &Expr) -> Shape {
        let mut classifier = Classifier {
            hoisted: &self.names,
            shape: Shape {
                invariant: true,
                constant: true,
                reads_env: false,
                safe: true,
            },
        };
        classifier.visit_expr(expr);
        classifier.shape
    }

    fn fold(&mut self, expr: &Expr) -> Option<Expr> {
        let ty = expr.infer().ok()?;
        let value = eval_expr(expr, &Env::new(&[])).ok()?;
        self.folded += 1;
        Some(Expr::constant(value, ty))
    }

    fn hoist(&mut self, expr: Expr) -> Option<Expr> {
        if let Some((var, _)) = self.hoisted.iter().find(|(_, e)| *e == expr) {
            return Some(var.expr());
        }
        let ty = expr.infer().ok()?;
        let var = Var::new(format!("$lift{}", self.hoisted.len()), ty);
        self.names.insert(var.name.clone());
        self.hoisted.push((var.clone(), expr));
        self.lifted += 1;
        Some(var.expr())
    }
}

/// Folding only; used on the inside of an expression about to be hoisted
struct FoldOnly<'a>(&'a mut Lifter);

impl Rewriter for FoldOnly<'_> {
    fn rewrite_expr(&mut self, expr: &Expr) -> Expr {
        if !expr.is_atom() && self.0.classify(expr).constant {
            if let Some(folded) = self.0.fold(expr) {
                return folded;
            }
        }
        rebuild_expr(self, expr)
    }
}

impl Rewriter for Lifter {
    fn rewrite_expr(&mut self, expr: &Expr) -> Expr {
        if expr.is_atom() {
            return expr.clone();
        }
        let shape = self.classify(expr);
        if shape.constant {
            if let Some(folded) = self.fold(expr) {
                return folded;
            }
        }
        if shape.invariant && shape.safe && shape.reads_env {
            let inner = FoldOnly(self).rewrite_expr(expr);
            if let Some(var) = self.hoist(inner) {
                return var;
            }
        }
        rebuild_expr(self, expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::expr::Lambda;

    fn selector(node: &QueryNode) -> &Lambda {
        match node {
            QueryNode::ToList { input } => selector(input),
            QueryNode::Transform { selector, .. } => selector,
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn test_folds_captured_arithmetic() {
        let factor = Expr::captured("factor", 3);
        let q = QueryNode::from_ints(&[1])
            .select(|x| x * (factor + 1))
            .unwrap()
            .to_list()
            .unwrap();
        let (out, folded, lifted) = Lifter::new(&Query::new(q.clone())).run(&Query::new(q));
        assert_eq!(folded, 1);
        assert_eq!(lifted, 0);
        let body = &selector(&out.root).body;
        match body {
            Expr::Binary { rhs, .. } => assert_eq!(**rhs, Expr::int(4)),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_hoists_parameter_expression_once() {
        let p = Expr::param(0, ElemType::Int);
        let q = QueryNode::range(0, 3)
            .unwrap()
            .filter(|x| x.gt(p.clone() * 2))
            .unwrap()
            .select(|x| x + p.clone() * 2)
            .unwrap()
            .to_list()
            .unwrap();
        let query = Query::new(q);
        let (out, _, lifted) = Lifter::new(&query).run(&query);
        assert_eq!(lifted, 1);
        assert_eq!(out.hoisted.len(), 1);
        assert_eq!(out.hoisted[0].1, Expr::param(0, ElemType::Int) * 2);
        assert!(out.check().is_ok());
    }

    #[test]
    fn test_failing_expressions_stay() {
        let p = Expr::param(0, ElemType::Int);
        let q = QueryNode::from_ints(&[1])
            .select(|x| x + Expr::int(10) / p.clone())
            .unwrap()
            .select(|x| x + Expr::int(1) / 0)
            .unwrap()
            .to_list()
            .unwrap();
        let query = Query::new(q);
        let (out, folded, lifted) = Lifter::new(&query).run(&query);
        assert_eq!((folded, lifted), (0, 0));
        assert_eq!(out, query);
    }

    #[test]
    fn test_rerun_is_stable() {
        let p = Expr::param(0, ElemType::Double);
        let q = QueryNode::from_doubles(&[1.0])
            .select(|x| x * p.clone().sqrt())
            .unwrap()
            .to_list()
            .unwrap();
        let query = Query::new(q);
        let (once, _, _) = Lifter::new(&query).run(&query);
        let (twice, folded, lifted) = Lifter::new(&once).run(&once);
        assert_eq!((folded, lifted), (0, 0));
        assert_eq!(once, twice);
    }
}
