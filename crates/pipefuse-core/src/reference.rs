//! Reference evaluator
//!
//! A direct interpreter over the query tree built from lazy iterators. It
//! never rewrites or compiles anything, which makes it the oracle every
//! backend is tested against. The optimizer also uses [`eval_expr`] to fold
//! constant subexpressions.

use crate::ast::expr::{BinaryOp, Expr, Lambda};
use crate::ast::node::{Query, QueryNode, Source, Step};
use crate::error::{Error, Result};
use crate::ops;
use crate::value::Value;
use indexmap::IndexMap;
use std::iter;
use std::sync::Arc;

type Stream<'a> = Box<dyn Iterator<Item = Result<Value>> + 'a>;

struct Binding {
    name: Arc<str>,
    value: Value,
    next: Option<Arc<Binding>>,
}

/// Variable environment: template arguments plus a persistent list of
/// bound variables
#[derive(Clone)]
pub struct Env {
    params: Arc<[Value]>,
    vars: Option<Arc<Binding>>,
}

impl Env {
    /// Environment with the given template arguments and no bindings
    pub fn new(params: &[Value]) -> Self {
        Self {
            params: Arc::from(params),
            vars: None,
        }
    }

    /// Extend with one binding
    pub fn bind(&self, name: &Arc<str>, value: Value) -> Self {
        Self {
            params: self.params.clone(),
            vars: Some(Arc::new(Binding {
                name: name.clone(),
                value,
                next: self.vars.clone(),
            })),
        }
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        let mut cursor = self.vars.as_deref();
        while let Some(binding) = cursor {
            if &*binding.name == name {
                return Some(&binding.value);
            }
            cursor = binding.next.as_deref();
        }
        None
    }
}

/// Evaluate an optimized query: hoisted bindings first, then the tree
pub fn evaluate_query(query: &Query, params: &[Value]) -> Result<Value> {
    let mut env = Env::new(params);
    for (var, expr) in &query.hoisted {
        let value = eval_expr(expr, &env)?;
        env = env.bind(&var.name, value);
    }
    run_node(&query.root, &env)
}

/// Evaluate a tree with the given template arguments
pub fn evaluate(node: &QueryNode, params: &[Value]) -> Result<Value> {
    run_node(node, &Env::new(params))
}

/// Evaluate an expression
pub fn eval_expr(expr: &Expr, env: &Env) -> Result<Value> {
    match expr {
        Expr::Const { value, .. } | Expr::Captured { value, .. } => Ok(value.clone()),
        Expr::Var(var) => env
            .lookup(&var.name)
            .cloned()
            .ok_or_else(|| Error::internal(format!("unbound variable {}", var.name))),
        Expr::Param { index, .. } => env.params.get(*index).cloned().ok_or_else(|| {
            Error::invalid_argument(format!("missing template argument {}", index))
        }),
        Expr::Unary { op, operand } => ops::unary(*op, &eval_expr(operand, env)?),
        Expr::Binary { op, lhs, rhs } => match op {
            BinaryOp::And => {
                if !ops::truthy(&eval_expr(lhs, env)?)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(ops::truthy(&eval_expr(rhs, env)?)?))
            }
            BinaryOp::Or => {
                if ops::truthy(&eval_expr(lhs, env)?)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(ops::truthy(&eval_expr(rhs, env)?)?))
            }
            _ => ops::binary(*op, &eval_expr(lhs, env)?, &eval_expr(rhs, env)?),
        },
        Expr::Cond {
            cond,
            then,
            otherwise,
        } => {
            if ops::truthy(&eval_expr(cond, env)?)? {
                eval_expr(then, env)
            } else {
                eval_expr(otherwise, env)
            }
        }
        Expr::Math { func, args } => {
            let args = args
                .iter()
                .map(|a| eval_expr(a, env))
                .collect::<Result<Vec<_>>>()?;
            ops::math(*func, &args)
        }
        Expr::Convert { expr, to } => ops::convert(&eval_expr(expr, env)?, to),
        Expr::Tuple(fields) => Ok(Value::tuple(
            fields
                .iter()
                .map(|f| eval_expr(f, env))
                .collect::<Result<Vec<_>>>()?,
        )),
        Expr::Field { expr, index } => ops::field(&eval_expr(expr, env)?, *index),
        Expr::Index { seq, index } => ops::index(&eval_expr(seq, env)?, &eval_expr(index, env)?),
        Expr::Query(node) => run_node(node, env),
        Expr::Host { func, args } => {
            let args = args
                .iter()
                .map(|a| eval_expr(a, env))
                .collect::<Result<Vec<_>>>()?;
            func.call(&args)
        }
        Expr::Buffer(_) => Err(Error::compile(
            "device buffers can only be read by the device backend",
        )),
    }
}

fn apply(lambda: &Lambda, env: &Env, args: Vec<Value>) -> Result<Value> {
    let mut scope = env.clone();
    for (param, arg) in lambda.params.iter().zip(args) {
        scope = scope.bind(&param.name, arg);
    }
    eval_expr(&lambda.body, &scope)
}

fn test(lambda: &Lambda, env: &Env, args: Vec<Value>) -> Result<bool> {
    ops::truthy(&apply(lambda, env, args)?)
}

fn run_node(node: &QueryNode, env: &Env) -> Result<Value> {
    match node {
        QueryNode::ToList { input } | QueryNode::ToArray { input } => collect(input, env),
        QueryNode::Sum { input, ty } => {
            let zero = ty
                .zero()
                .ok_or_else(|| Error::internal(format!("sum over {}", ty)))?;
            stream(input, env)?.try_fold(zero, |acc, item| ops::add(&acc, &item?))
        }
        QueryNode::Count { input } => {
            let mut n: i32 = 0;
            for item in stream(input, env)? {
                item?;
                n = n.wrapping_add(1);
            }
            Ok(Value::Int(n))
        }
        QueryNode::Aggregate {
            input, seed, func, ..
        } => {
            let seed = eval_expr(seed, env)?;
            stream(input, env)?.try_fold(seed, |acc, item| apply(func, env, vec![acc, item?]))
        }
        QueryNode::ForEach { input, action } => {
            for item in stream(input, env)? {
                apply(action, env, vec![item?])?;
            }
            Ok(Value::Unit)
        }
        other => collect(other, env),
    }
}

fn collect(node: &QueryNode, env: &Env) -> Result<Value> {
    Ok(Value::seq(stream(node, env)?.collect::<Result<Vec<_>>>()?))
}

fn lift_err<'a>(err: Error) -> Stream<'a> {
    Box::new(iter::once(Err(err)))
}

fn stream<'a>(node: &'a QueryNode, env: &Env) -> Result<Stream<'a>> {
    let env = env.clone();
    if let Some(inner) = node.nested_stream() {
        return stream(inner, &env);
    }
    Ok(match node {
        QueryNode::Source { source, .. } => match source {
            Source::Values(values) => Box::new(values.iter().cloned().map(Ok)),
            Source::Expr(expr) => {
                let items = ops::items(&eval_expr(expr, &env)?)?;
                Box::new((0..items.len()).map(move |i| Ok(items[i].clone())))
            }
            Source::Device(_) => {
                return Err(Error::compile(
                    "device buffers can only be read by the device backend",
                ));
            }
        },
        QueryNode::Range { start, count } => {
            let (first, n) = ops::range_bounds(&eval_expr(start, &env)?, &eval_expr(count, &env)?)?;
            Box::new((0..n as i64).map(move |i| Ok(Value::Int((first as i64 + i) as i32))))
        }
        QueryNode::Repeat { value, count, .. } => {
            let value = eval_expr(value, &env)?;
            let n = ops::repeat_count(&eval_expr(count, &env)?)?;
            Box::new(iter::repeat_n(value, n).map(Ok))
        }
        QueryNode::Generate {
            seed,
            condition,
            step,
            selector,
            ..
        } => {
            let mut state = Some(eval_expr(seed, &env)?);
            Box::new(iter::from_fn(move || {
                let current = state.take()?;
                let produced = (|| {
                    if !test(condition, &env, vec![current.clone()])? {
                        return Ok(None);
                    }
                    let out = apply(selector, &env, vec![current.clone()])?;
                    let next = apply(step, &env, vec![current])?;
                    Ok(Some((out, next)))
                })();
                match produced {
                    Ok(Some((out, next))) => {
                        state = Some(next);
                        Some(Ok(out))
                    }
                    Ok(None) => None,
                    Err(e) => Some(Err(e)),
                }
            }))
        }
        QueryNode::Transform {
            input, selector, ..
        } => Box::new(
            stream(input, &env)?.map(move |item| apply(selector, &env, vec![item?])),
        ),
        QueryNode::TransformIndexed {
            input, selector, ..
        } => Box::new(stream(input, &env)?.enumerate().map(move |(i, item)| {
            apply(selector, &env, vec![item?, Value::Int(i as i32)])
        })),
        QueryNode::Filter { input, predicate } => {
            Box::new(stream(input, &env)?.filter_map(move |item| {
                keep(item, |v| test(predicate, &env, vec![v.clone()]))
            }))
        }
        QueryNode::FilterIndexed { input, predicate } => Box::new(
            stream(input, &env)?
                .enumerate()
                .filter_map(move |(i, item)| {
                    keep(item, |v| {
                        test(predicate, &env, vec![v.clone(), Value::Int(i as i32)])
                    })
                }),
        ),
        QueryNode::Fused { input, steps, .. } => {
            let mut positions = vec![0i32; steps.len()];
            Box::new(stream(input, &env)?.filter_map(move |item| {
                match item.and_then(|v| run_steps(steps, &env, v, &mut positions)) {
                    Ok(Some(v)) => Some(Ok(v)),
                    Ok(None) => None,
                    Err(e) => Some(Err(e)),
                }
            }))
        }
        QueryNode::NestedQuery {
            input, var, nested, ..
        } => Box::new(stream(input, &env)?.flat_map(move |item| match item {
            Ok(outer) => {
                let scope = env.bind(&var.name, outer);
                stream(nested, &scope).unwrap_or_else(lift_err)
            }
            Err(e) => lift_err(e),
        })),
        QueryNode::NestedQueryTransform {
            input,
            var,
            nested,
            selector,
            ..
        } => Box::new(stream(input, &env)?.flat_map(move |item| match item {
            Ok(outer) => {
                let scope = env.bind(&var.name, outer.clone());
                match stream(nested, &scope) {
                    Ok(inner) => {
                        let env = env.clone();
                        Box::new(inner.map(move |v| {
                            apply(selector, &env, vec![outer.clone(), v?])
                        })) as Stream<'a>
                    }
                    Err(e) => lift_err(e),
                }
            }
            Err(e) => lift_err(e),
        })),
        QueryNode::Take { input, count } => {
            let input = stream(input, &env)?;
            let n = ops::window_count(&eval_expr(count, &env)?)?;
            Box::new(input.take(n))
        }
        QueryNode::Skip { input, count } => {
            let input = stream(input, &env)?;
            let n = ops::window_count(&eval_expr(count, &env)?)?;
            Box::new(input.enumerate().filter_map(move |(i, item)| match item {
                Ok(_) if i < n => None,
                other => Some(other),
            }))
        }
        QueryNode::TakeWhile { input, predicate } => {
            Box::new(stream(input, &env)?.map_while(move |item| {
                match item.and_then(|v| Ok((test(predicate, &env, vec![v.clone()])?, v))) {
                    Ok((true, v)) => Some(Ok(v)),
                    Ok((false, _)) => None,
                    Err(e) => Some(Err(e)),
                }
            }))
        }
        QueryNode::SkipWhile { input, predicate } => {
            let mut skipping = true;
            Box::new(stream(input, &env)?.filter_map(move |item| match item {
                Ok(v) if skipping => match test(predicate, &env, vec![v.clone()]) {
                    Ok(true) => None,
                    Ok(false) => {
                        skipping = false;
                        Some(Ok(v))
                    }
                    Err(e) => Some(Err(e)),
                },
                other => Some(other),
            }))
        }
        QueryNode::GroupBy { input, key, .. } => {
            let mut groups: IndexMap<Value, Vec<Value>> = IndexMap::new();
            for item in stream(input, &env)? {
                let v = item?;
                let k = apply(key, &env, vec![v.clone()])?;
                groups.entry(k).or_default().push(v);
            }
            Box::new(
                groups
                    .into_iter()
                    .map(|(k, members)| Ok(Value::group(k, members))),
            )
        }
        QueryNode::OrderBy { input, keys } => {
            let directions: Vec<_> = keys.iter().map(|k| k.direction).collect();
            let mut rows = Vec::new();
            for item in stream(input, &env)? {
                let v = item?;
                let ks = keys
                    .iter()
                    .map(|k| apply(&k.key, &env, vec![v.clone()]))
                    .collect::<Result<Vec<_>>>()?;
                rows.push((ks, v));
            }
            rows.sort_by(|a, b| ops::compare_keys(&a.0, &b.0, &directions));
            Box::new(rows.into_iter().map(|(_, v)| Ok(v)))
        }
        QueryNode::ZipWith {
            left,
            right,
            combiner,
            ..
        } => {
            // the right side is drained before the left is pulled
            let right = stream(right, &env)?.collect::<Result<Vec<_>>>()?;
            Box::new(
                stream(left, &env)?
                    .zip(right)
                    .map(move |(l, r)| apply(combiner, &env, vec![l?, r])),
            )
        }
        terminal => {
            return Err(Error::construction(format!(
                "{} is terminal and cannot feed another operator",
                terminal.name()
            )));
        }
    })
}

fn keep(item: Result<Value>, pred: impl FnOnce(&Value) -> Result<bool>) -> Option<Result<Value>> {
    match item {
        Ok(v) => match pred(&v) {
            Ok(true) => Some(Ok(v)),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        },
        Err(e) => Some(Err(e)),
    }
}

/// Run a fused step chain on one element; `None` when a filter drops it.
/// `positions` holds the running index seen by each indexed step.
fn run_steps(
    steps: &[Step],
    env: &Env,
    element: Value,
    positions: &mut [i32],
) -> Result<Option<Value>> {
    let mut current = element;
    let mut locals = env.clone();
    for (i, step) in steps.iter().enumerate() {
        match step {
            Step::Map(f) => current = apply(f, env, vec![current])?,
            Step::MapIndexed(f) => {
                let index = positions[i];
                positions[i] = positions[i].wrapping_add(1);
                current = apply(f, env, vec![current, Value::Int(index)])?;
            }
            Step::Filter(p) => {
                if !test(p, env, vec![current.clone()])? {
                    return Ok(None);
                }
            }
            Step::FilterIndexed(p) => {
                let index = positions[i];
                positions[i] = positions[i].wrapping_add(1);
                if !test(p, env, vec![current.clone(), Value::Int(index)])? {
                    return Ok(None);
                }
            }
            Step::Bind { param, locals: bound } => {
                locals = env.bind(&param.name, current.clone());
                for (var, expr) in bound {
                    let value = eval_expr(expr, &locals)?;
                    locals = locals.bind(&var.name, value);
                }
            }
            Step::FilterLocals(p) => {
                if !ops::truthy(&eval_expr(p, &locals)?)? {
                    return Ok(None);
                }
            }
            Step::MapLocals(e) => current = eval_expr(e, &locals)?,
        }
    }
    Ok(Some(current))
}
