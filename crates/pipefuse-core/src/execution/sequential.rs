//! Sequential lowering
//!
//! A query tree becomes a chain of push closures: the source of each loop
//! level drives elements into a composed sink, and every operator wraps the
//! sink of its consumer. Fused steps run inside one closure, flattened
//! sub-pipelines become nested loop levels, and early exit travels back up
//! as [`Flow::Break`] tagged with the level that owns the loop to stop.
//!
//! ```text
//!   level 0:  Range ──▶ NestedQuery ──▶ Take ──▶ [list append]
//!                           │             ▲
//!   level 1:                └─ Skip ──────┘   (Break(0) unwinds both loops)
//! ```

use crate::ast::expr::{Expr, Var};
use crate::ast::node::{Direction, Query, QueryNode, Source, Step};
use crate::error::{Error, Result};
use crate::execution::expr::{CompiledLambda, Eval};
use crate::execution::frame::{Frame, Layout};
use crate::ops;
use crate::value::Value;
use std::sync::Arc;
use tracing::debug;

/// Loop control returned by sinks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep feeding elements
    Continue,
    /// Stop the loop of the given level and everything nested in it
    Break(u32),
}

/// Consumer of one element
pub type Sink = Arc<dyn Fn(&mut Frame, Value) -> Result<Flow> + Send + Sync>;

/// Runs one loop level: its initializers, then its source loop
pub type Driver = Arc<dyn Fn(&mut Frame) -> Result<Flow> + Send + Sync>;

type Init = Arc<dyn Fn(&mut Frame) -> Result<Flow> + Send + Sync>;
type Loop = Arc<dyn Fn(&mut Frame) -> Result<Flow> + Send + Sync>;

/// Decide what a loop does with a sink's answer; `None` keeps looping
fn settle(flow: Flow, scope: u32) -> Option<Flow> {
    match flow {
        Flow::Continue => None,
        Flow::Break(s) if s == scope => Some(Flow::Continue),
        other => Some(other),
    }
}

/// Loop over a slice of values, pushing each into `sink`
fn drain(frame: &mut Frame, items: &[Value], sink: &Sink, scope: u32) -> Result<Flow> {
    for item in items {
        if let Some(out) = settle(sink(frame, item.clone())?, scope) {
            return Ok(out);
        }
    }
    Ok(Flow::Continue)
}

struct Level {
    scope: u32,
    inits: Vec<Init>,
}

enum CompiledStep {
    Map(CompiledLambda),
    MapIndexed(CompiledLambda, usize),
    Filter(CompiledLambda),
    FilterIndexed(CompiledLambda, usize),
    Bind(usize, Vec<(usize, Eval)>),
    MapLocals(Eval),
    FilterLocals(Eval),
}

/// Lowering state: slot layout plus the variables currently in scope
pub struct Lowerer {
    layout: Layout,
    env: Vec<(Arc<str>, usize)>,
    params: Vec<usize>,
    next_scope: u32,
}

impl Lowerer {
    /// Lowerer for a routine taking `arity` positional arguments
    pub fn new(arity: usize) -> Self {
        let mut layout = Layout::default();
        let params = (0..arity).map(|_| layout.value()).collect();
        Self {
            layout,
            env: Vec::new(),
            params,
            next_scope: 0,
        }
    }

    /// Slots reserved so far
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub(crate) fn env_mark(&self) -> usize {
        self.env.len()
    }

    pub(crate) fn bind(&mut self, name: &Arc<str>) -> usize {
        let slot = self.layout.value();
        self.env.push((name.clone(), slot));
        slot
    }

    pub(crate) fn unbind_to(&mut self, mark: usize) {
        self.env.truncate(mark);
    }

    pub(crate) fn lookup(&self, name: &str) -> Result<usize> {
        self.env
            .iter()
            .rev()
            .find(|(n, _)| &**n == name)
            .map(|(_, slot)| *slot)
            .ok_or_else(|| Error::compile(format!("unbound variable {}", name)))
    }

    pub(crate) fn param_slot(&self, index: usize) -> Result<usize> {
        self.params.get(index).copied().ok_or_else(|| {
            Error::compile(format!(
                "template parameter {} out of range for {} argument(s)",
                index,
                self.params.len()
            ))
        })
    }

    fn new_scope(&mut self) -> u32 {
        self.next_scope += 1;
        self.next_scope - 1
    }

    /// Lower a whole tree to a closure producing its result value; a
    /// non-terminal root is materialized as a list
    pub fn lower_value(&mut self, node: &QueryNode) -> Result<Eval> {
        Ok(match node {
            QueryNode::ToList { input } | QueryNode::ToArray { input } => self.lower_list(input)?,
            QueryNode::Sum { input, ty } => {
                let zero = ty
                    .zero()
                    .ok_or_else(|| Error::compile(format!("cannot sum elements of type {}", ty)))?;
                let acc = self.layout.value();
                let add: Sink = Arc::new(move |f, v| {
                    let sum = std::mem::replace(&mut f.values[acc], Value::Unit);
                    f.values[acc] = ops::add(&sum, &v)?;
                    Ok(Flow::Continue)
                });
                let driver = self.lower_level(input, add)?;
                Arc::new(move |f| {
                    f.values[acc] = zero.clone();
                    driver(f)?;
                    Ok(std::mem::replace(&mut f.values[acc], Value::Unit))
                })
            }
            QueryNode::Count { input } => {
                let n = self.layout.counter();
                let count: Sink = Arc::new(move |f, _| {
                    f.counters[n] += 1;
                    Ok(Flow::Continue)
                });
                let driver = self.lower_level(input, count)?;
                Arc::new(move |f| {
                    f.counters[n] = 0;
                    driver(f)?;
                    Ok(Value::Int(f.counters[n] as i32))
                })
            }
            QueryNode::Aggregate {
                input, seed, func, ..
            } => {
                let seed = self.compile_expr(seed)?;
                let func = self.compile_lambda(func)?;
                let acc = self.layout.value();
                let fold: Sink = Arc::new(move |f, v| {
                    let current = std::mem::replace(&mut f.values[acc], Value::Unit);
                    f.values[acc] = func.call2(f, current, v)?;
                    Ok(Flow::Continue)
                });
                let driver = self.lower_level(input, fold)?;
                Arc::new(move |f| {
                    f.values[acc] = seed(f)?;
                    driver(f)?;
                    Ok(std::mem::replace(&mut f.values[acc], Value::Unit))
                })
            }
            QueryNode::ForEach { input, action } => {
                let action = self.compile_lambda(action)?;
                let each: Sink = Arc::new(move |f, v| {
                    action.call1(f, v)?;
                    Ok(Flow::Continue)
                });
                let driver = self.lower_level(input, each)?;
                Arc::new(move |f| {
                    driver(f)?;
                    Ok(Value::Unit)
                })
            }
            stream => self.lower_list(stream)?,
        })
    }

    fn lower_list(&mut self, input: &QueryNode) -> Result<Eval> {
        let b = self.layout.buffer();
        let append: Sink = Arc::new(move |f, v| {
            f.buffers[b].push(v);
            Ok(Flow::Continue)
        });
        let driver = self.lower_level(input, append)?;
        Ok(Arc::new(move |f| {
            f.buffers[b].clear();
            driver(f)?;
            Ok(Value::seq(std::mem::take(&mut f.buffers[b])))
        }))
    }

    /// Lower `node` as a new loop level feeding `sink`
    pub fn lower_level(&mut self, node: &QueryNode, sink: Sink) -> Result<Driver> {
        let mut level = Level {
            scope: self.new_scope(),
            inits: Vec::new(),
        };
        let body = self.lower_stream(node, sink, &mut level)?;
        let Level { scope, inits } = level;
        Ok(Arc::new(move |f| {
            for init in &inits {
                if let Some(out) = settle(init(f)?, scope) {
                    return Ok(out);
                }
            }
            body(f)
        }))
    }

    fn lower_stream(&mut self, node: &QueryNode, sink: Sink, level: &mut Level) -> Result<Loop> {
        let scope = level.scope;
        if let Some(inner) = node.nested_stream() {
            return self.lower_stream(inner, sink, level);
        }
        match node {
            QueryNode::Source { source, .. } => match source {
                Source::Values(values) => {
                    let values = values.clone();
                    Ok(Arc::new(move |f| drain(f, &values, &sink, scope)))
                }
                Source::Expr(expr) => {
                    let seq = self.compile_expr(expr)?;
                    let slot = self.layout.value();
                    level.inits.push(Arc::new(move |f| {
                        f.values[slot] = seq(f)?;
                        Ok(Flow::Continue)
                    }));
                    Ok(Arc::new(move |f| {
                        let items = ops::items(&f.values[slot])?;
                        drain(f, &items, &sink, scope)
                    }))
                }
                Source::Device(_) => Err(Error::compile(
                    "device buffers can only be read by the device backend",
                )),
            },
            QueryNode::Range { start, count } => {
                let start = self.compile_expr(start)?;
                let count = self.compile_expr(count)?;
                let (first, n) = (self.layout.counter(), self.layout.counter());
                level.inits.push(Arc::new(move |f| {
                    let s = start(f)?;
                    let (from, len) = ops::range_bounds(&s, &count(f)?)?;
                    f.counters[first] = from as i64;
                    f.counters[n] = len as i64;
                    Ok(Flow::Continue)
                }));
                Ok(Arc::new(move |f| {
                    let (from, len) = (f.counters[first], f.counters[n]);
                    for i in 0..len {
                        if let Some(out) = settle(sink(f, Value::Int((from + i) as i32))?, scope) {
                            return Ok(out);
                        }
                    }
                    Ok(Flow::Continue)
                }))
            }
            QueryNode::Repeat { value, count, .. } => {
                let value = self.compile_expr(value)?;
                let count = self.compile_expr(count)?;
                let (slot, n) = (self.layout.value(), self.layout.counter());
                level.inits.push(Arc::new(move |f| {
                    f.values[slot] = value(f)?;
                    f.counters[n] = ops::repeat_count(&count(f)?)? as i64;
                    Ok(Flow::Continue)
                }));
                Ok(Arc::new(move |f| {
                    for _ in 0..f.counters[n] {
                        let v = f.values[slot].clone();
                        if let Some(out) = settle(sink(f, v)?, scope) {
                            return Ok(out);
                        }
                    }
                    Ok(Flow::Continue)
                }))
            }
            QueryNode::Generate {
                seed,
                condition,
                step,
                selector,
                ..
            } => {
                let seed = self.compile_expr(seed)?;
                let condition = self.compile_lambda(condition)?;
                let step = self.compile_lambda(step)?;
                let selector = self.compile_lambda(selector)?;
                let state = self.layout.value();
                level.inits.push(Arc::new(move |f| {
                    f.values[state] = seed(f)?;
                    Ok(Flow::Continue)
                }));
                Ok(Arc::new(move |f| loop {
                    let current = f.values[state].clone();
                    if !condition.test1(f, current.clone())? {
                        return Ok(Flow::Continue);
                    }
                    let out = selector.call1(f, current.clone())?;
                    f.values[state] = step.call1(f, current)?;
                    if let Some(flow) = settle(sink(f, out)?, scope) {
                        return Ok(flow);
                    }
                }))
            }
            QueryNode::Transform {
                input, selector, ..
            } => {
                let selector = self.compile_lambda(selector)?;
                let next: Sink = Arc::new(move |f, v| {
                    let out = selector.call1(f, v)?;
                    sink(f, out)
                });
                self.lower_stream(input, next, level)
            }
            QueryNode::TransformIndexed {
                input, selector, ..
            } => {
                let selector = self.compile_lambda(selector)?;
                let c = self.layout.counter();
                let next: Sink = Arc::new(move |f, v| {
                    let index = f.counters[c];
                    f.counters[c] += 1;
                    let out = selector.call2(f, v, Value::Int(index as i32))?;
                    sink(f, out)
                });
                let body = self.lower_stream(input, next, level)?;
                level.inits.push(reset_counters(vec![c]));
                Ok(body)
            }
            QueryNode::Filter { input, predicate } => {
                let predicate = self.compile_lambda(predicate)?;
                let next: Sink = Arc::new(move |f, v| {
                    if predicate.test1(f, v.clone())? {
                        sink(f, v)
                    } else {
                        Ok(Flow::Continue)
                    }
                });
                self.lower_stream(input, next, level)
            }
            QueryNode::FilterIndexed { input, predicate } => {
                let predicate = self.compile_lambda(predicate)?;
                let c = self.layout.counter();
                let next: Sink = Arc::new(move |f, v| {
                    let index = f.counters[c];
                    f.counters[c] += 1;
                    if predicate.test2(f, v.clone(), Value::Int(index as i32))? {
                        sink(f, v)
                    } else {
                        Ok(Flow::Continue)
                    }
                });
                let body = self.lower_stream(input, next, level)?;
                level.inits.push(reset_counters(vec![c]));
                Ok(body)
            }
            QueryNode::Fused { input, steps, .. } => {
                let (compiled, counters) = self.compile_steps(steps)?;
                let next: Sink = Arc::new(move |f, v| {
                    match run_steps(&compiled, f, v)? {
                        Some(out) => sink(f, out),
                        None => Ok(Flow::Continue),
                    }
                });
                let body = self.lower_stream(input, next, level)?;
                if !counters.is_empty() {
                    level.inits.push(reset_counters(counters));
                }
                Ok(body)
            }
            QueryNode::NestedQuery {
                input, var, nested, ..
            } => {
                let mark = self.env_mark();
                let slot = self.bind(&var.name);
                let inner = self.lower_level(nested, sink);
                self.unbind_to(mark);
                let inner = inner?;
                let next: Sink = Arc::new(move |f, v| {
                    f.values[slot] = v;
                    inner(f)
                });
                self.lower_stream(input, next, level)
            }
            QueryNode::NestedQueryTransform {
                input,
                var,
                nested,
                selector,
                ..
            } => {
                let selector = self.compile_lambda(selector)?;
                let mark = self.env_mark();
                let slot = self.bind(&var.name);
                let select: Sink = Arc::new(move |f, inner| {
                    let outer = f.values[slot].clone();
                    let out = selector.call2(f, outer, inner)?;
                    sink(f, out)
                });
                let inner = self.lower_level(nested, select);
                self.unbind_to(mark);
                let inner = inner?;
                let next: Sink = Arc::new(move |f, v| {
                    f.values[slot] = v;
                    inner(f)
                });
                self.lower_stream(input, next, level)
            }
            QueryNode::Take { input, count } => {
                let count = self.compile_expr(count)?;
                let c = self.layout.counter();
                let next: Sink = Arc::new(move |f, v| {
                    let flow = sink(f, v)?;
                    f.counters[c] -= 1;
                    if flow != Flow::Continue {
                        Ok(flow)
                    } else if f.counters[c] <= 0 {
                        Ok(Flow::Break(scope))
                    } else {
                        Ok(Flow::Continue)
                    }
                });
                let body = self.lower_stream(input, next, level)?;
                level.inits.push(Arc::new(move |f| {
                    let n = ops::window_count(&count(f)?)?;
                    f.counters[c] = n as i64;
                    Ok(if n == 0 {
                        Flow::Break(scope)
                    } else {
                        Flow::Continue
                    })
                }));
                Ok(body)
            }
            QueryNode::Skip { input, count } => {
                let count = self.compile_expr(count)?;
                let c = self.layout.counter();
                let next: Sink = Arc::new(move |f, v| {
                    if f.counters[c] > 0 {
                        f.counters[c] -= 1;
                        Ok(Flow::Continue)
                    } else {
                        sink(f, v)
                    }
                });
                let body = self.lower_stream(input, next, level)?;
                level.inits.push(Arc::new(move |f| {
                    f.counters[c] = ops::window_count(&count(f)?)? as i64;
                    Ok(Flow::Continue)
                }));
                Ok(body)
            }
            QueryNode::TakeWhile { input, predicate } => {
                let predicate = self.compile_lambda(predicate)?;
                let next: Sink = Arc::new(move |f, v| {
                    if predicate.test1(f, v.clone())? {
                        sink(f, v)
                    } else {
                        Ok(Flow::Break(scope))
                    }
                });
                self.lower_stream(input, next, level)
            }
            QueryNode::SkipWhile { input, predicate } => {
                let predicate = self.compile_lambda(predicate)?;
                let skipping = self.layout.counter();
                let next: Sink = Arc::new(move |f, v| {
                    if f.counters[skipping] == 1 {
                        if predicate.test1(f, v.clone())? {
                            return Ok(Flow::Continue);
                        }
                        f.counters[skipping] = 0;
                    }
                    sink(f, v)
                });
                let body = self.lower_stream(input, next, level)?;
                level.inits.push(Arc::new(move |f| {
                    f.counters[skipping] = 1;
                    Ok(Flow::Continue)
                }));
                Ok(body)
            }
            QueryNode::GroupBy { input, key, .. } => {
                let key = self.compile_lambda(key)?;
                let t = self.layout.group_table();
                let insert: Sink = Arc::new(move |f, v| {
                    let k = key.call1(f, v.clone())?;
                    f.groups[t].entry(k).or_default().push(v);
                    Ok(Flow::Continue)
                });
                let fill = self.lower_level(input, insert)?;
                level.inits.push(Arc::new(move |f| {
                    f.groups[t].clear();
                    fill(f)?;
                    Ok(Flow::Continue)
                }));
                Ok(Arc::new(move |f| {
                    let table = std::mem::take(&mut f.groups[t]);
                    for (k, members) in table {
                        if let Some(out) = settle(sink(f, Value::group(k, members))?, scope) {
                            return Ok(out);
                        }
                    }
                    Ok(Flow::Continue)
                }))
            }
            QueryNode::OrderBy { input, keys } => {
                let directions: Arc<[Direction]> = keys.iter().map(|k| k.direction).collect();
                let keys = keys
                    .iter()
                    .map(|k| self.compile_lambda(&k.key))
                    .collect::<Result<Vec<_>>>()?;
                let r = self.layout.sort_rows();
                let insert: Sink = Arc::new(move |f, v| {
                    let row = keys
                        .iter()
                        .map(|k| k.call1(f, v.clone()))
                        .collect::<Result<Vec<_>>>()?;
                    f.rows[r].push((row, v));
                    Ok(Flow::Continue)
                });
                let fill = self.lower_level(input, insert)?;
                level.inits.push(Arc::new(move |f| {
                    f.rows[r].clear();
                    fill(f)?;
                    f.rows[r].sort_by(|a, b| ops::compare_keys(&a.0, &b.0, &directions));
                    Ok(Flow::Continue)
                }));
                Ok(Arc::new(move |f| {
                    let rows = std::mem::take(&mut f.rows[r]);
                    for (_, v) in rows {
                        if let Some(out) = settle(sink(f, v)?, scope) {
                            return Ok(out);
                        }
                    }
                    Ok(Flow::Continue)
                }))
            }
            QueryNode::ZipWith {
                left,
                right,
                combiner,
                ..
            } => {
                let combiner = self.compile_lambda(combiner)?;
                let (b, c) = (self.layout.buffer(), self.layout.counter());
                let store: Sink = Arc::new(move |f, v| {
                    f.buffers[b].push(v);
                    Ok(Flow::Continue)
                });
                let fill = self.lower_level(right, store)?;
                // the right side is drained before the left is pulled
                level.inits.push(Arc::new(move |f| {
                    f.buffers[b].clear();
                    f.counters[c] = 0;
                    fill(f)?;
                    Ok(Flow::Continue)
                }));
                let next: Sink = Arc::new(move |f, l| {
                    let Some(r) = f.buffers[b].get(f.counters[c] as usize).cloned() else {
                        return Ok(Flow::Break(scope));
                    };
                    f.counters[c] += 1;
                    let out = combiner.call2(f, l, r)?;
                    sink(f, out)
                });
                self.lower_stream(left, next, level)
            }
            terminal => Err(Error::construction(format!(
                "{} is terminal and cannot feed another operator",
                terminal.name()
            ))),
        }
    }

    /// Compile a fused step list; returns the steps and the index counters
    /// that must be reset whenever the loop level restarts
    fn compile_steps(&mut self, steps: &[Step]) -> Result<(Arc<[CompiledStep]>, Vec<usize>)> {
        let mark = self.env_mark();
        let compiled = self.compile_steps_in_scope(steps);
        self.unbind_to(mark);
        let compiled = compiled?;
        let counters = compiled
            .iter()
            .filter_map(|s| match s {
                CompiledStep::MapIndexed(_, c) | CompiledStep::FilterIndexed(_, c) => Some(*c),
                _ => None,
            })
            .collect();
        Ok((compiled.into(), counters))
    }

    fn compile_steps_in_scope(&mut self, steps: &[Step]) -> Result<Vec<CompiledStep>> {
        let mut out = Vec::with_capacity(steps.len());
        for step in steps {
            out.push(match step {
                Step::Map(f) => CompiledStep::Map(self.compile_lambda(f)?),
                Step::MapIndexed(f) => {
                    CompiledStep::MapIndexed(self.compile_lambda(f)?, self.layout.counter())
                }
                Step::Filter(p) => CompiledStep::Filter(self.compile_lambda(p)?),
                Step::FilterIndexed(p) => {
                    CompiledStep::FilterIndexed(self.compile_lambda(p)?, self.layout.counter())
                }
                Step::Bind { param, locals } => {
                    let slot = self.bind(&param.name);
                    let mut bound = Vec::with_capacity(locals.len());
                    for (var, expr) in locals {
                        let eval = self.compile_expr(expr)?;
                        bound.push((self.bind(&var.name), eval));
                    }
                    CompiledStep::Bind(slot, bound)
                }
                Step::MapLocals(e) => CompiledStep::MapLocals(self.compile_expr(e)?),
                Step::FilterLocals(e) => CompiledStep::FilterLocals(self.compile_expr(e)?),
            });
        }
        Ok(out)
    }
}

fn reset_counters(counters: Vec<usize>) -> Init {
    Arc::new(move |f| {
        for c in &counters {
            f.counters[*c] = 0;
        }
        Ok(Flow::Continue)
    })
}

/// One element through a fused chain; `None` when a filter drops it
fn run_steps(steps: &[CompiledStep], f: &mut Frame, element: Value) -> Result<Option<Value>> {
    let mut current = element;
    for step in steps {
        match step {
            CompiledStep::Map(l) => current = l.call1(f, current)?,
            CompiledStep::MapIndexed(l, c) => {
                let index = f.counters[*c];
                f.counters[*c] += 1;
                current = l.call2(f, current, Value::Int(index as i32))?;
            }
            CompiledStep::Filter(p) => {
                if !p.test1(f, current.clone())? {
                    return Ok(None);
                }
            }
            CompiledStep::FilterIndexed(p, c) => {
                let index = f.counters[*c];
                f.counters[*c] += 1;
                if !p.test2(f, current.clone(), Value::Int(index as i32))? {
                    return Ok(None);
                }
            }
            CompiledStep::Bind(slot, locals) => {
                f.values[*slot] = current.clone();
                for (local, eval) in locals {
                    let v = eval(f)?;
                    f.values[*local] = v;
                }
            }
            CompiledStep::FilterLocals(p) => {
                if !ops::truthy(&p(f)?)? {
                    return Ok(None);
                }
            }
            CompiledStep::MapLocals(e) => current = e(f)?,
        }
    }
    Ok(Some(current))
}

/// A compiled query: fixed slot layout plus the closure tree
pub struct Routine {
    layout: Layout,
    params: Vec<usize>,
    hoisted: Vec<(usize, Eval)>,
    body: Eval,
}

impl Routine {
    /// Lower `query` for `arity` positional arguments
    pub fn compile(query: &Query, arity: usize) -> Result<Self> {
        Self::compile_with(&query.hoisted, arity, |lowerer| {
            let body = lowerer.lower_value(&query.root)?;
            debug!(
                slots = lowerer.layout.size(),
                levels = lowerer.next_scope,
                "lowered query"
            );
            Ok(body)
        })
    }

    /// Bind `hoisted` in order, then let `build` lower the body in that scope
    pub fn compile_with(
        hoisted: &[(Var, Expr)],
        arity: usize,
        build: impl FnOnce(&mut Lowerer) -> Result<Eval>,
    ) -> Result<Self> {
        let mut lowerer = Lowerer::new(arity);
        let mut bound = Vec::with_capacity(hoisted.len());
        for (var, expr) in hoisted {
            let eval = lowerer.compile_expr(expr)?;
            bound.push((lowerer.bind(&var.name), eval));
        }
        let body = build(&mut lowerer)?;
        Ok(Self {
            layout: lowerer.layout,
            params: lowerer.params,
            hoisted: bound,
            body,
        })
    }

    /// Number of positional arguments
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Fresh frame with the arguments stored and the hoisted bindings evaluated
    pub fn prepare(&self, args: &[Value]) -> Result<Frame> {
        if args.len() != self.params.len() {
            return Err(Error::invalid_argument(format!(
                "expected {} argument(s), got {}",
                self.params.len(),
                args.len()
            )));
        }
        let mut frame = Frame::new(&self.layout);
        for (slot, arg) in self.params.iter().zip(args) {
            frame.values[*slot] = arg.clone();
        }
        for (slot, eval) in &self.hoisted {
            let v = eval(&mut frame)?;
            frame.values[*slot] = v;
        }
        Ok(frame)
    }

    /// Evaluate the body in a frame from [`Routine::prepare`]
    pub fn run_in(&self, frame: &mut Frame) -> Result<Value> {
        (self.body)(frame)
    }

    /// Run with a fresh frame
    pub fn run(&self, args: &[Value]) -> Result<Value> {
        let mut frame = self.prepare(args)?;
        self.run_in(&mut frame)
    }
}

impl std::fmt::Debug for Routine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Routine")
            .field("layout", &self.layout)
            .field("arity", &self.params.len())
            .field("hoisted", &self.hoisted.len())
            .finish()
    }
}
