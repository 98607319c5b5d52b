//! Partitioned execution
//!
//! The pipeline is cut at its first combine point above the source. The part
//! below (the partition-safe segment) is compiled into a sequential routine
//! that runs once per partition on the global rayon pool; the partials are
//! merged by the strategy of the combine point, and whatever sits above it
//! runs sequentially over the merged value.
//!
//! ```text
//!            ┌─ part 0 ─▶ segment ─▶ partial ─┐
//!   source ──┼─ part 1 ─▶ segment ─▶ partial ─┼─▶ combine ─▶ upper (sequential)
//!            └─ part n ─▶ segment ─▶ partial ─┘
//! ```
//!
//! Indexable sources are divided into contiguous spans. A `Generate` source
//! is drained by a producer on the calling thread into a bounded channel of
//! chunks that pool workers consume.

use crate::ast::expr::{Expr, Lambda};
use crate::ast::node::{Direction, Query, QueryNode, SortKey, Source, Step};
use crate::config::PartitionConfig;
use crate::error::{Error, Result};
use crate::execution::expr::CompiledLambda;
use crate::execution::sequential::Routine;
use crate::ops;
use crate::value::{ElemType, Value};
use crossbeam_channel::{bounded, unbounded};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

/// How the partitions get their elements
enum Splitter {
    /// Evaluate a sequence once, hand out contiguous slices
    Items(Routine),
    /// Evaluate `(start, count)`, hand out sub-ranges
    Range(Routine),
    /// Evaluate `(value, count)`, hand out shorter repetitions
    Repeat(Routine),
    /// Run the generator on the calling thread, hand out chunks
    Generate {
        seed: Routine,
        condition: CompiledLambda,
        step: CompiledLambda,
        selector: CompiledLambda,
    },
}

/// How partials become one value
#[derive(Debug)]
enum Combine {
    Sum(ElemType),
    Count,
    /// Merge routine taking the partials as its last argument
    Fold(Routine),
    Concat { ordered: bool },
    Groups,
    Sorted(Arc<[Direction]>),
    Effects,
}

impl Combine {
    fn ordered(&self) -> bool {
        !matches!(self, Combine::Concat { ordered: false })
    }

    fn name(&self) -> &'static str {
        match self {
            Combine::Sum(_) => "sum",
            Combine::Count => "count",
            Combine::Fold(_) => "fold",
            Combine::Concat { .. } => "concat",
            Combine::Groups => "group-merge",
            Combine::Sorted(_) => "sorted-merge",
            Combine::Effects => "for-each",
        }
    }
}

struct Split {
    splitter: Splitter,
    lower: Routine,
    combine: Combine,
    upper: Option<Routine>,
}

enum Plan {
    Sequential(Routine),
    Split(Split),
}

/// A query compiled for partitioned execution
pub struct PartitionedRoutine {
    plan: Plan,
    arity: usize,
    partitions: usize,
    config: PartitionConfig,
}

impl std::fmt::Debug for PartitionedRoutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let plan = match &self.plan {
            Plan::Sequential(_) => "sequential",
            Plan::Split(split) => split.combine.name(),
        };
        f.debug_struct("PartitionedRoutine")
            .field("plan", &plan)
            .field("arity", &self.arity)
            .field("partitions", &self.partitions)
            .finish()
    }
}

/// Operators that can run independently on each partition
fn partition_safe(node: &QueryNode) -> bool {
    match node {
        QueryNode::Transform { .. }
        | QueryNode::Filter { .. }
        | QueryNode::NestedQuery { .. }
        | QueryNode::NestedQueryTransform { .. } => true,
        QueryNode::Fused { steps, .. } => !steps.iter().any(Step::is_indexed),
        _ => false,
    }
}

/// Copy of `node` reading from `input` instead of its primary input
fn with_input(node: &QueryNode, input: QueryNode) -> QueryNode {
    let input = Box::new(input);
    let mut out = node.clone();
    match &mut out {
        QueryNode::Source { .. }
        | QueryNode::Range { .. }
        | QueryNode::Repeat { .. }
        | QueryNode::Generate { .. } => return *input,
        QueryNode::ZipWith { left, .. } => *left = input,
        QueryNode::Transform { input: slot, .. }
        | QueryNode::TransformIndexed { input: slot, .. }
        | QueryNode::Filter { input: slot, .. }
        | QueryNode::FilterIndexed { input: slot, .. }
        | QueryNode::Fused { input: slot, .. }
        | QueryNode::NestedQuery { input: slot, .. }
        | QueryNode::NestedQueryTransform { input: slot, .. }
        | QueryNode::Take { input: slot, .. }
        | QueryNode::Skip { input: slot, .. }
        | QueryNode::TakeWhile { input: slot, .. }
        | QueryNode::SkipWhile { input: slot, .. }
        | QueryNode::Aggregate { input: slot, .. }
        | QueryNode::Sum { input: slot, .. }
        | QueryNode::Count { input: slot }
        | QueryNode::GroupBy { input: slot, .. }
        | QueryNode::OrderBy { input: slot, .. }
        | QueryNode::ToList { input: slot }
        | QueryNode::ToArray { input: slot }
        | QueryNode::ForEach { input: slot, .. } => *slot = input,
    }
    out
}

/// Rebuild `chain[from..to]` (top to bottom) on top of `bottom`
fn rebuild(chain: &[&QueryNode], from: usize, to: usize, bottom: QueryNode) -> QueryNode {
    chain[from..to]
        .iter()
        .rev()
        .fold(bottom, |acc, node| with_input(node, acc))
}

fn seq_param(index: usize, elem: ElemType) -> QueryNode {
    QueryNode::Source {
        source: Source::Expr(Expr::param(index, ElemType::seq(elem.clone()))),
        elem,
    }
}

/// Contiguous `(offset, len)` spans; never empty so reductions see a partial
fn spans(len: usize, parts: usize) -> Vec<(usize, usize)> {
    let parts = parts.clamp(1, len.max(1));
    let base = len / parts;
    let extra = len % parts;
    let mut offset = 0;
    (0..parts)
        .map(|i| {
            let n = base + usize::from(i < extra);
            let span = (offset, n);
            offset += n;
            span
        })
        .collect()
}

impl PartitionedRoutine {
    /// Plan and compile `query` for `arity` positional arguments
    pub fn compile(query: &Query, arity: usize, config: &PartitionConfig) -> Result<Self> {
        let partitions = config.effective_partitions();
        let plan = match Self::split(query, arity, config)? {
            Some(split) => {
                debug!(
                    partitions,
                    combine = split.combine.name(),
                    upper = split.upper.is_some(),
                    "partition plan"
                );
                Plan::Split(split)
            }
            None => Plan::Sequential(Routine::compile(query, arity)?),
        };
        Ok(Self {
            plan,
            arity,
            partitions,
            config: config.clone(),
        })
    }

    /// Whether the query actually runs on several partitions
    pub fn is_parallel(&self) -> bool {
        matches!(self.plan, Plan::Split(_))
    }

    /// Configured partition count
    pub fn partitions(&self) -> usize {
        self.partitions
    }

    fn split(query: &Query, arity: usize, config: &PartitionConfig) -> Result<Option<Split>> {
        let mut chain = vec![&query.root];
        while let Some(input) = chain[chain.len() - 1].input() {
            chain.push(input);
        }
        let source = chain.len() - 1;
        let mut seg_top = source;
        while seg_top > 0 && partition_safe(chain[seg_top - 1]) {
            seg_top -= 1;
        }
        let segment_empty = seg_top == source;
        let elem = chain[seg_top].elem_type();
        let generated = matches!(chain[source], QueryNode::Generate { .. });

        let fallback = |reason: &str| {
            debug!(reason, node = chain[source].name(), "partitioned run falls back to sequential");
            Ok(None)
        };

        // the segment plus its extra source parameters, on a partition-local source
        let (splitter, bottom) = match Self::splitter(chain[source], &query.hoisted, arity)? {
            Some(found) => found,
            None => return fallback("source cannot be partitioned"),
        };
        let segment = rebuild(&chain, seg_top, source, bottom);
        let part_arity = arity + splitter.extra_args();
        let lower_query = |root: QueryNode| Query {
            root,
            hoisted: query.hoisted.clone(),
        };
        let upper_query = |bottom: QueryNode, from: usize| -> Result<Routine> {
            let root = rebuild(&chain, 0, from, bottom);
            Routine::compile(&lower_query(root), arity + 1)
        };

        if seg_top == 0 {
            // non-terminal root made entirely of safe operators
            let lower = Routine::compile(&lower_query(QueryNode::ToList { input: Box::new(segment) }), part_arity)?;
            return Ok(Some(Split {
                splitter,
                lower,
                combine: Combine::Concat { ordered: config.preserve_order },
                upper: None,
            }));
        }

        let point = chain[seg_top - 1];
        let at_root = seg_top == 1;
        let (lower_root, combine, upper) = match point {
            QueryNode::Sum { ty, .. } => (with_input(point, segment), Combine::Sum(ty.clone()), None),
            QueryNode::Count { .. } => (with_input(point, segment), Combine::Count, None),
            QueryNode::Aggregate {
                seed,
                func,
                combiner,
                ty,
                ..
            } => {
                // every partition folds from `seed`, so only an explicit
                // combiner states that doing so is sound
                let Some(merge) = combiner.clone() else {
                    return fallback("aggregate without a combiner");
                };
                let lower = QueryNode::Aggregate {
                    input: Box::new(segment),
                    seed: seed.clone(),
                    func: func.clone(),
                    combiner: None,
                    ty: ty.clone(),
                };
                (lower, Combine::Fold(Self::fold_partials(query, arity, merge, ty)?), None)
            }
            QueryNode::ToList { .. } | QueryNode::ToArray { .. } => (
                QueryNode::ToList { input: Box::new(segment) },
                Combine::Concat { ordered: config.preserve_order },
                None,
            ),
            QueryNode::ForEach { .. } => (with_input(point, segment), Combine::Effects, None),
            QueryNode::GroupBy { elem: group, .. } => {
                let lower = QueryNode::ToList {
                    input: Box::new(with_input(point, segment)),
                };
                let upper = (!at_root)
                    .then(|| upper_query(seq_param(arity, group.clone()), seg_top - 1))
                    .transpose()?;
                (lower, Combine::Groups, upper)
            }
            QueryNode::OrderBy { keys, .. } => {
                let lower = Self::keyed_rows(segment, &elem, keys)?;
                let directions = keys.iter().map(|k| k.direction).collect();
                let upper = (!at_root)
                    .then(|| upper_query(seq_param(arity, elem.clone()), seg_top - 1))
                    .transpose()?;
                (lower, Combine::Sorted(directions), upper)
            }
            QueryNode::Take { .. } | QueryNode::TakeWhile { .. } => {
                return fallback("early exit above the segment");
            }
            _ if segment_empty => return fallback("no partition-safe operator above the source"),
            _ if generated => return fallback("unbounded source feeding a streaming operator"),
            _ => {
                let lower = QueryNode::ToList { input: Box::new(segment) };
                let upper = upper_query(seq_param(arity, elem.clone()), seg_top)?;
                (lower, Combine::Concat { ordered: true }, Some(upper))
            }
        };

        Ok(Some(Split {
            splitter,
            lower: Routine::compile(&lower_query(lower_root), part_arity)?,
            combine,
            upper,
        }))
    }

    /// Splitter for `source` plus the partition-local replacement leaf
    fn splitter(
        source: &QueryNode,
        hoisted: &[(crate::ast::expr::Var, Expr)],
        arity: usize,
    ) -> Result<Option<(Splitter, QueryNode)>> {
        if source.nested_stream().is_some() {
            return Ok(None);
        }
        Ok(Some(match source {
            QueryNode::Source { source, elem } => {
                let seq = match source {
                    Source::Values(values) => Expr::constant(
                        Value::Seq(values.clone()),
                        ElemType::seq(elem.clone()),
                    ),
                    Source::Expr(e) => e.clone(),
                    Source::Device(_) => {
                        return Err(Error::compile(
                            "device buffers can only be read by the device backend",
                        ));
                    }
                };
                let setup = Routine::compile_with(hoisted, arity, |lw| lw.compile_expr(&seq))?;
                (Splitter::Items(setup), seq_param(arity, elem.clone()))
            }
            QueryNode::Range { start, count } => {
                let args = Expr::tuple(vec![start.clone(), count.clone()]);
                let setup = Routine::compile_with(hoisted, arity, |lw| lw.compile_expr(&args))?;
                let leaf = QueryNode::Range {
                    start: Expr::param(arity, ElemType::Int),
                    count: Expr::param(arity + 1, ElemType::Int),
                };
                (Splitter::Range(setup), leaf)
            }
            QueryNode::Repeat { value, count, elem } => {
                let args = Expr::tuple(vec![value.clone(), count.clone()]);
                let setup = Routine::compile_with(hoisted, arity, |lw| lw.compile_expr(&args))?;
                let leaf = QueryNode::Repeat {
                    value: Expr::param(arity, elem.clone()),
                    count: Expr::param(arity + 1, ElemType::Int),
                    elem: elem.clone(),
                };
                (Splitter::Repeat(setup), leaf)
            }
            QueryNode::Generate {
                seed,
                condition,
                step,
                selector,
                elem,
            } => {
                let mut lambdas = None;
                let setup = Routine::compile_with(hoisted, arity, |lw| {
                    lambdas = Some((
                        lw.compile_lambda(condition)?,
                        lw.compile_lambda(step)?,
                        lw.compile_lambda(selector)?,
                    ));
                    lw.compile_expr(seed)
                })?;
                let Some((condition, step, selector)) = lambdas else {
                    return Err(Error::internal("generator lambdas were not compiled"));
                };
                let splitter = Splitter::Generate {
                    seed: setup,
                    condition,
                    step,
                    selector,
                };
                (splitter, seq_param(arity, elem.clone()))
            }
            _ => return Ok(None),
        }))
    }

    /// `[partial0, partial1, ..]` folded with `merge`, starting from the first
    fn fold_partials(query: &Query, arity: usize, merge: Lambda, ty: &ElemType) -> Result<Routine> {
        let partials = Expr::param(arity, ElemType::seq(ty.clone()));
        let root = QueryNode::Aggregate {
            input: Box::new(QueryNode::Skip {
                input: Box::new(seq_param(arity, ty.clone())),
                count: Expr::int(1),
            }),
            seed: partials.at(0),
            func: merge,
            combiner: None,
            ty: ty.clone(),
        };
        Routine::compile(
            &Query {
                root,
                hoisted: query.hoisted.clone(),
            },
            arity + 1,
        )
    }

    /// Sorted partition of `(key0, .., keyN, element)` rows
    fn keyed_rows(segment: QueryNode, elem: &ElemType, keys: &[SortKey]) -> Result<QueryNode> {
        let selector = Lambda::unary(elem.clone(), |x| {
            let mut fields: Vec<Expr> = keys.iter().map(|k| k.key.apply(&[x.clone()])).collect();
            fields.push(x);
            Expr::tuple(fields)
        });
        let row = selector.return_type()?;
        let sort_keys = keys
            .iter()
            .enumerate()
            .map(|(i, k)| SortKey {
                key: Lambda::unary(row.clone(), |t| t.field(i)),
                direction: k.direction,
            })
            .collect();
        Ok(QueryNode::ToList {
            input: Box::new(QueryNode::OrderBy {
                input: Box::new(QueryNode::Transform {
                    input: Box::new(segment),
                    selector,
                    elem: row,
                }),
                keys: sort_keys,
            }),
        })
    }

    /// Run with the given arguments
    pub fn run(&self, args: &[Value]) -> Result<Value> {
        if args.len() != self.arity {
            return Err(Error::invalid_argument(format!(
                "expected {} argument(s), got {}",
                self.arity,
                args.len()
            )));
        }
        let split = match &self.plan {
            Plan::Sequential(routine) => return routine.run(args),
            Plan::Split(split) => split,
        };

        let partials = match &split.splitter {
            Splitter::Generate {
                seed,
                condition,
                step,
                selector,
            } => self.run_generated(split, args, seed, condition, step, selector)?,
            indexable => {
                let parts = Self::partition_args(indexable, args, self.partitions)?;
                self.scatter(&split.lower, parts, split.combine.ordered())?
            }
        };

        let merged = self.merge(&split.combine, partials, args)?;
        match &split.upper {
            Some(upper) => {
                let mut upper_args = args.to_vec();
                upper_args.push(merged);
                upper.run(&upper_args)
            }
            None => Ok(merged),
        }
    }

    /// Argument lists of every partition of an indexable source
    fn partition_args(splitter: &Splitter, args: &[Value], parts: usize) -> Result<Vec<Vec<Value>>> {
        let with = |extra: Vec<Value>| {
            let mut a = args.to_vec();
            a.extend(extra);
            a
        };
        Ok(match splitter {
            Splitter::Items(setup) => {
                let items = ops::items(&setup.run(args)?)?;
                spans(items.len(), parts)
                    .into_iter()
                    .map(|(offset, n)| with(vec![Value::Seq(items[offset..offset + n].into())]))
                    .collect()
            }
            Splitter::Range(setup) => {
                let bounds = setup.run(args)?;
                let (start, count) = match bounds.as_tuple() {
                    Some([start, count]) => ops::range_bounds(start, count)?,
                    _ => return Err(Error::internal("range bounds are not a pair")),
                };
                spans(count, parts)
                    .into_iter()
                    .map(|(offset, n)| {
                        with(vec![
                            Value::Int(start.wrapping_add(offset as i32)),
                            Value::Int(n as i32),
                        ])
                    })
                    .collect()
            }
            Splitter::Repeat(setup) => {
                let pair = setup.run(args)?;
                let (value, count) = match pair.as_tuple() {
                    Some([value, count]) => (value.clone(), ops::repeat_count(count)?),
                    _ => return Err(Error::internal("repeat arguments are not a pair")),
                };
                spans(count, parts)
                    .into_iter()
                    .map(|(_, n)| with(vec![value.clone(), Value::Int(n as i32)]))
                    .collect()
            }
            Splitter::Generate { .. } => {
                return Err(Error::internal("generated sources are not split up front"));
            }
        })
    }

    /// Run `lower` once per argument list on the global rayon pool; partials
    /// come back in partition order unless unordered concatenation was
    /// requested
    fn scatter(&self, lower: &Routine, parts: Vec<Vec<Value>>, ordered: bool) -> Result<Vec<Value>> {
        let (tx, rx) = unbounded();
        rayon::in_place_scope(|s| {
            for (i, part) in parts.into_iter().enumerate() {
                let tx = tx.clone();
                s.spawn(move |_| {
                    let _ = tx.send((i, lower.run(&part)));
                });
            }
        });
        drop(tx);
        Self::gather(rx.into_iter(), ordered)
    }

    /// Join results: the first failure in completion order wins; partials
    /// are put back in partition order when `ordered`
    fn gather(
        results: impl Iterator<Item = (usize, Result<Value>)>,
        ordered: bool,
    ) -> Result<Vec<Value>> {
        let mut partials = Vec::new();
        for (i, result) in results {
            partials.push((i, result?));
        }
        if ordered {
            partials.sort_by_key(|(i, _)| *i);
        }
        Ok(partials.into_iter().map(|(_, v)| v).collect())
    }

    fn run_generated(
        &self,
        split: &Split,
        args: &[Value],
        seed: &Routine,
        condition: &CompiledLambda,
        step: &CompiledLambda,
        selector: &CompiledLambda,
    ) -> Result<Vec<Value>> {
        let (chunk_tx, chunk_rx) = bounded::<(usize, Vec<Value>)>(self.config.channel_capacity);
        let results = Mutex::new(Vec::new());
        let chunk_size = self.config.chunk_size;

        let produced = rayon::in_place_scope(|s| {
            for _ in 0..self.partitions {
                let chunk_rx = chunk_rx.clone();
                let results = &results;
                let lower = &split.lower;
                s.spawn(move |_| {
                    for (i, chunk) in chunk_rx.iter() {
                        let mut part = args.to_vec();
                        part.push(Value::seq(chunk));
                        let outcome = lower.run(&part);
                        results.lock().push((i, outcome));
                    }
                });
            }

            let produce = || -> Result<usize> {
                let mut frame = seed.prepare(args)?;
                let mut state = seed.run_in(&mut frame)?;
                let mut chunk = Vec::with_capacity(chunk_size);
                let mut sent = 0;
                while condition.test1(&mut frame, state.clone())? {
                    chunk.push(selector.call1(&mut frame, state.clone())?);
                    state = step.call1(&mut frame, state)?;
                    if chunk.len() == chunk_size {
                        let full = std::mem::replace(&mut chunk, Vec::with_capacity(chunk_size));
                        if chunk_tx.send((sent, full)).is_err() {
                            return Err(Error::internal("partition workers hung up"));
                        }
                        sent += 1;
                    }
                }
                if !chunk.is_empty() || sent == 0 {
                    if chunk_tx.send((sent, chunk)).is_err() {
                        return Err(Error::internal("partition workers hung up"));
                    }
                    sent += 1;
                }
                Ok(sent)
            };
            let produced = produce();
            drop(chunk_tx);
            produced
        });

        let chunks = produced?;
        debug!(chunks, chunk_size, "generated source consumed");
        Self::gather(results.into_inner().into_iter(), split.combine.ordered())
    }

    fn merge(&self, combine: &Combine, partials: Vec<Value>, args: &[Value]) -> Result<Value> {
        match combine {
            Combine::Sum(ty) => {
                let zero = ty
                    .zero()
                    .ok_or_else(|| Error::compile(format!("cannot sum elements of type {}", ty)))?;
                partials.iter().try_fold(zero, |acc, p| ops::add(&acc, p))
            }
            Combine::Count => {
                let mut total = 0i32;
                for p in &partials {
                    let n = p
                        .as_i32()
                        .ok_or_else(|| Error::internal("partial count is not an int"))?;
                    total = total.wrapping_add(n);
                }
                Ok(Value::Int(total))
            }
            Combine::Fold(routine) => {
                let mut fold_args = args.to_vec();
                fold_args.push(Value::seq(partials));
                routine.run(&fold_args)
            }
            Combine::Concat { .. } => {
                let mut out = Vec::new();
                for p in &partials {
                    out.extend(ops::items(p)?.iter().cloned());
                }
                Ok(Value::seq(out))
            }
            Combine::Groups => {
                let mut table: IndexMap<Value, Vec<Value>> = IndexMap::new();
                for p in &partials {
                    for g in ops::items(p)?.iter() {
                        let group = g
                            .as_group()
                            .ok_or_else(|| Error::internal("partial group table holds a non-group"))?;
                        table
                            .entry(group.key.clone())
                            .or_default()
                            .extend(group.items.iter().cloned());
                    }
                }
                Ok(Value::seq(
                    table.into_iter().map(|(k, items)| Value::group(k, items)).collect(),
                ))
            }
            Combine::Sorted(directions) => merge_sorted(&partials, directions),
            Combine::Effects => Ok(Value::Unit),
        }
    }
}

impl Splitter {
    fn extra_args(&self) -> usize {
        match self {
            Splitter::Items(_) | Splitter::Generate { .. } => 1,
            Splitter::Range(_) | Splitter::Repeat(_) => 2,
        }
    }
}

/// K-way merge of sorted `(keys.., element)` row lists; equal keys keep
/// partition order
fn merge_sorted(partials: &[Value], directions: &[Direction]) -> Result<Value> {
    let n = directions.len();
    let runs = partials.iter().map(ops::items).collect::<Result<Vec<_>>>()?;
    let mut heads = vec![0usize; runs.len()];
    let total = runs.iter().map(|r| r.len()).sum();
    let mut out = Vec::with_capacity(total);

    let row_of = |v: &Value| -> Result<Arc<[Value]>> {
        match v {
            Value::Tuple(fields) if fields.len() == n + 1 => Ok(fields.clone()),
            other => Err(Error::internal(format!("malformed sort row {}", other))),
        }
    };

    for _ in 0..total {
        let mut best: Option<(usize, Arc<[Value]>)> = None;
        for (p, run) in runs.iter().enumerate() {
            let Some(candidate) = run.get(heads[p]) else {
                continue;
            };
            let candidate = row_of(candidate)?;
            let better = match &best {
                None => true,
                Some((_, row)) => {
                    ops::compare_keys(&candidate[..n], &row[..n], directions) == Ordering::Less
                }
            };
            if better {
                best = Some((p, candidate));
            }
        }
        let Some((p, row)) = best else {
            break;
        };
        heads[p] += 1;
        out.push(row[n].clone());
    }
    Ok(Value::seq(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use crate::execution::sequential::Routine;

    fn config(partitions: usize) -> PartitionConfig {
        PartitionConfig {
            partitions: Some(partitions),
            chunk_size: 3,
            ..CompilerConfig::default().partition
        }
    }

    fn both(node: QueryNode, partitions: usize) -> (Value, Value, bool) {
        let query = Query::new(node);
        let par = PartitionedRoutine::compile(&query, 0, &config(partitions)).unwrap();
        let seq = Routine::compile(&query, 0).unwrap();
        (par.run(&[]).unwrap(), seq.run(&[]).unwrap(), par.is_parallel())
    }

    #[test]
    fn test_spans_are_contiguous() {
        assert_eq!(spans(10, 3), vec![(0, 4), (4, 3), (7, 3)]);
        assert_eq!(spans(2, 4), vec![(0, 1), (1, 1)]);
        assert_eq!(spans(0, 4), vec![(0, 0)]);
    }

    #[test]
    fn test_sum_over_range() {
        let node = QueryNode::range(1, 100)
            .unwrap()
            .select(|x| x * 2)
            .unwrap()
            .sum()
            .unwrap();
        let (par, seq, parallel) = both(node, 4);
        assert!(parallel);
        assert_eq!(par, Value::Int(10100));
        assert_eq!(par, seq);
    }

    #[test]
    fn test_list_keeps_source_order() {
        let node = QueryNode::range(0, 50)
            .unwrap()
            .filter(|x| (x % 3).equals(0))
            .unwrap()
            .to_list()
            .unwrap();
        let (par, seq, _) = both(node, 5);
        assert_eq!(par, seq);
    }

    #[test]
    fn test_order_by_merge_is_stable() {
        let node = QueryNode::from_ints(&[5, 3, 8, 3, 1, 8, 5, 2])
            .order_by(|x| x % 3)
            .unwrap()
            .select(|x| x * 10)
            .unwrap()
            .to_list()
            .unwrap();
        let (par, seq, parallel) = both(node, 3);
        assert!(parallel);
        assert_eq!(par, Value::from(vec![30, 30, 10, 50, 80, 80, 50, 20]));
        assert_eq!(par, seq);
    }

    #[test]
    fn test_group_merge_keeps_first_seen_order() {
        let node = QueryNode::from_ints(&[4, 1, 4, 2, 1, 3, 2])
            .select(|x| x + 0)
            .unwrap()
            .group_by(|x| x)
            .unwrap()
            .select(|g| g.field(0))
            .unwrap()
            .to_list()
            .unwrap();
        let (par, seq, parallel) = both(node, 3);
        assert!(parallel);
        assert_eq!(par, Value::from(vec![4, 1, 2, 3]));
        assert_eq!(par, seq);
    }

    #[test]
    fn test_take_falls_back() {
        let node = QueryNode::generate(0, |s| s.ge(0), |s| s + 1, |s| s)
            .unwrap()
            .take(5)
            .unwrap()
            .to_list()
            .unwrap();
        let (par, _, parallel) = both(node, 4);
        assert!(!parallel);
        assert_eq!(par, Value::from(vec![0, 1, 2, 3, 4]));
    }

    #[test]
    fn test_generated_chunks() {
        let node = QueryNode::generate(0, |s| s.lt(20), |s| s + 1, |s| s.clone() * s)
            .unwrap()
            .select(|x| x + 1)
            .unwrap()
            .to_list()
            .unwrap();
        let (par, seq, parallel) = both(node, 3);
        assert!(parallel);
        assert_eq!(par, seq);
    }

    #[test]
    fn test_aggregate_with_combiner() {
        let node = QueryNode::range(0, 10)
            .unwrap()
            .aggregate_with_combiner(Expr::long(0), |acc, x| acc + x.convert(ElemType::Long), |a, b| a + b)
            .unwrap();
        let (par, seq, parallel) = both(node, 4);
        assert!(parallel);
        assert_eq!(par, Value::Long(45));
        assert_eq!(par, seq);
    }

    #[test]
    fn test_aggregate_without_combiner_runs_sequentially() {
        for partitions in [1, 2, 4] {
            let node = QueryNode::range(1, 10)
                .unwrap()
                .aggregate(100, |acc, x| acc + x)
                .unwrap();
            let query = Query::new(node);
            let par = PartitionedRoutine::compile(&query, 0, &config(partitions)).unwrap();
            assert!(!par.is_parallel());
            assert_eq!(par.run(&[]).unwrap(), Value::Int(155));
        }
    }

    #[test]
    fn test_malformed_count_partial_is_an_error() {
        let node = QueryNode::range(0, 10).unwrap().count().unwrap();
        let par = PartitionedRoutine::compile(&Query::new(node), 0, &config(2)).unwrap();
        let partials = vec![Value::Int(3), Value::str("3")];
        let err = par.merge(&Combine::Count, partials, &[]).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_compiling_does_not_spawn_threads() {
        let threads = || std::fs::read_dir("/proc/self/task").map(|d| d.count()).unwrap_or(0);
        let before = threads();
        let node = QueryNode::range(0, 10)
            .unwrap()
            .take(3)
            .unwrap()
            .sum()
            .unwrap();
        let query = Query::new(node);
        let routines: Vec<_> = (0..50)
            .map(|_| PartitionedRoutine::compile(&query, 0, &config(8)).unwrap())
            .collect();
        assert!(routines.iter().all(|r| !r.is_parallel()));
        // other tests may start threads concurrently, never 8 per routine
        assert!(threads() < before + 50 * 8);
    }

    #[test]
    fn test_first_failure_is_reported() {
        let node = QueryNode::range(-5, 10)
            .unwrap()
            .select(|x| Expr::int(100) / x)
            .unwrap()
            .sum()
            .unwrap();
        let query = Query::new(node);
        let par = PartitionedRoutine::compile(&query, 0, &config(4)).unwrap();
        let err = par.run(&[]).unwrap_err();
        assert!(err.to_string().contains("division by zero"));
    }
}
