//! Query optimizer
//!
//! Applies `flatten → lift → fuse → detuple` until the tree stops changing
//! or the configured pass limit is reached. Every pass preserves results;
//! running the optimizer on its own output changes nothing.

pub mod detuple;
pub mod flatten;
pub mod fusion;
pub mod lift;

use crate::ast::node::Query;
use crate::config::OptimizerConfig;
use crate::error::Result;
use serde::Serialize;
use std::time::Instant;
use tracing::debug;

pub use detuple::Detupler;
pub use flatten::Flattener;
pub use fusion::Fuser;
pub use lift::Lifter;

/// Optimizer passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Pass {
    /// Nested-pipeline flattening
    Flatten,
    /// Constant folding and invariant hoisting
    Lift,
    /// Operator fusion
    Fuse,
    /// Tuple decomposition
    Detuple,
}

/// Optimization statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OptimizationStats {
    /// Rounds of the pass pipeline executed
    pub passes: u32,
    /// Element-wise nodes absorbed into fused nodes
    pub fused_nodes: usize,
    /// Tuple maps decomposed into locals
    pub detupled_maps: usize,
    /// Query-valued sources spliced into the tree
    pub flattened_sources: usize,
    /// Invariant subexpressions hoisted
    pub hoisted: usize,
    /// Subexpressions folded to literals
    pub folded: usize,
    /// Time spent optimizing (microseconds)
    pub optimization_time_us: u64,
}

/// Optimized query plus what happened to it
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    /// Optimized query
    pub query: Query,
    /// Passes that changed the tree at least once, in first-fired order
    pub fired: Vec<Pass>,
    /// Counters
    pub stats: OptimizationStats,
}

impl OptimizationResult {
    /// Whether `pass` changed the tree
    pub fn fired(&self, pass: Pass) -> bool {
        self.fired.contains(&pass)
    }
}

/// Rewrites query trees into their optimized form
#[derive(Debug, Clone, Default)]
pub struct QueryOptimizer {
    config: OptimizerConfig,
}

impl QueryOptimizer {
    /// Create an optimizer with the given pass toggles
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Optimize `query`; an ill-typed input is rejected before any rewrite
    pub fn optimize(&self, query: Query) -> Result<OptimizationResult> {
        let start = Instant::now();
        query.check()?;

        let mut stats = OptimizationStats::default();
        let mut fired = Vec::new();
        let mut current = query;

        for round in 0..self.config.max_passes {
            let before = current.clone();

            if self.config.flatten {
                let mut pass = Flattener::default();
                let next = pass.run(&current);
                stats.flattened_sources += pass.flattened;
                current = self.record(Pass::Flatten, current, next, &mut fired);
            }
            if self.config.lift {
                let (next, folded, lifted) = Lifter::new(&current).run(&current);
                stats.folded += folded;
                stats.hoisted += lifted;
                current = self.record(Pass::Lift, current, next, &mut fired);
            }
            if self.config.fuse {
                let mut pass = Fuser::default();
                let next = pass.run(&current);
                stats.fused_nodes += pass.fused;
                current = self.record(Pass::Fuse, current, next, &mut fired);
            }
            if self.config.detuple {
                let mut pass = Detupler::default();
                let next = pass.run(&current);
                stats.detupled_maps += pass.detupled;
                current = self.record(Pass::Detuple, current, next, &mut fired);
            }

            stats.passes = round as u32 + 1;
            if current == before {
                break;
            }
        }

        stats.optimization_time_us = start.elapsed().as_micros() as u64;
        debug!(
            passes = stats.passes,
            fused = stats.fused_nodes,
            detupled = stats.detupled_maps,
            flattened = stats.flattened_sources,
            hoisted = stats.hoisted,
            folded = stats.folded,
            nodes = current.root.node_count(),
            "optimized query"
        );

        Ok(OptimizationResult {
            query: current,
            fired,
            stats,
        })
    }

    fn record(&self, pass: Pass, before: Query, after: Query, fired: &mut Vec<Pass>) -> Query {
        if after == before {
            return before;
        }
        if cfg!(debug_assertions) {
            if let Err(e) = after.check() {
                panic!("{:?} pass produced an ill-typed tree: {}", pass, e);
            }
        }
        debug!(?pass, "optimizer pass rewrote the tree");
        if !fired.contains(&pass) {
            fired.push(pass);
        }
        after
    }
}
