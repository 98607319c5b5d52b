//! Compiled queries and the compiler front door
//!
//! [`QueryCompiler`] runs the optimizer and hands the result to the selected
//! [`Backend`]. The product is a [`CompiledQuery`]: a callable that checks
//! its positional arguments and counts its executions.

use crate::ast::expr::Expr;
use crate::ast::node::{Query, QueryNode};
use crate::config::CompilerConfig;
use crate::device::{DeviceContext, DeviceProgram, LaunchPlan};
use crate::error::{Error, Result};
use crate::execution::partitioned::PartitionedRoutine;
use crate::execution::sequential::Routine;
use crate::optimizer::{OptimizationStats, Pass, QueryOptimizer};
use crate::value::{ElemType, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Execution backend
#[derive(Debug, Clone, Default)]
pub enum Backend {
    /// One closure-compiled loop on the calling thread
    #[default]
    Sequential,
    /// Fork/join over partitions of the source
    Partitioned,
    /// Generated kernels run against buffers of the given context
    Device(Arc<DeviceContext>),
}

impl Backend {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Sequential => "sequential",
            Backend::Partitioned => "partitioned",
            Backend::Device(_) => "device",
        }
    }
}

enum Executor {
    Sequential(Routine),
    Partitioned(PartitionedRoutine),
    Device(DeviceProgram),
}

/// A query lowered by one backend, ready to be invoked any number of times
pub struct CompiledQuery {
    executor: Executor,
    param_types: Vec<ElemType>,
    result_type: ElemType,
    query: Query,
    fired: Vec<Pass>,
    stats: OptimizationStats,
    compilation_time: Duration,
    execution_count: AtomicUsize,
}

impl CompiledQuery {
    /// Run a query compiled without parameters
    pub fn run(&self) -> Result<Value> {
        self.invoke(&[])
    }

    /// Run with positional arguments matching [`CompiledQuery::param_types`]
    pub fn invoke(&self, args: &[Value]) -> Result<Value> {
        if args.len() != self.param_types.len() {
            return Err(Error::invalid_argument(format!(
                "expected {} argument(s), got {}",
                self.param_types.len(),
                args.len()
            )));
        }
        for (i, (arg, ty)) in args.iter().zip(&self.param_types).enumerate() {
            if !arg.conforms(ty) {
                return Err(Error::invalid_argument(format!(
                    "argument {} should be {}, got {}",
                    i,
                    ty,
                    arg.kind()
                )));
            }
        }

        self.execution_count.fetch_add(1, Ordering::SeqCst);
        match &self.executor {
            Executor::Sequential(routine) => routine.run(args),
            Executor::Partitioned(routine) => routine.run(args),
            Executor::Device(program) => program.run(args),
        }
    }

    /// Declared parameter types
    pub fn param_types(&self) -> &[ElemType] {
        &self.param_types
    }

    /// Type of the value every invocation returns
    pub fn result_type(&self) -> &ElemType {
        &self.result_type
    }

    /// Name of the backend the query was lowered by
    pub fn backend(&self) -> &'static str {
        match self.executor {
            Executor::Sequential(_) => "sequential",
            Executor::Partitioned(_) => "partitioned",
            Executor::Device(_) => "device",
        }
    }

    /// Whether a partitioned query actually splits its source
    pub fn is_parallel(&self) -> bool {
        matches!(&self.executor, Executor::Partitioned(r) if r.is_parallel())
    }

    /// Optimized tree the backend lowered
    pub fn optimized(&self) -> &Query {
        &self.query
    }

    /// Optimizer passes that changed the tree
    pub fn fired_passes(&self) -> &[Pass] {
        &self.fired
    }

    /// Optimizer counters
    pub fn optimization_stats(&self) -> &OptimizationStats {
        &self.stats
    }

    /// Generated OpenCL C for device queries
    pub fn device_source(&self) -> Option<&str> {
        match &self.executor {
            Executor::Device(program) => Some(program.source()),
            _ => None,
        }
    }

    /// Launch plan for device queries
    pub fn launch_plan(&self) -> Option<&LaunchPlan> {
        match &self.executor {
            Executor::Device(program) => Some(program.plan()),
            _ => None,
        }
    }

    /// Time spent optimizing and lowering
    pub fn compilation_time(&self) -> Duration {
        self.compilation_time
    }

    /// Number of invocations that passed argument checks
    pub fn execution_count(&self) -> usize {
        self.execution_count.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for CompiledQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledQuery")
            .field("backend", &self.backend())
            .field("param_types", &self.param_types)
            .field("result_type", &self.result_type)
            .field("compilation_time", &self.compilation_time)
            .field("execution_count", &self.execution_count())
            .finish()
    }
}

/// Optimizer plus backend selection
#[derive(Debug, Clone, Default)]
pub struct QueryCompiler {
    config: CompilerConfig,
}

impl QueryCompiler {
    /// Compiler with a validated configuration
    pub fn new(config: CompilerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Active configuration
    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Compile a parameterless query
    pub fn compile(&self, node: QueryNode, backend: Backend) -> Result<CompiledQuery> {
        self.lower(node, Vec::new(), backend)
    }

    /// Compile a query over positional parameters
    ///
    /// `build` receives one [`Expr::Param`] placeholder per entry of
    /// `param_types` and returns the query tree; sequence-typed parameters
    /// become sources through [`QueryNode::from_expr`].
    pub fn compile_template(
        &self,
        param_types: &[ElemType],
        build: impl FnOnce(&[Expr]) -> Result<QueryNode>,
        backend: Backend,
    ) -> Result<CompiledQuery> {
        let params: Vec<Expr> = param_types
            .iter()
            .enumerate()
            .map(|(i, ty)| Expr::param(i, ty.clone()))
            .collect();
        let node = build(&params)?;
        self.lower(node, param_types.to_vec(), backend)
    }

    fn lower(
        &self,
        node: QueryNode,
        param_types: Vec<ElemType>,
        backend: Backend,
    ) -> Result<CompiledQuery> {
        let start = Instant::now();
        let arity = param_types.len();

        let optimized = QueryOptimizer::new(self.config.optimizer.clone()).optimize(Query::new(node))?;
        let query = optimized.query;
        let result_type = query.result_type();
        debug!(backend = backend.name(), fired = ?optimized.fired, "lowering optimized query");

        let executor = match &backend {
            Backend::Sequential => Executor::Sequential(Routine::compile(&query, arity)?),
            Backend::Partitioned => Executor::Partitioned(PartitionedRoutine::compile(
                &query,
                arity,
                &self.config.partition,
            )?),
            Backend::Device(ctx) => Executor::Device(DeviceProgram::compile(
                &query,
                arity,
                &self.config.device,
                ctx.clone(),
            )?),
        };

        let compilation_time = start.elapsed();
        info!(
            backend = backend.name(),
            params = arity,
            nodes = query.root.node_count(),
            elapsed_us = compilation_time.as_micros() as u64,
            "compiled query"
        );

        Ok(CompiledQuery {
            executor,
            param_types,
            result_type,
            query,
            fired: optimized.fired,
            stats: optimized.stats,
            compilation_time,
            execution_count: AtomicUsize::new(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_and_count_executions() {
        let compiler = QueryCompiler::default();
        let query = compiler
            .compile(
                QueryNode::range(1, 4)
                    .unwrap()
                    .select(|x| x.clone() * x)
                    .unwrap()
                    .sum()
                    .unwrap(),
                Backend::Sequential,
            )
            .unwrap();
        assert_eq!(query.run().unwrap(), Value::Int(30));
        assert_eq!(query.run().unwrap(), Value::Int(30));
        assert_eq!(query.execution_count(), 2);
        assert_eq!(query.result_type(), &ElemType::Int);
        assert_eq!(query.backend(), "sequential");
    }

    #[test]
    fn test_template_argument_checks() {
        let compiler = QueryCompiler::default();
        let query = compiler
            .compile_template(
                &[ElemType::Int],
                |p| QueryNode::range(0, p[0].clone())?.count(),
                Backend::Sequential,
            )
            .unwrap();
        assert_eq!(query.invoke(&[Value::Int(7)]).unwrap(), Value::Int(7));
        assert!(query.invoke(&[]).unwrap_err().is_invalid_argument());
        assert!(query.invoke(&[Value::Long(7)]).unwrap_err().is_invalid_argument());
        assert_eq!(query.execution_count(), 1);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = CompilerConfig::default();
        config.device.work_group_size = 48;
        assert!(matches!(QueryCompiler::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn test_device_source_exposed() {
        let ctx = Arc::new(DeviceContext::new());
        let buf = ctx.create_ints(&[1, 2, 3]).unwrap();
        let query = QueryCompiler::default()
            .compile(QueryNode::from_buffer(&buf).sum().unwrap(), Backend::Device(ctx))
            .unwrap();
        assert_eq!(query.run().unwrap(), Value::Int(6));
        assert!(query.device_source().unwrap().contains("pf_reduce_final"));
        assert_eq!(query.launch_plan().unwrap().n, 3);
    }
}
