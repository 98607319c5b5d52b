//! Host emulation of device programs
//!
//! A [`DeviceProgram`] carries the generated OpenCL source together with its
//! [`LaunchPlan`] and executes the plan on the host, one work item at a time,
//! against scratch buffers allocated in its [`DeviceContext`]. Reductions
//! follow the same tree order as the generated kernels, so floating point
//! sums match what a device would produce for the same work-group size.

use crate::ast::expr::{BinaryOp, Expr};
use crate::ast::node::Query;
use crate::config::DeviceConfig;
use crate::device::codegen::CodeGenerator;
use crate::device::ir::{self, KernelExpr, KernelIr, KernelStmt, Terminal};
use crate::device::plan::{Binding, Kernel, LaunchPlan, PlanOutput, PlanStep, Scratch};
use crate::device::{DeviceBuffer, DeviceContext};
use crate::error::{Error, Result};
use crate::execution::sequential::Routine;
use crate::ops;
use crate::value::{ElemType, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// Compiled device program bound to a context
pub struct DeviceProgram {
    ir: KernelIr,
    plan: LaunchPlan,
    source: String,
    args: Routine,
    ctx: Arc<DeviceContext>,
}

/// Per-run state shared by every launch
struct Launch<'a> {
    ir: &'a KernelIr,
    ctx: &'a DeviceContext,
    inputs: Vec<Arc<[Value]>>,
    args: Vec<Value>,
    scratch: HashMap<Scratch, DeviceBuffer>,
    wg: usize,
    survivors: usize,
}

impl DeviceProgram {
    /// Lower, schedule and generate source for `query`
    pub fn compile(
        query: &Query,
        arity: usize,
        config: &DeviceConfig,
        ctx: Arc<DeviceContext>,
    ) -> Result<Self> {
        let wg = config.work_group_size;
        if wg == 0 || !wg.is_power_of_two() {
            return Err(Error::config(format!(
                "work group size must be a power of two, got {}",
                wg
            )));
        }

        let ir = ir::lower(query, arity, config)?;
        for buffer in &ir.buffers {
            if !ctx.owns(buffer) {
                return Err(Error::device(format!(
                    "buffer {} belongs to another context",
                    buffer.id()
                )));
            }
        }

        let plan = LaunchPlan::build(&ir, wg);
        let source = CodeGenerator::new().generate(&ir, &plan, config.enable_fp64);
        let exprs: Vec<Expr> = ir.args.iter().map(|(e, _)| e.clone()).collect();
        let args = Routine::compile_with(&query.hoisted, arity, |lowerer| {
            lowerer.compile_expr(&Expr::Tuple(exprs))
        })?;

        debug!(
            kernels = plan.kernels().len(),
            scratch = plan.scratch.len(),
            source_bytes = source.len(),
            "compiled device program"
        );
        Ok(Self {
            ir,
            plan,
            source,
            args,
            ctx,
        })
    }

    /// Generated OpenCL C source
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Host schedule
    pub fn plan(&self) -> &LaunchPlan {
        &self.plan
    }

    /// Kernel body the program was generated from
    pub fn ir(&self) -> &KernelIr {
        &self.ir
    }

    /// Context the program runs in
    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// Type of the value `run` returns
    pub fn result_type(&self) -> ElemType {
        match self.ir.terminal {
            Terminal::Array => ElemType::seq(self.ir.elem.clone()),
            Terminal::Sum => self.ir.elem.clone(),
            Terminal::Count => ElemType::Int,
        }
    }

    /// Execute the plan; scratch buffers are released before returning
    pub fn run(&self, params: &[Value]) -> Result<Value> {
        let start = Instant::now();
        let args = self.args.run(params)?;
        let args = args
            .as_tuple()
            .map(<[Value]>::to_vec)
            .ok_or_else(|| Error::internal("kernel arguments did not evaluate to a tuple"))?;

        let inputs = self
            .ir
            .buffers
            .iter()
            .map(|b| self.ctx.load(b))
            .collect::<Result<Vec<_>>>()?;

        if self.plan.n == 0 {
            return self.empty();
        }

        let mut scratch = HashMap::new();
        for spec in &self.plan.scratch {
            let elem = self.scratch_type(spec.role);
            scratch.insert(spec.role, self.ctx.alloc_scratch(elem, spec.len));
        }

        let mut launch = Launch {
            ir: &self.ir,
            ctx: &self.ctx,
            inputs,
            args,
            scratch,
            wg: self.plan.work_group_size,
            survivors: 0,
        };
        let result = launch.execute(&self.plan);
        for buffer in launch.scratch.values() {
            self.ctx.release_scratch(buffer);
        }

        debug!(
            n = self.plan.n,
            groups = self.plan.groups,
            elapsed_us = start.elapsed().as_micros() as u64,
            "device program finished"
        );
        result
    }

    fn empty(&self) -> Result<Value> {
        match self.ir.terminal {
            Terminal::Array => Ok(Value::seq(Vec::new())),
            Terminal::Count => Ok(Value::Int(0)),
            Terminal::Sum => self
                .ir
                .elem
                .zero()
                .ok_or_else(|| Error::internal(format!("no zero for {}", self.ir.elem))),
        }
    }

    fn scratch_type(&self, role: Scratch) -> ElemType {
        match role {
            Scratch::Values | Scratch::Compacted => self.ir.elem.clone(),
            Scratch::Partials | Scratch::Result => self.ir.reduce_type(),
            Scratch::Marks | Scratch::TileSums | Scratch::TilePrefix | Scratch::Positions => {
                ElemType::Int
            }
        }
    }
}

impl std::fmt::Debug for DeviceProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceProgram")
            .field("n", &self.plan.n)
            .field("kernels", &self.plan.kernels())
            .field("terminal", &self.ir.terminal)
            .finish()
    }
}

/// Halving tree sum over one work group's lanes
fn tree_sum(mut lanes: Vec<Value>) -> Result<Value> {
    let mut stride = lanes.len() / 2;
    while stride > 0 {
        for lid in 0..stride {
            lanes[lid] = ops::add(&lanes[lid], &lanes[lid + stride])?;
        }
        stride /= 2;
    }
    lanes
        .into_iter()
        .next()
        .ok_or_else(|| Error::internal("empty work group"))
}

fn mark(value: &Value) -> Result<bool> {
    value
        .as_i32()
        .map(|m| m != 0)
        .ok_or_else(|| Error::internal(format!("mark of kind {}", value.kind())))
}

fn position(value: &Value) -> Result<usize> {
    value
        .as_i32()
        .and_then(|p| usize::try_from(p).ok())
        .ok_or_else(|| Error::internal(format!("bad survivor position {}", value)))
}

impl Launch<'_> {
    fn execute(&mut self, plan: &LaunchPlan) -> Result<Value> {
        for step in &plan.steps {
            match step {
                PlanStep::Launch {
                    kernel,
                    global,
                    local,
                    bindings,
                } => {
                    trace!(kernel = kernel.entry(), global, local, "launch");
                    self.ctx.record_launch();
                    match kernel {
                        Kernel::Map => self.map(bindings)?,
                        Kernel::TileCount => self.tile_count()?,
                        Kernel::TileScan => self.tile_scan()?,
                        Kernel::Compact => self.compact()?,
                        Kernel::Reduce => self.reduce(bindings)?,
                        Kernel::ReduceFinal => self.reduce_final()?,
                    }
                }
                PlanStep::HostScan { input, output } => self.host_scan(*input, *output)?,
            }
        }

        match plan.output {
            PlanOutput::Array { buffer } => Ok(Value::seq(self.load(buffer)?.to_vec())),
            PlanOutput::Compacted { buffer } => {
                let data = self.load(buffer)?;
                Ok(Value::seq(data[..self.survivors].to_vec()))
            }
            PlanOutput::Scalar { buffer } => self
                .load(buffer)?
                .first()
                .cloned()
                .ok_or_else(|| Error::internal("empty result buffer")),
        }
    }

    fn buffer(&self, role: Scratch) -> Result<&DeviceBuffer> {
        self.scratch
            .get(&role)
            .ok_or_else(|| Error::internal(format!("scratch buffer {:?} was not allocated", role)))
    }

    fn load(&self, role: Scratch) -> Result<Arc<[Value]>> {
        self.ctx.load(self.buffer(role)?)
    }

    fn store(&self, role: Scratch, data: Vec<Value>) -> Result<()> {
        self.ctx.store(self.buffer(role)?, data)
    }

    fn n(&self) -> usize {
        self.ir.n
    }

    fn zero(&self, ty: &ElemType) -> Result<Value> {
        ty.zero()
            .ok_or_else(|| Error::internal(format!("no zero for {}", ty)))
    }

    fn map(&self, bindings: &[Binding]) -> Result<()> {
        let writes_values = bindings.contains(&Binding::Scratch(Scratch::Values));
        let writes_marks = bindings.contains(&Binding::Scratch(Scratch::Marks));
        let n = self.n();
        let mut values = vec![self.zero(&self.ir.elem)?; if writes_values { n } else { 0 }];
        let mut marks = vec![Value::Int(0); if writes_marks { n } else { 0 }];

        for gid in 0..n {
            let mut item = WorkItem {
                launch: self,
                gid,
                locals: vec![Value::Int(0); self.ir.locals.len()],
            };
            if !item.body()? {
                continue;
            }
            if writes_values {
                values[gid] = item.eval(&self.ir.result)?;
            }
            if writes_marks {
                marks[gid] = Value::Int(1);
            }
        }

        if writes_values {
            self.store(Scratch::Values, values)?;
        }
        if writes_marks {
            self.store(Scratch::Marks, marks)?;
        }
        Ok(())
    }

    /// One tree sum per work group of `lane(gid)`, zero past `n`
    fn per_group(&self, zero: &Value, lane: impl Fn(usize) -> Result<Value>) -> Result<Vec<Value>> {
        let n = self.n();
        (0..n.div_ceil(self.wg))
            .map(|group| {
                let lanes = (0..self.wg)
                    .map(|lid| {
                        let gid = group * self.wg + lid;
                        if gid < n { lane(gid) } else { Ok(zero.clone()) }
                    })
                    .collect::<Result<Vec<_>>>()?;
                tree_sum(lanes)
            })
            .collect()
    }

    fn tile_count(&self) -> Result<()> {
        let marks = self.load(Scratch::Marks)?;
        let sums = self.per_group(&Value::Int(0), |gid| Ok(marks[gid].clone()))?;
        self.store(Scratch::TileSums, sums)
    }

    fn host_scan(&mut self, input: Scratch, output: Scratch) -> Result<()> {
        let sums = self.load(input)?;
        let mut prefix = Vec::with_capacity(sums.len());
        let mut running = 0i32;
        for sum in sums.iter() {
            prefix.push(Value::Int(running));
            let sum = sum
                .as_i32()
                .ok_or_else(|| Error::internal(format!("tile sum of kind {}", sum.kind())))?;
            running += sum;
        }
        self.survivors = usize::try_from(running)
            .map_err(|_| Error::internal(format!("negative survivor count {}", running)))?;
        self.store(output, prefix)
    }

    fn tile_scan(&self) -> Result<()> {
        let marks = self.load(Scratch::Marks)?;
        let prefix = self.load(Scratch::TilePrefix)?;
        let mut positions = vec![Value::Int(0); self.n()];
        for (group, base) in prefix.iter().enumerate() {
            let mut offset = base
                .as_i32()
                .ok_or_else(|| Error::internal("tile prefix is not an int"))?;
            let end = ((group + 1) * self.wg).min(self.n());
            for gid in group * self.wg..end {
                positions[gid] = Value::Int(offset);
                if mark(&marks[gid])? {
                    offset += 1;
                }
            }
        }
        self.store(Scratch::Positions, positions)
    }

    fn compact(&self) -> Result<()> {
        let values = self.load(Scratch::Values)?;
        let marks = self.load(Scratch::Marks)?;
        let positions = self.load(Scratch::Positions)?;
        let mut compacted = vec![self.zero(&self.ir.elem)?; self.n()];
        for gid in 0..self.n() {
            if mark(&marks[gid])? {
                compacted[position(&positions[gid])?] = values[gid].clone();
            }
        }
        self.store(Scratch::Compacted, compacted)
    }

    fn reduce(&self, bindings: &[Binding]) -> Result<()> {
        let ty = self.ir.reduce_type();
        let zero = self.zero(&ty)?;
        let values = if bindings.contains(&Binding::Scratch(Scratch::Values)) {
            Some(self.load(Scratch::Values)?)
        } else {
            None
        };
        let marks = if bindings.contains(&Binding::Scratch(Scratch::Marks)) {
            Some(self.load(Scratch::Marks)?)
        } else {
            None
        };

        let partials = self.per_group(&zero, |gid| match (&values, &marks) {
            (Some(values), Some(marks)) if mark(&marks[gid])? => Ok(values[gid].clone()),
            (Some(_), Some(_)) => Ok(zero.clone()),
            (Some(values), None) => Ok(values[gid].clone()),
            (None, Some(marks)) => Ok(marks[gid].clone()),
            (None, None) => Err(Error::internal("reduce kernel without inputs")),
        })?;
        self.store(Scratch::Partials, partials)
    }

    fn reduce_final(&self) -> Result<()> {
        let zero = self.zero(&self.ir.reduce_type())?;
        let partials = self.load(Scratch::Partials)?;
        let lanes = (0..self.wg)
            .map(|lid| {
                partials
                    .iter()
                    .skip(lid)
                    .step_by(self.wg)
                    .try_fold(zero.clone(), |acc, p| ops::add(&acc, p))
            })
            .collect::<Result<Vec<_>>>()?;
        self.store(Scratch::Result, vec![tree_sum(lanes)?])
    }
}

/// Evaluation state of one work item in the map kernel
struct WorkItem<'a, 'l> {
    launch: &'a Launch<'l>,
    gid: usize,
    locals: Vec<Value>,
}

impl WorkItem<'_, '_> {
    /// Run the statements; false when a guard drops the element
    fn body(&mut self) -> Result<bool> {
        for stmt in &self.launch.ir.body {
            match stmt {
                KernelStmt::Let(local, value) => {
                    let v = self.eval(value)?;
                    self.locals[*local] = v;
                }
                KernelStmt::Guard(cond) => {
                    if !ops::truthy(&self.eval(cond)?)? {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    fn eval(&self, expr: &KernelExpr) -> Result<Value> {
        match expr {
            KernelExpr::Lit(value, _) => Ok(value.clone()),
            KernelExpr::Local(i) => self
                .locals
                .get(*i)
                .cloned()
                .ok_or_else(|| Error::internal(format!("kernel local {} out of range", i))),
            KernelExpr::Arg(i) => self
                .launch
                .args
                .get(*i)
                .cloned()
                .ok_or_else(|| Error::internal(format!("kernel argument {} out of range", i))),
            KernelExpr::Gid => Ok(Value::Int(self.gid as i32)),
            KernelExpr::Read { buffer, index } => {
                let data = self
                    .launch
                    .inputs
                    .get(*buffer)
                    .ok_or_else(|| Error::internal(format!("input buffer {} is not bound", buffer)))?;
                let at = self.eval(index)?;
                at.as_i64()
                    .and_then(|i| usize::try_from(i).ok())
                    .and_then(|i| data.get(i))
                    .cloned()
                    .ok_or_else(|| {
                        Error::runtime(format!(
                            "device read at {} outside a buffer of {} elements",
                            at,
                            data.len()
                        ))
                    })
            }
            KernelExpr::Unary(op, a) => ops::unary(*op, &self.eval(a)?),
            KernelExpr::Binary(BinaryOp::And, a, b) => {
                if ops::truthy(&self.eval(a)?)? {
                    self.eval(b)
                } else {
                    Ok(Value::Bool(false))
                }
            }
            KernelExpr::Binary(BinaryOp::Or, a, b) => {
                if ops::truthy(&self.eval(a)?)? {
                    Ok(Value::Bool(true))
                } else {
                    self.eval(b)
                }
            }
            KernelExpr::Binary(op, a, b) => ops::binary(*op, &self.eval(a)?, &self.eval(b)?),
            KernelExpr::Cond(c, t, e) => {
                if ops::truthy(&self.eval(c)?)? {
                    self.eval(t)
                } else {
                    self.eval(e)
                }
            }
            KernelExpr::Math(func, args) => {
                let args = args.iter().map(|a| self.eval(a)).collect::<Result<Vec<_>>>()?;
                ops::math(*func, &args)
            }
            KernelExpr::Convert(a, to) => ops::convert(&self.eval(a)?, to),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::node::QueryNode;

    fn program(ctx: &Arc<DeviceContext>, node: QueryNode, wg: usize) -> DeviceProgram {
        let config = DeviceConfig {
            work_group_size: wg,
            ..DeviceConfig::default()
        };
        DeviceProgram::compile(&Query::new(node), 0, &config, ctx.clone()).unwrap()
    }

    #[test]
    fn test_filter_compacts_in_order() {
        let ctx = Arc::new(DeviceContext::new());
        let data: Vec<i32> = (1..=10).collect();
        let buf = ctx.create_ints(&data).unwrap();
        let node = QueryNode::from_buffer(&buf)
            .filter(|x| (x % 3).not_equals(0))
            .unwrap()
            .select(|x| x * 10)
            .unwrap()
            .to_array()
            .unwrap();
        let result = program(&ctx, node, 4).run(&[]).unwrap();
        assert_eq!(result, Value::from(vec![10, 20, 40, 50, 70, 80, 100]));
        assert_eq!(ctx.live_scratch(), 0);
        assert_eq!(ctx.stats().kernels_launched, 4);
    }

    #[test]
    fn test_sum_and_count() {
        let ctx = Arc::new(DeviceContext::new());
        let data: Vec<i64> = (1..=100).collect();
        let buf = ctx.create_longs(&data).unwrap();
        let sum = program(&ctx, QueryNode::from_buffer(&buf).sum().unwrap(), 8);
        assert_eq!(sum.run(&[]).unwrap(), Value::Long(5050));

        let count = QueryNode::from_buffer(&buf)
            .filter(|x| x.gt(90i64))
            .unwrap()
            .count()
            .unwrap();
        assert_eq!(program(&ctx, count, 8).run(&[]).unwrap(), Value::Int(10));
        assert_eq!(ctx.live_scratch(), 0);
    }

    #[test]
    fn test_empty_buffer() {
        let ctx = Arc::new(DeviceContext::new());
        let buf = ctx.create_floats(&[]).unwrap();
        let sum = program(&ctx, QueryNode::from_buffer(&buf).sum().unwrap(), 4);
        assert_eq!(sum.run(&[]).unwrap(), Value::float(0.0));
        assert_eq!(ctx.stats().kernels_launched, 0);
    }

    #[test]
    fn test_division_by_zero_releases_scratch() {
        let ctx = Arc::new(DeviceContext::new());
        let buf = ctx.create_ints(&[1, 0, 2]).unwrap();
        let node = QueryNode::from_buffer(&buf)
            .select(|x| Expr::int(10) / x)
            .unwrap()
            .to_array()
            .unwrap();
        let err = program(&ctx, node, 4).run(&[]).unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
        assert_eq!(ctx.live_scratch(), 0);
    }

    #[test]
    fn test_foreign_buffer_rejected() {
        let ctx = Arc::new(DeviceContext::new());
        let other = DeviceContext::new();
        let buf = other.create_ints(&[1]).unwrap();
        let node = QueryNode::from_buffer(&buf).to_array().unwrap();
        let err = DeviceProgram::compile(&Query::new(node), 0, &DeviceConfig::default(), ctx)
            .unwrap_err();
        assert!(matches!(err, Error::Device(_)));
    }

    #[test]
    fn test_destroyed_buffer_fails_at_run() {
        let ctx = Arc::new(DeviceContext::new());
        let buf = ctx.create_ints(&[1, 2]).unwrap();
        let prog = program(&ctx, QueryNode::from_buffer(&buf).sum().unwrap(), 4);
        ctx.destroy_buffer(&buf).unwrap();
        assert!(matches!(prog.run(&[]), Err(Error::Device(_))));
    }

    #[test]
    fn test_tree_sum_order() {
        let lanes = vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)];
        assert_eq!(tree_sum(lanes).unwrap(), Value::Int(10));
    }
}
