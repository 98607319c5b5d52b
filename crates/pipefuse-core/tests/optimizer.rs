/// Optimizer behaviour observed through compiled queries
use parking_lot::Mutex;
use pipefuse_core::ast::HostFn;
use pipefuse_core::optimizer::Pass;
use pipefuse_core::reference::evaluate;
use pipefuse_core::{
    Backend, CompilerConfig, ElemType, Error, Expr, Query, QueryCompiler, QueryNode,
    QueryOptimizer, Value,
};
use std::sync::Arc;

/// Identity host function that records `tag:value` for every call
fn tracer(log: Arc<Mutex<Vec<String>>>, tag: &'static str) -> HostFn {
    HostFn::new(tag, vec![ElemType::Int], ElemType::Int, move |args| {
        log.lock().push(format!("{}:{}", tag, args[0]));
        Ok(args[0].clone())
    })
}

fn traced_pipeline(log: &Arc<Mutex<Vec<String>>>) -> Result<QueryNode, Error> {
    let map = tracer(log.clone(), "map");
    let keep = tracer(log.clone(), "keep");
    let each = tracer(log.clone(), "each");
    QueryNode::from_ints(&[1, 2, 3, 4])
        .select(|x| map.apply(vec![x * 3]))?
        .filter(|x| (keep.apply(vec![x]) % 2).equals(0))?
        .select(|x| x + 1)?
        .for_each(|x| each.apply(vec![x]))
}

#[test]
fn test_fusion_keeps_call_order() -> Result<(), Error> {
    let reference_log = Arc::new(Mutex::new(Vec::new()));
    evaluate(&traced_pipeline(&reference_log)?, &[])?;
    let expected = reference_log.lock().clone();
    assert_eq!(expected[..3], ["map:3", "keep:3", "map:6"]);

    for config in [CompilerConfig::default(), CompilerConfig::unoptimized()] {
        let log = Arc::new(Mutex::new(Vec::new()));
        let compiled =
            QueryCompiler::new(config)?.compile(traced_pipeline(&log)?, Backend::Sequential)?;
        assert_eq!(compiled.run()?, Value::Unit);
        assert_eq!(*log.lock(), expected);
    }
    Ok(())
}

#[test]
fn test_fused_chain_reported() -> Result<(), Error> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let compiled = QueryCompiler::default().compile(traced_pipeline(&log)?, Backend::Sequential)?;
    assert!(compiled.fired_passes().contains(&Pass::Fuse));
    assert_eq!(compiled.optimization_stats().fused_nodes, 3);
    assert!(matches!(
        compiled.optimized().root,
        QueryNode::ForEach { ref input, .. } if matches!(**input, QueryNode::Fused { .. })
    ));
    Ok(())
}

#[test]
fn test_optimize_twice_is_identity() -> Result<(), Error> {
    let pipelines = vec![
        QueryNode::from_ints(&[1, 2, 3])
            .select_many(|x| QueryNode::range(0, x)?.select(|y| y * 2)?.to_list())?
            .filter(|y| y.gt(0))?
            .to_list()?,
        QueryNode::range(0, Expr::captured("n", 10) * 2)?
            .select(|x| Expr::tuple(vec![x.clone(), x.clone() * x]))?
            .filter(|t| t.field(1).gt(20))?
            .select(|t| t.field(0))?
            .sum()?,
        QueryNode::from_strs(&["b", "a"])
            .order_by(|s| s)?
            .take(1)?
            .to_array()?,
    ];
    let optimizer = QueryOptimizer::default();
    for node in pipelines {
        let once = optimizer.optimize(Query::new(node.clone()))?;
        let twice = optimizer.optimize(once.query.clone())?;
        assert_eq!(twice.query, once.query);
        assert!(twice.fired.is_empty());
        assert_eq!(
            QueryCompiler::default().compile(node.clone(), Backend::Sequential)?.run()?,
            evaluate(&node, &[])?
        );
    }
    Ok(())
}

#[test]
fn test_detupled_pipeline_matches_reference() -> Result<(), Error> {
    let node = QueryNode::range(1, 6)?
        .select(|x| Expr::tuple(vec![x.clone() * 2, x.clone() * x]))?
        .filter(|t| t.clone().field(1).gt(t.field(0)))?
        .select(|t| t.clone().field(0) + t.field(1))?
        .to_list()?;
    let compiled = QueryCompiler::default().compile(node.clone(), Backend::Sequential)?;
    assert!(compiled.fired_passes().contains(&Pass::Detuple));
    assert_eq!(compiled.run()?, evaluate(&node, &[])?);
    assert_eq!(compiled.run()?, Value::from(vec![15, 24, 35, 48]));
    Ok(())
}

#[test]
fn test_hoisted_invariant_follows_arguments() -> Result<(), Error> {
    let compiled = QueryCompiler::default().compile_template(
        &[ElemType::Int],
        |p| {
            let limit = p[0].clone();
            QueryNode::range(0, 20)?
                .filter(move |x| x.lt(limit * 2 + 1))?
                .count()
        },
        Backend::Sequential,
    )?;
    assert!(compiled.optimization_stats().hoisted >= 1);
    assert_eq!(compiled.invoke(&[Value::Int(3)])?, Value::Int(7));
    assert_eq!(compiled.invoke(&[Value::Int(0)])?, Value::Int(1));
    assert_eq!(compiled.invoke(&[Value::Int(50)])?, Value::Int(20));
    Ok(())
}

#[test]
fn test_lifting_never_moves_failures() -> Result<(), Error> {
    let node = QueryNode::from_ints(&[])
        .select(|x| x + Expr::captured("d", 0) / Expr::captured("z", 0))?
        .count()?;
    let compiled = QueryCompiler::default().compile(node, Backend::Sequential)?;
    assert_eq!(compiled.run()?, Value::Int(0));
    Ok(())
}

#[test]
fn test_nested_pipelines_stream_lazily_everywhere() -> Result<(), Error> {
    // the third inner element divides by zero and must never be pulled
    let failing_tail = QueryNode::from_ints(&[1])
        .select_many(|_| {
            QueryNode::range(0, 3)?.select(|y| Expr::int(10) / (Expr::int(2) - y))
        })?
        .take(2)?
        .to_list()?;
    let unbounded = QueryNode::from_ints(&[1, 2])
        .select_many(|x| {
            QueryNode::generate(0, |s| s.ge(0), |s| s + 1, move |s| s * x)?.to_list()
        })?
        .take(3)?
        .to_list()?;

    for (node, expected) in [
        (failing_tail, Value::from(vec![5, 10])),
        (unbounded, Value::from(vec![0, 1, 2])),
    ] {
        assert_eq!(evaluate(&node, &[])?, expected);
        for config in [CompilerConfig::default(), CompilerConfig::unoptimized()] {
            let compiler = QueryCompiler::new(config)?;
            for backend in [Backend::Sequential, Backend::Partitioned] {
                assert_eq!(compiler.compile(node.clone(), backend)?.run()?, expected);
            }
        }
    }
    Ok(())
}
