//! Property tests: every backend, optimized or not, agrees with the
//! reference evaluator on randomly generated inputs.
//!
//! Failures count as agreement when both sides fail with the same error
//! variant; the message may differ.

use pipefuse_core::reference::evaluate;
use pipefuse_core::{
    Backend, CompilerConfig, DeviceContext, Error, Expr, QueryCompiler, QueryNode, Value,
};
use proptest::prelude::*;
use std::mem::discriminant;
use std::sync::Arc;

fn assert_same(what: &str, expected: &Result<Value, Error>, actual: Result<Value, Error>) {
    match (expected, &actual) {
        (Ok(e), Ok(a)) => assert_eq!(a, e, "{}", what),
        (Err(e), Err(a)) => assert_eq!(
            discriminant(e),
            discriminant(a),
            "{}: expected {:?}, got {:?}",
            what,
            e,
            a
        ),
        _ => panic!("{}: expected {:?}, got {:?}", what, expected, actual),
    }
}

/// Compile `node` on both host backends, with and without the optimizer
fn check_host(node: &QueryNode) {
    let expected = evaluate(node, &[]);
    for config in [CompilerConfig::default(), CompilerConfig::unoptimized()] {
        let compiler = QueryCompiler::new(config).unwrap();
        for backend in [Backend::Sequential, Backend::Partitioned] {
            let what = backend.name();
            let compiled = compiler.compile(node.clone(), backend).unwrap();
            assert_same(what, &expected, compiled.run());
        }
    }
}

fn ints() -> impl Strategy<Value = Vec<i32>> {
    prop::collection::vec(-200i32..200, 0..120)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_filter_map_list(data in ints(), k in 1i32..7, r in 0i32..3, m in -5i32..5, c in -9i32..9) {
        let node = QueryNode::from_ints(&data)
            .filter(|x| (x % k).equals(r))
            .unwrap()
            .select(|x| x * m + c)
            .unwrap()
            .to_list()
            .unwrap();
        check_host(&node);
    }

    #[test]
    fn prop_map_sum_and_count(data in ints(), m in -5i32..5) {
        let sum = QueryNode::from_ints(&data).select(|x| x * m).unwrap().sum().unwrap();
        check_host(&sum);
        let count = QueryNode::from_ints(&data).filter(|x| x.gt(m)).unwrap().count().unwrap();
        check_host(&count);
    }

    #[test]
    fn prop_group_keys_in_first_seen_order(data in ints(), k in 1i32..9) {
        let node = QueryNode::from_ints(&data)
            .group_by(|x| x % k)
            .unwrap()
            .try_select(|g| {
                let size = Expr::query(QueryNode::from_expr(g.clone())?.count()?);
                Ok(Expr::tuple(vec![g.field(0), size]))
            })
            .unwrap()
            .to_list()
            .unwrap();
        check_host(&node);
    }

    #[test]
    fn prop_order_by_is_stable(data in ints(), k in 1i32..5) {
        let node = QueryNode::from_ints(&data)
            .select_indexed(|x, i| Expr::tuple(vec![x, i]))
            .unwrap()
            .order_by(move |t| t.field(0) % k)
            .unwrap()
            .then_by_descending(|t| t.field(0))
            .unwrap()
            .to_list()
            .unwrap();
        check_host(&node);

        let plain = QueryNode::from_ints(&data).order_by(move |x| x % k).unwrap().to_array().unwrap();
        check_host(&plain);
    }

    #[test]
    fn prop_windows(data in ints(), t in -3i32..40, s in -3i32..40) {
        let node = QueryNode::from_ints(&data)
            .skip(s)
            .unwrap()
            .take(t)
            .unwrap()
            .to_list()
            .unwrap();
        check_host(&node);

        let whiles = QueryNode::from_ints(&data)
            .skip_while(|x| x.lt(0))
            .unwrap()
            .take_while(|x| x.not_equals(0))
            .unwrap()
            .to_list()
            .unwrap();
        check_host(&whiles);
    }

    #[test]
    fn prop_flattening_with_deferred_counts(data in prop::collection::vec(-2i32..6, 0..30)) {
        let node = QueryNode::from_ints(&data)
            .select_many(|x| QueryNode::range(x.clone(), x - 1)?.select(|y| y * 2))
            .unwrap()
            .count()
            .unwrap();
        check_host(&node);
    }

    #[test]
    fn prop_device_matches_reference(data in ints(), k in 1i32..7, m in -5i32..5) {
        let ctx = Arc::new(DeviceContext::new());
        let buf = ctx.create_ints(&data).unwrap();
        let compiler = QueryCompiler::default();
        let pipelines = |source: QueryNode| -> Result<Vec<QueryNode>, Error> {
            Ok(vec![
                source.clone().filter(|x| (x % k).equals(0))?.select(|x| x * m)?.to_array()?,
                source.clone().select(|x| x * m + 1)?.sum()?,
                source.filter(|x| x.gt(m))?.count()?,
            ])
        };
        let host = pipelines(QueryNode::from_ints(&data)).unwrap();
        let device = pipelines(QueryNode::from_buffer(&buf)).unwrap();
        for (host, device) in host.iter().zip(device) {
            let expected = evaluate(host, &[]);
            let compiled = compiler.compile(device, Backend::Device(ctx.clone())).unwrap();
            assert_same("device", &expected, compiled.run());
        }
        prop_assert_eq!(ctx.live_scratch(), 0);
    }
}
