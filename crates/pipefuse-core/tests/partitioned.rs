/// Partitioned backend: results independent of the partition count
use pipefuse_core::config::PartitionConfig;
use pipefuse_core::reference::evaluate;
use pipefuse_core::{Backend, CompilerConfig, Error, Expr, QueryCompiler, QueryNode, Value};

fn compiler(partitions: usize, preserve_order: bool) -> Result<QueryCompiler, Error> {
    QueryCompiler::new(CompilerConfig {
        partition: PartitionConfig {
            partitions: Some(partitions),
            preserve_order,
            chunk_size: 5,
            channel_capacity: 2,
        },
        ..CompilerConfig::default()
    })
}

fn across_partitions(node: &QueryNode) -> Result<Value, Error> {
    let expected = evaluate(node, &[])?;
    for partitions in [1, 2, 3, 8] {
        let compiled = compiler(partitions, true)?.compile(node.clone(), Backend::Partitioned)?;
        assert_eq!(compiled.run()?, expected, "{} partitions", partitions);
    }
    Ok(expected)
}

#[test]
fn test_sum_count_invariant() -> Result<(), Error> {
    let sum = QueryNode::range(-50, 301)?.select(|x| x * 3 - 1)?.sum()?;
    across_partitions(&sum)?;

    let count = QueryNode::range(0, 1000)?
        .filter(|x| (x % 7).equals(3))?
        .count()?;
    assert_eq!(across_partitions(&count)?, Value::Int(143));
    Ok(())
}

#[test]
fn test_aggregate_with_combiner() -> Result<(), Error> {
    let node = QueryNode::range(1, 20)?.aggregate_with_combiner(
        Expr::long(0),
        |acc, x| acc + x.convert(pipefuse_core::ElemType::Long) * 2i64,
        |a, b| a + b,
    )?;
    assert_eq!(across_partitions(&node)?, Value::Long(420));
    Ok(())
}

#[test]
fn test_aggregate_seed_counted_once() -> Result<(), Error> {
    let node = QueryNode::range(1, 10)?.aggregate(100, |acc, x| acc + x)?;
    assert_eq!(across_partitions(&node)?, Value::Int(155));
    let compiled = compiler(4, true)?.compile(node, Backend::Partitioned)?;
    assert!(!compiled.is_parallel());
    Ok(())
}

#[test]
fn test_ordered_concat_and_flatten() -> Result<(), Error> {
    let node = QueryNode::range(0, 40)?
        .select_many(|x| QueryNode::repeat(x, 2))?
        .filter(|x| (x % 3).not_equals(0))?
        .to_list()?;
    let compiled = compiler(4, true)?.compile(node.clone(), Backend::Partitioned)?;
    assert!(compiled.is_parallel());
    assert_eq!(compiled.run()?, evaluate(&node, &[])?);
    Ok(())
}

#[test]
fn test_unordered_concat_is_a_permutation() -> Result<(), Error> {
    let node = QueryNode::range(0, 200)?.select(|x| x * 2)?.to_array()?;
    let compiled = compiler(6, false)?.compile(node.clone(), Backend::Partitioned)?;
    let mut got: Vec<i32> = compiled
        .run()?
        .as_items()
        .map(|items| items.iter().filter_map(Value::as_i32).collect())
        .unwrap_or_default();
    got.sort_unstable();
    let expected: Vec<i32> = (0..200).map(|x| x * 2).collect();
    assert_eq!(got, expected);
    Ok(())
}

#[test]
fn test_group_and_sort_merge() -> Result<(), Error> {
    let groups = QueryNode::range(0, 100)?
        .group_by(|x| x % 6)?
        .try_select(|g| {
            let key = g.clone().field(0);
            let total = Expr::query(QueryNode::from_expr(g)?.sum()?);
            Ok(Expr::tuple(vec![key, total]))
        })?
        .to_list()?;
    across_partitions(&groups)?;

    let sorted = QueryNode::range(0, 90)?
        .select(|x| Expr::tuple(vec![x.clone() % 4, x]))?
        .order_by_descending(|t| t.field(0))?
        .then_by(|t| t.field(1) % 5)?
        .to_list()?;
    across_partitions(&sorted)?;
    Ok(())
}

#[test]
fn test_generated_source() -> Result<(), Error> {
    let node = QueryNode::generate(0, |s| s.lt(60), |s| s + 1, |s| s.clone() * s)?
        .filter(|x| (x % 2).equals(0))?
        .sum()?;
    assert_eq!(across_partitions(&node)?, Value::Int(34220));
    Ok(())
}

#[test]
fn test_take_falls_back() -> Result<(), Error> {
    let node = QueryNode::range(0, 1000)?.take(5)?.sum()?;
    let compiled = compiler(4, true)?.compile(node, Backend::Partitioned)?;
    assert!(!compiled.is_parallel());
    assert_eq!(compiled.run()?, Value::Int(10));
    Ok(())
}

#[test]
fn test_errors_after_join() -> Result<(), Error> {
    let node = QueryNode::range(-20, 40)?
        .select(|x| Expr::int(100) / x)?
        .sum()?;
    let compiled = compiler(4, true)?.compile(node, Backend::Partitioned)?;
    assert!(matches!(compiled.run(), Err(Error::Runtime(_))));
    // the pool survives a failed run
    assert!(matches!(compiled.run(), Err(Error::Runtime(_))));
    Ok(())
}

#[test]
fn test_negative_count_inside_partitioned_flatten() -> Result<(), Error> {
    let node = QueryNode::range(0, 10)?
        .select_many(|x| QueryNode::range(0, x - 5))?
        .count()?;
    let err = compiler(3, true)?
        .compile(node, Backend::Partitioned)?
        .run()
        .unwrap_err();
    assert!(err.is_invalid_argument());
    Ok(())
}
