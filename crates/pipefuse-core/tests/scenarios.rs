/// End-to-end pipelines run through every host backend and checked against
/// the reference evaluator
use pipefuse_core::reference::evaluate;
use pipefuse_core::{Backend, Error, Expr, QueryCompiler, QueryNode, Value};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pipefuse_core=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

fn run_everywhere(node: QueryNode) -> Result<Value, Error> {
    init_tracing();
    let expected = evaluate(&node, &[])?;
    let compiler = QueryCompiler::default();
    for backend in [Backend::Sequential, Backend::Partitioned] {
        let name = backend.name();
        let compiled = compiler.compile(node.clone(), backend)?;
        assert_eq!(compiled.run()?, expected, "{} backend disagrees", name);
    }
    Ok(expected)
}

#[test]
fn test_filter_map_to_string() -> Result<(), Error> {
    let node = QueryNode::from_ints(&[1, 2, 3, 4, 5])
        .filter(|x| (x % 2).equals(0))?
        .select(|x| x * 2)?
        .select(|x| x.to_str())?
        .select(|s| s + "!")?
        .to_list()?;
    assert_eq!(run_everywhere(node)?, Value::from(vec!["4!", "8!"]));
    Ok(())
}

#[test]
fn test_map_sum() -> Result<(), Error> {
    let node = QueryNode::from_ints(&[1, 2, 3, 4, 5]).select(|x| x * 2)?.sum()?;
    assert_eq!(run_everywhere(node)?, Value::Int(30));
    Ok(())
}

#[test]
fn test_group_counts_sum() -> Result<(), Error> {
    let node = QueryNode::from_ints(&[1, 1, 2, 2])
        .group_by(|x| x)?
        .try_select(|g| Ok(Expr::query(QueryNode::from_expr(g)?.count()?)))?
        .sum()?;
    assert_eq!(run_everywhere(node)?, Value::Int(4));
    Ok(())
}

#[test]
fn test_order_by_then_double() -> Result<(), Error> {
    let ascending = QueryNode::from_ints(&[5, 4, 3, 2, 1])
        .order_by(|x| x)?
        .select(|x| x * 2)?
        .to_list()?;
    assert_eq!(run_everywhere(ascending)?, Value::from(vec![2, 4, 6, 8, 10]));

    let descending = QueryNode::from_ints(&[5, 4, 3, 2, 1])
        .order_by_descending(|x| x)?
        .select(|x| x * 2)?
        .to_list()?;
    assert_eq!(run_everywhere(descending)?, Value::from(vec![10, 8, 6, 4, 2]));
    Ok(())
}

#[test]
fn test_take_then_nested_skip_take() -> Result<(), Error> {
    let node = QueryNode::from_ints(&[1, 2, 3, 4, 5])
        .take(2)?
        .select_many(|_| QueryNode::from_ints(&[1, 2, 3, 4, 5]).skip(2)?.take(2))?
        .to_list()?;
    assert_eq!(run_everywhere(node)?, Value::from(vec![3, 4, 3, 4]));
    Ok(())
}

#[test]
fn test_implicit_list_root() -> Result<(), Error> {
    let node = QueryNode::range(1, 3)?.select(|x| x + 10)?;
    assert_eq!(run_everywhere(node)?, Value::from(vec![11, 12, 13]));
    Ok(())
}

#[test]
fn test_then_by_chain() -> Result<(), Error> {
    let node = QueryNode::from_strs(&["bb", "a", "ccc", "dd", "e"])
        .order_by(|s| s.equals("a"))?
        .then_by_descending(|s| s)?
        .to_list()?;
    assert_eq!(
        run_everywhere(node)?,
        Value::from(vec!["e", "dd", "ccc", "bb", "a"])
    );
    Ok(())
}

#[test]
fn test_select_many_with_selector() -> Result<(), Error> {
    let node = QueryNode::from_ints(&[1, 2])
        .select_many_with(|x| QueryNode::range(0, x), |outer, inner| outer * 10 + inner)?
        .to_list()?;
    assert_eq!(run_everywhere(node)?, Value::from(vec![10, 20, 21]));
    Ok(())
}

#[test]
fn test_skip_while_and_aggregate() -> Result<(), Error> {
    let node = QueryNode::from_ints(&[1, 2, 5, 1, 7])
        .skip_while(|x| x.lt(3))?
        .aggregate(Expr::long(0), |acc, x| acc * 10i64 + x.convert(pipefuse_core::ElemType::Long))?;
    assert_eq!(run_everywhere(node)?, Value::Long(517));
    Ok(())
}

#[test]
fn test_repeat_and_zip() -> Result<(), Error> {
    let node = QueryNode::repeat("x", 3)?
        .zip_with(QueryNode::range(1, 5)?, |s, n| s + n.to_str())?
        .to_array()?;
    assert_eq!(run_everywhere(node)?, Value::from(vec!["x1", "x2", "x3"]));
    Ok(())
}

#[test]
fn test_zero_repeat_is_empty() -> Result<(), Error> {
    let list = QueryNode::repeat(7, 0)?.select(|x| x * 2)?.to_list()?;
    assert_eq!(run_everywhere(list)?, Value::from(Vec::<i32>::new()));

    let count = QueryNode::repeat("x", 0)?.count()?;
    assert_eq!(run_everywhere(count)?, Value::Int(0));

    let nested = QueryNode::from_ints(&[1, 2, 3])
        .select_many(|x| QueryNode::repeat(x, 0))?
        .sum()?;
    assert_eq!(run_everywhere(nested)?, Value::Int(0));
    Ok(())
}

#[test]
fn test_runtime_errors_propagate() -> Result<(), Error> {
    let node = QueryNode::from_ints(&[4, 2, 0, 1])
        .select(|x| Expr::int(8) / x)?
        .to_list()?;
    let compiler = QueryCompiler::default();
    for backend in [Backend::Sequential, Backend::Partitioned] {
        let err = compiler.compile(node.clone(), backend)?.run().unwrap_err();
        assert!(matches!(err, Error::Runtime(_)), "unexpected {:?}", err);
    }
    Ok(())
}
