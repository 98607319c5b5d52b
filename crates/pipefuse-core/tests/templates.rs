/// Template compilation: compile once, invoke with many argument sets
use pipefuse_core::reference::evaluate;
use pipefuse_core::{Backend, ElemType, Error, Expr, QueryCompiler, QueryNode, Value};

fn host_backends() -> [Backend; 2] {
    [Backend::Sequential, Backend::Partitioned]
}

#[test]
fn test_one_sequence_parameter() -> Result<(), Error> {
    let compiler = QueryCompiler::default();
    let build = |p: &[Expr]| {
        QueryNode::from_expr(p[0].clone())?
            .filter(|x| (x % 2).equals(1))?
            .select(|x| x.clone() * x)?
            .to_list()
    };
    for backend in host_backends() {
        let compiled =
            compiler.compile_template(&[ElemType::seq(ElemType::Int)], build, backend)?;
        assert_eq!(
            compiled.invoke(&[Value::from(vec![1, 2, 3])])?,
            Value::from(vec![1, 9])
        );
        assert_eq!(
            compiled.invoke(&[Value::from(Vec::<i32>::new())])?,
            Value::from(Vec::<i32>::new())
        );
        assert_eq!(compiled.execution_count(), 2);
    }
    Ok(())
}

#[test]
fn test_two_parameters() -> Result<(), Error> {
    let compiler = QueryCompiler::default();
    let params = [ElemType::Int, ElemType::Str];
    for backend in host_backends() {
        let compiled = compiler.compile_template(
            &params,
            |p| {
                let suffix = p[1].clone();
                QueryNode::range(1, p[0].clone())?
                    .select(move |x| x.to_str() + suffix)?
                    .to_array()
            },
            backend,
        )?;
        assert_eq!(
            compiled.invoke(&[Value::Int(3), Value::str("?")])?,
            Value::from(vec!["1?", "2?", "3?"])
        );
        let err = compiled
            .invoke(&[Value::Int(-1), Value::str("?")])
            .unwrap_err();
        assert!(err.is_invalid_argument());
        let err = compiled.invoke(&[Value::str("3"), Value::str("?")]).unwrap_err();
        assert!(err.is_invalid_argument());
        assert_eq!(compiled.execution_count(), 2);
    }
    Ok(())
}

#[test]
fn test_five_parameters() -> Result<(), Error> {
    let compiler = QueryCompiler::default();
    let params = vec![
        ElemType::seq(ElemType::Long),
        ElemType::Long,
        ElemType::Long,
        ElemType::Int,
        ElemType::Bool,
    ];
    let build = |p: &[Expr]| {
        let (lo, hi, take, negate) = (p[1].clone(), p[2].clone(), p[3].clone(), p[4].clone());
        QueryNode::from_expr(p[0].clone())?
            .filter(move |x| x.clone().ge(lo).and(x.le(hi)))?
            .select(move |x| Expr::if_then_else(negate, -x.clone(), x))?
            .take(take)?
            .sum()
    };
    let args = |values: Vec<i64>, lo: i64, hi: i64, take: i32, negate: bool| {
        vec![
            Value::from(values),
            Value::Long(lo),
            Value::Long(hi),
            Value::Int(take),
            Value::Bool(negate),
        ]
    };

    let expected_node = build(&params
        .iter()
        .enumerate()
        .map(|(i, ty)| Expr::param(i, ty.clone()))
        .collect::<Vec<_>>())?;

    for backend in host_backends() {
        let compiled = compiler.compile_template(&params, build, backend)?;
        for case in [
            args(vec![5, 1, 9, 4, 7], 2, 8, 10, false),
            args(vec![5, 1, 9, 4, 7], 2, 8, 2, true),
            args(vec![], 0, 0, 3, false),
            args(vec![3, 3, 3], 3, 3, 0, true),
        ] {
            assert_eq!(compiled.invoke(&case)?, evaluate(&expected_node, &case)?);
        }
        assert_eq!(
            compiled.invoke(&args(vec![5, 1, 9, 4, 7], 2, 8, 10, false))?,
            Value::Long(16)
        );
    }
    Ok(())
}
