//! Tuple decomposition inside fused chains
//!
//! A map producing a tuple that the following filters and the next map only
//! read field by field never needs the tuple itself. The fields become bound
//! locals and the readers are rewritten against them. Every field is still
//! evaluated, in order, so failures are unchanged.

use crate::ast::expr::{Expr, Lambda, Var};
use crate::ast::node::{Query, QueryNode, Step};
use crate::ast::visit::{Rewriter, VarUses, Visitor, rebuild_expr, rebuild_node};

/// Replaces `param.i` with the i-th local
struct FieldsToLocals<'a> {
    param: &'a str,
    locals: &'a [Var],
}

impl Rewriter for FieldsToLocals<'_> {
    fn rewrite_expr(&mut self, expr: &Expr) -> Expr {
        if let Expr::Field { expr: inner, index } = expr {
            if matches!(&**inner, Expr::Var(v) if &*v.name == self.param) {
                if let Some(local) = self.locals.get(*index) {
                    return local.expr();
                }
            }
        }
        rebuild_expr(self, expr)
    }
}

fn reads_only_fields(lambda: &Lambda) -> bool {
    let [param] = lambda.params.as_slice() else {
        return false;
    };
    let mut uses = VarUses::new(&param.name);
    uses.visit_expr(&lambda.body);
    uses.only_fields()
}

fn against_locals(lambda: &Lambda, locals: &[Var]) -> Expr {
    let name = &lambda.params[0].name;
    FieldsToLocals {
        param: name,
        locals,
    }
    .rewrite_expr(&lambda.body)
}

/// Rewrites tuple-producing maps into bound locals
#[derive(Default)]
pub struct Detupler {
    /// Tuple maps decomposed
    pub detupled: usize,
}

impl Detupler {
    /// Detuple every fused chain in `query`
    pub fn run(&mut self, query: &Query) -> Query {
        Query {
            root: self.rewrite_node(&query.root),
            hoisted: query.hoisted.clone(),
        }
    }

    fn rewrite_steps(&mut self, steps: &[Step]) -> Vec<Step> {
        let mut out = Vec::with_capacity(steps.len());
        let mut i = 0;
        while i < steps.len() {
            if let Some((replacement, consumed)) = self.decompose(&steps[i..]) {
                out.extend(replacement);
                i += consumed;
            } else {
                out.push(steps[i].clone());
                i += 1;
            }
        }
        out
    }

    /// Try to decompose a tuple map at the head of `steps`; returns the new
    /// steps and how many old steps they replace
    fn decompose(&mut self, steps: &[Step]) -> Option<(Vec<Step>, usize)> {
        let Step::Map(producer) = steps.first()? else {
            return None;
        };
        let Expr::Tuple(fields) = &producer.body else {
            return None;
        };
        let [param] = producer.params.as_slice() else {
            return None;
        };

        let mut readers = Vec::new();
        let mut consumer = None;
        for step in &steps[1..] {
            match step {
                Step::Filter(p) if reads_only_fields(p) => readers.push(p),
                Step::Map(f) if reads_only_fields(f) => {
                    consumer = Some(f);
                    break;
                }
                _ => return None,
            }
        }
        let consumer = consumer?;

        let locals: Vec<Var> = fields
            .iter()
            .enumerate()
            .map(|(i, field)| {
                let ty = field.infer().ok()?;
                Some(Var::fresh(&format!("{}_{}_", param.name, i), ty))
            })
            .collect::<Option<_>>()?;

        let mut replacement = Vec::with_capacity(readers.len() + 2);
        replacement.push(Step::Bind {
            param: param.clone(),
            locals: locals.iter().cloned().zip(fields.iter().cloned()).collect(),
        });
        for p in &readers {
            replacement.push(Step::FilterLocals(against_locals(p, &locals)));
        }
        replacement.push(Step::MapLocals(against_locals(consumer, &locals)));
        self.detupled += 1;
        Some((replacement, readers.len() + 2))
    }
}

impl Rewriter for Detupler {
    fn rewrite_node(&mut self, node: &QueryNode) -> QueryNode {
        match rebuild_node(self, node) {
            QueryNode::Fused { input, steps, elem } => QueryNode::Fused {
                input,
                steps: self.rewrite_steps(&steps),
                elem,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::fusion::Fuser;
    use crate::value::ElemType;

    fn fused_steps(query: &Query) -> &[Step] {
        match &query.root {
            QueryNode::ToList { input } => match &**input {
                QueryNode::Fused { steps, .. } => steps,
                other => panic!("unexpected node {:?}", other),
            },
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn test_pair_map_filter_map() {
        let q = QueryNode::from_ints(&[1, 2, 3])
            .select(|x| Expr::tuple(vec![x.clone(), x * 10]))
            .unwrap()
            .filter(|t| t.field(1).gt(10))
            .unwrap()
            .select(|t| t.clone().field(0) + t.field(1))
            .unwrap()
            .to_list()
            .unwrap();
        let fused = Fuser::default().run(&Query::new(q));
        let mut pass = Detupler::default();
        let out = pass.run(&fused);
        assert_eq!(pass.detupled, 1);
        let steps = fused_steps(&out);
        assert!(matches!(steps[0], Step::Bind { ref locals, .. } if locals.len() == 2));
        assert!(matches!(steps[1], Step::FilterLocals(_)));
        assert!(matches!(steps[2], Step::MapLocals(_)));
        assert_eq!(out.root.elem_type(), ElemType::Int);
        assert!(out.check().is_ok());
    }

    #[test]
    fn test_whole_tuple_use_blocks_decomposition() {
        let q = QueryNode::from_ints(&[1])
            .select(|x| Expr::tuple(vec![x.clone(), x]))
            .unwrap()
            .select(|t| Expr::tuple(vec![t.clone().field(0), t]))
            .unwrap()
            .to_list()
            .unwrap();
        let fused = Fuser::default().run(&Query::new(q));
        let mut pass = Detupler::default();
        assert_eq!(pass.run(&fused), fused);
        assert_eq!(pass.detupled, 0);
    }

    #[test]
    fn test_trailing_tuple_is_kept() {
        let q = QueryNode::from_ints(&[1])
            .select(|x| Expr::tuple(vec![x.clone(), x]))
            .unwrap()
            .filter(|t| t.field(0).gt(0))
            .unwrap()
            .to_list()
            .unwrap();
        let fused = Fuser::default().run(&Query::new(q));
        let mut pass = Detupler::default();
        assert_eq!(pass.run(&fused), fused);
    }
}
