//! Operator fusion
//!
//! Runs of element-wise operators collapse into one [`QueryNode::Fused`]
//! node whose steps the backends apply inside a single loop body. Fusion
//! stops at anything that is not element-wise.

use crate::ast::node::{Query, QueryNode, Step};
use crate::ast::visit::{Rewriter, rebuild_node};

/// Collapses element-wise runs into fused step lists
#[derive(Default)]
pub struct Fuser {
    /// Element-wise nodes absorbed into a fused node
    pub fused: usize,
}

impl Fuser {
    /// Fuse every element-wise run in `query`
    pub fn run(&mut self, query: &Query) -> Query {
        Query {
            root: self.rewrite_node(&query.root),
            hoisted: query.hoisted.clone(),
        }
    }
}

fn into_steps(node: QueryNode) -> Result<(Box<QueryNode>, Vec<Step>), QueryNode> {
    match node {
        QueryNode::Transform {
            input, selector, ..
        } => Ok((input, vec![Step::Map(selector)])),
        QueryNode::TransformIndexed {
            input, selector, ..
        } => Ok((input, vec![Step::MapIndexed(selector)])),
        QueryNode::Filter { input, predicate } => Ok((input, vec![Step::Filter(predicate)])),
        QueryNode::FilterIndexed { input, predicate } => {
            Ok((input, vec![Step::FilterIndexed(predicate)]))
        }
        QueryNode::Fused { input, steps, .. } => Ok((input, steps)),
        other => Err(other),
    }
}

impl Rewriter for Fuser {
    fn rewrite_node(&mut self, node: &QueryNode) -> QueryNode {
        let rebuilt = rebuild_node(self, node);
        let elem = rebuilt.elem_type();
        let absorbed = !matches!(rebuilt, QueryNode::Fused { .. });
        let (input, mut steps) = match into_steps(rebuilt) {
            Ok(parts) => parts,
            Err(other) => return other,
        };
        if absorbed {
            self.fused += 1;
        }
        match *input {
            QueryNode::Fused {
                input: inner,
                steps: inner_steps,
                ..
            } => {
                let mut merged = inner_steps;
                merged.append(&mut steps);
                QueryNode::Fused {
                    input: inner,
                    steps: merged,
                    elem,
                }
            }
            input => QueryNode::Fused {
                input: Box::new(input),
                steps,
                elem,
            },
        }
    }
}
