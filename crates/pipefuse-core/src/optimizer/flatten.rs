//! Nested-pipeline flattening
//!
//! `select_many` stores its body as a source over a query-valued
//! expression, which the backends pull through a nested loop one element at
//! a time. This pass splices the pipeline in as the sub-tree itself so the
//! later passes can fuse across it.

use crate::ast::node::{Query, QueryNode};
use crate::ast::visit::{Rewriter, rebuild_node};

/// Splices query-valued sources into the tree
#[derive(Default)]
pub struct Flattener {
    /// Sources replaced
    pub flattened: usize,
}

impl Flattener {
    /// Flatten every query-valued source of `query`
    pub fn run(&mut self, query: &Query) -> Query {
        Query {
            root: self.rewrite_node(&query.root),
            hoisted: query.hoisted.clone(),
        }
    }
}

impl Rewriter for Flattener {
    fn rewrite_node(&mut self, node: &QueryNode) -> QueryNode {
        let rebuilt = rebuild_node(self, node);
        match rebuilt.nested_stream().cloned() {
            Some(inner) => {
                self.flattened += 1;
                inner
            }
            None => rebuilt,
        }
    }
}
