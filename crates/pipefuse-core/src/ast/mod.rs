//! Query AST: lambda expressions, pipeline nodes, the combinator surface and
//! tree traversal

pub mod builder;
pub mod expr;
pub mod node;
pub mod visit;

pub use expr::{BinaryOp, Expr, HostFn, Lambda, MathFn, UnaryOp, Var};
pub use node::{Direction, Query, QueryNode, SortKey, Source, Step};
