//! pipefuse - query-pipeline compiler
//!
//! This crate compiles declarative chains of collection operators into
//! executable routines:
//! - Query AST built from lambda-bearing combinators (map, filter, fold,
//!   grouping, sorting, flattening, windowing)
//! - Optimizer: operator fusion, tuple decomposition, nested-pipeline
//!   flattening, constant and invariant lifting
//! - Sequential backend: one closure-compiled loop per pipeline level
//! - Partitioned backend: fork/join over partitions with a combine step
//! - Device backend: OpenCL C kernels plus a launch plan, run by a host emulator
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 AST Builder                 │
//! │  (select, filter, group_by, order_by, ...)  │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │                  Optimizer                  │
//! │        (Flatten, Lift, Fuse, Detuple)       │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │                   Backends                  │
//! │      (Sequential, Partitioned, Device)      │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │                CompiledQuery                │
//! │           (run, invoke, templates)          │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use pipefuse_core::{Backend, QueryCompiler, QueryNode, Value};
//!
//! let query = QueryNode::range(1, 4)?.select(|x| x.clone() * x)?.sum()?;
//! let compiled = QueryCompiler::default().compile(query, Backend::Sequential)?;
//! assert_eq!(compiled.run()?, Value::Int(30));
//! # Ok::<(), pipefuse_core::Error>(())
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod ast;
pub mod config;
pub mod device;
pub mod error;
pub mod execution;
pub mod ops;
pub mod optimizer;
pub mod reference;
pub mod value;

pub use ast::{Expr, Lambda, Query, QueryNode};
pub use config::CompilerConfig;
pub use device::{DeviceBuffer, DeviceContext};
pub use error::{Error, Result};
pub use execution::{Backend, CompiledQuery, QueryCompiler};
pub use optimizer::QueryOptimizer;
pub use value::{ElemType, Value};
