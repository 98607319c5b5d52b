//! Query execution
//!
//! Lowers optimized trees into closure-compiled routines. The sequential
//! backend drives one push loop per pipeline level; the partitioned backend
//! runs the same routines over disjoint slices of the source and combines
//! the partial results.

pub mod expr;
pub mod frame;
pub mod partitioned;
pub mod runtime;
pub mod sequential;

// Re-export main types
pub use frame::{Frame, Layout};
pub use partitioned::PartitionedRoutine;
pub use runtime::{Backend, CompiledQuery, QueryCompiler};
pub use sequential::{Flow, Routine};
