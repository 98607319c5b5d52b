//! Device backend
//!
//! Lowers the device subset of the query language (scalar element types,
//! element-wise map and filter over device buffers, zip of two buffers, and
//! array, sum or count terminals) to OpenCL C kernels plus a host-side
//! [`LaunchPlan`]. Programs run on the host through [`DeviceProgram`].

pub mod codegen;
pub mod context;
pub mod emulator;
pub mod ir;
pub mod plan;

pub use context::{DeviceBuffer, DeviceContext, DeviceStats};
pub use emulator::DeviceProgram;
pub use ir::{KernelIr, Terminal};
pub use plan::LaunchPlan;
