//! Launch plans
//!
//! The host side of a device program: which scratch buffers to allocate,
//! which kernels to launch in which order with which bindings, and where the
//! result is read back from. Plans are plain data and serialize to JSON for
//! inspection.

use crate::device::ir::{KernelIr, Terminal};
use serde::Serialize;

/// Scratch buffer roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scratch {
    /// Element values written by the map kernel
    Values,
    /// Survivor flags (0/1) written by the map kernel
    Marks,
    /// Survivors per work group
    TileSums,
    /// Exclusive scan of the tile sums
    TilePrefix,
    /// Output position of every survivor
    Positions,
    /// Survivors packed to the front
    Compacted,
    /// Per work-group partial reductions
    Partials,
    /// Final reduction, one element
    Result,
}

/// A buffer a kernel reads or writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    /// Caller-owned input buffer, by position in the kernel's buffer list
    Input(usize),
    /// Scratch buffer
    Scratch(Scratch),
}

/// Scratch allocation request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScratchSpec {
    /// Role
    pub role: Scratch,
    /// OpenCL element type
    pub elem: &'static str,
    /// Element count
    pub len: usize,
}

/// Kernels of a device program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Kernel {
    /// Element-wise pass: values and survivor marks
    Map,
    /// Survivors per work group
    TileCount,
    /// Survivor positions from the tile prefix and a local scan
    TileScan,
    /// Scatter survivors to their positions
    Compact,
    /// First reduction pass, one partial per work group
    Reduce,
    /// Second reduction pass over the partials in one work group
    ReduceFinal,
}

impl Kernel {
    /// Entry point name in the generated source
    pub fn entry(&self) -> &'static str {
        match self {
            Kernel::Map => "pf_map",
            Kernel::TileCount => "pf_tile_count",
            Kernel::TileScan => "pf_tile_scan",
            Kernel::Compact => "pf_compact",
            Kernel::Reduce => "pf_reduce",
            Kernel::ReduceFinal => "pf_reduce_final",
        }
    }
}

/// One step of the plan
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlanStep {
    /// Kernel launch over `global` work items in groups of `local`
    Launch {
        /// Kernel
        kernel: Kernel,
        /// Global work size
        global: usize,
        /// Work-group size
        local: usize,
        /// Buffer arguments in declaration order
        bindings: Vec<Binding>,
    },
    /// Exclusive scan of the tile sums on the host
    HostScan {
        /// Tile sums
        input: Scratch,
        /// Exclusive prefix
        output: Scratch,
    },
}

/// Where the result comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanOutput {
    /// Every work item's value, `n` elements
    Array {
        /// Buffer read back
        buffer: Scratch,
    },
    /// The first `count` elements, `count` being the host scan total
    Compacted {
        /// Buffer read back
        buffer: Scratch,
    },
    /// One element
    Scalar {
        /// Buffer read back
        buffer: Scratch,
    },
}

/// Complete host schedule of a device program
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaunchPlan {
    /// Number of work items
    pub n: usize,
    /// Work-group size
    pub work_group_size: usize,
    /// Number of work groups covering `n`
    pub groups: usize,
    /// Scratch buffers, allocated before the first step and released after the last
    pub scratch: Vec<ScratchSpec>,
    /// Steps in order
    pub steps: Vec<PlanStep>,
    /// Result location
    pub output: PlanOutput,
}

/// OpenCL spelling of a scalar type
pub fn cl_type(ty: &crate::value::ElemType) -> &'static str {
    use crate::value::ElemType;
    match ty {
        ElemType::Bool => "bool",
        ElemType::Int => "int",
        ElemType::Long => "long",
        ElemType::Float => "float",
        ElemType::Double => "double",
        _ => "void",
    }
}

impl LaunchPlan {
    /// Schedule `ir` with the given work-group size
    pub fn build(ir: &KernelIr, work_group_size: usize) -> Self {
        let n = ir.n;
        let wg = work_group_size;
        let groups = n.div_ceil(wg);
        let global = groups * wg;
        let elem = cl_type(&ir.elem);
        let reduce = cl_type(&ir.reduce_type());

        if n == 0 {
            return Self {
                n,
                work_group_size: wg,
                groups,
                scratch: Vec::new(),
                steps: Vec::new(),
                output: match ir.terminal {
                    Terminal::Array => PlanOutput::Array {
                        buffer: Scratch::Values,
                    },
                    _ => PlanOutput::Scalar {
                        buffer: Scratch::Result,
                    },
                },
            };
        }

        let inputs = (0..ir.buffers.len()).map(Binding::Input);
        let launch = |kernel, global, bindings: Vec<Binding>| PlanStep::Launch {
            kernel,
            global,
            local: wg,
            bindings,
        };
        let spec = |role, elem, len| ScratchSpec { role, elem, len };

        let mut scratch = Vec::new();
        let mut steps = Vec::new();
        let output;

        let mut map_out = Vec::new();
        match ir.terminal {
            Terminal::Array | Terminal::Sum => {
                scratch.push(spec(Scratch::Values, elem, n));
                map_out.push(Binding::Scratch(Scratch::Values));
            }
            Terminal::Count => {}
        }
        if ir.filtered || ir.terminal == Terminal::Count {
            scratch.push(spec(Scratch::Marks, "int", n));
            map_out.push(Binding::Scratch(Scratch::Marks));
        }

        steps.push(launch(Kernel::Map, global, inputs.chain(map_out).collect()));

        match ir.terminal {
            Terminal::Array if !ir.filtered => {
                output = PlanOutput::Array {
                    buffer: Scratch::Values,
                };
            }
            Terminal::Array => {
                scratch.push(spec(Scratch::TileSums, "int", groups));
                scratch.push(spec(Scratch::TilePrefix, "int", groups));
                scratch.push(spec(Scratch::Positions, "int", n));
                scratch.push(spec(Scratch::Compacted, elem, n));
                steps.push(launch(
                    Kernel::TileCount,
                    global,
                    vec![Binding::Scratch(Scratch::Marks), Binding::Scratch(Scratch::TileSums)],
                ));
                steps.push(PlanStep::HostScan {
                    input: Scratch::TileSums,
                    output: Scratch::TilePrefix,
                });
                steps.push(launch(
                    Kernel::TileScan,
                    global,
                    vec![
                        Binding::Scratch(Scratch::Marks),
                        Binding::Scratch(Scratch::TilePrefix),
                        Binding::Scratch(Scratch::Positions),
                    ],
                ));
                steps.push(launch(
                    Kernel::Compact,
                    global,
                    vec![
                        Binding::Scratch(Scratch::Values),
                        Binding::Scratch(Scratch::Marks),
                        Binding::Scratch(Scratch::Positions),
                        Binding::Scratch(Scratch::Compacted),
                    ],
                ));
                output = PlanOutput::Compacted {
                    buffer: Scratch::Compacted,
                };
            }
            Terminal::Sum | Terminal::Count => {
                scratch.push(spec(Scratch::Partials, reduce, groups));
                scratch.push(spec(Scratch::Result, reduce, 1));
                let mut first = Vec::new();
                if ir.terminal == Terminal::Sum {
                    first.push(Binding::Scratch(Scratch::Values));
                }
                if ir.filtered || ir.terminal == Terminal::Count {
                    first.push(Binding::Scratch(Scratch::Marks));
                }
                first.push(Binding::Scratch(Scratch::Partials));
                steps.push(launch(Kernel::Reduce, global, first));
                steps.push(launch(
                    Kernel::ReduceFinal,
                    wg,
                    vec![Binding::Scratch(Scratch::Partials), Binding::Scratch(Scratch::Result)],
                ));
                output = PlanOutput::Scalar {
                    buffer: Scratch::Result,
                };
            }
        }

        Self {
            n,
            work_group_size: wg,
            groups,
            scratch,
            steps,
            output,
        }
    }

    /// Kernels launched, in order
    pub fn kernels(&self) -> Vec<Kernel> {
        self.steps
            .iter()
            .filter_map(|s| match s {
                PlanStep::Launch { kernel, .. } => Some(*kernel),
                PlanStep::HostScan { .. } => None,
            })
            .collect()
    }

    /// Pretty JSON rendering
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
