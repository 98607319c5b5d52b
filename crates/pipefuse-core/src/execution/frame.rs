//! Per-invocation storage
//!
//! Lowering assigns every variable, counter, buffer and breaker table a
//! fixed slot in a [`Layout`]. Each invocation (and each partition task)
//! gets a fresh [`Frame`] sized from that layout, so compiled closures are
//! shared and frames never are.

use crate::value::Value;
use indexmap::IndexMap;

/// Slot counts of a compiled routine
#[derive(Debug, Clone, Default)]
pub struct Layout {
    values: usize,
    counters: usize,
    buffers: usize,
    groups: usize,
    rows: usize,
}

impl Layout {
    /// Reserve a value slot
    pub fn value(&mut self) -> usize {
        self.values += 1;
        self.values - 1
    }

    /// Reserve an integer counter or flag
    pub fn counter(&mut self) -> usize {
        self.counters += 1;
        self.counters - 1
    }

    /// Reserve an element buffer
    pub fn buffer(&mut self) -> usize {
        self.buffers += 1;
        self.buffers - 1
    }

    /// Reserve a group table
    pub fn group_table(&mut self) -> usize {
        self.groups += 1;
        self.groups - 1
    }

    /// Reserve a keyed row buffer for sorting
    pub fn sort_rows(&mut self) -> usize {
        self.rows += 1;
        self.rows - 1
    }

    /// Total slots of every kind
    pub fn size(&self) -> usize {
        self.values + self.counters + self.buffers + self.groups + self.rows
    }
}

/// Rows collected by an OrderBy: sort keys plus the element
pub type SortRows = Vec<(Vec<Value>, Value)>;

/// Mutable state of one invocation
#[derive(Debug)]
pub struct Frame {
    /// Variables, lambda parameters, accumulators
    pub values: Vec<Value>,
    /// Counters and flags
    pub counters: Vec<i64>,
    /// Materialized element buffers
    pub buffers: Vec<Vec<Value>>,
    /// GroupBy tables in first-seen key order
    pub groups: Vec<IndexMap<Value, Vec<Value>>>,
    /// OrderBy rows
    pub rows: Vec<SortRows>,
}

impl Frame {
    /// Frame with every slot of `layout` reset
    pub fn new(layout: &Layout) -> Self {
        Self {
            values: vec![Value::Unit; layout.values],
            counters: vec![0; layout.counters],
            buffers: vec![Vec::new(); layout.buffers],
            groups: vec![IndexMap::new(); layout.groups],
            rows: vec![Vec::new(); layout.rows],
        }
    }
}
