//! Device context and buffer handles
//!
//! The context owns every buffer allocation. Callers create and destroy
//! their own buffers; compiled device programs only ever allocate scratch
//! buffers and release them before `run` returns.

use crate::error::{Error, Result};
use crate::value::{ElemType, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Handle to a buffer owned by a [`DeviceContext`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceBuffer {
    context: u64,
    id: u64,
    elem: ElemType,
    len: usize,
}

impl DeviceBuffer {
    /// Element type
    pub fn elem_type(&self) -> &ElemType {
        &self.elem
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no elements
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocation id, unique within its context
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct Allocation {
    data: Arc<[Value]>,
    scratch: bool,
}

/// Allocation counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Caller buffers created
    pub buffers_created: u64,
    /// Caller buffers destroyed
    pub buffers_destroyed: u64,
    /// Scratch buffers allocated by programs
    pub scratch_allocated: u64,
    /// Kernel launches executed
    pub kernels_launched: u64,
}

/// Buffer owner and launch target for device programs
pub struct DeviceContext {
    id: u64,
    next_buffer: AtomicU64,
    buffers: Mutex<HashMap<u64, Allocation>>,
    stats: Mutex<DeviceStats>,
}

impl DeviceContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self {
            id: NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed),
            next_buffer: AtomicU64::new(1),
            buffers: Mutex::new(HashMap::new()),
            stats: Mutex::new(DeviceStats::default()),
        }
    }

    /// Copy `values` into a new buffer of scalar type `elem`
    pub fn create_buffer(&self, elem: ElemType, values: &[Value]) -> Result<DeviceBuffer> {
        if !matches!(
            elem,
            ElemType::Int | ElemType::Long | ElemType::Float | ElemType::Double
        ) {
            return Err(Error::unsupported_for_device(format!(
                "buffers of type {} are not supported",
                elem
            )));
        }
        if let Some(bad) = values.iter().find(|v| !v.conforms(&elem)) {
            return Err(Error::type_mismatch(&elem, bad.kind()));
        }
        let buffer = self.allocate(elem, Arc::from(values), false);
        self.stats.lock().buffers_created += 1;
        debug!(buffer = buffer.id, len = buffer.len, "created device buffer");
        Ok(buffer)
    }

    /// Int buffer
    pub fn create_ints(&self, values: &[i32]) -> Result<DeviceBuffer> {
        let values: Vec<Value> = values.iter().map(|v| Value::Int(*v)).collect();
        self.create_buffer(ElemType::Int, &values)
    }

    /// Long buffer
    pub fn create_longs(&self, values: &[i64]) -> Result<DeviceBuffer> {
        let values: Vec<Value> = values.iter().map(|v| Value::Long(*v)).collect();
        self.create_buffer(ElemType::Long, &values)
    }

    /// Float buffer
    pub fn create_floats(&self, values: &[f32]) -> Result<DeviceBuffer> {
        let values: Vec<Value> = values.iter().map(|v| Value::float(*v)).collect();
        self.create_buffer(ElemType::Float, &values)
    }

    /// Double buffer
    pub fn create_doubles(&self, values: &[f64]) -> Result<DeviceBuffer> {
        let values: Vec<Value> = values.iter().map(|v| Value::double(*v)).collect();
        self.create_buffer(ElemType::Double, &values)
    }

    /// Copy a buffer's contents back to the host
    pub fn read_buffer(&self, buffer: &DeviceBuffer) -> Result<Vec<Value>> {
        Ok(self.load(buffer)?.to_vec())
    }

    /// Release a caller buffer; destroying twice is an error
    pub fn destroy_buffer(&self, buffer: &DeviceBuffer) -> Result<()> {
        self.check_owner(buffer)?;
        match self.buffers.lock().remove(&buffer.id) {
            Some(_) => {
                self.stats.lock().buffers_destroyed += 1;
                debug!(buffer = buffer.id, "destroyed device buffer");
                Ok(())
            }
            None => Err(Error::device(format!(
                "buffer {} is not live in this context",
                buffer.id
            ))),
        }
    }

    /// Create a buffer, run `f` with it and destroy it whatever `f` returns
    pub fn with_buffer<R>(
        &self,
        elem: ElemType,
        values: &[Value],
        f: impl FnOnce(&DeviceBuffer) -> Result<R>,
    ) -> Result<R> {
        let buffer = self.create_buffer(elem, values)?;
        let result = f(&buffer);
        self.destroy_buffer(&buffer)?;
        result
    }

    /// Number of live allocations, scratch included
    pub fn live_buffers(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Number of live scratch allocations
    pub fn live_scratch(&self) -> usize {
        self.buffers.lock().values().filter(|a| a.scratch).count()
    }

    /// Snapshot of the allocation counters
    pub fn stats(&self) -> DeviceStats {
        self.stats.lock().clone()
    }

    /// Whether `buffer` was created by this context
    pub fn owns(&self, buffer: &DeviceBuffer) -> bool {
        buffer.context == self.id
    }

    pub(crate) fn alloc_scratch(&self, elem: ElemType, len: usize) -> DeviceBuffer {
        let zero = elem.zero().unwrap_or(Value::Bool(false));
        let buffer = self.allocate(elem, vec![zero; len].into(), true);
        self.stats.lock().scratch_allocated += 1;
        buffer
    }

    pub(crate) fn release_scratch(&self, buffer: &DeviceBuffer) {
        let mut buffers = self.buffers.lock();
        if buffers.get(&buffer.id).is_some_and(|a| a.scratch) {
            buffers.remove(&buffer.id);
        }
    }

    pub(crate) fn load(&self, buffer: &DeviceBuffer) -> Result<Arc<[Value]>> {
        self.check_owner(buffer)?;
        self.buffers
            .lock()
            .get(&buffer.id)
            .map(|a| a.data.clone())
            .ok_or_else(|| Error::device(format!("buffer {} is not live in this context", buffer.id)))
    }

    pub(crate) fn store(&self, buffer: &DeviceBuffer, data: Vec<Value>) -> Result<()> {
        self.check_owner(buffer)?;
        let mut buffers = self.buffers.lock();
        let slot = buffers
            .get_mut(&buffer.id)
            .ok_or_else(|| Error::device(format!("buffer {} is not live in this context", buffer.id)))?;
        if data.len() != buffer.len {
            return Err(Error::device(format!(
                "store of {} elements into buffer of {}",
                data.len(),
                buffer.len
            )));
        }
        slot.data = data.into();
        Ok(())
    }

    pub(crate) fn record_launch(&self) {
        self.stats.lock().kernels_launched += 1;
    }

    fn allocate(&self, elem: ElemType, data: Arc<[Value]>, scratch: bool) -> DeviceBuffer {
        let id = self.next_buffer.fetch_add(1, Ordering::Relaxed);
        let len = data.len();
        self.buffers.lock().insert(id, Allocation { data, scratch });
        DeviceBuffer {
            context: self.id,
            id,
            elem,
            len,
        }
    }

    fn check_owner(&self, buffer: &DeviceBuffer) -> Result<()> {
        if self.owns(buffer) {
            Ok(())
        } else {
            Err(Error::device(format!(
                "buffer {} belongs to another context",
                buffer.id
            )))
        }
    }
}

impl Default for DeviceContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("id", &self.id)
            .field("live_buffers", &self.live_buffers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_lifecycle() {
        let ctx = DeviceContext::new();
        let buf = ctx.create_ints(&[1, 2, 3]).unwrap();
        assert_eq!(buf.len(), 3);
        assert_eq!(ctx.live_buffers(), 1);
        assert_eq!(
            ctx.read_buffer(&buf).unwrap(),
            vec![Value::Int(1), Value::Int(2), Value::Int(3)]
        );
        ctx.destroy_buffer(&buf).unwrap();
        assert_eq!(ctx.live_buffers(), 0);
        assert!(ctx.destroy_buffer(&buf).is_err());
        assert!(ctx.read_buffer(&buf).is_err());
    }

    #[test]
    fn test_rejects_non_scalar_and_mismatched_values() {
        let ctx = DeviceContext::new();
        assert!(
            ctx.create_buffer(ElemType::Str, &[Value::str("a")])
                .unwrap_err()
                .is_unsupported_for_device()
        );
        assert!(ctx.create_buffer(ElemType::Int, &[Value::Long(1)]).is_err());
    }

    #[test]
    fn test_foreign_buffer() {
        let a = DeviceContext::new();
        let b = DeviceContext::new();
        let buf = a.create_doubles(&[1.0]).unwrap();
        assert!(b.read_buffer(&buf).is_err());
        assert!(!b.owns(&buf));
    }

    #[test]
    fn test_with_buffer_releases_on_error() {
        let ctx = DeviceContext::new();
        let result: Result<()> = ctx.with_buffer(ElemType::Int, &[Value::Int(1)], |_| {
            Err(Error::runtime("boom"))
        });
        assert!(result.is_err());
        assert_eq!(ctx.live_buffers(), 0);
    }

    #[test]
    fn test_scratch_accounting() {
        let ctx = DeviceContext::new();
        let scratch = ctx.alloc_scratch(ElemType::Int, 4);
        assert_eq!(ctx.live_scratch(), 1);
        ctx.store(&scratch, vec![Value::Int(7); 4]).unwrap();
        assert_eq!(ctx.load(&scratch).unwrap()[3], Value::Int(7));
        ctx.release_scratch(&scratch);
        assert_eq!(ctx.live_scratch(), 0);
        assert_eq!(ctx.stats().scratch_allocated, 1);
    }
}
