//! Backend abstraction for storage operations.
//!
//! Every (dtype, device) pair is one [`Backend`] implementation. A storage is
//! bound to its backend at creation and every read or write is dispatched
//! through it; the layout arithmetic stays backend-agnostic.
//!
//! # Backends
//!
//! - [`CpuBackend`]: reference `f32` implementation on the host (always
//!   available, registered by [`BackendRegistry::with_defaults`])
//!
//! # Kernels
//!
//! The `kernels` module holds the slice-level loops shared by the CPU
//! backend: strided block copy, axpy, batched gemm (through faer) and
//! sum-reduction.

mod cpu;
mod kernels;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use rand::RngCore;

use crate::error::TensorError;
use crate::layout::Layout;

pub use cpu::{CpuBackend, CpuData, Parallelism};

/// Backend-owned data behind a storage handle.
///
/// The layout is common to all backends; the rest (buffers, device handles)
/// is reached by downcasting through [`BackendData::as_any`].
pub trait BackendData: Debug {
    /// Layout used to traverse the data.
    fn layout(&self) -> &Layout;

    /// Mutable layout, used by view operations (transpose, reshape).
    fn layout_mut(&mut self) -> &mut Layout;

    /// Downcast to the concrete type.
    fn as_any(&self) -> &dyn Any;
}

/// Capability table every data-type/device implementation provides.
///
/// Methods that write take the destination by shared reference: buffers are
/// shared between views and mutated through interior mutability.
pub trait Backend: Debug + Send + Sync {
    /// Unique name, e.g. `"cpu_f32"`.
    fn name(&self) -> &str;

    /// Allocate zero-initialized data for `layout` (packed strides).
    fn init(&self, layout: Layout) -> Result<Box<dyn BackendData>, TensorError>;

    /// Wrap existing row-major values.
    fn from_vec(&self, layout: Layout, values: Vec<f32>)
    -> Result<Box<dyn BackendData>, TensorError>;

    /// Set every element addressed by the layout to `value`.
    fn fill(&self, data: &dyn BackendData, value: f32) -> Result<(), TensorError>;

    /// Set every element to a uniform sample in `[0, 1)`.
    fn fill_rand(&self, data: &dyn BackendData, rng: &mut dyn RngCore)
    -> Result<(), TensorError>;

    /// New handle with its own layout sharing the same buffer.
    fn shallow_copy(&self, data: &dyn BackendData) -> Result<Box<dyn BackendData>, TensorError>;

    /// New packed buffer holding the elements in logical order.
    fn contiguous(&self, data: &dyn BackendData) -> Result<Box<dyn BackendData>, TensorError>;

    /// Release the physical buffer for every handle that shares it.
    fn free(&self, data: &dyn BackendData) -> Result<(), TensorError>;

    /// `dst ← src`, broadcasting `src` to `dst`'s shape. `dst` must be contiguous.
    fn copy(&self, src: &dyn BackendData, dst: &dyn BackendData) -> Result<(), TensorError>;

    /// `y ← alpha·x + y`, broadcasting `x` to `y`'s shape. `y` must be contiguous.
    fn axpy(
        &self,
        alpha: f32,
        x: &dyn BackendData,
        y: &dyn BackendData,
    ) -> Result<(), TensorError>;

    /// `c ← alpha·a·b + beta·c` over the trailing two dims, batched over the
    /// (broadcast) leading dims. `c` must be contiguous with the result shape.
    fn gemm(
        &self,
        alpha: f32,
        a: &dyn BackendData,
        b: &dyn BackendData,
        beta: f32,
        c: &dyn BackendData,
    ) -> Result<(), TensorError>;

    /// `dst ← sum(src)` over every dim where `dst` has extent 1 and `src` does
    /// not. `dst` must be contiguous.
    fn reduce_sum(&self, src: &dyn BackendData, dst: &dyn BackendData)
    -> Result<(), TensorError>;

    /// Element at right-aligned `indices`.
    fn get(&self, data: &dyn BackendData, indices: &[usize]) -> Result<f32, TensorError>;

    /// Overwrite the element at right-aligned `indices`.
    fn set(&self, data: &dyn BackendData, indices: &[usize], value: f32)
    -> Result<(), TensorError>;

    /// Layout of the data.
    fn layout(&self, data: &dyn BackendData) -> Layout {
        *data.layout()
    }

    /// Whether two handles alias one physical buffer.
    fn same_buffer(&self, a: &dyn BackendData, b: &dyn BackendData) -> bool;

    /// All elements in logical row-major order.
    fn to_vec(&self, data: &dyn BackendData) -> Result<Vec<f32>, TensorError>;

    /// Human-readable rendering of the elements.
    fn format_data(&self, data: &dyn BackendData) -> Result<String, TensorError>;
}

/// Name-keyed table of the available backends.
///
/// Registration is explicit and ordered; nothing registers itself at load
/// time.
#[derive(Debug, Default, Clone)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let cpu: Arc<dyn Backend> = Arc::new(CpuBackend::new());
        registry.backends.insert(cpu.name().to_string(), cpu);
        registry
    }

    /// Add a backend under its own name.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::InvalidBackend` if the name is already taken:
    /// one instance per (dtype, device) pair.
    pub fn register(&mut self, backend: Arc<dyn Backend>) -> Result<(), TensorError> {
        let name = backend.name().to_string();
        if self.backends.contains_key(&name) {
            return Err(TensorError::InvalidBackend(format!(
                "backend {name} already registered"
            )));
        }
        tracing::debug!(backend = %name, "backend_registered");
        self.backends.insert(name, backend);
        Ok(())
    }

    /// Look up a backend by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(name).cloned()
    }

    /// Look up a backend by name, failing with `InvalidBackend`.
    pub fn require(&self, name: &str) -> Result<Arc<dyn Backend>, TensorError> {
        self.get(name)
            .ok_or_else(|| TensorError::InvalidBackend(format!("unknown backend {name}")))
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_hold_cpu() {
        let registry = BackendRegistry::with_defaults();
        assert!(registry.get(CpuBackend::NAME).is_some());
        assert!(registry.get("cuda_f32").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec![CpuBackend::NAME]);
    }

    #[test]
    fn test_register_twice_fails() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(CpuBackend::new())).unwrap();
        let err = registry.register(Arc::new(CpuBackend::new())).unwrap_err();
        assert!(matches!(err, TensorError::InvalidBackend(_)));
    }

    #[test]
    fn test_require_unknown() {
        let registry = BackendRegistry::new();
        assert!(matches!(
            registry.require("cpu_f32"),
            Err(TensorError::InvalidBackend(_))
        ));
    }
}
