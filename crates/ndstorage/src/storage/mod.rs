//! Backend-tagged storage handles.
//!
//! A [`Storage`] pairs a unique id with the backend it was created on and the
//! backend's opaque data (a layout plus a physical buffer). Several storages
//! may view the same buffer under different layouts; the [`Registry`] keeps
//! track of which ones do, so the buffer is released exactly once.
//!
//! ```text
//! Storage { id, backend, data }
//!     │            │        └── Box<dyn BackendData>  (Layout + CpuBuffer)
//!     │            └── Arc<dyn Backend>  (kernel dispatch)
//!     └── Registry bucket membership
//! ```

mod buffer;

use std::fmt;
use std::sync::Arc;

use rand::RngCore;
use uuid::Uuid;

use crate::backend::{Backend, BackendData};
use crate::error::TensorError;
use crate::layout::Layout;
use crate::registry::Registry;

pub use buffer::CpuBuffer;

/// Handle to a block of elements on one backend.
#[derive(Debug)]
pub struct Storage {
    id: Uuid,
    backend: Arc<dyn Backend>,
    data: Box<dyn BackendData>,
}

/// Value copy of a storage's identity, kept by the registry for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSnapshot {
    pub id: Uuid,
    pub backend: String,
    pub layout: Layout,
}

impl Storage {
    /// Wrap backend data under a fresh id. The caller registers it.
    pub(crate) fn from_parts(backend: Arc<dyn Backend>, data: Box<dyn BackendData>) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend,
            data,
        }
    }

    /// Zero-initialized storage of `shape`, registered as a new bucket root.
    ///
    /// # Errors
    ///
    /// `RankExceeded` for too many dims, `AllocFailed` if the buffer cannot
    /// be allocated.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use ndstorage::{Backend, CpuBackend, Registry, Storage};
    ///
    /// let mut registry = Registry::new();
    /// let backend: Arc<dyn Backend> = Arc::new(CpuBackend::new());
    /// let s = Storage::init(&mut registry, &backend, &[2, 3]).unwrap();
    /// assert_eq!(s.layout().dims(2), &[2, 3]);
    /// assert_eq!(registry.bucket_size(&s), 1);
    /// s.free(&mut registry).unwrap();
    /// ```
    pub fn init(
        registry: &mut Registry,
        backend: &Arc<dyn Backend>,
        shape: &[usize],
    ) -> Result<Self, TensorError> {
        Self::init_with_layout(registry, backend, Layout::new(shape)?)
    }

    pub(crate) fn init_with_layout(
        registry: &mut Registry,
        backend: &Arc<dyn Backend>,
        layout: Layout,
    ) -> Result<Self, TensorError> {
        let data = backend.init(layout)?;
        let storage = Self::from_parts(Arc::clone(backend), data);
        registry.register(&storage, None)?;
        tracing::debug!(id = %storage.id, layout = %storage.layout(), "storage_init");
        Ok(storage)
    }

    /// Storage holding `values` in row-major order, registered as a new root.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` if `values.len()` differs from the element count.
    pub fn from_vec(
        registry: &mut Registry,
        backend: &Arc<dyn Backend>,
        shape: &[usize],
        values: Vec<f32>,
    ) -> Result<Self, TensorError> {
        let data = backend.from_vec(Layout::new(shape)?, values)?;
        let storage = Self::from_parts(Arc::clone(backend), data);
        registry.register(&storage, None)?;
        Ok(storage)
    }

    /// Unique id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Backend bound at creation.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Backend-owned data.
    pub fn data(&self) -> &dyn BackendData {
        self.data.as_ref()
    }

    pub(crate) fn data_mut(&mut self) -> &mut dyn BackendData {
        self.data.as_mut()
    }

    /// Current layout.
    pub fn layout(&self) -> Layout {
        self.backend.layout(self.data.as_ref())
    }

    /// Trailing `ndim()` extents.
    pub fn shape(&self) -> Vec<usize> {
        let layout = self.layout();
        layout.dims(layout.ndim()).to_vec()
    }

    /// Value copy of id, backend name and layout.
    pub fn snapshot(&self) -> StorageSnapshot {
        StorageSnapshot {
            id: self.id,
            backend: self.backend.name().to_string(),
            layout: self.layout(),
        }
    }

    /// Whether `self` and `other` view the same physical buffer.
    pub fn shares_buffer(&self, other: &Storage) -> bool {
        self.backend.name() == other.backend.name()
            && self.backend.same_buffer(self.data.as_ref(), other.data.as_ref())
    }

    /// Fail with `BackendMismatch` unless both storages use the same backend.
    pub fn check_backend(&self, other: &Storage) -> Result<(), TensorError> {
        if self.backend.name() == other.backend.name() {
            Ok(())
        } else {
            Err(TensorError::BackendMismatch {
                left: self.backend.name().to_string(),
                right: other.backend.name().to_string(),
            })
        }
    }

    /// Handle with the same id and buffer, used for registry membership.
    pub(crate) fn alias(&self) -> Result<Self, TensorError> {
        Ok(Self {
            id: self.id,
            backend: Arc::clone(&self.backend),
            data: self.backend.shallow_copy(self.data.as_ref())?,
        })
    }

    /// Set every element to `value`.
    pub fn fill(&self, value: f32) -> Result<(), TensorError> {
        self.backend.fill(self.data.as_ref(), value)
    }

    /// Fill with uniform samples in `[0, 1)` from the thread-local generator.
    pub fn fill_rand(&self) -> Result<(), TensorError> {
        self.fill_rand_with(&mut rand::rng())
    }

    /// Fill with uniform samples in `[0, 1)` from `rng`.
    pub fn fill_rand_with(&self, rng: &mut dyn RngCore) -> Result<(), TensorError> {
        self.backend.fill_rand(self.data.as_ref(), rng)
    }

    /// View of the same buffer with its own copy of the layout.
    ///
    /// The view joins this storage's bucket.
    pub fn shallow_copy(&self, registry: &mut Registry) -> Result<Self, TensorError> {
        let view = Self::from_parts(
            Arc::clone(&self.backend),
            self.backend.shallow_copy(self.data.as_ref())?,
        );
        registry.register(&view, Some(self))?;
        Ok(view)
    }

    /// Packed copy in logical order, registered as a new bucket root.
    pub fn contiguous(&self, registry: &mut Registry) -> Result<Self, TensorError> {
        let copy = Self::from_parts(
            Arc::clone(&self.backend),
            self.backend.contiguous(self.data.as_ref())?,
        );
        registry.register(&copy, None)?;
        Ok(copy)
    }

    /// Release this handle.
    ///
    /// A view only leaves its bucket. The last member of a bucket also
    /// deletes the bucket and releases the buffer through the backend.
    ///
    /// # Errors
    ///
    /// `NotRegistered` if the registry does not track this storage.
    pub fn free(self, registry: &mut Registry) -> Result<(), TensorError> {
        match registry.bucket_size(&self) {
            0 => Err(TensorError::NotRegistered(self.id)),
            1 => {
                registry.deregister_and_delete_bucket(&self)?;
                tracing::debug!(id = %self.id, "storage_release");
                self.backend.free(self.data.as_ref())
            }
            _ => registry.deregister(&self),
        }
    }

    /// Element at right-aligned `indices`.
    pub fn get(&self, indices: &[usize]) -> Result<f32, TensorError> {
        self.backend.get(self.data.as_ref(), indices)
    }

    /// Overwrite the element at right-aligned `indices`.
    pub fn set(&self, indices: &[usize], value: f32) -> Result<(), TensorError> {
        self.backend.set(self.data.as_ref(), indices, value)
    }

    /// All elements in logical row-major order.
    pub fn to_vec(&self) -> Result<Vec<f32>, TensorError> {
        self.backend.to_vec(self.data.as_ref())
    }
}

impl fmt::Display for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage({}, {})", self.backend.name(), self.layout())?;
        match self.backend.format_data(self.data.as_ref()) {
            Ok(values) => write!(f, " {values}"),
            Err(err) => write!(f, " <{err}>"),
        }
    }
}
