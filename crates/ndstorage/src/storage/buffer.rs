//! Shared CPU data buffer.
//!
//! A `CpuBuffer` is the physical allocation behind one registry bucket. Views
//! clone the handle (not the data); the allocation itself is dropped either
//! when the last handle goes away or explicitly through [`CpuBuffer::release`]
//! once the registry reports that the last aliasing storage was freed.

use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

use crate::error::TensorError;

/// Reference-counted, interior-mutable `f32` buffer.
#[derive(Debug, Clone)]
pub struct CpuBuffer {
    cell: Rc<RefCell<Option<Vec<f32>>>>,
}

impl CpuBuffer {
    /// Allocate a zero-initialized buffer.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::AllocFailed` if the allocation cannot be reserved.
    pub fn zeros(len: usize) -> Result<Self, TensorError> {
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| TensorError::AllocFailed { len })?;
        data.resize(len, 0.0);
        Ok(Self::from_vec(data))
    }

    /// Wrap an existing vector.
    pub fn from_vec(data: Vec<f32>) -> Self {
        Self {
            cell: Rc::new(RefCell::new(Some(data))),
        }
    }

    /// Immutable access to the elements.
    ///
    /// # Errors
    ///
    /// `NotInitialized` after release, `InvalidOperation` while a writer holds
    /// the buffer.
    pub fn read(&self) -> Result<Ref<'_, [f32]>, TensorError> {
        let guard = self
            .cell
            .try_borrow()
            .map_err(|_| TensorError::InvalidOperation("buffer is being written".into()))?;
        Ref::filter_map(guard, |data| data.as_deref()).map_err(|_| TensorError::NotInitialized)
    }

    /// Mutable access to the elements.
    ///
    /// # Errors
    ///
    /// `NotInitialized` after release, `InvalidOperation` while any other
    /// borrow is alive.
    pub fn write(&self) -> Result<RefMut<'_, [f32]>, TensorError> {
        let guard = self
            .cell
            .try_borrow_mut()
            .map_err(|_| TensorError::InvalidOperation("buffer is already borrowed".into()))?;
        RefMut::filter_map(guard, |data| data.as_deref_mut())
            .map_err(|_| TensorError::NotInitialized)
    }

    /// Number of elements, 0 once released.
    pub fn len(&self) -> usize {
        self.cell
            .try_borrow()
            .map(|data| data.as_ref().map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Check if the buffer holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the allocation for every handle sharing it.
    ///
    /// # Errors
    ///
    /// `NotInitialized` if already released.
    pub fn release(&self) -> Result<(), TensorError> {
        let mut guard = self
            .cell
            .try_borrow_mut()
            .map_err(|_| TensorError::InvalidOperation("buffer is still borrowed".into()))?;
        guard.take().map(drop).ok_or(TensorError::NotInitialized)
    }

    /// Whether [`CpuBuffer::release`] has run.
    pub fn is_released(&self) -> bool {
        self.cell
            .try_borrow()
            .map(|data| data.is_none())
            .unwrap_or(false)
    }

    /// Whether two handles point at the same allocation.
    pub fn ptr_eq(&self, other: &CpuBuffer) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }

    /// Number of live handles to the allocation.
    pub fn handle_count(&self) -> usize {
        Rc::strong_count(&self.cell)
    }
}
