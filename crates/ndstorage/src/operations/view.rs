//! Views: new layouts over an existing buffer.

use std::sync::Arc;

use crate::error::TensorError;
use crate::registry::Registry;
use crate::storage::Storage;

/// View with the trailing `perm.len()` dims permuted. No data moves.
///
/// # Errors
///
/// `DuplicateDimension` if `perm` is not a permutation.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use ndstorage::{Backend, CpuBackend, Registry, Storage};
/// use ndstorage::operations::transpose;
///
/// let mut registry = Registry::new();
/// let cpu: Arc<dyn Backend> = Arc::new(CpuBackend::new());
/// let a = Storage::from_vec(&mut registry, &cpu, &[2, 3],
///     vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
///
/// let t = transpose(&mut registry, &a, &[1, 0]).unwrap();
/// assert_eq!(t.shape(), vec![3, 2]);
/// assert_eq!(t.get(&[2, 1]).unwrap(), a.get(&[1, 2]).unwrap());
/// assert_eq!(registry.bucket_size(&a), 2);
/// ```
pub fn transpose(
    registry: &mut Registry,
    src: &Storage,
    perm: &[usize],
) -> Result<Storage, TensorError> {
    let mut view = detached_view(src)?;
    view.data_mut().layout_mut().transpose(perm)?;
    registry.register(&view, Some(src))?;
    Ok(view)
}

/// View with a new shape; at most one extent may be `-1`.
///
/// A regular source is reshaped in place as a view. A non-regular source
/// (a transposed or broadcast view) is first copied into a fresh packed
/// buffer, which becomes a new bucket root.
///
/// # Errors
///
/// `ReshapeInvalidShape` if the element count changes or the placeholder is
/// misused.
pub fn reshape(
    registry: &mut Registry,
    src: &Storage,
    new_shape: &[isize],
) -> Result<Storage, TensorError> {
    if src.layout().is_regular() {
        let mut view = detached_view(src)?;
        view.data_mut().layout_mut().reshape(new_shape)?;
        registry.register(&view, Some(src))?;
        Ok(view)
    } else {
        tracing::debug!(layout = %src.layout(), "reshape_materialize");
        let data = src.backend().contiguous(src.data())?;
        let mut copy = Storage::from_parts(Arc::clone(src.backend()), data);
        copy.data_mut().layout_mut().reshape(new_shape)?;
        registry.register(&copy, None)?;
        Ok(copy)
    }
}

/// View of the same buffer with an unchanged layout.
pub fn shallow_copy(registry: &mut Registry, src: &Storage) -> Result<Storage, TensorError> {
    src.shallow_copy(registry)
}

fn detached_view(src: &Storage) -> Result<Storage, TensorError> {
    let data = src.backend().shallow_copy(src.data())?;
    Ok(Storage::from_parts(Arc::clone(src.backend()), data))
}
