//! `y ← α·x + y` with broadcasting.

use crate::error::TensorError;
use crate::registry::Registry;
use crate::storage::Storage;

use super::with_fresh_output;

/// `α·x + y` into a fresh storage of the broadcast shape of `x` and `y`.
///
/// # Errors
///
/// `BackendMismatch` for storages on different backends, `BroadcastError`
/// for incompatible shapes.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use ndstorage::{Backend, CpuBackend, Registry, Storage};
/// use ndstorage::operations::axpy;
///
/// let mut registry = Registry::new();
/// let cpu: Arc<dyn Backend> = Arc::new(CpuBackend::new());
/// let x = Storage::from_vec(&mut registry, &cpu, &[1, 2], vec![1.0, 2.0]).unwrap();
/// let y = Storage::from_vec(&mut registry, &cpu, &[2, 2], vec![1.0; 4]).unwrap();
///
/// let z = axpy(&mut registry, 2.0, &x, &y).unwrap();
/// assert_eq!(z.to_vec().unwrap(), vec![3.0, 5.0, 3.0, 5.0]);
/// ```
#[tracing::instrument(level = "debug", skip_all, fields(x = %x.layout(), y = %y.layout()))]
pub fn axpy(
    registry: &mut Registry,
    alpha: f32,
    x: &Storage,
    y: &Storage,
) -> Result<Storage, TensorError> {
    x.check_backend(y)?;
    let layout = x.layout().broadcast_with(&y.layout())?;
    with_fresh_output(registry, x.backend(), layout, |out| {
        copy_into(y, out)?;
        axpy_into(alpha, x, out)
    })
}

/// `y ← α·x + y` in place, broadcasting `x` to `y`'s shape.
///
/// # Errors
///
/// - `BackendMismatch` for storages on different backends
/// - `NotImplemented` if `y` is not contiguous
/// - `BroadcastError` if `x` cannot be broadcast to `y`
pub fn axpy_into(alpha: f32, x: &Storage, y: &Storage) -> Result<(), TensorError> {
    x.check_backend(y)?;
    x.backend().axpy(alpha, x.data(), y.data())
}

/// `dst ← src`, broadcasting `src` to `dst`'s shape. `dst` must be contiguous.
pub fn copy_into(src: &Storage, dst: &Storage) -> Result<(), TensorError> {
    src.check_backend(dst)?;
    src.backend().copy(src.data(), dst.data())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, CpuBackend};
    use std::sync::Arc;

    fn cpu() -> Arc<dyn Backend> {
        Arc::new(CpuBackend::new())
    }

    #[test]
    fn test_axpy_fresh_broadcasts_both_sides() {
        let mut registry = Registry::new();
        let x = Storage::from_vec(&mut registry, &cpu(), &[2, 1], vec![1.0, 2.0]).unwrap();
        let y = Storage::from_vec(&mut registry, &cpu(), &[1, 3], vec![10.0, 20.0, 30.0]).unwrap();
        let z = axpy(&mut registry, 1.0, &x, &y).unwrap();
        assert_eq!(z.shape(), vec![2, 3]);
        assert_eq!(
            z.to_vec().unwrap(),
            vec![11.0, 21.0, 31.0, 12.0, 22.0, 32.0]
        );
        // inputs untouched
        assert_eq!(y.to_vec().unwrap(), vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_axpy_incompatible_frees_nothing_new() {
        let mut registry = Registry::new();
        let x = Storage::init(&mut registry, &cpu(), &[2]).unwrap();
        let y = Storage::init(&mut registry, &cpu(), &[3]).unwrap();
        assert!(matches!(
            axpy(&mut registry, 1.0, &x, &y),
            Err(TensorError::BroadcastError { .. })
        ));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_axpy_into_non_regular_x() {
        let mut registry = Registry::new();
        let x = Storage::from_vec(&mut registry, &cpu(), &[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let xt = crate::operations::transpose(&mut registry, &x, &[1, 0]).unwrap();
        let y = Storage::init(&mut registry, &cpu(), &[2, 2]).unwrap();
        axpy_into(1.0, &xt, &y).unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_axpy_into_strided_destination() {
        let mut registry = Registry::new();
        let x = Storage::init(&mut registry, &cpu(), &[2, 2]).unwrap();
        let y = Storage::init(&mut registry, &cpu(), &[2, 2]).unwrap();
        let yt = crate::operations::transpose(&mut registry, &y, &[1, 0]).unwrap();
        assert!(matches!(
            axpy_into(1.0, &x, &yt),
            Err(TensorError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_axpy_into_x_larger_than_y() {
        let mut registry = Registry::new();
        let x = Storage::init(&mut registry, &cpu(), &[2, 3]).unwrap();
        let y = Storage::init(&mut registry, &cpu(), &[1, 3]).unwrap();
        assert!(matches!(
            axpy_into(1.0, &x, &y),
            Err(TensorError::BroadcastError { .. })
        ));
    }
}
