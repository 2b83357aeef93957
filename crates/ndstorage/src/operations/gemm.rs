//! Batched matrix multiply.
//!
//! The trailing two dims are the matrix, every leading dim is a batch dim.
//! Batch dims of `a` and `b` broadcast against each other; the result keeps
//! `a`'s rows and `b`'s columns.

use crate::error::TensorError;
use crate::registry::Registry;
use crate::storage::Storage;

use super::with_fresh_output;

/// `α·a·b` into a fresh storage.
///
/// # Errors
///
/// - `BackendMismatch` for storages on different backends
/// - `ShapeMismatch` if `a`'s columns differ from `b`'s rows
/// - `BroadcastError` for incompatible batch dims
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use ndstorage::{Backend, CpuBackend, Registry, Storage};
/// use ndstorage::operations::gemm;
///
/// let mut registry = Registry::new();
/// let cpu: Arc<dyn Backend> = Arc::new(CpuBackend::new());
/// let a = Storage::from_vec(&mut registry, &cpu, &[2, 3],
///     vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
/// let b = Storage::from_vec(&mut registry, &cpu, &[3, 2],
///     vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]).unwrap();
///
/// let c = gemm(&mut registry, 1.0, &a, &b).unwrap();
/// assert_eq!(c.to_vec().unwrap(), vec![58.0, 64.0, 139.0, 154.0]);
/// ```
#[tracing::instrument(level = "debug", skip_all, fields(a = %a.layout(), b = %b.layout()))]
pub fn gemm(
    registry: &mut Registry,
    alpha: f32,
    a: &Storage,
    b: &Storage,
) -> Result<Storage, TensorError> {
    a.check_backend(b)?;
    let layout = a.layout().gemm_with(&b.layout())?;
    with_fresh_output(registry, a.backend(), layout, |c| {
        gemm_into(alpha, a, b, 0.0, c)
    })
}

/// `c ← α·a·b + β·c` into an existing destination.
///
/// # Errors
///
/// `ShapeMismatch` if `c` does not have the product shape, `NotImplemented`
/// if `c` is not contiguous, plus the errors of [`gemm`].
pub fn gemm_into(
    alpha: f32,
    a: &Storage,
    b: &Storage,
    beta: f32,
    c: &Storage,
) -> Result<(), TensorError> {
    a.check_backend(b)?;
    a.check_backend(c)?;
    a.backend().gemm(alpha, a.data(), b.data(), beta, c.data())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, CpuBackend, Parallelism};
    use crate::operations::transpose;
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn cpu() -> Arc<dyn Backend> {
        Arc::new(CpuBackend::new())
    }

    #[test]
    fn test_gemm_literal() {
        let mut registry = Registry::new();
        let a = Storage::from_vec(&mut registry, &cpu(), &[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap();
        let b = Storage::from_vec(&mut registry, &cpu(), &[3, 2], vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0])
            .unwrap();
        let c = gemm(&mut registry, 1.0, &a, &b).unwrap();
        assert_eq!(c.shape(), vec![2, 2]);
        assert_eq!(c.to_vec().unwrap(), vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_gemm_batched_with_broadcast_b() {
        let backend: Arc<dyn Backend> = Arc::new(CpuBackend::with_parallelism(Parallelism::Rayon));
        let mut registry = Registry::new();
        // two batches of 2x2, b shared
        let a = Storage::from_vec(
            &mut registry,
            &backend,
            &[2, 2, 2],
            vec![1.0, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 2.0],
        )
        .unwrap();
        let b = Storage::from_vec(&mut registry, &backend, &[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let c = gemm(&mut registry, 1.0, &a, &b).unwrap();
        assert_eq!(c.shape(), vec![2, 2, 2]);
        assert_eq!(
            c.to_vec().unwrap(),
            vec![1.0, 2.0, 3.0, 4.0, 2.0, 4.0, 6.0, 8.0]
        );
    }

    #[test]
    fn test_gemm_transposed_view_operand() {
        let mut registry = Registry::new();
        let a = Storage::from_vec(&mut registry, &cpu(), &[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap();
        let at = transpose(&mut registry, &a, &[1, 0]).unwrap();
        // aᵗ·a is 3x3 and symmetric
        let c = gemm(&mut registry, 1.0, &at, &a).unwrap();
        assert_eq!(c.shape(), vec![3, 3]);
        assert_relative_eq!(c.get(&[0, 0]).unwrap(), 17.0);
        assert_relative_eq!(c.get(&[0, 2]).unwrap(), 27.0);
        assert_relative_eq!(c.get(&[2, 0]).unwrap(), 27.0);
        assert_relative_eq!(c.get(&[2, 2]).unwrap(), 45.0);
    }

    #[test]
    fn test_gemm_into_accumulates() {
        let mut registry = Registry::new();
        let a = Storage::from_vec(&mut registry, &cpu(), &[1, 2], vec![1.0, 2.0]).unwrap();
        let b = Storage::from_vec(&mut registry, &cpu(), &[2, 1], vec![3.0, 4.0]).unwrap();
        let c = Storage::from_vec(&mut registry, &cpu(), &[1, 1], vec![1.0]).unwrap();
        gemm_into(2.0, &a, &b, 1.0, &c).unwrap();
        assert_relative_eq!(c.get(&[0, 0]).unwrap(), 23.0);
    }

    #[test]
    fn test_gemm_inner_mismatch() {
        let mut registry = Registry::new();
        let a = Storage::init(&mut registry, &cpu(), &[2, 3]).unwrap();
        let b = Storage::init(&mut registry, &cpu(), &[2, 3]).unwrap();
        assert!(matches!(
            gemm(&mut registry, 1.0, &a, &b),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_gemm_into_wrong_destination() {
        let mut registry = Registry::new();
        let a = Storage::init(&mut registry, &cpu(), &[2, 3]).unwrap();
        let b = Storage::init(&mut registry, &cpu(), &[3, 4]).unwrap();
        let c = Storage::init(&mut registry, &cpu(), &[4, 2]).unwrap();
        assert!(matches!(
            gemm_into(1.0, &a, &b, 0.0, &c),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }
}
