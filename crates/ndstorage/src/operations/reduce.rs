//! Sum-reduction over masked dims.

use crate::error::TensorError;
use crate::registry::Registry;
use crate::storage::Storage;

use super::with_fresh_output;

/// Sum `src` over the trailing dims selected by `mask`.
///
/// `mask` is right-aligned like a shape; reduced dims keep extent 1 so the
/// result broadcasts back against `src`.
///
/// # Errors
///
/// `RankExceeded` if `mask` is longer than the maximum rank.
pub fn sum(registry: &mut Registry, src: &Storage, mask: &[bool]) -> Result<Storage, TensorError> {
    let mut layout = src.layout();
    layout.reduce(mask)?;
    tracing::debug!(src = %src.layout(), dst = %layout, "sum");
    with_fresh_output(registry, src.backend(), layout, |dst| sum_into(src, dst))
}

/// `dst ← sum(src)` over every dim where `dst` has extent 1 and `src` does
/// not.
///
/// # Errors
///
/// `ShapeMismatch` if `dst` is not a reduced shape of `src`,
/// `NotImplemented` if `dst` is not contiguous.
pub fn sum_into(src: &Storage, dst: &Storage) -> Result<(), TensorError> {
    src.check_backend(dst)?;
    src.backend().reduce_sum(src.data(), dst.data())
}
