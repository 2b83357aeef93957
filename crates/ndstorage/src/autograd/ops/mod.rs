//! Differentiable operators.

mod axpy;
mod gemm;
mod sum;
mod view;

pub use axpy::AxpyOp;
pub use gemm::GemmOp;
pub use sum::SumOp;
pub use view::{ReshapeOp, TransposeOp};

use crate::error::TensorError;
use crate::layout::RANK;
use crate::operations::{axpy_into, sum};
use crate::registry::Registry;
use crate::storage::Storage;

/// `slot += alpha · grad`, first summing `grad` over every dim where its
/// extent differs from `slot`'s.
///
/// Undoes a forward broadcast: a gradient flowing back into a broadcast
/// input must be reduced to the input's shape before it is accumulated.
/// The reduced temporary lives in `registry`'s current recording scope.
pub(crate) fn accumulate_reduced(
    registry: &mut Registry,
    alpha: f32,
    grad: &Storage,
    slot: &Storage,
) -> Result<(), TensorError> {
    let (from, to) = (grad.layout(), slot.layout());
    if from.shape() == to.shape() {
        return axpy_into(alpha, grad, slot);
    }
    let mut mask = [false; RANK];
    for (dim, reduced) in mask.iter_mut().enumerate() {
        *reduced = from.shape()[dim] != to.shape()[dim];
    }
    let reduced = sum(registry, grad, &mask)?;
    axpy_into(alpha, &reduced, slot)
}
