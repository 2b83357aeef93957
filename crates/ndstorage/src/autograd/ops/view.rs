use smallvec::SmallVec;

use crate::autograd::operator::{BackwardArgs, OpContext, Operator, check_arity};
use crate::error::TensorError;
use crate::layout::{Layout, RANK, inverse_permutation};
use crate::operations::{axpy_into, reshape, transpose};
use crate::registry::Registry;
use crate::storage::Storage;

/// `B = transpose(A, perm)` on the trailing `perm.len()` dims.
///
/// Backward: `grad_A += transpose(grad_B, perm⁻¹)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransposeOp {
    perm: SmallVec<[usize; RANK]>,
}

impl TransposeOp {
    /// # Errors
    ///
    /// `DuplicateDimension` if `perm` is not a permutation.
    pub fn new(perm: &[usize]) -> Result<Self, TensorError> {
        inverse_permutation(perm)?;
        Ok(Self {
            perm: SmallVec::from_slice(perm),
        })
    }

    pub fn perm(&self) -> &[usize] {
        &self.perm
    }
}

impl Operator for TransposeOp {
    fn name(&self) -> &'static str {
        "transpose"
    }

    fn arity(&self) -> usize {
        1
    }

    fn infer_layout(&self, inputs: &[Layout]) -> Result<Layout, TensorError> {
        check_arity(self.name(), 1, inputs)?;
        let mut layout = inputs[0];
        layout.transpose(&self.perm)?;
        Ok(layout)
    }

    fn forward(
        &self,
        registry: &mut Registry,
        inputs: &[&Storage],
        _requires_grad: bool,
    ) -> Result<(Storage, Option<OpContext>), TensorError> {
        check_arity(self.name(), 1, inputs)?;
        Ok((transpose(registry, inputs[0], &self.perm)?, None))
    }

    fn backward(
        &self,
        registry: &mut Registry,
        args: &BackwardArgs<'_>,
    ) -> Result<(), TensorError> {
        let Some(grad_a) = args.slot(0) else {
            return Ok(());
        };
        let inverse = inverse_permutation(&self.perm)?;
        registry.with_recording(|registry| {
            let back = transpose(registry, args.grad_output, &inverse)?;
            axpy_into(1.0, &back, grad_a)
        })
    }
}

/// `B = reshape(A, shape)`.
///
/// Forward stashes `A`'s layout; backward reshapes `grad_B` back to it and
/// accumulates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReshapeOp {
    shape: SmallVec<[isize; RANK]>,
}

impl ReshapeOp {
    pub fn new(shape: &[isize]) -> Self {
        Self {
            shape: SmallVec::from_slice(shape),
        }
    }

    pub fn shape(&self) -> &[isize] {
        &self.shape
    }
}

fn full_shape(layout: &Layout) -> [isize; RANK] {
    (*layout.shape()).map(|extent| extent as isize)
}

impl Operator for ReshapeOp {
    fn name(&self) -> &'static str {
        "reshape"
    }

    fn arity(&self) -> usize {
        1
    }

    fn infer_layout(&self, inputs: &[Layout]) -> Result<Layout, TensorError> {
        check_arity(self.name(), 1, inputs)?;
        // shape only: lazily inferred layouts are always packed
        let mut layout = inputs[0].to_contiguous();
        layout.reshape(&self.shape)?;
        Ok(layout)
    }

    fn forward(
        &self,
        registry: &mut Registry,
        inputs: &[&Storage],
        _requires_grad: bool,
    ) -> Result<(Storage, Option<OpContext>), TensorError> {
        check_arity(self.name(), 1, inputs)?;
        let original: OpContext = Box::new(inputs[0].layout());
        Ok((reshape(registry, inputs[0], &self.shape)?, Some(original)))
    }

    fn backward(
        &self,
        registry: &mut Registry,
        args: &BackwardArgs<'_>,
    ) -> Result<(), TensorError> {
        let Some(grad_a) = args.slot(0) else {
            return Ok(());
        };
        let original = args
            .ctx
            .and_then(|ctx| ctx.downcast_ref::<Layout>())
            .copied()
            .unwrap_or_else(|| grad_a.layout());
        registry.with_recording(|registry| {
            let back = reshape(registry, args.grad_output, &full_shape(&original))?;
            axpy_into(1.0, &back, grad_a)
        })
    }
}
