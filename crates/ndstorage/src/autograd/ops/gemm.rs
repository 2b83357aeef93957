use crate::autograd::operator::{BackwardArgs, OpContext, Operator, check_arity};
use crate::error::TensorError;
use crate::layout::Layout;
use crate::operations::{gemm, gemm_into, transpose};
use crate::registry::Registry;
use crate::storage::Storage;

use super::accumulate_reduced;

/// `C = A·B` over the trailing two dims, batched over the rest.
///
/// Backward: `grad_A += grad_C·Bᵗ` and `grad_B += Aᵗ·grad_C`, with `ᵗ`
/// swapping the last two axes as a view. A contribution whose batch dims were
/// broadcast is summed back to the input's shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GemmOp;

impl GemmOp {
    pub fn new() -> Self {
        Self
    }
}

/// `slot += lhs·rhs`, straight into the slot when the shapes agree.
fn accumulate_product(
    registry: &mut Registry,
    lhs: &Storage,
    rhs: &Storage,
    slot: &Storage,
) -> Result<(), TensorError> {
    let product = lhs.layout().gemm_with(&rhs.layout())?;
    if product.shape() == slot.layout().shape() && slot.layout().is_contiguous() {
        gemm_into(1.0, lhs, rhs, 1.0, slot)
    } else {
        let partial = gemm(registry, 1.0, lhs, rhs)?;
        accumulate_reduced(registry, 1.0, &partial, slot)
    }
}

impl Operator for GemmOp {
    fn name(&self) -> &'static str {
        "gemm"
    }

    fn arity(&self) -> usize {
        2
    }

    fn infer_layout(&self, inputs: &[Layout]) -> Result<Layout, TensorError> {
        check_arity(self.name(), 2, inputs)?;
        inputs[0].gemm_with(&inputs[1])
    }

    fn forward(
        &self,
        registry: &mut Registry,
        inputs: &[&Storage],
        _requires_grad: bool,
    ) -> Result<(Storage, Option<OpContext>), TensorError> {
        check_arity(self.name(), 2, inputs)?;
        Ok((gemm(registry, 1.0, inputs[0], inputs[1])?, None))
    }

    fn backward(
        &self,
        registry: &mut Registry,
        args: &BackwardArgs<'_>,
    ) -> Result<(), TensorError> {
        check_arity(self.name(), 2, args.inputs)?;
        let (a, b) = (args.inputs[0], args.inputs[1]);
        registry.with_recording(|registry| {
            if let Some(grad_a) = args.slot(0) {
                let bt = transpose(registry, b, &[1, 0])?;
                accumulate_product(registry, args.grad_output, &bt, grad_a)?;
            }
            if let Some(grad_b) = args.slot(1) {
                let at = transpose(registry, a, &[1, 0])?;
                accumulate_product(registry, &at, args.grad_output, grad_b)?;
            }
            Ok(())
        })
    }
}
