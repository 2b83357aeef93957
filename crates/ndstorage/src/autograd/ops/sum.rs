use smallvec::SmallVec;

use crate::autograd::operator::{BackwardArgs, OpContext, Operator, check_arity};
use crate::error::TensorError;
use crate::layout::{Layout, RANK};
use crate::operations::{axpy_into, sum};
use crate::registry::Registry;
use crate::storage::Storage;

/// `B = sum(A, mask)` over the masked trailing dims (kept at extent 1).
///
/// Backward: `grad_A += grad_B`, broadcasting `grad_B` over the reduced dims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SumOp {
    mask: SmallVec<[bool; RANK]>,
}

impl SumOp {
    pub fn new(mask: &[bool]) -> Self {
        Self {
            mask: SmallVec::from_slice(mask),
        }
    }

    pub fn mask(&self) -> &[bool] {
        &self.mask
    }
}

impl Operator for SumOp {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn arity(&self) -> usize {
        1
    }

    fn infer_layout(&self, inputs: &[Layout]) -> Result<Layout, TensorError> {
        check_arity(self.name(), 1, inputs)?;
        let mut layout = inputs[0];
        layout.reduce(&self.mask)?;
        Ok(layout)
    }

    fn forward(
        &self,
        registry: &mut Registry,
        inputs: &[&Storage],
        _requires_grad: bool,
    ) -> Result<(Storage, Option<OpContext>), TensorError> {
        check_arity(self.name(), 1, inputs)?;
        Ok((sum(registry, inputs[0], &self.mask)?, None))
    }

    fn backward(
        &self,
        _registry: &mut Registry,
        args: &BackwardArgs<'_>,
    ) -> Result<(), TensorError> {
        match args.slot(0) {
            Some(grad_a) => axpy_into(1.0, args.grad_output, grad_a),
            None => Ok(()),
        }
    }
}
