use crate::autograd::operator::{BackwardArgs, OpContext, Operator, check_arity};
use crate::error::TensorError;
use crate::layout::Layout;
use crate::operations::axpy;
use crate::registry::Registry;
use crate::storage::Storage;

use super::accumulate_reduced;

/// `c = α·a + b`, broadcasting `a` and `b` against each other.
///
/// Backward: `grad_a += α·grad_c` and `grad_b += grad_c`, each summed over
/// the dims the forward broadcast expanded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxpyOp {
    pub alpha: f32,
}

impl AxpyOp {
    pub fn new(alpha: f32) -> Self {
        Self { alpha }
    }
}

impl Operator for AxpyOp {
    fn name(&self) -> &'static str {
        "axpy"
    }

    fn arity(&self) -> usize {
        2
    }

    fn infer_layout(&self, inputs: &[Layout]) -> Result<Layout, TensorError> {
        check_arity(self.name(), 2, inputs)?;
        inputs[0].broadcast_with(&inputs[1])
    }

    fn forward(
        &self,
        registry: &mut Registry,
        inputs: &[&Storage],
        _requires_grad: bool,
    ) -> Result<(Storage, Option<OpContext>), TensorError> {
        check_arity(self.name(), 2, inputs)?;
        Ok((axpy(registry, self.alpha, inputs[0], inputs[1])?, None))
    }

    fn backward(
        &self,
        registry: &mut Registry,
        args: &BackwardArgs<'_>,
    ) -> Result<(), TensorError> {
        registry.with_recording(|registry| {
            if let Some(grad_a) = args.slot(0) {
                accumulate_reduced(registry, self.alpha, args.grad_output, grad_a)?;
            }
            if let Some(grad_b) = args.slot(1) {
                accumulate_reduced(registry, 1.0, args.grad_output, grad_b)?;
            }
            Ok(())
        })
    }
}
