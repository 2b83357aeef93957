//! Forward/backward contract shared by every differentiable operation.

use std::any::Any;
use std::fmt::Debug;

use crate::error::TensorError;
use crate::layout::Layout;
use crate::registry::Registry;
use crate::storage::Storage;

/// Backend-agnostic state an operator stashes during forward for reuse in
/// backward.
pub type OpContext = Box<dyn Any>;

/// Everything a backward call can look at.
#[derive(Debug)]
pub struct BackwardArgs<'a> {
    /// Forward inputs, in order.
    pub inputs: &'a [&'a Storage],
    /// Forward output.
    pub output: &'a Storage,
    /// Gradient of the loss with respect to `output`.
    pub grad_output: &'a Storage,
    /// Context returned by forward, if any.
    pub ctx: Option<&'a OpContext>,
    /// Gradient slots of the inputs; `None` where no gradient is kept.
    pub grad_inputs: &'a [Option<&'a Storage>],
    /// Which inputs want a gradient.
    pub requires_grad: &'a [bool],
}

impl<'a> BackwardArgs<'a> {
    /// Gradient slot `i` if it is both requested and present.
    pub fn slot(&self, i: usize) -> Option<&'a Storage> {
        let wanted = self.requires_grad.get(i).copied().unwrap_or(false);
        self.grad_inputs.get(i).copied().flatten().filter(|_| wanted)
    }
}

/// A differentiable operation on storages.
///
/// `backward` must **accumulate** into every requested gradient slot; a value
/// that feeds several consumers receives one contribution from each.
pub trait Operator: Debug {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Number of inputs.
    fn arity(&self) -> usize;

    /// Output layout for the given input layouts, without computing anything.
    fn infer_layout(&self, inputs: &[Layout]) -> Result<Layout, TensorError>;

    /// Compute the output, registered in `registry`.
    fn forward(
        &self,
        registry: &mut Registry,
        inputs: &[&Storage],
        requires_grad: bool,
    ) -> Result<(Storage, Option<OpContext>), TensorError>;

    /// Add this operation's contribution to the input gradients.
    fn backward(&self, registry: &mut Registry, args: &BackwardArgs<'_>)
    -> Result<(), TensorError>;
}

/// Fail with `InvalidOperation` unless exactly `arity` inputs were given.
pub(crate) fn check_arity<T>(name: &str, arity: usize, inputs: &[T]) -> Result<(), TensorError> {
    if inputs.len() == arity {
        Ok(())
    } else {
        Err(TensorError::InvalidOperation(format!(
            "{name} takes {arity} input(s), got {}",
            inputs.len()
        )))
    }
}
