//! Storage-level operations.
//!
//! Each math operation comes in two levels:
//!
//! ```text
//! Level 1: fresh destination (axpy, gemm, sum)
//!     → infer output layout
//!     → allocate and register output
//!     → call the level-2 version, free the output on failure
//!
//! Level 2: existing destination (axpy_into, gemm_into, sum_into)
//!     → check backends match
//!     → dispatch to the backend kernel
//! ```
//!
//! View operations (`transpose`, `reshape`, `shallow_copy`) never copy data
//! unless the layout forces it; views join the source's registry bucket.

mod axpy;
mod gemm;
mod reduce;
mod view;

use std::sync::Arc;

use crate::backend::Backend;
use crate::error::TensorError;
use crate::layout::Layout;
use crate::registry::Registry;
use crate::storage::Storage;

pub use axpy::{axpy, axpy_into, copy_into};
pub use gemm::{gemm, gemm_into};
pub use reduce::{sum, sum_into};
pub use view::{reshape, shallow_copy, transpose};

/// Allocate a registered output and run `fill` on it, freeing the output if
/// `fill` fails.
pub(crate) fn with_fresh_output(
    registry: &mut Registry,
    backend: &Arc<dyn Backend>,
    layout: Layout,
    fill: impl FnOnce(&Storage) -> Result<(), TensorError>,
) -> Result<Storage, TensorError> {
    let out = Storage::init_with_layout(registry, backend, layout)?;
    match fill(&out) {
        Ok(()) => Ok(out),
        Err(err) => {
            if let Err(cleanup) = out.free(registry) {
                tracing::debug!(error = %cleanup, "output_cleanup_failed");
            }
            Err(err)
        }
    }
}
