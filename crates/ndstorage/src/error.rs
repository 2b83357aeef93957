//! Error types for ndstorage.
//!
//! Every variant maps to a small negative status code through
//! [`TensorError::code`]. Codes are banded by subsystem:
//!
//! | band | subsystem |
//! |------|-----------|
//! | `-1..=-9` | general |
//! | `-10..=-19` | storage / backend |
//! | `-20..=-29` | registry |
//! | `-30..=-39` | layout |
//! | `-40..=-49` | graph / autograd |

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in layout, storage, registry and autograd operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TensorError {
    // --- general ---
    /// A required handle was null (only produced at the C boundary).
    #[error("null pointer")]
    NullPointer,

    /// The storage buffer was already released or never allocated.
    #[error("storage not initialized or already released")]
    NotInitialized,

    /// Allocation of a buffer failed.
    #[error("allocation of {len} elements failed")]
    AllocFailed { len: usize },

    /// The requested operation is not supported for the given operands.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    // --- storage ---
    /// Two storages bound to different backends were mixed.
    #[error("backend mismatch: {left} vs {right}")]
    BackendMismatch { left: String, right: String },

    /// Shapes disagree (destination shape, inner gemm dimension, ...).
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Unknown backend name or a backend registered twice.
    #[error("invalid backend: {0}")]
    InvalidBackend(String),

    // --- registry ---
    /// The storage is not tracked by the registry.
    #[error("storage {0} is not registered")]
    NotRegistered(Uuid),

    /// A view was registered against a parent the registry does not know.
    #[error("parent storage {0} is not registered")]
    ParentNotRegistered(Uuid),

    /// The bucket still has live members and cannot be deleted.
    #[error("bucket still holds {remaining} member(s)")]
    BucketNotEmpty { remaining: usize },

    /// No recording scope with this id exists.
    #[error("recording scope {0} not found")]
    RecordNotFound(u64),

    // --- layout ---
    /// Extents differ and neither is 1.
    #[error("cannot broadcast dimension {dim}: {lhs} vs {rhs}")]
    BroadcastError { dim: usize, lhs: usize, rhs: usize },

    /// More dimensions than the fixed maximum rank.
    #[error("rank {ndim} exceeds the maximum rank {max}")]
    RankExceeded { ndim: usize, max: usize },

    /// A permutation repeats or skips a dimension.
    #[error("invalid permutation {perm:?}: duplicate or out-of-range dimension")]
    DuplicateDimension { perm: Vec<usize> },

    /// Index out of bounds.
    #[error("index {index} out of range for dimension {dim} of size {size}")]
    IndexOutOfBounds { dim: usize, index: usize, size: usize },

    /// Reshape target is malformed or does not preserve the element count.
    #[error("invalid reshape target {shape:?} for {size} elements")]
    ReshapeInvalidShape { shape: Vec<isize>, size: usize },

    /// The layout cannot be traversed with a single stride multiplier.
    #[error("layout is not regular")]
    NotRegular,

    /// The layout is not densely packed.
    #[error("layout is not contiguous")]
    NotContiguous,

    // --- graph / autograd ---
    /// The operation is not valid in the current graph state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The node dependencies could not be ordered.
    #[error("topological sort failed: cycle through node {0}")]
    TopologicalSortFailed(usize),

    /// An operator failed while the graph was being evaluated.
    #[error("execution of {op} failed: {reason}")]
    ExecutionFailed { op: &'static str, reason: String },

    /// No gradient has been computed for the node.
    #[error("no gradient available for node {0}")]
    GradientNotAvailable(usize),

    /// A gradient was requested from a node that does not track gradients.
    #[error("node {0} does not require grad")]
    RequiresGradFalse(usize),
}

impl TensorError {
    /// Banded status code for this error. Success (`0`) is never returned.
    pub fn code(&self) -> i32 {
        match self {
            Self::NullPointer => -1,
            Self::NotInitialized => -2,
            Self::AllocFailed { .. } => -3,
            Self::NotImplemented(_) => -4,

            Self::BackendMismatch { .. } => -10,
            Self::ShapeMismatch { .. } => -11,
            Self::InvalidBackend(_) => -12,

            Self::NotRegistered(_) => -20,
            Self::ParentNotRegistered(_) => -21,
            Self::BucketNotEmpty { .. } => -22,
            Self::RecordNotFound(_) => -23,

            Self::BroadcastError { .. } => -30,
            Self::RankExceeded { .. } => -31,
            Self::DuplicateDimension { .. } => -32,
            Self::IndexOutOfBounds { .. } => -33,
            Self::ReshapeInvalidShape { .. } => -34,
            Self::NotRegular => -35,
            Self::NotContiguous => -36,

            Self::InvalidOperation(_) => -40,
            Self::TopologicalSortFailed(_) => -41,
            Self::ExecutionFailed { .. } => -42,
            Self::GradientNotAvailable(_) => -43,
            Self::RequiresGradFalse(_) => -44,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_banded() {
        assert_eq!(TensorError::NotInitialized.code(), -2);
        assert_eq!(
            TensorError::BackendMismatch {
                left: "a".into(),
                right: "b".into()
            }
            .code(),
            -10
        );
        assert_eq!(TensorError::RecordNotFound(3).code(), -23);
        assert_eq!(TensorError::NotRegular.code(), -35);
        assert_eq!(TensorError::GradientNotAvailable(0).code(), -43);
    }

    #[test]
    fn test_display() {
        let err = TensorError::IndexOutOfBounds {
            dim: 7,
            index: 4,
            size: 3,
        };
        assert_eq!(
            err.to_string(),
            "index 4 out of range for dimension 7 of size 3"
        );
    }
}
