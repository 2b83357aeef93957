//! ndstorage - strided storage, aliasing registry and autograd core
//!
//! This crate provides the computational core of a small tensor library:
//! a fixed-rank strided layout engine, backend-polymorphic storage, a
//! registry that frees buffers shared by several views exactly once, and
//! differentiable operators with broadcast-aware gradient accumulation.
//!
//! # Architecture
//!
//! ```text
//! Level 1: Fresh-output API (operations module)
//!     → axpy, gemm, sum, transpose, reshape
//!
//! Level 2: Existing-destination API
//!     → axpy_into, gemm_into, sum_into, copy_into
//!
//! Level 3: Backend implementation (backend module)
//!     → CpuBackend (f32, faer gemm, rayon block copies)
//! ```
//!
//! Every storage is created and freed through a [`Registry`], passed
//! explicitly; there is no global state.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use ndstorage::{BackendRegistry, CpuBackend, Registry, Storage};
//! use ndstorage::operations::{gemm, transpose};
//!
//! let backends = BackendRegistry::with_defaults();
//! let cpu = backends.require(CpuBackend::NAME).unwrap();
//! let mut registry = Registry::new();
//!
//! let a = Storage::from_vec(&mut registry, &cpu, &[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
//! let at = transpose(&mut registry, &a, &[1, 0]).unwrap();
//! let c = gemm(&mut registry, 1.0, &a, &at).unwrap();
//! assert_eq!(c.to_vec().unwrap(), vec![5.0, 11.0, 11.0, 25.0]);
//!
//! // the transposed view shares `a`'s buffer
//! assert_eq!(registry.bucket_size(&a), 2);
//! for s in [c, at, a] {
//!     s.free(&mut registry).unwrap();
//! }
//! assert!(registry.is_empty());
//! ```

#[cfg(feature = "autograd")]
pub mod autograd;
pub mod backend;
pub mod error;
pub mod layout;
pub mod operations;
pub mod registry;
pub mod storage;

pub use backend::{Backend, BackendData, BackendRegistry, CpuBackend, Parallelism};
pub use error::TensorError;
pub use layout::{Layout, RANK};
pub use registry::{RecordId, Registry};
pub use storage::{Storage, StorageSnapshot};
