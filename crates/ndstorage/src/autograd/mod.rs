//! Reverse-mode automatic differentiation over storages.
//!
//! # Architecture
//!
//! ```text
//! Graph ──owns──► Node { op: Box<dyn Operator>, materialized, cached_gradient }
//!   │                         │
//!   │ petgraph toposort       ├── forward:  inputs → output (+ OpContext)
//!   ▼                         └── backward: grad_output → grad_inputs (+=)
//! evaluate / backward
//! ```
//!
//! Backward temporaries (transposed views, broadcast reductions) are created
//! inside a registry recording scope and released when the operator returns.
//!
//! # Key Types
//!
//! - [`Operator`]: the forward/backward contract
//! - [`Graph`], [`NodeId`]: lazily evaluated DAG with cached results
//! - [`AxpyOp`], [`GemmOp`], [`TransposeOp`], [`ReshapeOp`], [`SumOp`]

mod graph;
mod operator;
mod ops;

pub use graph::{Graph, Node, NodeId};
pub use operator::{BackwardArgs, OpContext, Operator};
pub use ops::{AxpyOp, GemmOp, ReshapeOp, SumOp, TransposeOp};
