//! Lazily evaluated computation graph.
//!
//! Nodes are added without computing anything; only the output layout is
//! inferred. [`Graph::evaluate`] runs the forward of every unevaluated
//! ancestor of a node in topological order and caches each result, so a node
//! is computed at most once. [`Graph::backward`] walks the same sub-graph in
//! reverse order and accumulates gradients into per-node caches.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use ndstorage::{Backend, CpuBackend, Registry, Storage};
//! use ndstorage::autograd::Graph;
//!
//! let mut registry = Registry::new();
//! let cpu: Arc<dyn Backend> = Arc::new(CpuBackend::new());
//! let mut graph = Graph::new();
//!
//! let a = graph.leaf(Storage::from_vec(&mut registry, &cpu, &[1, 3], vec![1.0, 2.0, 3.0]).unwrap(), true);
//! let b = graph.leaf(Storage::from_vec(&mut registry, &cpu, &[2, 3], vec![0.0; 6]).unwrap(), true);
//! let c = graph.axpy(1.0, a, b).unwrap();
//! let loss = graph.sum(c, &[true, true]).unwrap();
//!
//! graph.backward(&mut registry, loss).unwrap();
//! assert_eq!(graph.grad(a).unwrap().to_vec().unwrap(), vec![2.0, 2.0, 2.0]);
//! graph.free(&mut registry).unwrap();
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};

use crate::backend::Backend;
use crate::error::TensorError;
use crate::layout::Layout;
use crate::operations::axpy_into;
use crate::registry::Registry;
use crate::storage::Storage;

use super::operator::{BackwardArgs, OpContext, Operator};
use super::ops::{AxpyOp, GemmOp, ReshapeOp, SumOp, TransposeOp};

/// Unique identifier for a node in a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// Get the internal index.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A node: either a leaf holding a storage, or an operator over other nodes.
pub struct Node {
    id: NodeId,
    op: Option<Box<dyn Operator>>,
    inputs: Vec<NodeId>,
    output_layout: Layout,
    materialized: Option<Storage>,
    cached_gradient: Option<Storage>,
    op_context: Option<OpContext>,
    backend: Arc<dyn Backend>,
    requires_grad: bool,
    ref_count: usize,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("op", &self.op_name())
            .field("inputs", &self.inputs)
            .field("output_layout", &self.output_layout)
            .field("evaluated", &self.materialized.is_some())
            .field("has_grad", &self.cached_gradient.is_some())
            .field("backend", &self.backend.name())
            .field("requires_grad", &self.requires_grad)
            .field("ref_count", &self.ref_count)
            .finish()
    }
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Operator name, `"leaf"` for leaves.
    pub fn op_name(&self) -> &'static str {
        self.op.as_ref().map_or("leaf", |op| op.name())
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    /// Inferred layout of the output.
    pub fn output_layout(&self) -> &Layout {
        &self.output_layout
    }

    pub fn is_leaf(&self) -> bool {
        self.op.is_none()
    }

    /// Whether the output has been computed and cached.
    pub fn is_evaluated(&self) -> bool {
        self.materialized.is_some()
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Number of consumer edges.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }
}

/// DAG of nodes with cached forward results and gradients.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    /// input -> consumer edges; node weights are indices into `nodes`
    deps: DiGraph<usize, ()>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Get node by ID.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    fn get(&self, id: NodeId) -> Result<&Node, TensorError> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| TensorError::InvalidOperation(format!("unknown node {id}")))
    }

    fn push(&mut self, mut node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        node.id = id;
        let index = self.deps.add_node(id.0);
        for input in &node.inputs {
            self.deps.add_edge(NodeIndex::new(input.0), index, ());
        }
        self.nodes.push(node);
        id
    }

    /// Add a leaf holding an already computed storage. The graph takes
    /// ownership and frees it in [`Graph::free`].
    pub fn leaf(&mut self, storage: Storage, requires_grad: bool) -> NodeId {
        self.push(Node {
            id: NodeId(0),
            op: None,
            inputs: Vec::new(),
            output_layout: storage.layout(),
            backend: Arc::clone(storage.backend()),
            materialized: Some(storage),
            cached_gradient: None,
            op_context: None,
            requires_grad,
            ref_count: 0,
        })
    }

    /// Add an operator node over `inputs`. Nothing is computed yet.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` for an unknown input or a wrong input count
    /// - `BackendMismatch` if the inputs live on different backends
    /// - the operator's shape errors from layout inference
    pub fn apply(
        &mut self,
        op: impl Operator + 'static,
        inputs: &[NodeId],
    ) -> Result<NodeId, TensorError> {
        super::operator::check_arity(op.name(), op.arity(), inputs)?;
        let mut layouts = Vec::with_capacity(inputs.len());
        let mut requires_grad = false;
        let mut backend: Option<&Arc<dyn Backend>> = None;
        for &input in inputs {
            let node = self.get(input)?;
            if let Some(first) = backend {
                if first.name() != node.backend.name() {
                    return Err(TensorError::BackendMismatch {
                        left: first.name().to_string(),
                        right: node.backend.name().to_string(),
                    });
                }
            }
            backend = Some(&node.backend);
            layouts.push(node.output_layout);
            requires_grad |= node.requires_grad;
        }
        let backend = backend
            .cloned()
            .ok_or_else(|| TensorError::InvalidOperation(format!("{} has no inputs", op.name())))?;
        let output_layout = op.infer_layout(&layouts)?;

        for &input in inputs {
            self.nodes[input.0].ref_count += 1;
        }
        let id = self.push(Node {
            id: NodeId(0),
            op: Some(Box::new(op)),
            inputs: inputs.to_vec(),
            output_layout,
            materialized: None,
            cached_gradient: None,
            op_context: None,
            backend,
            requires_grad,
            ref_count: 0,
        });
        tracing::trace!(node = %id, op = self.nodes[id.0].op_name(), layout = %output_layout, "graph_apply");
        Ok(id)
    }

    /// `α·a + b` with broadcasting.
    pub fn axpy(&mut self, alpha: f32, a: NodeId, b: NodeId) -> Result<NodeId, TensorError> {
        self.apply(AxpyOp::new(alpha), &[a, b])
    }

    /// Batched `a·b`.
    pub fn gemm(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, TensorError> {
        self.apply(GemmOp::new(), &[a, b])
    }

    /// Transposed view of `a`.
    pub fn transpose(&mut self, a: NodeId, perm: &[usize]) -> Result<NodeId, TensorError> {
        self.apply(TransposeOp::new(perm)?, &[a])
    }

    /// Reshaped view of `a`.
    pub fn reshape(&mut self, a: NodeId, shape: &[isize]) -> Result<NodeId, TensorError> {
        self.apply(ReshapeOp::new(shape), &[a])
    }

    /// Sum of `a` over the masked trailing dims.
    pub fn sum(&mut self, a: NodeId, mask: &[bool]) -> Result<NodeId, TensorError> {
        self.apply(SumOp::new(mask), &[a])
    }

    /// `target` and every node it depends on, in topological order.
    fn schedule(&self, target: NodeId) -> Result<Vec<NodeId>, TensorError> {
        self.get(target)?;
        let mut reachable = HashSet::new();
        let reversed = Reversed(&self.deps);
        let mut dfs = Dfs::new(reversed, NodeIndex::new(target.0));
        while let Some(index) = dfs.next(reversed) {
            reachable.insert(index);
        }
        let order = toposort(&self.deps, None)
            .map_err(|cycle| TensorError::TopologicalSortFailed(cycle.node_id().index()))?;
        Ok(order
            .into_iter()
            .filter(|index| reachable.contains(index))
            .map(|index| NodeId(index.index()))
            .collect())
    }

    /// Compute (or fetch from cache) the output of `id`.
    ///
    /// # Errors
    ///
    /// `TopologicalSortFailed` if the dependencies cannot be ordered,
    /// `ExecutionFailed` if an operator's forward fails.
    #[tracing::instrument(level = "debug", skip(self, registry))]
    pub fn evaluate(&mut self, registry: &mut Registry, id: NodeId) -> Result<&Storage, TensorError> {
        if !self.get(id)?.is_evaluated() {
            for step in self.schedule(id)? {
                if !self.nodes[step.0].is_evaluated() {
                    self.run_forward(registry, step)?;
                }
            }
        }
        self.get(id)?
            .materialized
            .as_ref()
            .ok_or_else(|| TensorError::InvalidOperation(format!("node {id} has no output")))
    }

    fn run_forward(&mut self, registry: &mut Registry, id: NodeId) -> Result<(), TensorError> {
        let node = &self.nodes[id.0];
        let Some(op) = node.op.as_ref() else {
            return Err(TensorError::InvalidOperation(format!(
                "leaf {id} has no storage"
            )));
        };
        let inputs = node
            .inputs
            .iter()
            .map(|input| {
                self.nodes[input.0]
                    .materialized
                    .as_ref()
                    .ok_or_else(|| TensorError::ExecutionFailed {
                        op: op.name(),
                        reason: format!("input {input} not evaluated"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (output, ctx) = op
            .forward(registry, &inputs, node.requires_grad)
            .map_err(|err| TensorError::ExecutionFailed {
                op: op.name(),
                reason: err.to_string(),
            })?;
        tracing::debug!(node = %id, op = op.name(), layout = %output.layout(), "node_evaluated");

        let node = &mut self.nodes[id.0];
        node.materialized = Some(output);
        node.op_context = ctx;
        Ok(())
    }

    /// Allocate a zero gradient for `id` if it has none.
    fn ensure_grad(&mut self, registry: &mut Registry, id: NodeId) -> Result<(), TensorError> {
        let node = &self.nodes[id.0];
        if node.cached_gradient.is_none() {
            let grad =
                Storage::init_with_layout(registry, &node.backend, node.output_layout.to_contiguous())?;
            self.nodes[id.0].cached_gradient = Some(grad);
        }
        Ok(())
    }

    /// Back-propagate from `root`, seeding its gradient with ones.
    ///
    /// Leaf gradients accumulate across calls; use [`Graph::zero_grad`] to
    /// reset them. Gradients of intermediate nodes are recomputed on every
    /// call.
    ///
    /// # Errors
    ///
    /// `RequiresGradFalse` if `root` does not track gradients, plus the
    /// errors of [`Graph::evaluate`] and of the operators' backward.
    #[tracing::instrument(level = "debug", skip(self, registry))]
    pub fn backward(&mut self, registry: &mut Registry, root: NodeId) -> Result<(), TensorError> {
        self.evaluate(registry, root)?;
        if !self.nodes[root.0].requires_grad {
            return Err(TensorError::RequiresGradFalse(root.0));
        }

        let order = self.schedule(root)?;
        for &id in &order {
            let node = &mut self.nodes[id.0];
            if node.is_leaf() {
                continue;
            }
            if let Some(stale) = node.cached_gradient.take() {
                stale.free(registry)?;
            }
        }

        self.ensure_grad(registry, root)?;
        {
            let node = &self.nodes[root.0];
            let layout = node.output_layout.to_contiguous();
            let backend = Arc::clone(&node.backend);
            let grad = node.cached_gradient.as_ref();
            registry.with_recording(|registry| {
                let ones = Storage::init_with_layout(registry, &backend, layout)?;
                ones.fill(1.0)?;
                match grad {
                    Some(grad) => axpy_into(1.0, &ones, grad),
                    None => Err(TensorError::GradientNotAvailable(root.0)),
                }
            })?;
        }

        for &id in order.iter().rev() {
            let node = &self.nodes[id.0];
            if node.is_leaf() || !node.requires_grad || node.cached_gradient.is_none() {
                continue;
            }
            let targets: Vec<NodeId> = node
                .inputs
                .iter()
                .copied()
                .filter(|input| self.nodes[input.0].requires_grad)
                .collect();
            for input in targets {
                self.ensure_grad(registry, input)?;
            }
            self.run_backward(registry, id)?;
        }
        Ok(())
    }

    fn run_backward(&self, registry: &mut Registry, id: NodeId) -> Result<(), TensorError> {
        let node = &self.nodes[id.0];
        let (Some(op), Some(output), Some(grad_output)) = (
            node.op.as_ref(),
            node.materialized.as_ref(),
            node.cached_gradient.as_ref(),
        ) else {
            return Ok(());
        };

        let mut inputs = Vec::with_capacity(node.inputs.len());
        let mut grad_inputs = Vec::with_capacity(node.inputs.len());
        let mut requires_grad = Vec::with_capacity(node.inputs.len());
        for input in &node.inputs {
            let input = &self.nodes[input.0];
            inputs.push(
                input
                    .materialized
                    .as_ref()
                    .ok_or(TensorError::GradientNotAvailable(input.id.0))?,
            );
            grad_inputs.push(input.cached_gradient.as_ref());
            requires_grad.push(input.requires_grad);
        }

        tracing::trace!(node = %id, op = op.name(), "node_backward");
        op.backward(
            registry,
            &BackwardArgs {
                inputs: &inputs,
                output,
                grad_output,
                ctx: node.op_context.as_ref(),
                grad_inputs: &grad_inputs,
                requires_grad: &requires_grad,
            },
        )
    }

    /// Cached gradient of `id`.
    ///
    /// # Errors
    ///
    /// `RequiresGradFalse` if the node does not track gradients,
    /// `GradientNotAvailable` if no backward pass has reached it.
    pub fn grad(&self, id: NodeId) -> Result<&Storage, TensorError> {
        let node = self.get(id)?;
        if !node.requires_grad {
            return Err(TensorError::RequiresGradFalse(id.0));
        }
        node.cached_gradient
            .as_ref()
            .ok_or(TensorError::GradientNotAvailable(id.0))
    }

    /// Release every cached gradient.
    pub fn zero_grad(&mut self, registry: &mut Registry) -> Result<(), TensorError> {
        let mut first_error = None;
        for node in &mut self.nodes {
            if let Some(grad) = node.cached_gradient.take() {
                if let Err(err) = grad.free(registry) {
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Release every cached output (leaves included) and gradient.
    ///
    /// Outputs are freed consumers first so that views leave their bucket
    /// before the storage they view. Keeps going past failures and returns
    /// the first error.
    pub fn free(mut self, registry: &mut Registry) -> Result<(), TensorError> {
        let mut first_error = self.zero_grad(registry).err();
        for node in self.nodes.iter_mut().rev() {
            node.op_context = None;
            if let Some(output) = node.materialized.take() {
                if let Err(err) = output.free(registry) {
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;

    fn cpu() -> Arc<dyn Backend> {
        Arc::new(CpuBackend::new())
    }

    fn leaf(graph: &mut Graph, registry: &mut Registry, shape: &[usize], values: Vec<f32>) -> NodeId {
        let storage = Storage::from_vec(registry, &cpu(), shape, values).unwrap();
        graph.leaf(storage, true)
    }

    #[test]
    fn test_apply_is_lazy() {
        let mut registry = Registry::new();
        let mut graph = Graph::new();
        let a = leaf(&mut graph, &mut registry, &[2, 3], vec![1.0; 6]);
        let b = leaf(&mut graph, &mut registry, &[3, 4], vec![1.0; 12]);
        let c = graph.gemm(a, b).unwrap();
        assert!(!graph.node(c).unwrap().is_evaluated());
        assert_eq!(graph.node(c).unwrap().output_layout().dims(2), &[2, 4]);
        assert_eq!(graph.node(a).unwrap().ref_count(), 1);
        assert_eq!(registry.len(), 2);
        graph.free(&mut registry).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_apply_checks_shapes_and_arity() {
        let mut registry = Registry::new();
        let mut graph = Graph::new();
        let a = leaf(&mut graph, &mut registry, &[2, 3], vec![1.0; 6]);
        assert!(matches!(
            graph.gemm(a, a),
            Err(TensorError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            graph.apply(SumOp::new(&[true]), &[a, a]),
            Err(TensorError::InvalidOperation(_))
        ));
        assert!(matches!(
            graph.sum(NodeId(42), &[true]),
            Err(TensorError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_evaluate_caches() {
        let mut registry = Registry::new();
        let mut graph = Graph::new();
        let a = leaf(&mut graph, &mut registry, &[2], vec![1.0, 2.0]);
        let b = graph.axpy(2.0, a, a).unwrap();
        let c = graph.axpy(1.0, b, a).unwrap();
        assert_eq!(graph.evaluate(&mut registry, c).unwrap().to_vec().unwrap(), vec![4.0, 8.0]);
        assert!(graph.node(b).unwrap().is_evaluated());
        let tracked = registry.len();
        graph.evaluate(&mut registry, c).unwrap();
        assert_eq!(registry.len(), tracked);
        graph.free(&mut registry).unwrap();
    }

    #[test]
    fn test_diamond_gradient_accumulates() {
        // c = a + a, so dc/da = 2 even though a has two consumer edges
        let mut registry = Registry::new();
        let mut graph = Graph::new();
        let a = leaf(&mut graph, &mut registry, &[3], vec![1.0, 2.0, 3.0]);
        let c = graph.axpy(1.0, a, a).unwrap();
        graph.backward(&mut registry, c).unwrap();
        assert_eq!(graph.grad(a).unwrap().to_vec().unwrap(), vec![2.0; 3]);
        assert_eq!(graph.node(a).unwrap().ref_count(), 2);
        graph.free(&mut registry).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_grad_errors() {
        let mut registry = Registry::new();
        let mut graph = Graph::new();
        let a = leaf(&mut graph, &mut registry, &[2], vec![1.0, 2.0]);
        let frozen = Storage::from_vec(&mut registry, &cpu(), &[2], vec![1.0, 1.0]).unwrap();
        let k = graph.leaf(frozen, false);
        assert_eq!(graph.grad(a).unwrap_err(), TensorError::GradientNotAvailable(a.index()));
        assert_eq!(graph.grad(k).unwrap_err(), TensorError::RequiresGradFalse(k.index()));
        assert_eq!(
            graph.backward(&mut registry, k).unwrap_err(),
            TensorError::RequiresGradFalse(k.index())
        );

        let c = graph.axpy(1.0, a, k).unwrap();
        graph.backward(&mut registry, c).unwrap();
        assert!(graph.grad(a).is_ok());
        assert!(graph.grad(k).is_err());
        graph.free(&mut registry).unwrap();
    }

    #[test]
    fn test_forward_failure_is_execution_failed() {
        #[derive(Debug)]
        struct Broken;
        impl Operator for Broken {
            fn name(&self) -> &'static str {
                "broken"
            }
            fn arity(&self) -> usize {
                1
            }
            fn infer_layout(&self, inputs: &[Layout]) -> Result<Layout, TensorError> {
                Ok(inputs[0])
            }
            fn forward(
                &self,
                _registry: &mut Registry,
                _inputs: &[&Storage],
                _requires_grad: bool,
            ) -> Result<(Storage, Option<OpContext>), TensorError> {
                Err(TensorError::NotImplemented("broken".into()))
            }
            fn backward(
                &self,
                _registry: &mut Registry,
                _args: &BackwardArgs<'_>,
            ) -> Result<(), TensorError> {
                Ok(())
            }
        }

        let mut registry = Registry::new();
        let mut graph = Graph::new();
        let a = leaf(&mut graph, &mut registry, &[2], vec![1.0, 2.0]);
        let b = graph.apply(Broken, &[a]).unwrap();
        assert!(matches!(
            graph.evaluate(&mut registry, b),
            Err(TensorError::ExecutionFailed { op: "broken", .. })
        ));
    }

    #[test]
    fn test_zero_grad_resets() {
        let mut registry = Registry::new();
        let mut graph = Graph::new();
        let a = leaf(&mut graph, &mut registry, &[2], vec![1.0, 2.0]);
        let c = graph.axpy(3.0, a, a).unwrap();
        graph.backward(&mut registry, c).unwrap();
        graph.backward(&mut registry, c).unwrap();
        assert_eq!(graph.grad(a).unwrap().to_vec().unwrap(), vec![8.0, 8.0]);
        graph.zero_grad(&mut registry).unwrap();
        assert!(graph.grad(a).is_err());
        graph.backward(&mut registry, c).unwrap();
        assert_eq!(graph.grad(a).unwrap().to_vec().unwrap(), vec![4.0, 4.0]);
        graph.free(&mut registry).unwrap();
        assert!(registry.is_empty());
    }
}
