#![forbid(unsafe_code)]

//! AD engine layered above the IR: a node graph keyed by the upper half
//! of `Index64` handles, gradient accumulation, forward/backward
//! traversal, custom ops, isolation boundaries, and implicit-dependency
//! capture.

mod custom;
mod graph;
mod ops;

use std::cell::RefCell;

use log::trace;
use vx_core::{BackendKind, Index64, VarType};
use vx_ir::{IrContext, IrError};

pub use custom::CustomOp;
pub use graph::{AdFlag, AdMode};
use graph::{AdGraph, Edge, Weight};

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum AdError {
    Ir(IrError),
    InvalidNode(u32),
    /// Failure raised by a custom op's forward/backward callback.
    Custom(String),
}

impl std::fmt::Display for AdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ir(err) => write!(f, "IR error: {err}"),
            Self::InvalidNode(id) => write!(f, "invalid AD node a{id}"),
            Self::Custom(detail) => write!(f, "custom op failed: {detail}"),
        }
    }
}

impl std::error::Error for AdError {}

impl From<IrError> for AdError {
    fn from(value: IrError) -> Self {
        Self::Ir(value)
    }
}

// ── Context ────────────────────────────────────────────────────────

/// The AD engine bound to (and owning) an IR engine, mirroring the
/// layering of the composite handle: `ad_*` operations consult both
/// graphs, plain IR operations go through [`AdContext::ir`].
pub struct AdContext {
    ir: IrContext,
    graph: RefCell<AdGraph>,
}

impl AdContext {
    #[must_use]
    pub fn new(backend: BackendKind) -> Self {
        Self {
            ir: IrContext::new(backend),
            graph: RefCell::new(AdGraph::new()),
        }
    }

    #[must_use]
    pub fn ir(&self) -> &IrContext {
        &self.ir
    }

    // ── Handle management ──────────────────────────────────────────

    /// Promote an IR handle to a tracked leaf variable. Takes a borrowed
    /// handle; the returned composite owns references to both halves.
    pub fn var_new(&self, ir_handle: u32) -> Result<Index64, AdError> {
        let ty = self.ir.var_type(ir_handle)?;
        let size = self.ir.var_size(ir_handle)?;
        self.ir.inc_ref(ir_handle)?;
        let node = self.graph.borrow_mut().alloc(ty, size, Vec::new());
        Ok(Index64::new(node, ir_handle))
    }

    /// Value-identical copy with a fresh AD node that depends on the
    /// original through an identity edge, so gradients accumulated on
    /// the copy do not land on the original.
    pub fn var_copy(&self, handle: Index64) -> Result<Index64, AdError> {
        self.ir.inc_ref(handle.ir_id())?;
        if !handle.is_tracked() {
            return Ok(handle.detached());
        }
        let ty = self.ir.var_type(handle.ir_id())?;
        let size = self.ir.var_size(handle.ir_id())?;
        let one = self.one_literal(ty);
        let node = self.alloc_node(
            ty,
            size,
            vec![Edge {
                source: handle.ad_id(),
                weight: Weight::Partial(one),
            }],
        )?;
        Ok(Index64::new(node, handle.ir_id()))
    }

    pub fn ad_inc_ref(&self, id: u32) -> Result<(), AdError> {
        if id != 0 {
            self.graph.borrow_mut().inc_ref(id)?;
        }
        Ok(())
    }

    pub fn ad_dec_ref(&self, id: u32) -> Result<(), AdError> {
        if id != 0 {
            self.graph.borrow_mut().dec_ref(id, &self.ir)?;
        }
        Ok(())
    }

    /// Acquire one reference on both halves of a composite handle.
    pub fn retain(&self, handle: Index64) -> Result<Index64, AdError> {
        if handle.ir_id() != 0 {
            self.ir.inc_ref(handle.ir_id())?;
        }
        self.ad_inc_ref(handle.ad_id())?;
        Ok(handle)
    }

    /// Release one reference on both halves of a composite handle.
    pub fn release(&self, handle: Index64) -> Result<(), AdError> {
        if handle.ir_id() != 0 {
            self.ir.dec_ref(handle.ir_id())?;
        }
        self.ad_dec_ref(handle.ad_id())
    }

    pub(crate) fn alloc_node(
        &self,
        ty: VarType,
        size: usize,
        edges: Vec<Edge>,
    ) -> Result<u32, AdError> {
        let mut graph = self.graph.borrow_mut();
        for edge in &edges {
            graph.inc_ref(edge.source)?;
        }
        Ok(graph.alloc(ty, size, edges))
    }

    pub(crate) fn one_literal(&self, ty: VarType) -> u32 {
        let bits = match ty {
            VarType::F64 => vx_core::pack_f64(1.0),
            VarType::F32 => vx_core::pack_f32(1.0),
            _ => 1,
        };
        self.ir.literal(ty, bits, 1)
    }

    // ── Gradients ──────────────────────────────────────────────────

    /// Owned handle of the gradient accumulated on a node; a zero
    /// literal of the node's type and size when nothing accumulated yet.
    pub fn grad_of(&self, id: u32) -> Result<u32, AdError> {
        let (grad, ty, size) = {
            let graph = self.graph.borrow();
            let node = graph.node(id)?;
            (node.grad, node.ty, node.size)
        };
        if grad != 0 {
            self.ir.inc_ref(grad)?;
            Ok(grad)
        } else {
            Ok(self.ir.zero(ty, size))
        }
    }

    pub fn grad(&self, handle: Index64) -> Result<u32, AdError> {
        self.grad_of(handle.ad_id())
    }

    /// Add `value` (borrowed IR handle) into the gradient of a node.
    pub fn accum_grad(&self, handle: Index64, value: u32) -> Result<(), AdError> {
        self.accum_node_grad_borrowed(handle.ad_id(), value)
    }

    /// Like [`AdContext::accum_grad`], addressed by node id.
    pub fn accum_grad_id(&self, id: u32, value: u32) -> Result<(), AdError> {
        self.accum_node_grad_borrowed(id, value)
    }

    fn accum_node_grad_borrowed(&self, id: u32, value: u32) -> Result<(), AdError> {
        self.ir.inc_ref(value)?;
        self.accum_node_grad_owned(id, value)
    }

    /// Like `accum_node_grad_borrowed` but consumes the caller's
    /// reference to `value`.
    pub(crate) fn accum_node_grad_owned(&self, id: u32, value: u32) -> Result<(), AdError> {
        let previous = {
            let graph = self.graph.borrow();
            graph.node(id)?.grad
        };
        let next = if previous == 0 {
            value
        } else {
            let sum = self.ir.add(previous, value)?;
            self.ir.dec_ref(previous)?;
            self.ir.dec_ref(value)?;
            sum
        };
        self.graph.borrow_mut().node_mut(id)?.grad = next;
        Ok(())
    }

    pub fn clear_grad(&self, handle: Index64) -> Result<(), AdError> {
        let id = handle.ad_id();
        let previous = {
            let mut graph = self.graph.borrow_mut();
            std::mem::replace(&mut graph.node_mut(id)?.grad, 0)
        };
        if previous != 0 {
            self.ir.dec_ref(previous)?;
        }
        Ok(())
    }

    // ── Traversal ──────────────────────────────────────────────────

    pub fn enqueue(&self, _mode: AdMode, handle: Index64) {
        if handle.is_tracked() {
            self.graph.borrow_mut().queue.push(handle.ad_id());
        }
    }

    /// Like [`AdContext::enqueue`], addressed by node id.
    pub fn enqueue_id(&self, mode: AdMode, id: u32) {
        if id != 0 {
            self.enqueue(mode, Index64::new(id, 0));
        }
    }

    /// Sweep the live tape and propagate gradients. Backward visits
    /// nodes in descending creation order, forward ascending; the sweep
    /// stops at the innermost isolation boundary, so traversal never
    /// escapes into the enclosing graph.
    pub fn traverse(&self, mode: AdMode, _flags: AdFlag) -> Result<(), AdError> {
        let (lo, hi) = {
            let mut graph = self.graph.borrow_mut();
            graph.queue.clear();
            let lo = graph.boundaries.last().map_or(0, |b| b.watermark);
            (lo, graph.nodes.len() as u32 - 1)
        };
        trace!("ad traverse {mode:?} over ({lo}, {hi}]");
        match mode {
            AdMode::Backward => {
                for id in ((lo + 1)..=hi).rev() {
                    self.process(id, mode)?;
                }
            }
            AdMode::Forward => {
                for id in (lo + 1)..=hi {
                    self.process(id, mode)?;
                }
            }
        }
        Ok(())
    }

    fn process(&self, id: u32, mode: AdMode) -> Result<(), AdError> {
        enum Action {
            Skip,
            Custom,
            Edges(Vec<EdgeSnapshot>),
        }
        struct EdgeSnapshot {
            source: u32,
            weight: WeightSnapshot,
        }

        let action = {
            let graph = self.graph.borrow();
            let Ok(node) = graph.node(id) else {
                return Ok(());
            };
            if node.custom.is_some() {
                let triggers = match mode {
                    AdMode::Backward => &node.custom_outputs,
                    AdMode::Forward => &node.custom_inputs,
                };
                let fired = triggers
                    .iter()
                    .any(|t| graph.node(*t).map(|n| n.grad != 0).unwrap_or(false));
                if fired { Action::Custom } else { Action::Skip }
            } else {
                match mode {
                    AdMode::Backward => {
                        if node.grad == 0 || node.edges.is_empty() {
                            Action::Skip
                        } else {
                            Action::Edges(
                                node.edges
                                    .iter()
                                    .map(|e| EdgeSnapshot {
                                        source: e.source,
                                        weight: snapshot(&e.weight),
                                    })
                                    .collect(),
                            )
                        }
                    }
                    AdMode::Forward => {
                        let live: Vec<EdgeSnapshot> = node
                            .edges
                            .iter()
                            .filter(|e| {
                                graph
                                    .node(e.source)
                                    .map(|n| n.grad != 0)
                                    .unwrap_or(false)
                            })
                            .map(|e| EdgeSnapshot {
                                source: e.source,
                                weight: snapshot(&e.weight),
                            })
                            .collect();
                        if live.is_empty() {
                            Action::Skip
                        } else {
                            Action::Edges(live)
                        }
                    }
                }
            }
        };

        match action {
            Action::Skip => Ok(()),
            Action::Custom => {
                let op = self.graph.borrow_mut().node_mut(id)?.custom.take();
                let Some(op) = op else { return Ok(()) };
                trace!("ad traverse invokes custom op '{}'", op.name());
                let result = match mode {
                    AdMode::Backward => op.backward(self),
                    AdMode::Forward => op.forward(self),
                };
                // The op slot stays reusable even if the callback failed.
                self.graph.borrow_mut().node_mut(id)?.custom = Some(op);
                result
            }
            Action::Edges(edges) => {
                for edge in edges {
                    match mode {
                        AdMode::Backward => {
                            let grad = self.grad_of(id)?;
                            let contribution = self.weight_backward(&edge.weight, grad)?;
                            self.ir.dec_ref(grad)?;
                            self.accum_node_grad_owned(edge.source, contribution)?;
                        }
                        AdMode::Forward => {
                            let tangent = self.grad_of(edge.source)?;
                            let node_size = self.graph.borrow().node(id)?.size;
                            let contribution =
                                self.weight_forward(&edge.weight, tangent, node_size)?;
                            self.ir.dec_ref(tangent)?;
                            self.accum_node_grad_owned(id, contribution)?;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn weight_backward(&self, weight: &WeightSnapshot, grad: u32) -> Result<u32, AdError> {
        match weight {
            WeightSnapshot::Partial(partial) => Ok(self.ir.mul(*partial, grad)?),
            WeightSnapshot::Gather {
                index,
                mask,
                source_size,
            } => {
                let ty = self.ir.var_type(grad)?;
                let zero = self.ir.zero(ty, *source_size);
                let out = self
                    .ir
                    .scatter(zero, grad, *index, *mask, vx_core::ReduceOp::Add)?;
                self.ir.dec_ref(zero)?;
                Ok(out)
            }
            WeightSnapshot::ScatterValue { index, mask } => {
                Ok(self.ir.gather(grad, *index, *mask)?)
            }
            WeightSnapshot::ScatterTarget { index, mask } => {
                // Overwritten lanes contribute nothing to the carried target.
                let ty = self.ir.var_type(grad)?;
                let zero = self.ir.zero(ty, 1);
                let out = self
                    .ir
                    .scatter(grad, zero, *index, *mask, vx_core::ReduceOp::None)?;
                self.ir.dec_ref(zero)?;
                Ok(out)
            }
            WeightSnapshot::Null => {
                let ty = self.ir.var_type(grad)?;
                Ok(self.ir.zero(ty, 1))
            }
        }
    }

    fn weight_forward(
        &self,
        weight: &WeightSnapshot,
        tangent: u32,
        node_size: usize,
    ) -> Result<u32, AdError> {
        match weight {
            WeightSnapshot::Partial(partial) => Ok(self.ir.mul(*partial, tangent)?),
            WeightSnapshot::Gather { index, mask, .. } => {
                Ok(self.ir.gather(tangent, *index, *mask)?)
            }
            WeightSnapshot::ScatterValue { index, mask } => {
                let ty = self.ir.var_type(tangent)?;
                let zero = self.ir.zero(ty, node_size);
                let out = self
                    .ir
                    .scatter(zero, tangent, *index, *mask, vx_core::ReduceOp::None)?;
                self.ir.dec_ref(zero)?;
                Ok(out)
            }
            WeightSnapshot::ScatterTarget { index, mask } => {
                let ty = self.ir.var_type(tangent)?;
                let zero = self.ir.zero(ty, 1);
                let out = self
                    .ir
                    .scatter(tangent, zero, *index, *mask, vx_core::ReduceOp::None)?;
                self.ir.dec_ref(zero)?;
                Ok(out)
            }
            WeightSnapshot::Null => {
                let ty = self.ir.var_type(tangent)?;
                Ok(self.ir.zero(ty, 1))
            }
        }
    }

    // ── Custom ops ─────────────────────────────────────────────────

    /// Attach a custom op between the given input and output nodes.
    /// Returns false (without taking the op) when no differentiable
    /// input or output participates, i.e. the hook is not needed.
    /// `retained` names borrowed IR handles the node must keep alive for
    /// the op's later forward/backward invocations.
    pub fn custom_op(
        &self,
        op: Box<dyn CustomOp>,
        inputs: &[u32],
        outputs: &[u32],
        retained: &[u32],
    ) -> Result<bool, AdError> {
        if inputs.is_empty() || outputs.is_empty() {
            return Ok(false);
        }
        trace!(
            "attach custom op '{}' ({} inputs, {} outputs)",
            op.name(),
            inputs.len(),
            outputs.len()
        );
        for handle in retained {
            self.ir.inc_ref(*handle)?;
        }
        let node_id = {
            let mut graph = self.graph.borrow_mut();
            for input in inputs {
                graph.inc_ref(*input)?;
            }
            let id = graph.alloc(VarType::F64, 1, Vec::new());
            let node = graph.node_mut(id)?;
            node.custom = Some(op);
            node.custom_inputs = inputs.to_vec();
            node.custom_outputs = outputs.to_vec();
            node.held_ir = retained.to_vec();
            id
        };
        // Each output keeps the op alive through a structural edge; the
        // construction reference is handed over to the first of them.
        let mut graph = self.graph.borrow_mut();
        for (position, output) in outputs.iter().enumerate() {
            if position > 0 {
                graph.inc_ref(node_id)?;
            }
            graph.node_mut(*output)?.edges.push(Edge {
                source: node_id,
                weight: Weight::Null,
            });
        }
        Ok(true)
    }

    // ── Isolation boundaries & implicit dependencies ───────────────

    pub fn isolation_push(&self) {
        let mut graph = self.graph.borrow_mut();
        let watermark = graph.watermark();
        graph.boundaries.push(graph::Boundary {
            watermark,
            implicit: Vec::new(),
        });
    }

    pub fn isolation_pop(&self) {
        self.graph.borrow_mut().boundaries.pop();
    }

    #[must_use]
    pub fn isolation_depth(&self) -> usize {
        self.graph.borrow().boundaries.len()
    }

    /// Record a value that entered the current isolation scope from
    /// outside: an implicit dependency of whatever is being recorded.
    pub fn check_implicit(&self, handle: Index64) {
        if !handle.is_tracked() {
            return;
        }
        let mut graph = self.graph.borrow_mut();
        let Some(boundary) = graph.boundaries.last_mut() else {
            return;
        };
        let id = handle.ad_id();
        if id < boundary.watermark && !boundary.implicit.contains(&id) {
            boundary.implicit.push(id);
        }
    }

    #[must_use]
    pub fn copy_implicit_deps(&self) -> Vec<u32> {
        self.graph
            .borrow()
            .boundaries
            .last()
            .map(|b| b.implicit.clone())
            .unwrap_or_default()
    }
}

/// Plain-data copy of an edge weight, safe to use while the graph is
/// unborrowed; the owning node stays alive for the duration of `process`.
enum WeightSnapshot {
    Partial(u32),
    Gather {
        index: u32,
        mask: u32,
        source_size: usize,
    },
    ScatterValue {
        index: u32,
        mask: u32,
    },
    ScatterTarget {
        index: u32,
        mask: u32,
    },
    Null,
}

fn snapshot(weight: &Weight) -> WeightSnapshot {
    match weight {
        Weight::Partial(partial) => WeightSnapshot::Partial(*partial),
        Weight::Gather {
            index,
            mask,
            source_size,
        } => WeightSnapshot::Gather {
            index: *index,
            mask: *mask,
            source_size: *source_size,
        },
        Weight::ScatterValue { index, mask } => WeightSnapshot::ScatterValue {
            index: *index,
            mask: *mask,
        },
        Weight::ScatterTarget { index, mask } => WeightSnapshot::ScatterTarget {
            index: *index,
            mask: *mask,
        },
        Weight::Null => WeightSnapshot::Null,
    }
}

/// RAII wrapper around an isolation boundary: backward traversal inside
/// the scope cannot escape into the enclosing AD graph, and implicit
/// dependencies observed inside the scope are collected on the frame.
pub struct IsolationGuard<'a> {
    ctx: &'a AdContext,
}

impl<'a> IsolationGuard<'a> {
    #[must_use]
    pub fn new(ctx: &'a AdContext) -> Self {
        ctx.isolation_push();
        Self { ctx }
    }
}

impl Drop for IsolationGuard<'_> {
    fn drop(&mut self) {
        self.ctx.isolation_pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(ctx: &AdContext, values: &[f64]) -> Index64 {
        let ir = ctx.ir().array_f64(values);
        let handle = ctx.var_new(ir).expect("leaf");
        ctx.ir().dec_ref(ir).expect("release plain half");
        handle
    }

    #[test]
    fn backward_through_mul_chain() {
        let ctx = AdContext::new(BackendKind::Host);
        let x = leaf(&ctx, &[3.0]);
        let y = leaf(&ctx, &[4.0]);
        // z = x * y + x  →  dz/dx = y + 1, dz/dy = x
        let xy = ctx.mul(x, y).expect("mul");
        let z = ctx.add(xy, x).expect("add");

        let seed = ctx.ir().literal_f64(1.0, 1);
        ctx.accum_grad(z, seed).expect("seed");
        ctx.ir().dec_ref(seed).expect("release seed");
        ctx.enqueue(AdMode::Backward, z);
        ctx.traverse(AdMode::Backward, AdFlag::ClearNone)
            .expect("traverse");

        let gx = ctx.grad(x).expect("grad x");
        let gy = ctx.grad(y).expect("grad y");
        assert_eq!(ctx.ir().to_vec_f64(gx).expect("gx"), vec![5.0]);
        assert_eq!(ctx.ir().to_vec_f64(gy).expect("gy"), vec![3.0]);
    }

    #[test]
    fn forward_through_scale() {
        let ctx = AdContext::new(BackendKind::Host);
        let x = leaf(&ctx, &[2.0]);
        let three = ctx.ir().literal_f64(3.0, 1);
        let x3 = ctx.mul(x, Index64::from_ir(three)).expect("mul");

        let seed = ctx.ir().literal_f64(1.0, 1);
        ctx.accum_grad(x, seed).expect("seed");
        ctx.ir().dec_ref(seed).expect("release seed");
        ctx.enqueue(AdMode::Forward, x);
        ctx.traverse(AdMode::Forward, AdFlag::ClearNone)
            .expect("traverse");

        let tangent = ctx.grad(x3).expect("tangent");
        assert_eq!(ctx.ir().to_vec_f64(tangent).expect("t"), vec![3.0]);
    }

    #[test]
    fn gather_backward_scatters_gradient() {
        let ctx = AdContext::new(BackendKind::Host);
        let source = leaf(&ctx, &[1.0, 2.0, 3.0]);
        let index = ctx.ir().array_u32(&[2, 2, 0]);
        let mask = ctx.ir().bool_const(true);
        let gathered = ctx.gather(source, index, mask).expect("gather");

        let seed = ctx.ir().literal_f64(1.0, 3);
        ctx.accum_grad(gathered, seed).expect("seed");
        ctx.ir().dec_ref(seed).expect("release seed");
        ctx.traverse(AdMode::Backward, AdFlag::ClearNone)
            .expect("traverse");

        let grad = ctx.grad(source).expect("grad");
        assert_eq!(
            ctx.ir().to_vec_f64(grad).expect("g"),
            vec![1.0, 0.0, 2.0]
        );
    }

    #[test]
    fn untracked_inputs_stay_untracked() {
        let ctx = AdContext::new(BackendKind::Host);
        let a = ctx.ir().array_f64(&[1.0]);
        let b = ctx.ir().array_f64(&[2.0]);
        let sum = ctx
            .add(Index64::from_ir(a), Index64::from_ir(b))
            .expect("add");
        assert!(!sum.is_tracked());

        // Integer arithmetic is never tracked, even with tracked inputs.
        let x = ctx.ir().array_u32(&[1]);
        let tracked_x = ctx.var_new(x).expect("var new");
        let y = ctx.ir().array_u32(&[2]);
        let isum = ctx.add(tracked_x, Index64::from_ir(y)).expect("add");
        assert!(!isum.is_tracked());
    }

    #[test]
    fn isolation_boundary_stops_backward_sweep() {
        let ctx = AdContext::new(BackendKind::Host);
        let outer = leaf(&ctx, &[2.0]);
        let outer_sq = ctx.mul(outer, outer).expect("mul");

        {
            let _guard = IsolationGuard::new(&ctx);
            let inner = ctx.var_copy(outer_sq).expect("copy");
            let seed = ctx.ir().literal_f64(1.0, 1);
            ctx.accum_grad(inner, seed).expect("seed");
            ctx.ir().dec_ref(seed).expect("release seed");
            ctx.traverse(AdMode::Backward, AdFlag::ClearNone)
                .expect("traverse");

            // The cotangent reached the boundary node but not `outer`.
            let at_boundary = ctx.grad(outer_sq).expect("boundary grad");
            assert_eq!(ctx.ir().to_vec_f64(at_boundary).expect("b"), vec![1.0]);
            let at_outer = ctx.grad(outer).expect("outer grad");
            assert_eq!(ctx.ir().to_vec_f64(at_outer).expect("o"), vec![0.0]);
        }
        assert_eq!(ctx.isolation_depth(), 0);
    }

    #[test]
    fn implicit_deps_are_captured_inside_boundary() {
        let ctx = AdContext::new(BackendKind::Host);
        let outer = leaf(&ctx, &[1.0]);
        ctx.isolation_push();
        ctx.check_implicit(outer);
        ctx.check_implicit(outer);
        assert_eq!(ctx.copy_implicit_deps(), vec![outer.ad_id()]);
        ctx.isolation_pop();
        assert!(ctx.copy_implicit_deps().is_empty());
    }
}
