#![forbid(unsafe_code)]

//! Reference IR engine for the Vexel JIT.
//!
//! The engine keeps a reference-counted variable table with lazy
//! evaluation, the process-wide scoped stacks (mask, self, recording
//! scope), call bucketizing, aggregation, and the instance registry:
//! the full contract the dispatcher consumes. Evaluation is
//! host-resident; recorded regions are replayed per lane group when an
//! emitted indirect call or loop is materialized.
//!
//! The context is single-threaded cooperative: interior mutability with
//! the rule that no method holds an internal borrow across user code.

mod engine;
mod eval;
pub mod ops;

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use vx_core::{BackendKind, ReduceOp, VarState, VarType, pack_f64, unpack_bool, unpack_f64,
    unpack_i32, unpack_u32};

use engine::Engine;
pub use eval::{AggEntry, CallBucket};
use ops::{BinaryOp, UnaryOp};

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrError {
    InvalidHandle(u32),
    TypeMismatch {
        op: &'static str,
        left: VarType,
        right: VarType,
    },
    SizeMismatch {
        op: &'static str,
        left: usize,
        right: usize,
    },
    StackUnderflow(&'static str),
    /// Direct evaluation of a variable recorded inside a symbolic region.
    SymbolicEval(u32),
    /// A region placeholder was replayed without a binding.
    UnboundRegionInput(u32),
    NotEvaluated(u32),
    UnknownDomain(String),
}

impl std::fmt::Display for IrError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidHandle(handle) => write!(f, "invalid IR handle r{handle}"),
            Self::TypeMismatch { op, left, right } => {
                write!(f, "type mismatch in '{op}': {left} vs {right}")
            }
            Self::SizeMismatch { op, left, right } => {
                write!(f, "size mismatch in '{op}': {left} vs {right}")
            }
            Self::StackUnderflow(stack) => write!(f, "{stack} stack underflow"),
            Self::SymbolicEval(handle) => write!(
                f,
                "r{handle} was recorded inside a symbolic region and cannot be evaluated directly"
            ),
            Self::UnboundRegionInput(handle) => {
                write!(f, "region input r{handle} replayed without a binding")
            }
            Self::NotEvaluated(handle) => write!(f, "r{handle} has not been evaluated yet"),
            Self::UnknownDomain(domain) => write!(f, "unknown registry domain '{domain}'"),
        }
    }
}

impl std::error::Error for IrError {}

/// Snapshot of a variable's descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarInfo {
    pub ty: VarType,
    pub size: usize,
    pub state: VarState,
    pub backend: BackendKind,
}

// ── Context ────────────────────────────────────────────────────────

pub struct IrContext {
    backend: BackendKind,
    inner: RefCell<Engine>,
}

impl IrContext {
    #[must_use]
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            inner: RefCell::new(Engine::new()),
        }
    }

    #[must_use]
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    // ── Reference counting ─────────────────────────────────────────

    pub fn inc_ref(&self, handle: u32) -> Result<(), IrError> {
        self.inner.borrow_mut().inc_ref(handle)
    }

    pub fn dec_ref(&self, handle: u32) -> Result<(), IrError> {
        self.inner.borrow_mut().dec_ref(handle)
    }

    pub fn refcount(&self, handle: u32) -> Result<u32, IrError> {
        self.inner.borrow().refcount(handle)
    }

    // ── Constructors ───────────────────────────────────────────────

    pub fn literal(&self, ty: VarType, bits: u64, size: usize) -> u32 {
        self.inner.borrow_mut().literal(ty, bits, size)
    }

    pub fn literal_f64(&self, value: f64, size: usize) -> u32 {
        self.literal(VarType::F64, pack_f64(value), size)
    }

    pub fn zero(&self, ty: VarType, size: usize) -> u32 {
        self.literal(ty, 0, size)
    }

    pub fn u32_const(&self, value: u32) -> u32 {
        self.inner.borrow_mut().u32_const(value)
    }

    pub fn bool_const(&self, value: bool) -> u32 {
        self.inner.borrow_mut().bool_const(value)
    }

    pub fn array_f64(&self, values: &[f64]) -> u32 {
        let bits = values.iter().map(|v| vx_core::pack_f64(*v)).collect();
        self.inner.borrow_mut().array(VarType::F64, bits)
    }

    pub fn array_i32(&self, values: &[i32]) -> u32 {
        let bits = values.iter().map(|v| vx_core::pack_i32(*v)).collect();
        self.inner.borrow_mut().array(VarType::I32, bits)
    }

    pub fn array_u32(&self, values: &[u32]) -> u32 {
        let bits = values.iter().map(|v| vx_core::pack_u32(*v)).collect();
        self.inner.borrow_mut().array(VarType::U32, bits)
    }

    pub fn array_bool(&self, values: &[bool]) -> u32 {
        let bits = values.iter().map(|v| vx_core::pack_bool(*v)).collect();
        self.inner.borrow_mut().array(VarType::Bool, bits)
    }

    // ── Introspection ──────────────────────────────────────────────

    pub fn var_type(&self, handle: u32) -> Result<VarType, IrError> {
        Ok(self.inner.borrow().slot(handle)?.ty)
    }

    pub fn var_size(&self, handle: u32) -> Result<usize, IrError> {
        Ok(self.inner.borrow().slot(handle)?.size)
    }

    pub fn var_state(&self, handle: u32) -> Result<VarState, IrError> {
        Ok(self.inner.borrow().slot(handle)?.state)
    }

    pub fn var_info(&self, handle: u32) -> Result<VarInfo, IrError> {
        let inner = self.inner.borrow();
        let slot = inner.slot(handle)?;
        Ok(VarInfo {
            ty: slot.ty,
            size: slot.size,
            state: slot.state,
            backend: self.backend,
        })
    }

    #[must_use]
    pub fn is_dirty(&self, handle: u32) -> bool {
        matches!(self.var_state(handle), Ok(VarState::Dirty))
    }

    #[must_use]
    pub fn is_zero_literal(&self, handle: u32) -> bool {
        self.inner.borrow().is_zero_literal(handle)
    }

    // ── Arithmetic / logic ─────────────────────────────────────────

    pub fn add(&self, a: u32, b: u32) -> Result<u32, IrError> {
        self.inner.borrow_mut().binary(BinaryOp::Add, a, b)
    }

    pub fn sub(&self, a: u32, b: u32) -> Result<u32, IrError> {
        self.inner.borrow_mut().binary(BinaryOp::Sub, a, b)
    }

    pub fn mul(&self, a: u32, b: u32) -> Result<u32, IrError> {
        self.inner.borrow_mut().binary(BinaryOp::Mul, a, b)
    }

    pub fn div(&self, a: u32, b: u32) -> Result<u32, IrError> {
        self.inner.borrow_mut().binary(BinaryOp::Div, a, b)
    }

    pub fn min(&self, a: u32, b: u32) -> Result<u32, IrError> {
        self.inner.borrow_mut().binary(BinaryOp::Min, a, b)
    }

    pub fn max(&self, a: u32, b: u32) -> Result<u32, IrError> {
        self.inner.borrow_mut().binary(BinaryOp::Max, a, b)
    }

    pub fn eq(&self, a: u32, b: u32) -> Result<u32, IrError> {
        self.inner.borrow_mut().binary(BinaryOp::Eq, a, b)
    }

    pub fn neq(&self, a: u32, b: u32) -> Result<u32, IrError> {
        self.inner.borrow_mut().binary(BinaryOp::Neq, a, b)
    }

    pub fn lt(&self, a: u32, b: u32) -> Result<u32, IrError> {
        self.inner.borrow_mut().binary(BinaryOp::Lt, a, b)
    }

    pub fn le(&self, a: u32, b: u32) -> Result<u32, IrError> {
        self.inner.borrow_mut().binary(BinaryOp::Le, a, b)
    }

    pub fn gt(&self, a: u32, b: u32) -> Result<u32, IrError> {
        self.inner.borrow_mut().binary(BinaryOp::Gt, a, b)
    }

    pub fn ge(&self, a: u32, b: u32) -> Result<u32, IrError> {
        self.inner.borrow_mut().binary(BinaryOp::Ge, a, b)
    }

    pub fn and(&self, a: u32, b: u32) -> Result<u32, IrError> {
        self.inner.borrow_mut().binary(BinaryOp::And, a, b)
    }

    pub fn or(&self, a: u32, b: u32) -> Result<u32, IrError> {
        self.inner.borrow_mut().binary(BinaryOp::Or, a, b)
    }

    pub fn not(&self, a: u32) -> Result<u32, IrError> {
        self.inner.borrow_mut().unary(UnaryOp::Not, a)
    }

    pub fn neg(&self, a: u32) -> Result<u32, IrError> {
        self.inner.borrow_mut().unary(UnaryOp::Neg, a)
    }

    pub fn abs(&self, a: u32) -> Result<u32, IrError> {
        self.inner.borrow_mut().unary(UnaryOp::Abs, a)
    }

    pub fn sqrt(&self, a: u32) -> Result<u32, IrError> {
        self.inner.borrow_mut().unary(UnaryOp::Sqrt, a)
    }

    pub fn select(&self, cond: u32, a: u32, b: u32) -> Result<u32, IrError> {
        self.inner.borrow_mut().select(cond, a, b)
    }

    pub fn gather(&self, src: u32, index: u32, mask: u32) -> Result<u32, IrError> {
        self.inner.borrow_mut().gather(src, index, mask)
    }

    pub fn scatter(
        &self,
        target: u32,
        value: u32,
        index: u32,
        mask: u32,
        reduce: ReduceOp,
    ) -> Result<u32, IrError> {
        self.inner
            .borrow_mut()
            .scatter(target, value, index, mask, reduce)
    }

    // ── Mask stack ─────────────────────────────────────────────────

    /// Takes ownership of one reference to `mask`.
    pub fn mask_push(&self, mask: u32) -> Result<(), IrError> {
        self.inner.borrow_mut().mask_push(mask)
    }

    pub fn mask_pop(&self) -> Result<(), IrError> {
        self.inner.borrow_mut().mask_pop()
    }

    pub fn mask_default(&self, size: usize) -> u32 {
        self.inner.borrow_mut().mask_default(size)
    }

    /// Placeholder mask bound to the active lanes of the callable being
    /// replayed; owned by the caller.
    pub fn call_mask(&self) -> Result<u32, IrError> {
        self.inner.borrow_mut().call_mask()
    }

    #[must_use]
    pub fn mask_depth(&self) -> usize {
        self.inner.borrow().mask_stack.len()
    }

    // ── Self stack ─────────────────────────────────────────────────

    /// Takes ownership of one reference to `index` when non-zero.
    pub fn self_push(&self, value: u32, index: u32) -> Result<(), IrError> {
        self.inner.borrow_mut().self_push(value, index)
    }

    pub fn self_pop(&self) -> Result<(), IrError> {
        self.inner.borrow_mut().self_pop()
    }

    /// Borrowed view: (current instance id, per-lane id handle or 0).
    #[must_use]
    pub fn self_read(&self) -> (u32, u32) {
        self.inner.borrow().self_read()
    }

    #[must_use]
    pub fn self_depth(&self) -> usize {
        self.inner.borrow().self_stack.len()
    }

    // ── Recording ──────────────────────────────────────────────────

    pub fn record_begin(&self) -> u32 {
        self.inner.borrow_mut().record_begin()
    }

    pub fn record_checkpoint(&self) -> u32 {
        self.inner.borrow_mut().record_checkpoint()
    }

    pub fn record_end(&self, checkpoint: u32, cleanup: bool) -> Result<(), IrError> {
        self.inner.borrow_mut().record_end(checkpoint, cleanup)
    }

    pub fn new_scope(&self) -> u32 {
        self.inner.borrow_mut().new_scope()
    }

    pub fn set_scope(&self, scope: u32) {
        self.inner.borrow_mut().set_scope(scope);
    }

    #[must_use]
    pub fn record_depth(&self) -> usize {
        self.inner.borrow().record_stack.len()
    }

    /// Whether a symbolic region is currently being recorded.
    #[must_use]
    pub fn symbolic(&self) -> bool {
        self.inner.borrow().is_symbolic()
    }

    #[must_use]
    pub fn symbolic_calls(&self) -> bool {
        self.inner.borrow().symbolic_calls
    }

    /// Returns the previous value.
    pub fn set_symbolic_calls(&self, enabled: bool) -> bool {
        let mut inner = self.inner.borrow_mut();
        std::mem::replace(&mut inner.symbolic_calls, enabled)
    }

    // ── Call emission ──────────────────────────────────────────────

    pub fn call_input(&self, src: u32) -> Result<u32, IrError> {
        self.inner.borrow_mut().call_input(src)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn emit_call(
        &self,
        name: &str,
        index: u32,
        mask: u32,
        ids: &[u32],
        inputs: &[u32],
        outputs: &[u32],
        checkpoints: &[u32],
        n_out: usize,
    ) -> Result<Vec<u32>, IrError> {
        self.inner
            .borrow_mut()
            .emit_call(name, index, mask, ids, inputs, outputs, checkpoints, n_out)
    }

    pub fn call_reduce(&self, index: u32) -> Result<Vec<CallBucket>, IrError> {
        self.inner.borrow_mut().call_reduce(index)
    }

    // ── Loop emission ──────────────────────────────────────────────

    pub fn loop_phi(&self, init: u32) -> Result<u32, IrError> {
        self.inner.borrow_mut().loop_phi(init)
    }

    pub fn emit_loop(
        &self,
        name: &str,
        inits: &[u32],
        phis: &[u32],
        cond: u32,
        body: &[u32],
    ) -> Result<Vec<u32>, IrError> {
        self.inner.borrow_mut().emit_loop(name, inits, phis, cond, body)
    }

    // ── Evaluation ─────────────────────────────────────────────────

    pub fn schedule(&self, handle: u32) -> Result<(), IrError> {
        self.inner.borrow_mut().schedule(handle)
    }

    pub fn eval(&self) -> Result<(), IrError> {
        self.inner.borrow_mut().eval_scheduled()
    }

    pub fn read(&self, handle: u32, lane: usize) -> Result<u64, IrError> {
        self.inner.borrow().read(handle, lane)
    }

    pub fn aggregate(&self, ty: VarType, entries: &[AggEntry]) -> Result<u32, IrError> {
        self.inner.borrow_mut().aggregate(ty, entries)
    }

    pub fn to_vec_f64(&self, handle: u32) -> Result<Vec<f64>, IrError> {
        self.decode(handle, unpack_f64)
    }

    pub fn to_vec_u32(&self, handle: u32) -> Result<Vec<u32>, IrError> {
        self.decode(handle, unpack_u32)
    }

    pub fn to_vec_i32(&self, handle: u32) -> Result<Vec<i32>, IrError> {
        self.decode(handle, unpack_i32)
    }

    pub fn to_vec_bool(&self, handle: u32) -> Result<Vec<bool>, IrError> {
        self.decode(handle, unpack_bool)
    }

    fn decode<T>(&self, handle: u32, unpack: impl Fn(u64) -> T) -> Result<Vec<T>, IrError> {
        let mut inner = self.inner.borrow_mut();
        let val = inner.materialize(handle)?;
        let size = inner.slot(handle)?.size;
        let mut out = Vec::with_capacity(size);
        for k in 0..size {
            out.push(unpack(val.elem(k)));
        }
        Ok(out)
    }

    // ── Instance registry ──────────────────────────────────────────

    pub fn registry_put(&self, domain: &str, instance: Rc<dyn Any>) -> u32 {
        self.inner.borrow_mut().registry_put(domain, instance)
    }

    pub fn registry_remove(&self, domain: &str, id: u32) -> Result<(), IrError> {
        self.inner.borrow_mut().registry_remove(domain, id)
    }

    #[must_use]
    pub fn registry_get(&self, domain: &str, id: u32) -> Option<Rc<dyn Any>> {
        self.inner.borrow().registry_get(domain, id)
    }

    #[must_use]
    pub fn registry_bound(&self, domain: &str) -> u32 {
        self.inner.borrow().registry_bound(domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lazy_arithmetic_evaluates_on_read() {
        let ctx = IrContext::new(BackendKind::Host);
        let a = ctx.array_f64(&[1.0, 2.0, 3.0]);
        let b = ctx.literal_f64(10.0, 1);
        let sum = ctx.add(a, b).expect("add");
        assert_eq!(ctx.var_state(sum), Ok(VarState::Unevaluated));
        assert_eq!(ctx.to_vec_f64(sum).expect("eval"), vec![11.0, 12.0, 13.0]);
        assert_eq!(ctx.var_state(sum), Ok(VarState::Evaluated));
    }

    #[test]
    fn gather_respects_mask_and_bounds() {
        let ctx = IrContext::new(BackendKind::Host);
        let src = ctx.array_f64(&[1.5, 2.5, 3.5]);
        let index = ctx.array_u32(&[2, 0, 9]);
        let mask = ctx.array_bool(&[true, true, false]);
        let out = ctx.gather(src, index, mask).expect("gather");
        assert_eq!(ctx.to_vec_f64(out).expect("eval"), vec![3.5, 1.5, 0.0]);
    }

    #[test]
    fn scatter_is_copy_on_write_and_dirty() {
        let ctx = IrContext::new(BackendKind::Host);
        let target = ctx.array_f64(&[0.0, 0.0, 0.0, 0.0]);
        let value = ctx.array_f64(&[5.0, 6.0]);
        let index = ctx.array_u32(&[3, 1]);
        let mask = ctx.bool_const(true);
        let out = ctx
            .scatter(target, value, index, mask, ReduceOp::None)
            .expect("scatter");
        assert!(ctx.is_dirty(out));
        assert_eq!(
            ctx.to_vec_f64(out).expect("eval"),
            vec![0.0, 6.0, 0.0, 5.0]
        );
        // Original target is untouched.
        assert_eq!(
            ctx.to_vec_f64(target).expect("eval"),
            vec![0.0, 0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn recorded_region_cannot_be_evaluated_directly() {
        let ctx = IrContext::new(BackendKind::Host);
        let outer = ctx.array_f64(&[1.0, 2.0]);
        let checkpoint = ctx.record_begin();
        let wrapped = ctx.call_input(outer).expect("call input");
        let doubled = ctx.add(wrapped, wrapped).expect("add");
        assert!(matches!(
            ctx.to_vec_f64(doubled),
            Err(IrError::UnboundRegionInput(_))
        ));
        ctx.record_end(checkpoint, true).expect("record end");
        ctx.dec_ref(doubled).expect("release");
        ctx.dec_ref(wrapped).expect("release");
    }

    #[test]
    fn emitted_call_replays_per_instance_regions() {
        let ctx = IrContext::new(BackendKind::Host);
        let arg = ctx.array_f64(&[10.0, 20.0, 30.0, 40.0]);
        let index = ctx.array_u32(&[1, 2, 1, 2]);
        let mask = ctx.bool_const(true);

        let checkpoint = ctx.record_begin();
        let wrapped = ctx.call_input(arg).expect("call input");
        // Callable 1: a + 1, callable 2: a * 2.
        let one = ctx.literal_f64(1.0, 1);
        let two = ctx.literal_f64(2.0, 1);
        let rv_1 = ctx.add(wrapped, one).expect("add");
        let rv_2 = ctx.mul(wrapped, two).expect("mul");
        let outputs = ctx
            .emit_call(
                "pair",
                index,
                mask,
                &[1, 2],
                &[wrapped],
                &[rv_1, rv_2],
                &[0, 1, 2],
                1,
            )
            .expect("emit");
        ctx.record_end(checkpoint, false).expect("record end");

        assert_eq!(
            ctx.to_vec_f64(outputs[0]).expect("eval"),
            vec![11.0, 40.0, 31.0, 80.0]
        );
        for handle in [outputs[0], rv_2, rv_1, two, one, wrapped] {
            ctx.dec_ref(handle).expect("release");
        }
    }

    #[test]
    fn emitted_loop_iterates_to_fixpoint() {
        let ctx = IrContext::new(BackendKind::Host);
        let i0 = ctx.array_u32(&[0]);
        let s0 = ctx.array_u32(&[0]);

        let checkpoint = ctx.record_begin();
        let phi_i = ctx.loop_phi(i0).expect("phi");
        let phi_s = ctx.loop_phi(s0).expect("phi");
        let five = ctx.u32_const(5);
        let one = ctx.u32_const(1);
        let cond = ctx.lt(phi_i, five).expect("lt");
        let next_i = ctx.add(phi_i, one).expect("add");
        let next_s = ctx.add(phi_s, phi_i).expect("add");
        let outputs = ctx
            .emit_loop("count", &[i0, s0], &[phi_i, phi_s], cond, &[next_i, next_s])
            .expect("emit loop");
        ctx.record_end(checkpoint, false).expect("record end");

        assert_eq!(ctx.to_vec_u32(outputs[0]).expect("eval"), vec![5]);
        assert_eq!(ctx.to_vec_u32(outputs[1]).expect("eval"), vec![10]);
        for handle in outputs {
            ctx.dec_ref(handle).expect("release");
        }
    }

    #[test]
    fn call_reduce_groups_lanes_by_id() {
        let ctx = IrContext::new(BackendKind::Host);
        let index = ctx.array_u32(&[2, 0, 1, 2]);
        let buckets = ctx.call_reduce(index).expect("reduce");
        let summary: Vec<(u32, Vec<u32>)> = buckets
            .iter()
            .map(|b| (b.id, ctx.to_vec_u32(b.perm).expect("perm")))
            .collect();
        assert_eq!(
            summary,
            vec![(0, vec![1]), (1, vec![2]), (2, vec![0, 3])]
        );
        for bucket in buckets {
            ctx.dec_ref(bucket.perm).expect("release perm");
        }
    }

    #[test]
    fn aggregation_packs_slots_with_zero_sentinel() {
        let ctx = IrContext::new(BackendKind::Host);
        let evaluated = ctx.array_f64(&[2.5]);
        let buffer = ctx
            .aggregate(
                VarType::F64,
                &[
                    AggEntry::Immediate(pack_f64(1.5)),
                    AggEntry::Var(evaluated),
                    AggEntry::Immediate(pack_f64(3.5)),
                ],
            )
            .expect("aggregate");
        assert_eq!(
            ctx.to_vec_f64(buffer).expect("eval"),
            vec![0.0, 1.5, 2.5, 3.5]
        );
    }

    #[test]
    fn ref_counts_free_transitively() {
        let ctx = IrContext::new(BackendKind::Host);
        let a = ctx.array_f64(&[1.0]);
        let b = ctx.add(a, a).expect("add");
        // The op holds two references to `a`, plus the caller's one.
        assert_eq!(ctx.refcount(a), Ok(3));
        ctx.dec_ref(a).expect("release a");
        ctx.dec_ref(b).expect("release b");
        assert!(matches!(ctx.refcount(a), Err(IrError::InvalidHandle(_))));
    }

    #[test]
    fn mask_and_self_stacks_are_lifo() {
        let ctx = IrContext::new(BackendKind::Host);
        let mask = ctx.mask_default(4);
        ctx.mask_push(mask).expect("push");
        assert_eq!(ctx.mask_depth(), 1);
        ctx.mask_pop().expect("pop");
        assert_eq!(ctx.mask_depth(), 0);
        assert!(ctx.mask_pop().is_err());

        ctx.self_push(3, 0).expect("push self");
        assert_eq!(ctx.self_read(), (3, 0));
        ctx.self_pop().expect("pop self");
        assert_eq!(ctx.self_read(), (0, 0));
    }

    #[test]
    fn registry_round_trip_and_removal() {
        let ctx = IrContext::new(BackendKind::Host);
        let id_a = ctx.registry_put("sensor", Rc::new(42_u32));
        let id_b = ctx.registry_put("sensor", Rc::new(43_u32));
        assert_eq!((id_a, id_b), (1, 2));
        assert_eq!(ctx.registry_bound("sensor"), 2);

        let got = ctx.registry_get("sensor", id_a).expect("registered");
        assert_eq!(*got.downcast::<u32>().expect("type"), 42);

        ctx.registry_remove("sensor", id_a).expect("remove");
        assert!(ctx.registry_get("sensor", id_a).is_none());
        // The bound stays: ids are not compacted.
        assert_eq!(ctx.registry_bound("sensor"), 2);
    }
}
