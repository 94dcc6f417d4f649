//! Lazy evaluation: materialization of instruction results, including
//! region replay for indirect calls and recorded loops.
//!
//! Values flow through evaluation as `Val` views: a shared bit buffer
//! plus a logical length, where a one-element buffer broadcasts.

use std::rc::Rc;

use log::trace;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use vx_core::{ReduceOp, VarState, VarType, broadcast_size, pack_bool, unpack_bool, unpack_u32};

use crate::IrError;
use crate::engine::Engine;
use crate::ops::{
    BinaryOp, CallDesc, LoopDesc, OpKind, apply_binary, apply_mask_and, apply_unary,
};

/// One evaluated value: raw bits plus logical length. `data.len()` is
/// either 1 (uniform, broadcasts to `len`) or equal to `len`.
#[derive(Debug, Clone)]
pub(crate) struct Val {
    pub data: Rc<Vec<u64>>,
    pub len: usize,
}

impl Val {
    fn uniform(bits: u64, len: usize) -> Self {
        Self {
            data: Rc::new(vec![bits]),
            len,
        }
    }

    fn from_vec(data: Vec<u64>) -> Self {
        let len = data.len();
        Self {
            data: Rc::new(data),
            len,
        }
    }

    pub(crate) fn elem(&self, k: usize) -> u64 {
        if self.data.len() <= 1 {
            self.data.first().copied().unwrap_or(0)
        } else {
            self.data[k]
        }
    }
}

/// Per-region bindings used while replaying a recorded region: maps
/// region-internal variables (call inputs, phis, memoized intermediates)
/// to their per-lane values.
pub(crate) struct Frame {
    bindings: FxHashMap<u32, Val>,
}

impl Frame {
    fn new() -> Self {
        Self {
            bindings: FxHashMap::default(),
        }
    }
}

/// One lane group produced by bucketizing an instance-index array.
#[derive(Debug)]
pub struct CallBucket {
    /// Instance id shared by every lane in this bucket (0 = inactive).
    pub id: u32,
    /// Owned handle of an evaluated `U32` permutation array mapping
    /// bucket positions back to original lane indices.
    pub perm: u32,
    pub width: usize,
}

impl Engine {
    pub(crate) fn materialize(&mut self, handle: u32) -> Result<Val, IrError> {
        self.eval_value(handle, &mut Vec::new())
    }

    pub(crate) fn eval_value(
        &mut self,
        handle: u32,
        frames: &mut Vec<Frame>,
    ) -> Result<Val, IrError> {
        let (state, size, symbolic) = {
            let slot = self.slot(handle)?;
            (slot.state, slot.size, slot.symbolic)
        };

        if symbolic {
            for frame in frames.iter().rev() {
                if let Some(val) = frame.bindings.get(&handle) {
                    return Ok(val.clone());
                }
            }
        }

        match state {
            VarState::Literal | VarState::Evaluated => {
                let slot = self.slot(handle)?;
                return Ok(Val {
                    data: Rc::clone(&slot.data),
                    len: size,
                });
            }
            VarState::Unevaluated | VarState::Dirty => {}
        }

        let kind = match self.slot(handle)?.op.as_ref() {
            Some(node) => node.kind.clone(),
            None => return Err(IrError::InvalidHandle(handle)),
        };

        let value = match &kind {
            OpKind::CallMask => Val::uniform(pack_bool(true), 1),
            OpKind::CallInput | OpKind::LoopPhi => {
                return Err(IrError::UnboundRegionInput(handle));
            }
            OpKind::Unary(op) => {
                let a = self.operand_val(handle, 0, frames)?;
                let ty = self.operand_type(handle, 0)?;
                let mut out = Vec::with_capacity(a.len);
                for k in 0..a.len {
                    out.push(apply_unary(*op, ty, a.elem(k))?);
                }
                Val::from_vec(out)
            }
            OpKind::Binary(op) => {
                let a = self.operand_val(handle, 0, frames)?;
                let b = self.operand_val(handle, 1, frames)?;
                let ty_a = self.operand_type(handle, 0)?;
                let ty_b = self.operand_type(handle, 1)?;
                let len = broadcast_size(a.len, b.len).ok_or(IrError::SizeMismatch {
                    op: op.as_str(),
                    left: a.len,
                    right: b.len,
                })?;
                let masking = matches!(op, BinaryOp::And | BinaryOp::Or)
                    && ty_a != VarType::Bool
                    && ty_b == VarType::Bool;
                let mut out = Vec::with_capacity(len);
                for k in 0..len {
                    let bits = if masking {
                        match op {
                            BinaryOp::And => apply_mask_and(a.elem(k), b.elem(k)),
                            _ => {
                                if unpack_bool(b.elem(k)) {
                                    u64::from(u32::MAX)
                                } else {
                                    a.elem(k)
                                }
                            }
                        }
                    } else {
                        apply_binary(*op, ty_a, a.elem(k), b.elem(k))?
                    };
                    out.push(bits);
                }
                Val::from_vec(out)
            }
            OpKind::Select => {
                let cond = self.operand_val(handle, 0, frames)?;
                let a = self.operand_val(handle, 1, frames)?;
                let b = self.operand_val(handle, 2, frames)?;
                let len = broadcast_size(cond.len, a.len)
                    .and_then(|s| broadcast_size(s, b.len))
                    .ok_or(IrError::SizeMismatch {
                        op: "select",
                        left: a.len,
                        right: b.len,
                    })?;
                let mut out = Vec::with_capacity(len);
                for k in 0..len {
                    out.push(if unpack_bool(cond.elem(k)) {
                        a.elem(k)
                    } else {
                        b.elem(k)
                    });
                }
                Val::from_vec(out)
            }
            OpKind::Gather => {
                let src = self.operand_val(handle, 0, frames)?;
                let index = self.operand_val(handle, 1, frames)?;
                let mask = self.operand_val(handle, 2, frames)?;
                let len = broadcast_size(index.len, mask.len).ok_or(IrError::SizeMismatch {
                    op: "gather",
                    left: index.len,
                    right: mask.len,
                })?;
                let mut out = Vec::with_capacity(len);
                for k in 0..len {
                    let bits = if unpack_bool(mask.elem(k)) {
                        let at = unpack_u32(index.elem(k)) as usize;
                        if src.data.len() <= 1 {
                            src.elem(0)
                        } else if at < src.data.len() {
                            src.data[at]
                        } else {
                            0
                        }
                    } else {
                        0
                    };
                    out.push(bits);
                }
                Val::from_vec(out)
            }
            OpKind::Scatter(reduce) => {
                let target = self.operand_val(handle, 0, frames)?;
                let value = self.operand_val(handle, 1, frames)?;
                let index = self.operand_val(handle, 2, frames)?;
                let mask = self.operand_val(handle, 3, frames)?;
                let ty = self.operand_type(handle, 0)?;
                let mut out: Vec<u64> = if target.data.len() <= 1 {
                    vec![target.elem(0); target.len]
                } else {
                    (*target.data).clone()
                };
                let lanes = broadcast_size(value.len, index.len)
                    .and_then(|s| broadcast_size(s, mask.len))
                    .ok_or(IrError::SizeMismatch {
                        op: "scatter",
                        left: value.len,
                        right: index.len,
                    })?;
                for k in 0..lanes {
                    if !unpack_bool(mask.elem(k)) {
                        continue;
                    }
                    let at = unpack_u32(index.elem(k)) as usize;
                    if at >= out.len() {
                        continue;
                    }
                    out[at] = match reduce {
                        ReduceOp::None => value.elem(k),
                        ReduceOp::Add => apply_binary(BinaryOp::Add, ty, out[at], value.elem(k))?,
                    };
                }
                Val::from_vec(out)
            }
            OpKind::Call { desc, slot } => {
                let desc = Rc::clone(desc);
                self.eval_call(&desc, *slot, frames)?
            }
            OpKind::Loop { desc, slot } => {
                let desc = Rc::clone(desc);
                self.eval_loop(&desc, *slot, frames)?
            }
        };

        if symbolic {
            match frames.last_mut() {
                Some(frame) => {
                    frame.bindings.insert(handle, value.clone());
                }
                None => return Err(IrError::SymbolicEval(handle)),
            }
        } else {
            self.install_data(handle, Rc::clone(&value.data))?;
        }
        Ok(value)
    }

    fn operand(&self, handle: u32, position: usize) -> Result<u32, IrError> {
        let node = self
            .slot(handle)?
            .op
            .as_ref()
            .ok_or(IrError::InvalidHandle(handle))?;
        node.operands
            .get(position)
            .copied()
            .ok_or(IrError::InvalidHandle(handle))
    }

    fn operand_val(
        &mut self,
        handle: u32,
        position: usize,
        frames: &mut Vec<Frame>,
    ) -> Result<Val, IrError> {
        let operand = self.operand(handle, position)?;
        self.eval_value(operand, frames)
    }

    fn operand_type(&self, handle: u32, position: usize) -> Result<VarType, IrError> {
        let operand = self.operand(handle, position)?;
        Ok(self.slot(operand)?.ty)
    }

    /// Replays the recorded callable regions of one indirect call for a
    /// single return slot. Lanes whose instance id matches no executed
    /// callable (including id 0) produce zero bits.
    fn eval_call(
        &mut self,
        desc: &CallDesc,
        slot: usize,
        frames: &mut Vec<Frame>,
    ) -> Result<Val, IrError> {
        let index = self.eval_value(desc.index, frames)?;
        let mask = self.eval_value(desc.mask, frames)?;
        let width = broadcast_size(index.len, mask.len).ok_or(IrError::SizeMismatch {
            op: "call",
            left: index.len,
            right: mask.len,
        })?;
        trace!("replay call '{}' (width {width})", desc.name);

        // Sources feeding each call input, evaluated once in the
        // enclosing context.
        let mut sources = Vec::with_capacity(desc.inputs.len());
        for input in &desc.inputs {
            let src = self.operand(*input, 0)?;
            let val = self.eval_value(src, frames)?;
            sources.push((*input, val));
        }

        let mut out = vec![0_u64; width];
        for (group, id) in desc.ids.iter().enumerate() {
            let lanes: Vec<usize> = (0..width)
                .filter(|k| {
                    unpack_u32(index.elem(*k)) == *id && unpack_bool(mask.elem(*k))
                })
                .collect();
            if lanes.is_empty() {
                continue;
            }

            let mut frame = Frame::new();
            for (input, val) in &sources {
                let bound = if val.data.len() <= 1 {
                    Val {
                        data: Rc::clone(&val.data),
                        len: lanes.len(),
                    }
                } else {
                    Val::from_vec(lanes.iter().map(|lane| val.elem(*lane)).collect())
                };
                frame.bindings.insert(*input, bound);
            }

            frames.push(frame);
            let result = self.eval_value(desc.outputs[group * desc.n_out + slot], frames);
            frames.pop();
            let result = result?;

            for (position, lane) in lanes.iter().enumerate() {
                out[*lane] = result.elem(position);
            }
        }
        Ok(Val::from_vec(out))
    }

    /// Iterates one recorded loop to fixpoint: the condition region is
    /// ANDed into the carried active mask, and inactive lanes hold their
    /// previous state.
    fn eval_loop(
        &mut self,
        desc: &LoopDesc,
        slot: usize,
        frames: &mut Vec<Frame>,
    ) -> Result<Val, IrError> {
        let mut state = Vec::with_capacity(desc.inits.len());
        for init in &desc.inits {
            state.push(self.eval_value(*init, frames)?);
        }
        let mut active = Val::uniform(pack_bool(true), 1);
        trace!("replay loop '{}' ({} state slots)", desc.name, state.len());

        loop {
            let mut frame = Frame::new();
            for (phi, current) in desc.phis.iter().zip(&state) {
                frame.bindings.insert(*phi, current.clone());
            }
            frames.push(frame);
            let step = self.loop_step(desc, &active, frames);
            frames.pop();

            match step? {
                None => break,
                Some((next_active, updated)) => {
                    for (current, new) in state.iter_mut().zip(updated) {
                        *current = select_val(&next_active, &new, current)?;
                    }
                    active = next_active;
                }
            }
        }
        Ok(state[slot].clone())
    }

    /// One loop iteration inside an already-pushed phi frame: evaluate
    /// the condition, fold it into the carried mask, and (while any lane
    /// remains active) evaluate the body outputs.
    fn loop_step(
        &mut self,
        desc: &LoopDesc,
        active: &Val,
        frames: &mut Vec<Frame>,
    ) -> Result<Option<(Val, Vec<Val>)>, IrError> {
        let cond = self.eval_value(desc.cond, frames)?;
        let next_active = and_bool(active, &cond)?;
        if !any_bool(&next_active) {
            return Ok(None);
        }
        let mut updated = Vec::with_capacity(desc.body.len());
        for body_out in &desc.body {
            updated.push(self.eval_value(*body_out, frames)?);
        }
        Ok(Some((next_active, updated)))
    }

    // ── Scheduling ─────────────────────────────────────────────────

    pub fn schedule(&mut self, handle: u32) -> Result<(), IrError> {
        if self.slot(handle)?.symbolic {
            return Err(IrError::SymbolicEval(handle));
        }
        self.inc_ref(handle)?;
        self.scheduled.push(handle);
        Ok(())
    }

    pub fn eval_scheduled(&mut self) -> Result<(), IrError> {
        while let Some(handle) = self.scheduled.pop() {
            let result = self.materialize(handle);
            self.dec_ref(handle)?;
            result?;
        }
        Ok(())
    }

    // ── Bucketizing ────────────────────────────────────────────────

    /// Groups lanes by instance id, ascending, including the inactive
    /// id-0 group when present.
    pub fn call_reduce(&mut self, index: u32) -> Result<Vec<CallBucket>, IrError> {
        let val = self.materialize(index)?;
        let mut groups: BTreeMap<u32, Vec<u64>> = BTreeMap::new();
        for k in 0..val.len {
            groups
                .entry(unpack_u32(val.elem(k)))
                .or_default()
                .push(k as u64);
        }
        let mut buckets = Vec::with_capacity(groups.len());
        for (id, lanes) in groups {
            let width = lanes.len();
            let perm = self.array(VarType::U32, lanes);
            buckets.push(CallBucket { id, perm, width });
        }
        Ok(buckets)
    }

    // ── Aggregation ────────────────────────────────────────────────

    /// Packs per-callable scalar outputs into one contiguous
    /// gather-indexable buffer with a zero sentinel at slot 0.
    pub fn aggregate(&mut self, ty: VarType, entries: &[AggEntry]) -> Result<u32, IrError> {
        let mut data = vec![0_u64; entries.len() + 1];
        for (position, entry) in entries.iter().enumerate() {
            data[position + 1] = match entry {
                AggEntry::Immediate(bits) => *bits,
                AggEntry::Var(handle) => {
                    let val = self.materialize(*handle)?;
                    val.elem(0)
                }
            };
        }
        Ok(self.array(ty, data))
    }

    // ── Introspection ──────────────────────────────────────────────

    pub fn read(&self, handle: u32, lane: usize) -> Result<u64, IrError> {
        let slot = self.slot(handle)?;
        match slot.state {
            VarState::Literal => Ok(slot.data[0]),
            VarState::Evaluated => {
                if slot.data.len() <= 1 {
                    Ok(slot.data.first().copied().unwrap_or(0))
                } else {
                    Ok(slot.data[lane])
                }
            }
            VarState::Unevaluated | VarState::Dirty => Err(IrError::NotEvaluated(handle)),
        }
    }

    pub fn is_zero_literal(&self, handle: u32) -> bool {
        match self.slot(handle) {
            Ok(slot) => slot.state == VarState::Literal && slot.data[0] == 0,
            Err(_) => false,
        }
    }
}

/// Entry of an aggregation buffer: an immediate bit pattern or a scalar
/// variable whose contents are copied in.
#[derive(Debug, Clone, Copy)]
pub enum AggEntry {
    Immediate(u64),
    Var(u32),
}

fn and_bool(a: &Val, b: &Val) -> Result<Val, IrError> {
    let len = broadcast_size(a.len, b.len).ok_or(IrError::SizeMismatch {
        op: "and",
        left: a.len,
        right: b.len,
    })?;
    let mut out = Vec::with_capacity(len);
    for k in 0..len {
        out.push(pack_bool(unpack_bool(a.elem(k)) && unpack_bool(b.elem(k))));
    }
    Ok(Val::from_vec(out))
}

fn any_bool(val: &Val) -> bool {
    (0..val.len.max(val.data.len())).any(|k| unpack_bool(val.elem(k)))
}

fn select_val(cond: &Val, a: &Val, b: &Val) -> Result<Val, IrError> {
    let len = broadcast_size(cond.len, a.len)
        .and_then(|s| broadcast_size(s, b.len))
        .ok_or(IrError::SizeMismatch {
            op: "select",
            left: a.len,
            right: b.len,
        })?;
    let mut out = Vec::with_capacity(len);
    for k in 0..len {
        out.push(if unpack_bool(cond.elem(k)) {
            a.elem(k)
        } else {
            b.elem(k)
        });
    }
    Ok(Val::from_vec(out))
}
