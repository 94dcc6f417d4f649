//! Variable table, reference counting, scoped stacks, recording scopes,
//! and instruction creation.

use std::any::Any;
use std::rc::Rc;

use log::trace;
use rustc_hash::FxHashMap;
use smallvec::{SmallVec, smallvec};
use vx_core::{ReduceOp, VarState, VarType, broadcast_size, pack_bool, pack_u32};

use crate::IrError;
use crate::ops::{
    BinaryOp, CallDesc, LoopDesc, OpKind, OpNode, UnaryOp, binary_result_type, unary_result_type,
};

pub(crate) struct Slot {
    pub ty: VarType,
    pub size: usize,
    pub state: VarState,
    pub refcount: u32,
    pub scope: u32,
    /// Created inside a recording scope; only meaningful through the
    /// region that recorded it, never directly evaluable.
    pub symbolic: bool,
    pub op: Option<OpNode>,
    pub data: Rc<Vec<u64>>,
    pub alive: bool,
}

pub(crate) struct SelfFrame {
    pub value: u32,
    /// Owned handle of the per-lane instance-id variable, 0 if absent.
    pub index: u32,
}

pub(crate) struct RecordFrame {
    pub start: u32,
    pub scope: u32,
}

pub(crate) struct Engine {
    pub vars: Vec<Slot>,
    pub free: Vec<u32>,
    pub mask_stack: Vec<u32>,
    pub self_stack: Vec<SelfFrame>,
    pub record_stack: Vec<RecordFrame>,
    pub trace: Vec<u32>,
    pub scheduled: Vec<u32>,
    pub scope_counter: u32,
    pub current_scope: u32,
    pub symbolic_calls: bool,
    pub registry: FxHashMap<String, Vec<Option<Rc<dyn Any>>>>,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            // Slot 0 stays unused so handle 0 can mean "uninitialized".
            vars: vec![Slot {
                ty: VarType::Bool,
                size: 0,
                state: VarState::Literal,
                refcount: 0,
                scope: 0,
                symbolic: false,
                op: None,
                data: Rc::new(Vec::new()),
                alive: false,
            }],
            free: Vec::new(),
            mask_stack: Vec::new(),
            self_stack: Vec::new(),
            record_stack: Vec::new(),
            trace: Vec::new(),
            scheduled: Vec::new(),
            scope_counter: 0,
            current_scope: 0,
            symbolic_calls: false,
            registry: FxHashMap::default(),
        }
    }

    pub fn slot(&self, handle: u32) -> Result<&Slot, IrError> {
        match self.vars.get(handle as usize) {
            Some(slot) if slot.alive => Ok(slot),
            _ => Err(IrError::InvalidHandle(handle)),
        }
    }

    pub fn slot_mut(&mut self, handle: u32) -> Result<&mut Slot, IrError> {
        match self.vars.get_mut(handle as usize) {
            Some(slot) if slot.alive => Ok(slot),
            _ => Err(IrError::InvalidHandle(handle)),
        }
    }

    // ── Variable lifecycle ─────────────────────────────────────────

    fn alloc(&mut self, slot: Slot) -> u32 {
        let handle = if let Some(reused) = self.free.pop() {
            self.vars[reused as usize] = slot;
            reused
        } else {
            self.vars.push(slot);
            (self.vars.len() - 1) as u32
        };
        if !self.record_stack.is_empty() {
            self.trace.push(handle);
        }
        handle
    }

    pub fn new_var(
        &mut self,
        ty: VarType,
        size: usize,
        state: VarState,
        op: Option<OpNode>,
        data: Vec<u64>,
        symbolic: bool,
    ) -> u32 {
        let scope = self.current_scope;
        self.alloc(Slot {
            ty,
            size,
            state,
            refcount: 1,
            scope,
            symbolic,
            op,
            data: Rc::new(data),
            alive: true,
        })
    }

    pub fn inc_ref(&mut self, handle: u32) -> Result<(), IrError> {
        let slot = self.slot_mut(handle)?;
        slot.refcount += 1;
        Ok(())
    }

    pub fn dec_ref(&mut self, handle: u32) -> Result<(), IrError> {
        let mut worklist: SmallVec<[u32; 8]> = smallvec![handle];
        while let Some(current) = worklist.pop() {
            let slot = self.slot_mut(current)?;
            debug_assert!(slot.refcount > 0, "over-release of r{current}");
            slot.refcount -= 1;
            if slot.refcount > 0 {
                continue;
            }
            slot.alive = false;
            slot.data = Rc::new(Vec::new());
            if let Some(node) = slot.op.take() {
                worklist.extend(node.operands.iter().copied());
            }
            self.free.push(current);
        }
        Ok(())
    }

    pub fn refcount(&self, handle: u32) -> Result<u32, IrError> {
        Ok(self.slot(handle)?.refcount)
    }

    /// Called when a variable's instruction has run: the result data is
    /// installed and the operand references are released.
    pub fn install_data(&mut self, handle: u32, data: Rc<Vec<u64>>) -> Result<(), IrError> {
        let slot = self.slot_mut(handle)?;
        slot.data = data;
        slot.state = VarState::Evaluated;
        let node = slot.op.take();
        if let Some(node) = node {
            for operand in node.operands {
                self.dec_ref(operand)?;
            }
        }
        Ok(())
    }

    // ── Constructors ───────────────────────────────────────────────

    pub fn literal(&mut self, ty: VarType, bits: u64, size: usize) -> u32 {
        // Literals stay materializable even when created inside a
        // recording scope.
        self.new_var(ty, size, VarState::Literal, None, vec![bits], false)
    }

    pub fn u32_const(&mut self, value: u32) -> u32 {
        self.literal(VarType::U32, pack_u32(value), 1)
    }

    pub fn bool_const(&mut self, value: bool) -> u32 {
        self.literal(VarType::Bool, pack_bool(value), 1)
    }

    pub fn array(&mut self, ty: VarType, data: Vec<u64>) -> u32 {
        let size = data.len();
        self.new_var(ty, size, VarState::Evaluated, None, data, false)
    }

    fn symbolic_now(&self) -> bool {
        !self.record_stack.is_empty()
    }

    fn op_var(
        &mut self,
        ty: VarType,
        size: usize,
        kind: OpKind,
        operands: SmallVec<[u32; 4]>,
    ) -> Result<u32, IrError> {
        let mut symbolic = self.symbolic_now();
        for operand in &operands {
            self.inc_ref(*operand)?;
            symbolic |= self.slot(*operand)?.symbolic;
        }
        Ok(self.new_var(
            ty,
            size,
            VarState::Unevaluated,
            Some(OpNode { kind, operands }),
            Vec::new(),
            symbolic,
        ))
    }

    pub fn unary(&mut self, op: UnaryOp, a: u32) -> Result<u32, IrError> {
        let (ty, size) = {
            let slot = self.slot(a)?;
            (slot.ty, slot.size)
        };
        let out_ty = unary_result_type(op, ty)?;
        self.op_var(out_ty, size, OpKind::Unary(op), smallvec![a])
    }

    pub fn binary(&mut self, op: BinaryOp, a: u32, b: u32) -> Result<u32, IrError> {
        let (ty_a, size_a) = {
            let slot = self.slot(a)?;
            (slot.ty, slot.size)
        };
        let (ty_b, size_b) = {
            let slot = self.slot(b)?;
            (slot.ty, slot.size)
        };
        let out_ty = binary_result_type(op, ty_a, ty_b)?;
        let size = broadcast_size(size_a, size_b).ok_or(IrError::SizeMismatch {
            op: op.as_str(),
            left: size_a,
            right: size_b,
        })?;
        self.op_var(out_ty, size, OpKind::Binary(op), smallvec![a, b])
    }

    pub fn select(&mut self, cond: u32, a: u32, b: u32) -> Result<u32, IrError> {
        let (ty_c, size_c) = {
            let slot = self.slot(cond)?;
            (slot.ty, slot.size)
        };
        if ty_c != VarType::Bool {
            return Err(IrError::TypeMismatch {
                op: "select",
                left: ty_c,
                right: VarType::Bool,
            });
        }
        let (ty_a, size_a) = {
            let slot = self.slot(a)?;
            (slot.ty, slot.size)
        };
        let (ty_b, size_b) = {
            let slot = self.slot(b)?;
            (slot.ty, slot.size)
        };
        if ty_a != ty_b {
            return Err(IrError::TypeMismatch {
                op: "select",
                left: ty_a,
                right: ty_b,
            });
        }
        let size = broadcast_size(size_c, size_a)
            .and_then(|s| broadcast_size(s, size_b))
            .ok_or(IrError::SizeMismatch {
                op: "select",
                left: size_a,
                right: size_b,
            })?;
        self.op_var(ty_a, size, OpKind::Select, smallvec![cond, a, b])
    }

    pub fn gather(&mut self, src: u32, index: u32, mask: u32) -> Result<u32, IrError> {
        let src_ty = self.slot(src)?.ty;
        let (index_ty, index_size) = {
            let slot = self.slot(index)?;
            (slot.ty, slot.size)
        };
        if index_ty != VarType::U32 {
            return Err(IrError::TypeMismatch {
                op: "gather",
                left: index_ty,
                right: VarType::U32,
            });
        }
        let mask_size = self.slot(mask)?.size;
        let size = broadcast_size(index_size, mask_size).ok_or(IrError::SizeMismatch {
            op: "gather",
            left: index_size,
            right: mask_size,
        })?;
        self.op_var(src_ty, size, OpKind::Gather, smallvec![src, index, mask])
    }

    pub fn scatter(
        &mut self,
        target: u32,
        value: u32,
        index: u32,
        mask: u32,
        reduce: ReduceOp,
    ) -> Result<u32, IrError> {
        let (target_ty, target_size) = {
            let slot = self.slot(target)?;
            (slot.ty, slot.size)
        };
        let value_ty = self.slot(value)?.ty;
        if value_ty != target_ty {
            return Err(IrError::TypeMismatch {
                op: "scatter",
                left: target_ty,
                right: value_ty,
            });
        }
        // The top of the mask stack participates in every side effect.
        let effective_mask = match self.mask_stack.last().copied() {
            Some(top) => self.binary(BinaryOp::And, mask, top)?,
            None => {
                self.inc_ref(mask)?;
                mask
            }
        };
        let result = self.op_var(
            target_ty,
            target_size,
            OpKind::Scatter(reduce),
            smallvec![target, value, index, effective_mask],
        )?;
        self.dec_ref(effective_mask)?;
        // A scattered-into variable reads back stale data until the
        // pending effect is applied.
        self.slot_mut(result)?.state = VarState::Dirty;
        Ok(result)
    }

    pub fn call_input(&mut self, src: u32) -> Result<u32, IrError> {
        let (ty, size) = {
            let slot = self.slot(src)?;
            (slot.ty, slot.size)
        };
        let handle = self.op_var(ty, size, OpKind::CallInput, smallvec![src])?;
        self.slot_mut(handle)?.symbolic = true;
        Ok(handle)
    }

    pub fn call_mask(&mut self) -> Result<u32, IrError> {
        let handle = self.op_var(VarType::Bool, 1, OpKind::CallMask, smallvec![])?;
        self.slot_mut(handle)?.symbolic = true;
        Ok(handle)
    }

    pub fn loop_phi(&mut self, init: u32) -> Result<u32, IrError> {
        let (ty, size) = {
            let slot = self.slot(init)?;
            (slot.ty, slot.size)
        };
        let handle = self.op_var(ty, size, OpKind::LoopPhi, smallvec![init])?;
        self.slot_mut(handle)?.symbolic = true;
        Ok(handle)
    }

    // ── Mask stack ─────────────────────────────────────────────────

    /// Takes ownership of one reference to `mask`.
    pub fn mask_push(&mut self, mask: u32) -> Result<(), IrError> {
        self.slot(mask)?;
        self.mask_stack.push(mask);
        Ok(())
    }

    pub fn mask_pop(&mut self) -> Result<(), IrError> {
        match self.mask_stack.pop() {
            Some(mask) => self.dec_ref(mask),
            None => Err(IrError::StackUnderflow("mask")),
        }
    }

    pub fn mask_default(&mut self, size: usize) -> u32 {
        self.literal(VarType::Bool, pack_bool(true), size)
    }

    // ── Self stack ─────────────────────────────────────────────────

    /// Takes ownership of one reference to `index` when non-zero.
    pub fn self_push(&mut self, value: u32, index: u32) -> Result<(), IrError> {
        if index != 0 {
            self.slot(index)?;
        }
        self.self_stack.push(SelfFrame { value, index });
        Ok(())
    }

    pub fn self_pop(&mut self) -> Result<(), IrError> {
        match self.self_stack.pop() {
            Some(frame) => {
                if frame.index != 0 {
                    self.dec_ref(frame.index)?;
                }
                Ok(())
            }
            None => Err(IrError::StackUnderflow("self")),
        }
    }

    /// Borrowed view of the current instance: (id value, per-lane handle).
    pub fn self_read(&self) -> (u32, u32) {
        match self.self_stack.last() {
            Some(frame) => (frame.value, frame.index),
            None => (0, 0),
        }
    }

    // ── Recording scopes ───────────────────────────────────────────

    pub fn record_begin(&mut self) -> u32 {
        let start = self.trace.len() as u32;
        let scope = self.new_scope();
        self.record_stack.push(RecordFrame { start, scope });
        start
    }

    pub fn record_checkpoint(&mut self) -> u32 {
        self.trace.len() as u32
    }

    pub fn record_end(&mut self, checkpoint: u32, cleanup: bool) -> Result<(), IrError> {
        match self.record_stack.pop() {
            Some(frame) => {
                trace!(
                    "record_end(start={}, checkpoint={checkpoint}, cleanup={cleanup})",
                    frame.start
                );
                self.trace.truncate(checkpoint.min(frame.start) as usize);
                Ok(())
            }
            None => Err(IrError::StackUnderflow("record")),
        }
    }

    pub fn new_scope(&mut self) -> u32 {
        self.scope_counter += 1;
        self.current_scope = self.scope_counter;
        self.current_scope
    }

    pub fn set_scope(&mut self, scope: u32) {
        self.current_scope = scope;
    }

    pub fn is_symbolic(&self) -> bool {
        self.symbolic_now()
    }

    // ── Instance registry ──────────────────────────────────────────

    pub fn registry_put(&mut self, domain: &str, instance: Rc<dyn Any>) -> u32 {
        let slots = self.registry.entry(domain.to_owned()).or_default();
        slots.push(Some(instance));
        slots.len() as u32
    }

    pub fn registry_remove(&mut self, domain: &str, id: u32) -> Result<(), IrError> {
        let slots = self
            .registry
            .get_mut(domain)
            .ok_or_else(|| IrError::UnknownDomain(domain.to_owned()))?;
        match slots.get_mut((id as usize).wrapping_sub(1)) {
            Some(entry) => {
                *entry = None;
                Ok(())
            }
            None => Err(IrError::UnknownDomain(domain.to_owned())),
        }
    }

    pub fn registry_get(&self, domain: &str, id: u32) -> Option<Rc<dyn Any>> {
        self.registry
            .get(domain)
            .and_then(|slots| slots.get((id as usize).wrapping_sub(1)))
            .and_then(|entry| entry.clone())
    }

    pub fn registry_bound(&self, domain: &str) -> u32 {
        self.registry.get(domain).map_or(0, |slots| slots.len() as u32)
    }

    // ── Call / loop emission ───────────────────────────────────────

    /// Emits one indirect-call instruction and returns one fresh output
    /// handle per return slot. `outputs` is callable-major over the
    /// executed ids; `checkpoints` may contain repeated boundaries for
    /// skipped callables.
    pub fn emit_call(
        &mut self,
        name: &str,
        index: u32,
        mask: u32,
        ids: &[u32],
        inputs: &[u32],
        outputs: &[u32],
        checkpoints: &[u32],
        n_out: usize,
    ) -> Result<Vec<u32>, IrError> {
        debug_assert_eq!(outputs.len(), ids.len() * n_out);
        let index_size = self.slot(index)?.size;
        let mask_size = self.slot(mask)?.size;
        let size = broadcast_size(index_size, mask_size).ok_or(IrError::SizeMismatch {
            op: "call",
            left: index_size,
            right: mask_size,
        })?;

        // Outputs of the call belong to the enclosing scope: they are
        // symbolic only if the call's own inputs are.
        let mut symbolic = self.slot(index)?.symbolic || self.slot(mask)?.symbolic;
        for input in inputs {
            let node = self
                .slot(*input)?
                .op
                .as_ref()
                .ok_or(IrError::InvalidHandle(*input))?;
            let src = node.operands[0];
            symbolic |= self.slot(src)?.symbolic;
        }

        let desc = Rc::new(CallDesc {
            name: name.to_owned(),
            index,
            mask,
            ids: ids.to_vec(),
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            checkpoints: checkpoints.to_vec(),
            n_out,
        });

        let mut result = Vec::with_capacity(n_out);
        for slot_index in 0..n_out {
            // Slot type comes from the first executed callable's entry;
            // `check_rv` has already ensured they agree.
            let ty = if ids.is_empty() {
                VarType::F64
            } else {
                self.slot(outputs[slot_index])?.ty
            };
            let mut operands: SmallVec<[u32; 4]> = smallvec![index, mask];
            operands.extend(inputs.iter().copied());
            operands.extend(outputs.iter().copied());
            for operand in &operands {
                self.inc_ref(*operand)?;
            }
            let handle = self.new_var(
                ty,
                size,
                VarState::Unevaluated,
                Some(OpNode {
                    kind: OpKind::Call {
                        desc: Rc::clone(&desc),
                        slot: slot_index,
                    },
                    operands,
                }),
                Vec::new(),
                symbolic,
            );
            result.push(handle);
        }
        Ok(result)
    }

    /// Emits one loop instruction over recorded cond/body regions and
    /// returns one fresh handle per state slot.
    pub fn emit_loop(
        &mut self,
        name: &str,
        inits: &[u32],
        phis: &[u32],
        cond: u32,
        body: &[u32],
    ) -> Result<Vec<u32>, IrError> {
        debug_assert_eq!(inits.len(), phis.len());
        debug_assert_eq!(inits.len(), body.len());
        if self.slot(cond)?.ty != VarType::Bool {
            return Err(IrError::TypeMismatch {
                op: "loop",
                left: self.slot(cond)?.ty,
                right: VarType::Bool,
            });
        }

        // The loop width is the broadcast of every state slot, the
        // condition, and the body outputs (state may grow from 1 to N
        // inside the body).
        let mut width = self.slot(cond)?.size;
        let mut symbolic = false;
        for init in inits {
            let slot = self.slot(*init)?;
            width = broadcast_size(width, slot.size).ok_or(IrError::SizeMismatch {
                op: "loop",
                left: width,
                right: slot.size,
            })?;
            symbolic |= slot.symbolic;
        }
        for out in body {
            let size = self.slot(*out)?.size;
            width = broadcast_size(width, size).ok_or(IrError::SizeMismatch {
                op: "loop",
                left: width,
                right: size,
            })?;
        }

        let desc = Rc::new(LoopDesc {
            name: name.to_owned(),
            inits: inits.to_vec(),
            phis: phis.to_vec(),
            cond,
            body: body.to_vec(),
        });

        let mut result = Vec::with_capacity(inits.len());
        for slot_index in 0..inits.len() {
            let ty = self.slot(inits[slot_index])?.ty;
            let mut operands: SmallVec<[u32; 4]> = SmallVec::new();
            operands.extend(inits.iter().copied());
            operands.extend(phis.iter().copied());
            operands.push(cond);
            operands.extend(body.iter().copied());
            for operand in &operands {
                self.inc_ref(*operand)?;
            }
            let handle = self.new_var(
                ty,
                width,
                VarState::Unevaluated,
                Some(OpNode {
                    kind: OpKind::Loop {
                        desc: Rc::clone(&desc),
                        slot: slot_index,
                    },
                    operands,
                }),
                Vec::new(),
                symbolic,
            );
            result.push(handle);
        }
        Ok(result)
    }
}
