//! RAII wrappers for the engine's scoped state. Every wrapper releases
//! its frame on all exit paths, so an error inside a user callback
//! unwinds the mask, self, and recording stacks in inverse push order.

use log::warn;
use vx_core::Index64;
use vx_ad::AdContext;
use vx_ir::IrContext;

/// Pushes a mask for the duration of a scope. Takes ownership of one
/// reference to the mask handle.
pub(crate) struct ScopedMask<'a> {
    ir: &'a IrContext,
}

impl<'a> ScopedMask<'a> {
    pub fn new(ir: &'a IrContext, mask: u32) -> Result<Self, vx_ir::IrError> {
        ir.mask_push(mask)?;
        Ok(Self { ir })
    }
}

impl Drop for ScopedMask<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.ir.mask_pop() {
            warn!("mask stack unwind failed: {err}");
        }
    }
}

/// Sets the current instance for the duration of a scope. Takes
/// ownership of one reference to the per-lane id handle (when non-zero).
pub(crate) struct ScopedSelf<'a> {
    ir: &'a IrContext,
}

impl<'a> ScopedSelf<'a> {
    pub fn new(ir: &'a IrContext, value: u32, index: u32) -> Result<Self, vx_ir::IrError> {
        ir.self_push(value, index)?;
        Ok(Self { ir })
    }
}

impl Drop for ScopedSelf<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.ir.self_pop() {
            warn!("self stack unwind failed: {err}");
        }
    }
}

/// A recording scope: captures a checkpoint on entry and either commits
/// (after `disarm`) or discards the recorded region on drop.
pub(crate) struct ScopedRecord<'a> {
    ir: &'a IrContext,
    checkpoint: u32,
    scope: u32,
    cleanup: bool,
}

impl<'a> ScopedRecord<'a> {
    pub fn new(ir: &'a IrContext) -> Self {
        let checkpoint = ir.record_begin();
        let scope = ir.new_scope();
        Self {
            ir,
            checkpoint,
            scope,
            cleanup: true,
        }
    }

    /// Rolls the recording cursor back so the next callable records into
    /// the same region slot; returns the boundary mark.
    pub fn checkpoint_and_rewind(&self) -> u32 {
        self.ir.set_scope(self.scope);
        self.ir.record_checkpoint()
    }

    pub fn disarm(&mut self) {
        self.cleanup = false;
    }
}

impl Drop for ScopedRecord<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.ir.record_end(self.checkpoint, self.cleanup) {
            warn!("recording scope unwind failed: {err}");
        }
    }
}

/// Owned plain IR handles released together on drop.
pub(crate) struct IrHandles<'a> {
    ir: &'a IrContext,
    pub handles: Vec<u32>,
}

impl<'a> IrHandles<'a> {
    pub fn new(ir: &'a IrContext) -> Self {
        Self {
            ir,
            handles: Vec::new(),
        }
    }

    /// Takes ownership of one reference.
    pub fn push_owned(&mut self, handle: u32) {
        self.handles.push(handle);
    }

    /// Acquires a reference first.
    pub fn push_borrowed(&mut self, handle: u32) -> Result<(), vx_ir::IrError> {
        self.ir.inc_ref(handle)?;
        self.handles.push(handle);
        Ok(())
    }
}

impl Drop for IrHandles<'_> {
    fn drop(&mut self) {
        for handle in &self.handles {
            if let Err(err) = self.ir.dec_ref(*handle) {
                warn!("handle release failed: {err}");
            }
        }
    }
}

/// Owned composite handles released together on drop.
pub(crate) struct IndexHandles<'a> {
    ctx: &'a AdContext,
    pub handles: Vec<Index64>,
}

impl<'a> IndexHandles<'a> {
    pub fn new(ctx: &'a AdContext) -> Self {
        Self {
            ctx,
            handles: Vec::new(),
        }
    }

    /// Takes ownership of one reference on both halves.
    pub fn push_owned(&mut self, handle: Index64) {
        self.handles.push(handle);
    }
}

impl Drop for IndexHandles<'_> {
    fn drop(&mut self) {
        for handle in &self.handles {
            if let Err(err) = self.ctx.release(*handle) {
                warn!("composite handle release failed: {err}");
            }
        }
    }
}
