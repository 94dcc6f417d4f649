//! The AD hook: a recorded indirect call wrapped as one node in the AD
//! graph. Forward and backward both re-enter the dispatcher with a
//! synthesized callback, so shape unification, masking, and strategy
//! selection are reused instead of duplicated.

use std::rc::Rc;

use log::debug;
use vx_core::Index64;
use vx_ad::{AdContext, AdError, AdFlag, AdMode, CustomOp, IsolationGuard};

use crate::scoped::{IndexHandles, IrHandles};
use crate::{CallCallback, CallConfig, CallbackRef, DispatchError, Instance, call_impl};

pub(crate) struct CallOp {
    name: String,
    domain: Option<String>,
    callable_count: u32,
    index: u32,
    mask: u32,
    /// Borrowed IR halves of the original arguments (kept alive by the
    /// AD node that owns this op).
    args: Vec<u32>,
    /// Differentiable participants: explicit inputs first, then
    /// implicit dependencies captured during recording.
    input_nodes: Vec<u32>,
    input_offsets: Vec<usize>,
    output_nodes: Vec<u32>,
    output_offsets: Vec<usize>,
    callback: Rc<dyn CallCallback>,
}

impl CallOp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        domain: Option<String>,
        callable_count: u32,
        index: u32,
        mask: u32,
        args: Vec<u32>,
        input_nodes: Vec<u32>,
        input_offsets: Vec<usize>,
        output_nodes: Vec<u32>,
        output_offsets: Vec<usize>,
        callback: Rc<dyn CallCallback>,
    ) -> Self {
        Self {
            name,
            domain,
            callable_count,
            index,
            mask,
            args,
            input_nodes,
            input_offsets,
            output_nodes,
            output_offsets,
            callback,
        }
    }

    fn config<'a>(&'a self, name: &'a str) -> CallConfig<'a> {
        CallConfig {
            domain: self.domain.as_deref(),
            callable_count: self.callable_count,
            name,
            is_getter: false,
            ad: false,
        }
    }

    /// f(arg..., grad(arg)...) -> grad(rv)...
    fn forward_impl(&self, ctx: &AdContext) -> Result<(), DispatchError> {
        debug!("'{}': forward AD pass", self.name);
        let _boundary = IsolationGuard::new(ctx);
        let name = format!("{} [ad, fwd]", self.name);

        let mut args2: Vec<Index64> =
            self.args.iter().map(|h| Index64::from_ir(*h)).collect();
        let mut tangents = IrHandles::new(ctx.ir());
        for node in &self.input_nodes[..self.input_offsets.len()] {
            let tangent = ctx.grad_of(*node)?;
            tangents.push_owned(tangent);
            args2.push(Index64::from_ir(tangent));
        }

        let mut rv2 = IndexHandles::new(ctx);
        let body = ForwardBody { op: self };
        call_impl(
            ctx,
            &self.config(&name),
            self.index,
            self.mask,
            &args2,
            &mut rv2.handles,
            &CallbackRef::Borrowed(&body),
        )?;
        debug_assert_eq!(rv2.handles.len(), self.output_offsets.len());

        for (position, node) in self.output_nodes.iter().enumerate() {
            ctx.accum_grad_id(*node, rv2.handles[position].ir_id())?;
        }
        Ok(())
    }

    /// f(arg..., grad(rv)...) -> grad(arg)...
    fn backward_impl(&self, ctx: &AdContext) -> Result<(), DispatchError> {
        debug!("'{}': backward AD pass", self.name);
        let _boundary = IsolationGuard::new(ctx);
        let name = format!("{} [ad, bwd]", self.name);

        let mut args2: Vec<Index64> =
            self.args.iter().map(|h| Index64::from_ir(*h)).collect();
        let mut cotangents = IrHandles::new(ctx.ir());
        for node in &self.output_nodes {
            let cotangent = ctx.grad_of(*node)?;
            cotangents.push_owned(cotangent);
            args2.push(Index64::from_ir(cotangent));
        }

        let mut rv2 = IndexHandles::new(ctx);
        let body = BackwardBody { op: self };
        call_impl(
            ctx,
            &self.config(&name),
            self.index,
            self.mask,
            &args2,
            &mut rv2.handles,
            &CallbackRef::Borrowed(&body),
        )?;
        debug_assert_eq!(rv2.handles.len(), self.input_offsets.len());

        for (position, node) in self.input_nodes[..self.input_offsets.len()]
            .iter()
            .enumerate()
        {
            ctx.accum_grad_id(*node, rv2.handles[position].ir_id())?;
        }
        Ok(())
    }
}

impl CustomOp for CallOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, ctx: &AdContext) -> Result<(), AdError> {
        self.forward_impl(ctx)
            .map_err(|err| AdError::Custom(err.to_string()))
    }

    fn backward(&self, ctx: &AdContext) -> Result<(), AdError> {
        self.backward_impl(ctx)
            .map_err(|err| AdError::Custom(err.to_string()))
    }
}

/// Re-assigns fresh AD tags to the tracked inputs, runs the body, seeds
/// the incoming tangents, traverses forward, and returns the tangents of
/// the body's outputs as the new return values.
struct ForwardBody<'a> {
    op: &'a CallOp,
}

impl CallCallback for ForwardBody<'_> {
    fn call(
        &self,
        ctx: &AdContext,
        instance: &Instance,
        args: &[Index64],
        rv: &mut Vec<Index64>,
    ) -> Result<(), DispatchError> {
        let op = self.op;
        let n_args = op.args.len();

        // Confine the traversal below to this callable's fresh nodes.
        let _cb_boundary = IsolationGuard::new(ctx);

        let mut local: Vec<Index64> = args[..n_args].to_vec();
        let mut fresh = IndexHandles::new(ctx);
        for offset in &op.input_offsets {
            let promoted = ctx.var_new(local[*offset].ir_id())?;
            fresh.push_owned(promoted);
            local[*offset] = promoted;
        }

        let mut body_rv = IndexHandles::new(ctx);
        op.callback
            .call(ctx, instance, &local, &mut body_rv.handles)?;

        for (position, offset) in op.input_offsets.iter().enumerate() {
            ctx.accum_grad(local[*offset], args[n_args + position].ir_id())?;
            ctx.enqueue(AdMode::Forward, local[*offset]);
        }
        // Implicit dependencies ride along with their own tangents.
        for node in &op.input_nodes[op.input_offsets.len()..] {
            ctx.enqueue_id(AdMode::Forward, *node);
        }
        ctx.traverse(AdMode::Forward, AdFlag::ClearNone)?;

        for offset in &op.output_offsets {
            let tangent = ctx.grad(body_rv.handles[*offset])?;
            rv.push(Index64::from_ir(tangent));
        }
        Ok(())
    }
}

/// Runs the body, seeds the incoming cotangents on copies of the body's
/// outputs, traverses backward, and returns the cotangents of the
/// tracked inputs as the new return values.
struct BackwardBody<'a> {
    op: &'a CallOp,
}

impl CallCallback for BackwardBody<'_> {
    fn call(
        &self,
        ctx: &AdContext,
        instance: &Instance,
        args: &[Index64],
        rv: &mut Vec<Index64>,
    ) -> Result<(), DispatchError> {
        let op = self.op;
        let n_args = op.args.len();

        // Confine the traversal below to this callable's fresh nodes.
        let _cb_boundary = IsolationGuard::new(ctx);

        let mut local: Vec<Index64> = args[..n_args].to_vec();
        let mut fresh = IndexHandles::new(ctx);
        for offset in &op.input_offsets {
            let promoted = ctx.var_new(local[*offset].ir_id())?;
            fresh.push_owned(promoted);
            local[*offset] = promoted;
        }

        let mut body_rv = IndexHandles::new(ctx);
        op.callback
            .call(ctx, instance, &local, &mut body_rv.handles)?;

        let mut copies = IndexHandles::new(ctx);
        for (position, offset) in op.output_offsets.iter().enumerate() {
            let copy = ctx.var_copy(body_rv.handles[*offset])?;
            copies.push_owned(copy);
            ctx.accum_grad(copy, args[n_args + position].ir_id())?;
            ctx.enqueue(AdMode::Backward, copy);
        }
        ctx.traverse(AdMode::Backward, AdFlag::ClearNone)?;

        for offset in &op.input_offsets {
            let cotangent = ctx.grad(local[*offset])?;
            rv.push(Index64::from_ir(cotangent));
        }
        Ok(())
    }
}
