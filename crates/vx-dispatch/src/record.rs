//! Recording strategy: trace every callable once into a shared region
//! and emit a single indirect-branch instruction.

use log::debug;
use vx_core::Index64;
use vx_ad::AdContext;

use crate::scoped::{IndexHandles, IrHandles, ScopedMask, ScopedRecord, ScopedSelf};
use crate::{CallCallback, DispatchError, Instance, check_rv};

#[allow(clippy::too_many_arguments)]
pub(crate) fn record_strategy(
    ctx: &AdContext,
    name: &str,
    domain: Option<&str>,
    callable_count: u32,
    size: usize,
    index: u32,
    mask: u32,
    args: &[Index64],
    rv: &mut Vec<Index64>,
    rv_ad: &mut Vec<bool>,
    callback: &dyn CallCallback,
) -> Result<(), DispatchError> {
    let ir = ctx.ir();
    debug!("call('{name}'): record strategy, {callable_count} callables, width {size}");

    // Normalized call mask, owned locally.
    let mut mask_local = IrHandles::new(ir);
    if mask != 0 {
        mask_local.push_borrowed(mask)?;
    } else {
        mask_local.push_owned(ir.bool_const(true));
    }
    let mask_handle = mask_local.handles[0];

    let mut checkpoints = vec![0_u32; callable_count as usize + 1];
    let mut instance_ids: Vec<u32> = Vec::with_capacity(callable_count as usize);

    let mut record = ScopedRecord::new(ir);

    // Wrap the inputs so they are clearly exposed as entering the call
    // region; tracked inputs additionally get a fresh AD tag so body
    // derivatives stay region-local.
    let mut wrapped = IrHandles::new(ir);
    let mut region_args = IndexHandles::new(ctx);
    for arg in args {
        let input = ir.call_input(arg.ir_id())?;
        wrapped.push_owned(input);
        if arg.is_tracked() {
            region_args.push_owned(ctx.var_new(input)?);
        } else {
            ir.inc_ref(input)?;
            region_args.push_owned(Index64::from_ir(input));
        }
    }

    let mut rv_flat = IrHandles::new(ir);
    {
        let call_mask = ir.call_mask()?;
        let _mask_guard = ScopedMask::new(ir, call_mask)?;

        for i in 0..callable_count {
            checkpoints[i as usize] = record.checkpoint_and_rewind();

            let instance = match domain {
                Some(domain) => match ir.registry_get(domain, i + 1) {
                    Some(object) => Instance::Object(object),
                    // Unregistered slot: its region stays empty and its
                    // checkpoint equals the previous one.
                    None => continue,
                },
                None => Instance::Index(i + 1),
            };

            let _self_guard = ScopedSelf::new(ir, i + 1, 0)?;
            let mut rv_i = IndexHandles::new(ctx);
            callback.call(ctx, &instance, &region_args.handles, &mut rv_i.handles)?;

            for handle in &rv_i.handles {
                ctx.check_implicit(*handle);
            }
            check_rv(ctx, name, size, i + 1, rv, &rv_i.handles)?;

            if rv_ad.is_empty() {
                rv_ad.resize(rv_i.handles.len(), false);
            }
            for (slot, handle) in rv_i.handles.iter().enumerate() {
                rv_ad[slot] |= handle.is_tracked();
                rv_flat.push_borrowed(handle.ir_id())?;
            }
            instance_ids.push(i + 1);
        }

        checkpoints[callable_count as usize] = record.checkpoint_and_rewind();
    }

    let outputs = ir.emit_call(
        name,
        index,
        mask_handle,
        &instance_ids,
        &wrapped.handles,
        &rv_flat.handles,
        &checkpoints,
        rv.len(),
    )?;

    for (slot, output) in outputs.into_iter().enumerate() {
        ctx.release(rv[slot])?;
        rv[slot] = Index64::from_ir(output);
    }

    record.disarm();
    Ok(())
}
