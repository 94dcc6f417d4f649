//! Evaluated strategy: bucketize lanes by callable id, evaluate one
//! materialized kernel per bucket, and scatter the results back.

use log::debug;
use vx_core::{Index64, ReduceOp};
use vx_ad::AdContext;

use crate::scoped::{IndexHandles, IrHandles, ScopedMask, ScopedSelf};
use crate::{CallCallback, DispatchError, Instance, check_rv};

#[allow(clippy::too_many_arguments)]
pub(crate) fn reduce_strategy(
    ctx: &AdContext,
    name: &str,
    domain: Option<&str>,
    size: usize,
    index: u32,
    mask: u32,
    args: &[Index64],
    rv: &mut Vec<Index64>,
    callback: &dyn CallCallback,
) -> Result<(), DispatchError> {
    let ir = ctx.ir();
    debug!("call('{name}'): evaluated strategy, width {size}");

    // Masked-off lanes fold into the inactive id-0 bucket.
    let mut locals = IrHandles::new(ir);
    let masked_index = if mask != 0 {
        ir.and(index, mask)?
    } else {
        ir.inc_ref(index)?;
        index
    };
    locals.push_owned(masked_index);

    ir.schedule(masked_index)?;
    for arg in args {
        ir.schedule(arg.ir_id())?;
    }
    ir.eval()?;

    let buckets = ir.call_reduce(masked_index)?;
    let mut perms = IrHandles::new(ir);
    for bucket in &buckets {
        perms.push_owned(bucket.perm);
    }

    let memop_mask = ir.bool_const(true);
    locals.push_owned(memop_mask);

    let mut last_size = 0_usize;
    for bucket in &buckets {
        if bucket.id == 0 {
            continue;
        }
        let instance = match domain {
            Some(domain) => match ir.registry_get(domain, bucket.id) {
                Some(object) => Instance::Object(object),
                None => {
                    return Err(DispatchError::RegistryMiss {
                        name: name.to_owned(),
                        id: bucket.id,
                    });
                }
            },
            None => Instance::Index(bucket.id),
        };

        // Two consecutive wavefronts of equal width would otherwise be
        // fused into one kernel by the emitter.
        if last_size == bucket.width {
            ir.eval()?;
        }
        last_size = bucket.width;

        let _mask_guard = ScopedMask::new(ir, ir.mask_default(bucket.width))?;

        let mut bucket_args = IndexHandles::new(ctx);
        for arg in args {
            bucket_args.push_owned(ctx.gather(*arg, bucket.perm, memop_mask)?);
        }

        // Per-lane instance ids, so user code asking "who am I?" sees
        // the right answer for every lane of the bucket.
        let lane_ids = ir.gather(masked_index, bucket.perm, memop_mask)?;
        let _self_guard = ScopedSelf::new(ir, bucket.id, lane_ids)?;

        let mut rv_i = IndexHandles::new(ctx);
        callback.call(ctx, &instance, &bucket_args.handles, &mut rv_i.handles)?;
        check_rv(ctx, name, size, bucket.id, rv, &rv_i.handles)?;

        for (slot, value) in rv_i.handles.iter().enumerate() {
            let merged = ctx.scatter(rv[slot], *value, bucket.perm, memop_mask, ReduceOp::None)?;
            ctx.release(rv[slot])?;
            rv[slot] = merged;
        }
    }

    for slot in rv.iter() {
        ir.schedule(slot.ir_id())?;
    }
    Ok(())
}
