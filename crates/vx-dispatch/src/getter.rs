//! Getter strategy: when every callable returns scalar literals (or
//! already-materialized scalars), the whole call compiles into a gather
//! from a packed per-callable table.

use log::debug;
use vx_core::{Index64, VarState};
use vx_ad::AdContext;
use vx_ir::AggEntry;

use crate::scoped::{IndexHandles, IrHandles, ScopedRecord, ScopedSelf};
use crate::{CallCallback, DispatchError, Instance, check_rv};

#[allow(clippy::too_many_arguments)]
pub(crate) fn getter_strategy(
    ctx: &AdContext,
    name: &str,
    domain: Option<&str>,
    callable_count: u32,
    size: usize,
    index: u32,
    mask: u32,
    rv: &mut Vec<Index64>,
    rv_ad: &mut Vec<bool>,
    callback: &dyn CallCallback,
) -> Result<(), DispatchError> {
    let ir = ctx.ir();
    debug!("call('{name}'): getter strategy, {callable_count} callables");

    // Lanes with the null instance are masked out of the final gather.
    let mut locals = IrHandles::new(ir);
    let null_instance = ir.u32_const(0);
    locals.push_owned(null_instance);
    let is_non_null = ir.neq(index, null_instance)?;
    locals.push_owned(is_non_null);
    let base_mask = if mask != 0 {
        ir.inc_ref(mask)?;
        mask
    } else {
        ir.bool_const(true)
    };
    locals.push_owned(base_mask);
    let gather_mask = ir.and(base_mask, is_non_null)?;
    locals.push_owned(gather_mask);

    // Per-callable rows of borrowed scalar handles; the rows live until
    // aggregation completes so evaluated entries stay valid.
    let mut rows: Vec<Option<Vec<u32>>> = vec![None; callable_count as usize];
    let mut row_store = IrHandles::new(ir);

    for i in 0..callable_count {
        let instance = match domain {
            Some(domain) => match ir.registry_get(domain, i + 1) {
                Some(object) => Instance::Object(object),
                None => continue,
            },
            None => Instance::Index(i + 1),
        };

        let mut rv_i = IndexHandles::new(ctx);
        {
            // Throwaway scope: whatever IR the getter records besides
            // its return values is discarded.
            let _record = ScopedRecord::new(ir);
            let _self_guard = ScopedSelf::new(ir, i + 1, 0)?;
            callback.call(ctx, &instance, &[], &mut rv_i.handles)?;
            for handle in &rv_i.handles {
                ctx.check_implicit(*handle);
            }
        }
        check_rv(ctx, name, size, i + 1, rv, &rv_i.handles)?;

        if rv_ad.is_empty() {
            rv_ad.resize(rv_i.handles.len(), false);
        }
        let mut row = Vec::with_capacity(rv_i.handles.len());
        for (slot, handle) in rv_i.handles.iter().enumerate() {
            rv_ad[slot] |= handle.is_tracked();
            let scalar_size = ir.var_size(handle.ir_id())?;
            if scalar_size != 1 {
                return Err(DispatchError::ReturnNotScalar {
                    name: name.to_owned(),
                    callable: i + 1,
                    size: scalar_size,
                });
            }
            row_store.push_borrowed(handle.ir_id())?;
            row.push(handle.ir_id());
        }
        rows[i as usize] = Some(row);
    }

    for slot in 0..rv.len() {
        ctx.release(rv[slot])?;
        rv[slot] = Index64::ZERO;

        // If every callable produced the identical handle, the gather
        // collapses to that single value.
        let mut shared: Option<u32> = None;
        let mut uniform = true;
        for row in &rows {
            match row {
                Some(row) => match shared {
                    None => shared = Some(row[slot]),
                    Some(handle) if handle == row[slot] => {}
                    Some(_) => {
                        uniform = false;
                        break;
                    }
                },
                None => {
                    uniform = false;
                    break;
                }
            }
        }
        if uniform && let Some(handle) = shared {
            ir.inc_ref(handle)?;
            rv[slot] = Index64::from_ir(handle);
            continue;
        }

        let first = rows
            .iter()
            .flatten()
            .next()
            .map(|row| row[slot])
            .ok_or(DispatchError::EmptyReturn {
                name: name.to_owned(),
                callable: 0,
            })?;
        let ty = ir.var_type(first)?;

        let mut entries = Vec::with_capacity(callable_count as usize);
        for row in &rows {
            let entry = match row {
                // Unregistered callables contribute the sentinel value.
                None => AggEntry::Immediate(0),
                Some(row) => {
                    let handle = row[slot];
                    match ir.var_state(handle)? {
                        VarState::Literal => AggEntry::Immediate(ir.read(handle, 0)?),
                        _ => AggEntry::Var(handle),
                    }
                }
            };
            entries.push(entry);
        }

        let table = ir.aggregate(ty, &entries)?;
        let gathered = ir.gather(table, index, gather_mask)?;
        ir.dec_ref(table)?;
        rv[slot] = Index64::from_ir(gathered);
    }
    Ok(())
}
