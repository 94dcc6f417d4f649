use std::cell::Cell;
use std::rc::Rc;

use vx_core::{BackendKind, Index64};
use vx_ad::AdContext;

use crate::{CallCallback, CallConfig, DispatchError, Instance, call};

/// Callable 1 computes `a + 1`, callable 2 computes `a * 2`.
fn pair_callback() -> Rc<dyn CallCallback> {
    Rc::new(
        |ctx: &AdContext,
         instance: &Instance,
         args: &[Index64],
         rv: &mut Vec<Index64>|
         -> Result<(), DispatchError> {
            let ir = ctx.ir();
            let out = if instance.id() == 2 {
                let two = ir.literal_f64(2.0, 1);
                let product = ir.mul(args[0].ir_id(), two)?;
                ir.dec_ref(two)?;
                product
            } else {
                let one = ir.literal_f64(1.0, 1);
                let sum = ir.add(args[0].ir_id(), one)?;
                ir.dec_ref(one)?;
                sum
            };
            rv.push(Index64::from_ir(out));
            Ok(())
        },
    )
}

fn release_rv(ctx: &AdContext, rv: Vec<Index64>) {
    for handle in rv {
        ctx.release(handle).expect("release output");
    }
}

fn assert_stacks_balanced(ctx: &AdContext) {
    assert_eq!(ctx.ir().mask_depth(), 0);
    assert_eq!(ctx.ir().self_depth(), 0);
    assert_eq!(ctx.ir().record_depth(), 0);
}

fn dispatch_pair(ctx: &AdContext, index: &[u32], mask: Option<&[bool]>) -> Vec<f64> {
    let arg = ctx.ir().array_f64(&[10.0, 20.0, 30.0, 40.0]);
    let index_h = ctx.ir().array_u32(index);
    let mask_h = mask.map_or(0, |m| ctx.ir().array_bool(m));

    let mut rv = Vec::new();
    call(
        ctx,
        &CallConfig::indexed("pair", 2),
        index_h,
        mask_h,
        &[Index64::from_ir(arg)],
        &mut rv,
        pair_callback(),
    )
    .expect("dispatch");

    let values = ctx.ir().to_vec_f64(rv[0].ir_id()).expect("read output");
    release_rv(ctx, rv);
    for handle in [arg, index_h] {
        ctx.ir().dec_ref(handle).expect("release input");
    }
    if mask_h != 0 {
        ctx.ir().dec_ref(mask_h).expect("release mask");
    }
    values
}

#[test]
fn two_callable_dispatch_recorded() {
    let ctx = AdContext::new(BackendKind::Host);
    ctx.ir().set_symbolic_calls(true);
    assert_eq!(
        dispatch_pair(&ctx, &[1, 2, 1, 2], None),
        vec![11.0, 40.0, 31.0, 80.0]
    );
    assert_stacks_balanced(&ctx);
}

#[test]
fn two_callable_dispatch_evaluated() {
    let ctx = AdContext::new(BackendKind::Host);
    assert_eq!(
        dispatch_pair(&ctx, &[1, 2, 1, 2], None),
        vec![11.0, 40.0, 31.0, 80.0]
    );
    assert_stacks_balanced(&ctx);
}

#[test]
fn null_instance_lanes_produce_zero() {
    for symbolic in [true, false] {
        let ctx = AdContext::new(BackendKind::Host);
        ctx.ir().set_symbolic_calls(symbolic);
        assert_eq!(
            dispatch_pair(&ctx, &[1, 0, 1, 2], Some(&[true, true, true, true])),
            vec![11.0, 0.0, 31.0, 80.0]
        );
        assert_stacks_balanced(&ctx);
    }
}

#[test]
fn mode_conflict_is_rejected() {
    let ctx = AdContext::new(BackendKind::Host);
    let index = ctx.ir().array_u32(&[1]);
    let mut rv = Vec::new();
    let mut cfg = CallConfig::indexed("conflicted", 2);
    cfg.domain = Some("things");
    let err = call(&ctx, &cfg, index, 0, &[], &mut rv, pair_callback())
        .expect_err("both domain and count must be rejected");
    assert!(matches!(err, DispatchError::ModeConflict { .. }));
    assert!(rv.is_empty());
}

#[test]
fn shape_mismatch_is_rejected() {
    let ctx = AdContext::new(BackendKind::Host);
    let index = ctx.ir().array_u32(&[1, 2, 1]);
    let arg = ctx.ir().array_f64(&[1.0, 2.0]);
    let mut rv = Vec::new();
    let err = call(
        &ctx,
        &CallConfig::indexed("mismatched", 2),
        index,
        0,
        &[Index64::from_ir(arg)],
        &mut rv,
        pair_callback(),
    )
    .expect_err("3-wide index and 2-wide arg must be rejected");
    assert!(matches!(err, DispatchError::ShapeMismatch { .. }));
}

#[test]
fn degenerate_mask_returns_zero_literals() {
    let ctx = AdContext::new(BackendKind::Host);
    let index = ctx.ir().array_u32(&[1, 2]);
    let arg = ctx.ir().array_f64(&[5.0, 6.0]);
    let mask = ctx.ir().bool_const(false);

    let mut rv = Vec::new();
    call(
        &ctx,
        &CallConfig::indexed("inactive", 2),
        index,
        mask,
        &[Index64::from_ir(arg)],
        &mut rv,
        pair_callback(),
    )
    .expect("degenerate dispatch");

    assert_eq!(rv.len(), 1);
    assert!(ctx.ir().is_zero_literal(rv[0].ir_id()));
    assert_eq!(ctx.ir().var_size(rv[0].ir_id()), Ok(2));
    release_rv(&ctx, rv);
    assert_stacks_balanced(&ctx);
}

#[test]
fn evaluated_call_inside_symbolic_region_is_rejected() {
    let ctx = AdContext::new(BackendKind::Host);
    let checkpoint = ctx.ir().record_begin();
    let index = ctx.ir().array_u32(&[1]);
    let mut rv = Vec::new();
    let err = call(
        &ctx,
        &CallConfig::indexed("nested", 1),
        index,
        0,
        &[],
        &mut rv,
        pair_callback(),
    )
    .expect_err("evaluated call inside a symbolic region");
    assert!(matches!(err, DispatchError::SymbolicModeRequired));
    ctx.ir().record_end(checkpoint, true).expect("unwind");
}

#[test]
fn return_arity_mismatch_unwinds_cleanly() {
    let ctx = AdContext::new(BackendKind::Host);
    ctx.ir().set_symbolic_calls(true);
    let index = ctx.ir().array_u32(&[1, 2]);
    let arg = ctx.ir().array_f64(&[1.0, 2.0]);
    let arg_refs = ctx.ir().refcount(arg).expect("refcount");

    let callback: Rc<dyn CallCallback> = Rc::new(
        |ctx: &AdContext,
         instance: &Instance,
         args: &[Index64],
         rv: &mut Vec<Index64>|
         -> Result<(), DispatchError> {
            let ir = ctx.ir();
            let one = ir.literal_f64(1.0, 1);
            let sum = ir.add(args[0].ir_id(), one)?;
            ir.dec_ref(one)?;
            rv.push(Index64::from_ir(sum));
            if instance.id() == 2 {
                // One value too many.
                rv.push(Index64::from_ir(ir.literal_f64(0.0, 1)));
            }
            Ok(())
        },
    );

    let mut rv = Vec::new();
    let err = call(
        &ctx,
        &CallConfig::indexed("uneven", 2),
        index,
        0,
        &[Index64::from_ir(arg)],
        &mut rv,
        callback,
    )
    .expect_err("arity mismatch");
    assert!(matches!(err, DispatchError::ReturnArityMismatch { .. }));
    assert!(rv.is_empty());
    assert_stacks_balanced(&ctx);
    // No net change in the input's reference count.
    assert_eq!(ctx.ir().refcount(arg), Ok(arg_refs));
}

#[test]
fn self_is_visible_during_recording() {
    let ctx = AdContext::new(BackendKind::Host);
    ctx.ir().set_symbolic_calls(true);
    let observed = Rc::new(Cell::new(0_u32));
    let observed_inner = Rc::clone(&observed);

    let callback: Rc<dyn CallCallback> = Rc::new(
        move |ctx: &AdContext,
              _instance: &Instance,
              _args: &[Index64],
              rv: &mut Vec<Index64>|
              -> Result<(), DispatchError> {
            let (value, _) = ctx.ir().self_read();
            observed_inner.set(observed_inner.get().max(value));
            rv.push(Index64::from_ir(ctx.ir().literal_f64(1.0, 1)));
            Ok(())
        },
    );

    let index = ctx.ir().array_u32(&[1, 2, 3]);
    let mut rv = Vec::new();
    call(
        &ctx,
        &CallConfig::indexed("who_am_i", 3),
        index,
        0,
        &[],
        &mut rv,
        callback,
    )
    .expect("dispatch");
    assert_eq!(observed.get(), 3);
    assert_eq!(ctx.ir().self_read(), (0, 0));
    release_rv(&ctx, rv);
}

/// Counts drops so tests can observe the exactly-once cleanup contract.
struct CountingCallback {
    drops: Rc<Cell<u32>>,
}

impl CallCallback for CountingCallback {
    fn call(
        &self,
        ctx: &AdContext,
        _instance: &Instance,
        args: &[Index64],
        rv: &mut Vec<Index64>,
    ) -> Result<(), DispatchError> {
        let one = ctx.ir().literal_f64(1.0, 1);
        let sum = ctx.add(args[0], Index64::from_ir(one))?;
        ctx.ir().dec_ref(one)?;
        rv.push(sum);
        Ok(())
    }
}

impl Drop for CountingCallback {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

#[test]
fn callback_released_exactly_once_with_ad_hook() {
    let drops = Rc::new(Cell::new(0_u32));
    let ctx = AdContext::new(BackendKind::Host);
    ctx.ir().set_symbolic_calls(true);

    let plain = ctx.ir().array_f64(&[1.0, 2.0]);
    let tracked = ctx.var_new(plain).expect("leaf");
    ctx.ir().dec_ref(plain).expect("release plain");
    let index = ctx.ir().array_u32(&[1, 1]);

    let mut rv = Vec::new();
    let retained = call(
        &ctx,
        &CallConfig::indexed("hooked", 1),
        index,
        0,
        &[tracked],
        &mut rv,
        Rc::new(CountingCallback {
            drops: Rc::clone(&drops),
        }),
    )
    .expect("dispatch");

    // The CustomOp took over the callback; it survives the caller's
    // reference and dies with the op when the outputs are released.
    assert!(retained);
    assert!(rv[0].is_tracked());
    assert_eq!(drops.get(), 0);
    release_rv(&ctx, rv);
    assert_eq!(drops.get(), 1);
    ctx.release(tracked).expect("release input");
}

#[test]
fn callback_released_exactly_once_on_failure() {
    let drops = Rc::new(Cell::new(0_u32));
    let ctx = AdContext::new(BackendKind::Host);
    let mut rv = Vec::new();
    let mut cfg = CallConfig::indexed("failing", 1);
    cfg.domain = Some("things");
    let index = ctx.ir().array_u32(&[1]);
    call(
        &ctx,
        &cfg,
        index,
        0,
        &[],
        &mut rv,
        Rc::new(CountingCallback {
            drops: Rc::clone(&drops),
        }),
    )
    .expect_err("mode conflict");
    assert_eq!(drops.get(), 1);
}
