use std::rc::Rc;

use vx_core::{BackendKind, Index64};
use vx_ad::AdContext;

use crate::state::StateWalker;
use crate::{
    BranchFn, CflowError, CflowMode, Condition, StateTree, if_stmt, release_state, while_loop,
};

fn leaf_f64(ctx: &AdContext, values: &[f64]) -> StateTree {
    StateTree::Leaf(Index64::from_ir(ctx.ir().array_f64(values)))
}

fn leaf_u32(ctx: &AdContext, values: &[u32]) -> StateTree {
    StateTree::Leaf(Index64::from_ir(ctx.ir().array_u32(values)))
}

fn leaf_values(ctx: &AdContext, state: &StateTree) -> Vec<f64> {
    match state {
        StateTree::Leaf(handle) => ctx.ir().to_vec_f64(handle.ir_id()).expect("read leaf"),
        _ => panic!("expected leaf"),
    }
}

#[test]
fn abs_via_if_scalar_mode() {
    let ctx = AdContext::new(BackendKind::Host);
    let state = leaf_f64(&ctx, &[-3.0]);
    let negate: Rc<BranchFn> = Rc::new(|ctx, state| {
        let StateTree::Leaf(x) = state else {
            panic!("leaf state")
        };
        Ok(StateTree::Leaf(ctx.neg(*x)?))
    });
    let keep: Rc<BranchFn> = Rc::new(|ctx, state| {
        let StateTree::Leaf(x) = state else {
            panic!("leaf state")
        };
        Ok(StateTree::Leaf(ctx.retain(*x)?))
    });

    let result = if_stmt(
        &ctx,
        Condition::Scalar(true),
        &state,
        negate,
        keep,
        &[],
        "abs",
        CflowMode::Auto,
    )
    .expect("scalar if");
    assert_eq!(leaf_values(&ctx, &result), vec![3.0]);
    release_state(&ctx, &result).expect("release");
    release_state(&ctx, &state).expect("release");
}

fn abs_branches() -> (Rc<BranchFn>, Rc<BranchFn>) {
    let negate: Rc<BranchFn> = Rc::new(|ctx: &AdContext, state: &StateTree| {
        let StateTree::Leaf(x) = state else {
            panic!("leaf state")
        };
        Ok(StateTree::Leaf(ctx.neg(*x)?))
    });
    let keep: Rc<BranchFn> = Rc::new(|ctx: &AdContext, state: &StateTree| {
        let StateTree::Leaf(x) = state else {
            panic!("leaf state")
        };
        Ok(StateTree::Leaf(ctx.retain(*x)?))
    });
    (negate, keep)
}

#[test]
fn abs_via_if_vectorized() {
    for symbolic in [true, false] {
        let ctx = AdContext::new(BackendKind::Host);
        ctx.ir().set_symbolic_calls(symbolic);
        let values = ctx.ir().array_f64(&[-2.0, -1.0, 0.0, 1.0, 2.0]);
        let state = StateTree::Leaf(Index64::from_ir(values));
        let zero = ctx.ir().literal_f64(0.0, 1);
        let cond = ctx.ir().lt(values, zero).expect("lt");
        ctx.ir().dec_ref(zero).expect("release zero");

        let (negate, keep) = abs_branches();
        let result = if_stmt(
            &ctx,
            Condition::Var(Index64::from_ir(cond)),
            &state,
            negate,
            keep,
            &["x"],
            "abs",
            CflowMode::Auto,
        )
        .expect("vector if");

        assert_eq!(
            leaf_values(&ctx, &result),
            vec![2.0, 1.0, 0.0, 1.0, 2.0],
            "symbolic = {symbolic}"
        );
        release_state(&ctx, &result).expect("release result");
        release_state(&ctx, &state).expect("release state");
        ctx.ir().dec_ref(cond).expect("release cond");
        assert_eq!(ctx.ir().mask_depth(), 0);
        assert_eq!(ctx.ir().record_depth(), 0);
    }
}

#[test]
fn branch_shape_mismatch_is_reported() {
    let ctx = AdContext::new(BackendKind::Host);
    ctx.ir().set_symbolic_calls(true);
    let values = ctx.ir().array_f64(&[1.0, -1.0]);
    let state = StateTree::Leaf(Index64::from_ir(values));
    let zero = ctx.ir().literal_f64(0.0, 1);
    let cond = ctx.ir().lt(values, zero).expect("lt");
    ctx.ir().dec_ref(zero).expect("release zero");

    let one_value: Rc<BranchFn> = Rc::new(|ctx: &AdContext, state: &StateTree| {
        let StateTree::Leaf(x) = state else {
            panic!("leaf state")
        };
        Ok(StateTree::Leaf(ctx.retain(*x)?))
    });
    let two_values: Rc<BranchFn> = Rc::new(|ctx: &AdContext, state: &StateTree| {
        let StateTree::Leaf(x) = state else {
            panic!("leaf state")
        };
        Ok(StateTree::Tuple(vec![
            StateTree::Leaf(ctx.retain(*x)?),
            StateTree::Leaf(ctx.retain(*x)?),
        ]))
    });

    let err = if_stmt(
        &ctx,
        Condition::Var(Index64::from_ir(cond)),
        &state,
        one_value,
        two_values,
        &[],
        "uneven",
        CflowMode::Auto,
    )
    .expect_err("shape mismatch");
    assert!(
        matches!(err, CflowError::ReturnShapeMismatch { .. }),
        "got {err}"
    );
    assert_eq!(ctx.ir().mask_depth(), 0);
    assert_eq!(ctx.ir().record_depth(), 0);
}

fn count_loop(
    ctx: &AdContext,
    mode: CflowMode,
) -> Result<StateTree, CflowError> {
    let state = StateTree::Tuple(vec![leaf_u32(ctx, &[0]), leaf_u32(ctx, &[0])]);
    let result = while_loop(
        ctx,
        &state,
        &|ctx: &AdContext, state: &StateTree| {
            let StateTree::Tuple(items) = state else {
                panic!("tuple state")
            };
            let StateTree::Leaf(i) = &items[0] else {
                panic!("leaf i")
            };
            let five = ctx.ir().u32_const(5);
            let cond = ctx.ir().lt(i.ir_id(), five)?;
            ctx.ir().dec_ref(five)?;
            Ok(Condition::Var(Index64::from_ir(cond)))
        },
        &|ctx: &AdContext, state: &StateTree| {
            let StateTree::Tuple(items) = state else {
                panic!("tuple state")
            };
            let (StateTree::Leaf(i), StateTree::Leaf(s)) = (&items[0], &items[1]) else {
                panic!("leaf state")
            };
            let one = ctx.ir().u32_const(1);
            let next_i = ctx.ir().add(i.ir_id(), one)?;
            ctx.ir().dec_ref(one)?;
            let next_s = ctx.ir().add(s.ir_id(), i.ir_id())?;
            Ok(StateTree::Tuple(vec![
                StateTree::Leaf(Index64::from_ir(next_i)),
                StateTree::Leaf(Index64::from_ir(next_s)),
            ]))
        },
        &["i", "s"],
        "count",
        mode,
    );
    release_state(ctx, &state)?;
    result
}

#[test]
fn counting_loop_terminates_with_sum() {
    for mode in [CflowMode::Symbolic, CflowMode::Evaluated] {
        let ctx = AdContext::new(BackendKind::Host);
        let result = count_loop(&ctx, mode).expect("loop");
        let StateTree::Tuple(items) = &result else {
            panic!("tuple result")
        };
        let (StateTree::Leaf(i), StateTree::Leaf(s)) = (&items[0], &items[1]) else {
            panic!("leaf result")
        };
        assert_eq!(ctx.ir().to_vec_u32(i.ir_id()).expect("i"), vec![5]);
        assert_eq!(ctx.ir().to_vec_u32(s.ir_id()).expect("s"), vec![10]);
        release_state(&ctx, &result).expect("release");
        assert_eq!(ctx.ir().record_depth(), 0);
    }
}

#[test]
fn scalar_loop_runs_on_host() {
    let ctx = AdContext::new(BackendKind::Host);
    let state = StateTree::Tuple(vec![leaf_u32(&ctx, &[0])]);
    let counter = std::cell::Cell::new(0_u32);
    let result = while_loop(
        &ctx,
        &state,
        &|_, _| Ok(Condition::Scalar(counter.get() < 3)),
        &|ctx: &AdContext, state: &StateTree| {
            counter.set(counter.get() + 1);
            crate::retain_state(ctx, state)
        },
        &[],
        "host_loop",
        CflowMode::Auto,
    )
    .expect("scalar loop");
    assert_eq!(counter.get(), 3);
    release_state(&ctx, &result).expect("release");
    release_state(&ctx, &state).expect("release");
}

#[test]
fn loop_state_change_is_rejected() {
    let ctx = AdContext::new(BackendKind::Host);
    let state = StateTree::Tuple(vec![leaf_u32(&ctx, &[0])]);
    let err = while_loop(
        &ctx,
        &state,
        &|ctx: &AdContext, state: &StateTree| {
            let StateTree::Tuple(items) = state else {
                panic!("tuple state")
            };
            let StateTree::Leaf(i) = &items[0] else {
                panic!("leaf i")
            };
            let two = ctx.ir().u32_const(2);
            let cond = ctx.ir().lt(i.ir_id(), two)?;
            ctx.ir().dec_ref(two)?;
            Ok(Condition::Var(Index64::from_ir(cond)))
        },
        &|ctx: &AdContext, _state: &StateTree| {
            // The body returns a float where a u32 entered.
            Ok(StateTree::Tuple(vec![leaf_f64(ctx, &[1.0])]))
        },
        &[],
        "mutating",
        CflowMode::Evaluated,
    )
    .expect_err("state change");
    assert!(matches!(err, CflowError::LoopStateChanged { .. }), "got {err}");
    release_state(&ctx, &state).expect("release");
}

#[test]
fn walker_names_leaves_by_path() {
    let ctx = AdContext::new(BackendKind::Host);
    let state = StateTree::Tuple(vec![
        leaf_u32(&ctx, &[1]),
        StateTree::Dict(vec![("k".to_owned(), leaf_u32(&ctx, &[2]))]),
        StateTree::Record {
            type_name: "Particle".to_owned(),
            fields: vec![("pos".to_owned(), leaf_u32(&ctx, &[3]))],
        },
    ]);
    let mut walker = StateWalker::new(&[]);
    let handles = walker.read(&ctx, &state).expect("read");
    assert_eq!(handles.len(), 3);
    for handle in handles {
        ctx.release(handle).expect("release");
    }

    // A later pass with a changed container layout names the offender.
    let changed = StateTree::Tuple(vec![
        leaf_u32(&ctx, &[1]),
        StateTree::Dict(vec![("other".to_owned(), leaf_u32(&ctx, &[2]))]),
        StateTree::Record {
            type_name: "Particle".to_owned(),
            fields: vec![("pos".to_owned(), leaf_u32(&ctx, &[3]))],
        },
    ]);
    let err = walker.read(&ctx, &changed).expect_err("layout change");
    match err {
        CflowError::LoopStateChanged { name, .. } => {
            assert!(name.contains("arg1"), "unexpected name {name}");
        }
        other => panic!("unexpected error {other}"),
    }
    release_state(&ctx, &state).expect("release");
    release_state(&ctx, &changed).expect("release");
}
