//! Vectorized if-statement: both branches are recorded as the two
//! callables of an indirect conditional, so masking, AD hooking, and
//! error handling are shared with the dispatcher.

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;
use vx_core::{Index64, VarType};
use vx_ad::AdContext;
use vx_dispatch::{CallCallback, CallConfig, DispatchError, Instance};

use crate::state::{StateTree, StateWalker, release_state};
use crate::{CflowError, CflowMode, Condition, FlagGuard, ReleaseList, template_of};

/// One branch body. Owned (`Rc`) because the AD hook may re-run it
/// during later forward/backward passes. Must return a tree of owned
/// handles (retain any input handle it passes through).
pub type BranchFn = dyn Fn(&AdContext, &StateTree) -> Result<StateTree, CflowError>;

/// Run `true_fn` where the condition holds and `false_fn` elsewhere.
///
/// Scalar conditions (in auto or scalar mode) run exactly one branch
/// directly. Otherwise both branches execute against a copy of the
/// state, their results must agree in shape (`rv_labels` names the
/// slots in error messages), and the construct lowers to one indirect
/// call with two callables: 1 = true branch, 2 = false branch.
#[allow(clippy::too_many_arguments)]
pub fn if_stmt(
    ctx: &AdContext,
    cond: Condition,
    state: &StateTree,
    true_fn: Rc<BranchFn>,
    false_fn: Rc<BranchFn>,
    rv_labels: &[&str],
    name: &str,
    mode: CflowMode,
) -> Result<StateTree, CflowError> {
    let scalar = matches!(mode, CflowMode::Scalar)
        || (matches!(mode, CflowMode::Auto) && matches!(cond, Condition::Scalar(_)));

    if scalar {
        let Condition::Scalar(value) = cond else {
            return Err(CflowError::InvalidCondition {
                detail: "scalar mode requires a host boolean condition".to_owned(),
            });
        };
        return if value {
            true_fn(ctx, state)
        } else {
            false_fn(ctx, state)
        };
    }

    let Condition::Var(cond_var) = cond else {
        return Err(CflowError::InvalidCondition {
            detail: "a vectorized if-statement requires a boolean lane vector".to_owned(),
        });
    };
    if cond_var.is_empty() {
        return Err(CflowError::InvalidCondition {
            detail: "condition handle is empty".to_owned(),
        });
    }
    let cond_ty = ctx.ir().var_type(cond_var.ir_id())?;
    if cond_ty != VarType::Bool {
        return Err(CflowError::InvalidCondition {
            detail: format!("condition must be boolean, got {cond_ty}"),
        });
    }
    debug!("if_stmt('{name}'): lowering to a two-callable indirect call");

    let _flag = FlagGuard::set(ctx, mode);

    // Stash references on every input for the duration of the symbolic
    // region, so copy-on-write operations inside observe shared state.
    let mut stash_walker = StateWalker::new(&[]);
    let stash = ReleaseList::from(ctx, stash_walker.read(ctx, state)?);

    // True branch dispatches as callable 1, false branch as callable 2.
    let mut locals = ReleaseList::new(ctx);
    let one = ctx.ir().u32_const(1);
    locals.handles.push(Index64::from_ir(one));
    let two = ctx.ir().u32_const(2);
    locals.handles.push(Index64::from_ir(two));
    let index = ctx.ir().select(cond_var.ir_id(), one, two)?;
    locals.handles.push(Index64::from_ir(index));

    let body = Rc::new(IfBody {
        template: template_of(state),
        true_fn,
        false_fn,
        shared: RefCell::new(IfShared {
            rv_walker: StateWalker::lenient(rv_labels),
            rv_template: None,
            failure: None,
        }),
    });

    let mut rv = Vec::new();
    let outcome = vx_dispatch::call(
        ctx,
        &CallConfig::indexed(name, 2),
        index,
        0,
        &stash.handles,
        &mut rv,
        Rc::clone(&body) as Rc<dyn CallCallback>,
    );
    if let Err(err) = outcome {
        let mut shared = body.shared.borrow_mut();
        return Err(shared.failure.take().unwrap_or_else(|| err.into()));
    }

    let template = {
        let mut shared = body.shared.borrow_mut();
        shared.rv_template.take().ok_or_else(|| {
            CflowError::InternalInvariant("branches produced no return value".to_owned())
        })?
    };
    let mut out_walker = StateWalker::new(rv_labels);
    out_walker.write(ctx, &template, &rv)
}

struct IfShared {
    rv_walker: StateWalker,
    rv_template: Option<StateTree>,
    failure: Option<CflowError>,
}

struct IfBody {
    template: StateTree,
    true_fn: Rc<BranchFn>,
    false_fn: Rc<BranchFn>,
    shared: RefCell<IfShared>,
}

impl IfBody {
    fn run(
        &self,
        ctx: &AdContext,
        instance: &Instance,
        args: &[Index64],
        rv_out: &mut Vec<Index64>,
    ) -> Result<(), CflowError> {
        // Rebuild the state tree from the region's view of the inputs.
        let mut owned = ReleaseList::new(ctx);
        for arg in args {
            owned.handles.push(ctx.retain(*arg)?);
        }
        let mut rebuild = StateWalker::new(&[]);
        let branch_state = rebuild.write(ctx, &self.template, &owned.handles)?;
        let _ = owned.take();

        let branch = if instance.id() == 2 {
            &self.false_fn
        } else {
            &self.true_fn
        };
        let branch_rv = branch(ctx, &branch_state);
        release_state(ctx, &branch_state)?;
        let branch_rv = branch_rv?;

        // The first branch fixes the result shape; the second must match.
        let leaves = {
            let mut shared = self.shared.borrow_mut();
            shared.rv_walker.read(ctx, &branch_rv)
        };
        let leaves = match leaves {
            Ok(leaves) => leaves,
            Err(err) => {
                release_state(ctx, &branch_rv)?;
                return Err(as_shape_mismatch(err));
            }
        };
        {
            let mut shared = self.shared.borrow_mut();
            if shared.rv_template.is_none() {
                shared.rv_template = Some(template_of(&branch_rv));
            }
        }
        release_state(ctx, &branch_rv)?;
        rv_out.extend(leaves);
        Ok(())
    }
}

fn as_shape_mismatch(err: CflowError) -> CflowError {
    match err {
        CflowError::LoopStateChanged { name, detail } => {
            CflowError::ReturnShapeMismatch { slot: name, detail }
        }
        CflowError::LoopSizeConflict { name, from, to } => CflowError::ReturnShapeMismatch {
            slot: name,
            detail: format!("incompatible sizes {from} and {to}"),
        },
        other => other,
    }
}

impl CallCallback for IfBody {
    fn call(
        &self,
        ctx: &AdContext,
        instance: &Instance,
        args: &[Index64],
        rv: &mut Vec<Index64>,
    ) -> Result<(), DispatchError> {
        match self.run(ctx, instance, args, rv) {
            Ok(()) => Ok(()),
            Err(err) => {
                let message = err.to_string();
                self.shared.borrow_mut().failure = Some(err);
                Err(DispatchError::Callback(message))
            }
        }
    }
}
