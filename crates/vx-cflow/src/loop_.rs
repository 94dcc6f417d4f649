//! While-loop frontend: scalar loops run directly, evaluated loops
//! iterate eagerly with a carried active mask, and symbolic loops
//! record the condition and body once into a single loop instruction.

use log::{debug, warn};
use vx_core::{Index64, VarType};
use vx_ad::AdContext;
use vx_ir::IrContext;

use crate::state::{StateTree, StateWalker, release_state, retain_state};
use crate::{CflowError, CflowMode, Condition, FlagGuard, ReleaseList, template_of};

pub type CondFn<'a> = dyn Fn(&AdContext, &StateTree) -> Result<Condition, CflowError> + 'a;
pub type BodyFn<'a> = dyn Fn(&AdContext, &StateTree) -> Result<StateTree, CflowError> + 'a;

/// Evolve `state` with `body_fn` while `cond_fn` holds.
///
/// The state may nest tuples, lists, dicts, and records; its leaves are
/// enumerated in a fixed order with path-derived names, and every
/// iteration must preserve that structure. Leaf sizes may grow from 1
/// to the loop width once; any other size change is an error.
pub fn while_loop(
    ctx: &AdContext,
    state: &StateTree,
    cond_fn: &CondFn<'_>,
    body_fn: &BodyFn<'_>,
    labels: &[&str],
    name: &str,
    mode: CflowMode,
) -> Result<StateTree, CflowError> {
    // The first condition evaluation decides between a host loop and a
    // vectorized one.
    let first = cond_fn(ctx, state)?;
    let scalar = matches!(mode, CflowMode::Scalar)
        || (matches!(mode, CflowMode::Auto) && matches!(first, Condition::Scalar(_)));

    if scalar {
        let Condition::Scalar(active) = first else {
            if let Condition::Var(handle) = first {
                ctx.release(handle)?;
            }
            return Err(CflowError::InvalidCondition {
                detail: "scalar mode requires a host boolean condition".to_owned(),
            });
        };
        return scalar_loop(ctx, state, cond_fn, body_fn, labels, active);
    }

    let Condition::Var(first_var) = first else {
        return Err(CflowError::InvalidCondition {
            detail: "a vectorized loop requires a boolean lane vector".to_owned(),
        });
    };
    let first_guard = ReleaseList::from(ctx, vec![first_var]);
    if ctx.ir().var_type(first_var.ir_id())? != VarType::Bool {
        return Err(CflowError::InvalidCondition {
            detail: format!(
                "loop condition must be boolean, got {}",
                ctx.ir().var_type(first_var.ir_id())?
            ),
        });
    }

    let _flag = FlagGuard::set(ctx, mode);
    let symbolic = match mode {
        CflowMode::Symbolic => true,
        CflowMode::Evaluated => false,
        CflowMode::Auto | CflowMode::Scalar => ctx.ir().symbolic_calls(),
    };

    if symbolic {
        drop(first_guard);
        symbolic_loop(ctx, state, cond_fn, body_fn, labels, name)
    } else {
        let first = first_guard.take().remove(0);
        evaluated_loop(ctx, state, cond_fn, body_fn, labels, name, first)
    }
}

fn scalar_loop(
    ctx: &AdContext,
    state: &StateTree,
    cond_fn: &CondFn<'_>,
    body_fn: &BodyFn<'_>,
    labels: &[&str],
    mut active: bool,
) -> Result<StateTree, CflowError> {
    let mut walker = StateWalker::new(labels);
    for handle in walker.read(ctx, state)? {
        ctx.release(handle)?;
    }

    let mut current = retain_state(ctx, state)?;
    while active {
        let next = match scalar_step(ctx, &current, body_fn, &mut walker) {
            Ok(next) => next,
            Err(err) => {
                release_state(ctx, &current)?;
                return Err(err);
            }
        };
        release_state(ctx, &current)?;
        current = next;

        active = match cond_fn(ctx, &current) {
            Ok(Condition::Scalar(value)) => value,
            Ok(Condition::Var(handle)) => {
                ctx.release(handle)?;
                release_state(ctx, &current)?;
                return Err(CflowError::InvalidCondition {
                    detail: "scalar loop condition became a lane vector".to_owned(),
                });
            }
            Err(err) => {
                release_state(ctx, &current)?;
                return Err(err);
            }
        };
    }
    Ok(current)
}

/// One scalar iteration: run the body, validate the new structure, and
/// release the validation handles again.
fn scalar_step(
    ctx: &AdContext,
    current: &StateTree,
    body_fn: &BodyFn<'_>,
    walker: &mut StateWalker,
) -> Result<StateTree, CflowError> {
    let next = body_fn(ctx, current)?;
    match walker.read(ctx, &next) {
        Ok(handles) => {
            for handle in handles {
                ctx.release(handle)?;
            }
            Ok(next)
        }
        Err(err) => {
            release_state(ctx, &next)?;
            Err(err)
        }
    }
}

fn evaluated_loop(
    ctx: &AdContext,
    state: &StateTree,
    cond_fn: &CondFn<'_>,
    body_fn: &BodyFn<'_>,
    labels: &[&str],
    name: &str,
    first: Index64,
) -> Result<StateTree, CflowError> {
    debug!("while_loop('{name}'): evaluated mode");
    let template = template_of(state);
    let mut walker = StateWalker::new(labels);
    let mut current = ReleaseList::from(ctx, walker.read(ctx, state)?);
    let mut active = ReleaseList::new(ctx);
    let mut pending = Some(first);

    loop {
        let view = StateWalker::new(labels).write(ctx, &template, &current.handles)?;

        let cond_v = match pending.take() {
            Some(handle) => handle,
            None => match cond_fn(ctx, &view)? {
                Condition::Var(handle) => handle,
                Condition::Scalar(value) => Index64::from_ir(ctx.ir().bool_const(value)),
            },
        };

        // Fold the fresh condition into the carried active mask: a lane
        // that exits once stays inactive.
        let folded_ir = {
            let cond_guard = ReleaseList::from(ctx, vec![cond_v]);
            match active.handles.first().copied() {
                None => {
                    active.handles.push(cond_guard.take().remove(0));
                }
                Some(previous) => {
                    let combined = ctx.ir().and(previous.ir_id(), cond_v.ir_id())?;
                    let old = std::mem::replace(
                        &mut active.handles,
                        vec![Index64::from_ir(combined)],
                    );
                    for handle in old {
                        ctx.release(handle)?;
                    }
                }
            }
            active.handles[0].ir_id()
        };

        let lanes = ctx.ir().to_vec_bool(folded_ir)?;
        if !lanes.iter().any(|lane| *lane) {
            break;
        }

        let next_tree = body_fn(ctx, &view)?;
        let validated = walker.read(ctx, &next_tree);
        release_state(ctx, &next_tree)?;
        let next = ReleaseList::from(ctx, validated?);

        // Inactive lanes hold their previous state.
        let mut merged = ReleaseList::new(ctx);
        for (old, new) in current.handles.iter().zip(&next.handles) {
            merged.handles.push(ctx.select(folded_ir, *new, *old)?);
        }
        let previous = std::mem::replace(&mut current, merged);
        drop(previous);
    }

    let result = StateWalker::new(labels).write(ctx, &template, &current.handles)?;
    let _ = current.take();
    Ok(result)
}

fn symbolic_loop(
    ctx: &AdContext,
    state: &StateTree,
    cond_fn: &CondFn<'_>,
    body_fn: &BodyFn<'_>,
    labels: &[&str],
    name: &str,
) -> Result<StateTree, CflowError> {
    debug!("while_loop('{name}'): symbolic mode");
    let template = template_of(state);
    let mut walker = StateWalker::new(labels);
    let inits = ReleaseList::from(ctx, walker.read(ctx, state)?);

    let mut record = RecordScope::new(ctx.ir());

    let mut phis = ReleaseList::new(ctx);
    for init in &inits.handles {
        let phi = ctx.ir().loop_phi(init.ir_id())?;
        phis.handles.push(Index64::from_ir(phi));
    }
    let phi_view = StateWalker::new(labels).write(ctx, &template, &phis.handles)?;

    let cond_v = match cond_fn(ctx, &phi_view)? {
        Condition::Var(handle) => handle,
        Condition::Scalar(_) => {
            return Err(CflowError::InvalidCondition {
                detail: "a symbolic loop condition must be a lane vector".to_owned(),
            });
        }
    };
    let cond_guard = ReleaseList::from(ctx, vec![cond_v]);
    if ctx.ir().var_type(cond_v.ir_id())? != VarType::Bool {
        return Err(CflowError::InvalidCondition {
            detail: format!(
                "loop condition must be boolean, got {}",
                ctx.ir().var_type(cond_v.ir_id())?
            ),
        });
    }

    let body_tree = body_fn(ctx, &phi_view)?;
    let validated = walker.read(ctx, &body_tree);
    release_state(ctx, &body_tree)?;
    let body = ReleaseList::from(ctx, validated?);

    let init_irs: Vec<u32> = inits.handles.iter().map(|h| h.ir_id()).collect();
    let phi_irs: Vec<u32> = phis.handles.iter().map(|h| h.ir_id()).collect();
    let body_irs: Vec<u32> = body.handles.iter().map(|h| h.ir_id()).collect();
    let outputs = ctx
        .ir()
        .emit_loop(name, &init_irs, &phi_irs, cond_v.ir_id(), &body_irs)?;
    record.disarm();
    drop(cond_guard);

    let out_handles: Vec<Index64> = outputs.into_iter().map(Index64::from_ir).collect();
    let owned = ReleaseList::from(ctx, out_handles);
    let result = walker.write(ctx, &template, &owned.handles)?;
    let _ = owned.take();
    Ok(result)
}

/// Local recording-scope guard (commit on `disarm`, discard otherwise).
struct RecordScope<'a> {
    ir: &'a IrContext,
    checkpoint: u32,
    cleanup: bool,
}

impl<'a> RecordScope<'a> {
    fn new(ir: &'a IrContext) -> Self {
        let checkpoint = ir.record_begin();
        ir.new_scope();
        Self {
            ir,
            checkpoint,
            cleanup: true,
        }
    }

    fn disarm(&mut self) {
        self.cleanup = false;
    }
}

impl Drop for RecordScope<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.ir.record_end(self.checkpoint, self.cleanup) {
            warn!("loop recording scope unwind failed: {err}");
        }
    }
}
