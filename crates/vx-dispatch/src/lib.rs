#![forbid(unsafe_code)]

//! The symbolic indirect-call dispatcher.
//!
//! [`call`] runs a user callback once per distinct instance, fusing the
//! per-instance sub-computations into a single indirect-branch kernel
//! (recording strategy), one materialized kernel per lane bucket
//! (evaluated strategy), or a packed-table gather (getter strategy),
//! and hooks the whole call into the AD graph when any input or output
//! is differentiable.

mod custom;
mod getter;
mod record;
mod reduce;
mod scoped;

use std::any::Any;
use std::rc::Rc;

use log::debug;
use vx_core::{Index64, VarType};
use vx_ad::{AdContext, AdError};
use vx_ir::IrError;

use custom::CallOp;
use scoped::ScopedMask;

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum DispatchError {
    /// Incompatible argument sizes (neither equal nor broadcast).
    ShapeMismatch {
        name: String,
        left: usize,
        right: usize,
    },
    /// Both or neither of `domain` and `callable_count` supplied.
    ModeConflict { name: String },
    /// Evaluated call attempted inside an active symbolic region.
    SymbolicModeRequired,
    /// A callable returned an empty/uninitialized handle.
    EmptyReturn { name: String, callable: u32 },
    ReturnArityMismatch {
        name: String,
        callable: u32,
        expected: usize,
        actual: usize,
    },
    ReturnTypeMismatch {
        name: String,
        callable: u32,
        expected: VarType,
        actual: VarType,
    },
    ReturnBackendMismatch { name: String, callable: u32 },
    /// Getter strategy observed a non-scalar output.
    ReturnNotScalar {
        name: String,
        callable: u32,
        size: usize,
    },
    /// Evaluated strategy met a bucket whose id is no longer registered.
    RegistryMiss { name: String, id: u32 },
    /// Failure surfaced by the user callback.
    Callback(String),
    Ir(IrError),
    Ad(AdError),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShapeMismatch { name, left, right } => {
                write!(f, "call('{name}'): mismatched argument sizes ({left} and {right})")
            }
            Self::ModeConflict { name } => write!(
                f,
                "call('{name}'): specify either 'domain' or 'callable_count', but not both"
            ),
            Self::SymbolicModeRequired => write!(
                f,
                "an indirect call in evaluated mode is not permitted while symbolic \
                 computation is being recorded; enable symbolic calls instead"
            ),
            Self::EmptyReturn { name, callable } => write!(
                f,
                "call('{name}'): return value of callable {callable} is empty/uninitialized"
            ),
            Self::ReturnArityMismatch {
                name,
                callable,
                expected,
                actual,
            } => write!(
                f,
                "call('{name}'): callable {callable} returned an unexpected number of \
                 return values (got {actual}, expected {expected})"
            ),
            Self::ReturnTypeMismatch {
                name,
                callable,
                expected,
                actual,
            } => write!(
                f,
                "call('{name}'): callable {callable} returned an inconsistent type \
                 ({actual} vs {expected})"
            ),
            Self::ReturnBackendMismatch { name, callable } => write!(
                f,
                "call('{name}'): callable {callable} returned a value with an \
                 inconsistent backend"
            ),
            Self::ReturnNotScalar {
                name,
                callable,
                size,
            } => write!(
                f,
                "call('{name}'): return value of callable {callable} is not a scalar \
                 (size {size})"
            ),
            Self::RegistryMiss { name, id } => write!(
                f,
                "call('{name}'): instance {id} does not exist (or no longer exists)"
            ),
            Self::Callback(detail) => write!(f, "callback failed: {detail}"),
            Self::Ir(err) => write!(f, "{err}"),
            Self::Ad(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<IrError> for DispatchError {
    fn from(value: IrError) -> Self {
        Self::Ir(value)
    }
}

impl From<AdError> for DispatchError {
    fn from(value: AdError) -> Self {
        Self::Ad(value)
    }
}

// ── Callable protocol ──────────────────────────────────────────────

/// The instance a callable runs for.
#[derive(Clone)]
pub enum Instance {
    /// Degenerate dispatch: no lane is active.
    Null,
    /// Raw 1-based callable id (no domain supplied).
    Index(u32),
    /// Registry-resolved object for a domain dispatch.
    Object(Rc<dyn Any>),
}

impl Instance {
    #[must_use]
    pub fn id(&self) -> u32 {
        match self {
            Self::Null => 0,
            Self::Index(id) => *id,
            Self::Object(_) => 0,
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("Instance::Null"),
            Self::Index(id) => write!(f, "Instance::Index({id})"),
            Self::Object(_) => f.write_str("Instance::Object(..)"),
        }
    }
}

/// One indirect-call body. Invoked once per callable during recording,
/// once per lane bucket in evaluated mode, and again by the AD hook's
/// forward/backward passes. Must push one owned, non-empty handle per
/// return slot and leave every scoped stack balanced.
pub trait CallCallback {
    fn call(
        &self,
        ctx: &AdContext,
        instance: &Instance,
        args: &[Index64],
        rv: &mut Vec<Index64>,
    ) -> Result<(), DispatchError>;
}

impl<F> CallCallback for F
where
    F: Fn(&AdContext, &Instance, &[Index64], &mut Vec<Index64>) -> Result<(), DispatchError>,
{
    fn call(
        &self,
        ctx: &AdContext,
        instance: &Instance,
        args: &[Index64],
        rv: &mut Vec<Index64>,
    ) -> Result<(), DispatchError> {
        self(ctx, instance, args, rv)
    }
}

pub(crate) enum CallbackRef<'a> {
    Owned(Rc<dyn CallCallback>),
    Borrowed(&'a dyn CallCallback),
}

impl CallbackRef<'_> {
    pub(crate) fn as_dyn(&self) -> &dyn CallCallback {
        match self {
            Self::Owned(callback) => callback.as_ref(),
            Self::Borrowed(callback) => *callback,
        }
    }
}

// ── Configuration ──────────────────────────────────────────────────

/// Static parameters of one dispatch. Exactly one of `domain` and
/// `callable_count` must be supplied; a domain resolves the count from
/// the instance registry.
#[derive(Debug, Clone)]
pub struct CallConfig<'a> {
    pub domain: Option<&'a str>,
    pub callable_count: u32,
    pub name: &'a str,
    pub is_getter: bool,
    /// Permit hooking the call into the AD graph.
    pub ad: bool,
}

impl<'a> CallConfig<'a> {
    #[must_use]
    pub fn indexed(name: &'a str, callable_count: u32) -> Self {
        Self {
            domain: None,
            callable_count,
            name,
            is_getter: false,
            ad: true,
        }
    }

    #[must_use]
    pub fn domain(name: &'a str, domain: &'a str) -> Self {
        Self {
            domain: Some(domain),
            callable_count: 0,
            name,
            is_getter: false,
            ad: true,
        }
    }

    #[must_use]
    pub fn getter(mut self) -> Self {
        self.is_getter = true;
        self
    }
}

// ── Entry point ────────────────────────────────────────────────────

/// Dispatch an indirect call over `instance_index`.
///
/// `index` and `mask` are borrowed IR handles (`mask == 0` means
/// all-true); `args` are borrowed composite handles. On success `rv`
/// holds one owned handle per return slot. The returned flag reports
/// whether the callback was retained by a CustomOp in the AD graph (its
/// release then happens on that op's destruction rather than when the
/// caller drops its reference).
///
/// Any failure releases everything acquired here, unwinds the scoped
/// stacks, and leaves `rv` empty.
pub fn call(
    ctx: &AdContext,
    cfg: &CallConfig<'_>,
    index: u32,
    mask: u32,
    args: &[Index64],
    rv: &mut Vec<Index64>,
    callback: Rc<dyn CallCallback>,
) -> Result<bool, DispatchError> {
    let result = call_impl(ctx, cfg, index, mask, args, rv, &CallbackRef::Owned(callback));
    if result.is_err() {
        for handle in rv.drain(..) {
            let _ = ctx.release(handle);
        }
    }
    result
}

pub(crate) fn call_impl(
    ctx: &AdContext,
    cfg: &CallConfig<'_>,
    index: u32,
    mask: u32,
    args: &[Index64],
    rv: &mut Vec<Index64>,
    callback: &CallbackRef<'_>,
) -> Result<bool, DispatchError> {
    let combined = combined_name(cfg);

    if (cfg.callable_count != 0) == cfg.domain.is_some() {
        return Err(DispatchError::ModeConflict { name: combined });
    }
    let callable_count = match cfg.domain {
        Some(domain) => ctx.ir().registry_bound(domain),
        None => cfg.callable_count,
    };

    // Size unification over the instance index, the mask, and all args.
    let mut size = if index == 0 {
        0
    } else {
        ctx.ir().var_size(index)?
    };
    if mask != 0 {
        size = unify_size(&combined, size, ctx.ir().var_size(mask)?)?;
    }
    let mut needs_ad = false;
    for arg in args {
        size = unify_size(&combined, size, ctx.ir().var_size(arg.ir_id())?)?;
        needs_ad |= arg.is_tracked();
    }

    // Degenerate dispatch: nothing can run. The callback still shapes
    // `rv` under an all-false mask, then every slot becomes a zero
    // literal at the unified size.
    if index == 0
        || size == 0
        || (mask != 0 && ctx.ir().is_zero_literal(mask))
        || callable_count == 0
    {
        debug!("call('{combined}'): degenerate dispatch (size {size})");
        let all_false = ctx.ir().bool_const(false);
        let guard = ScopedMask::new(ctx.ir(), all_false)?;
        callback
            .as_dyn()
            .call(ctx, &Instance::Null, args, rv)?;
        drop(guard);
        for slot in rv.iter_mut() {
            if slot.is_empty() {
                continue;
            }
            let ty = ctx.ir().var_type(slot.ir_id())?;
            let zero = ctx.ir().zero(ty, size.max(1));
            ctx.release(*slot)?;
            *slot = Index64::from_ir(zero);
        }
        return Ok(false);
    }

    let mut rv_ad: Vec<bool> = Vec::new();
    let implicit;

    if cfg.is_getter {
        let _boundary = vx_ad::IsolationGuard::new(ctx);
        getter::getter_strategy(
            ctx,
            &combined,
            cfg.domain,
            callable_count,
            size,
            index,
            mask,
            rv,
            &mut rv_ad,
            callback.as_dyn(),
        )?;
        implicit = ctx.copy_implicit_deps();
    } else if ctx.ir().symbolic_calls() {
        let _boundary = vx_ad::IsolationGuard::new(ctx);
        record::record_strategy(
            ctx,
            &combined,
            cfg.domain,
            callable_count,
            size,
            index,
            mask,
            args,
            rv,
            &mut rv_ad,
            callback.as_dyn(),
        )?;
        implicit = ctx.copy_implicit_deps();
    } else {
        if ctx.ir().symbolic() {
            return Err(DispatchError::SymbolicModeRequired);
        }
        reduce::reduce_strategy(
            ctx,
            &combined,
            cfg.domain,
            size,
            index,
            mask,
            args,
            rv,
            callback.as_dyn(),
        )?;
        // Derivatives were tracked directly through the per-bucket
        // gathers and scatters; no CustomOp is needed.
        return Ok(false);
    }

    for tracked in &rv_ad {
        needs_ad |= *tracked;
    }

    if cfg.ad && needs_ad {
        let attached = attach_custom_op(
            ctx,
            cfg,
            &combined,
            callable_count,
            index,
            mask,
            args,
            rv,
            &rv_ad,
            &implicit,
            callback,
        )?;
        if attached {
            return Ok(true);
        }
    }
    Ok(false)
}

#[allow(clippy::too_many_arguments)]
fn attach_custom_op(
    ctx: &AdContext,
    cfg: &CallConfig<'_>,
    combined: &str,
    callable_count: u32,
    index: u32,
    mask: u32,
    args: &[Index64],
    rv: &mut Vec<Index64>,
    rv_ad: &[bool],
    implicit: &[u32],
    callback: &CallbackRef<'_>,
) -> Result<bool, DispatchError> {
    let callback = match callback {
        CallbackRef::Owned(rc) => Rc::clone(rc),
        // Re-entrant dispatches from an existing CallOp never wrap again.
        CallbackRef::Borrowed(_) => return Ok(false),
    };

    let mut input_nodes = Vec::new();
    let mut input_offsets = Vec::new();
    for (position, arg) in args.iter().enumerate() {
        if arg.is_tracked() {
            input_nodes.push(arg.ad_id());
            input_offsets.push(position);
        }
    }
    input_nodes.extend_from_slice(implicit);

    // Promote each differentiable output to a fresh AD node.
    let mut output_nodes = Vec::new();
    let mut output_offsets = Vec::new();
    for (position, tracked) in rv_ad.iter().enumerate() {
        if !*tracked {
            continue;
        }
        let promoted = ctx.var_new(rv[position].ir_id())?;
        ctx.ir().dec_ref(rv[position].ir_id())?;
        rv[position] = promoted;
        output_nodes.push(promoted.ad_id());
        output_offsets.push(position);
    }

    let mut retained = vec![index];
    if mask != 0 {
        retained.push(mask);
    }
    retained.extend(args.iter().map(|arg| arg.ir_id()));
    let op = CallOp::new(
        combined.to_owned(),
        cfg.domain.map(str::to_owned),
        if cfg.domain.is_some() { 0 } else { callable_count },
        index,
        mask,
        args.iter().map(|arg| arg.ir_id()).collect(),
        input_nodes.clone(),
        input_offsets,
        output_nodes.clone(),
        output_offsets,
        callback,
    );

    let attached = ctx.custom_op(Box::new(op), &input_nodes, &output_nodes, &retained)?;
    if !attached {
        // The hook was not needed after all: detach the AD tags again.
        for slot in rv.iter_mut() {
            if slot.is_tracked() {
                ctx.ad_dec_ref(slot.ad_id())?;
                *slot = slot.detached();
            }
        }
    }
    Ok(attached)
}

// ── Shared helpers ─────────────────────────────────────────────────

pub(crate) fn combined_name(cfg: &CallConfig<'_>) -> String {
    match cfg.domain {
        Some(domain) if !cfg.name.contains("::") => format!("{domain}::{}", cfg.name),
        _ => cfg.name.to_owned(),
    }
}

fn unify_size(name: &str, current: usize, other: usize) -> Result<usize, DispatchError> {
    if current == 0 || current == 1 {
        return Ok(other.max(current));
    }
    if other == current || other == 1 {
        return Ok(current);
    }
    Err(DispatchError::ShapeMismatch {
        name: name.to_owned(),
        left: current,
        right: other,
    })
}

#[cfg(test)]
mod tests;

/// Validate one callable's return values against the shape fixed by the
/// first non-empty callable: arity, per-slot emptiness, type, and
/// backend must agree. The first callable also allocates `rv` as
/// zero literals of the unified size.
pub(crate) fn check_rv(
    ctx: &AdContext,
    name: &str,
    size: usize,
    callable: u32,
    rv: &mut Vec<Index64>,
    rv_i: &[Index64],
) -> Result<(), DispatchError> {
    if rv.len() != rv_i.len() {
        if !rv.is_empty() {
            return Err(DispatchError::ReturnArityMismatch {
                name: name.to_owned(),
                callable,
                expected: rv.len(),
                actual: rv_i.len(),
            });
        }
        for slot in rv_i {
            if slot.is_empty() {
                return Err(DispatchError::EmptyReturn {
                    name: name.to_owned(),
                    callable,
                });
            }
            let ty = ctx.ir().var_type(slot.ir_id())?;
            rv.push(Index64::from_ir(ctx.ir().zero(ty, size)));
        }
        return Ok(());
    }

    for (expected, actual) in rv.iter().zip(rv_i) {
        if actual.is_empty() {
            return Err(DispatchError::EmptyReturn {
                name: name.to_owned(),
                callable,
            });
        }
        let info_expected = ctx.ir().var_info(expected.ir_id())?;
        let info_actual = ctx.ir().var_info(actual.ir_id())?;
        if info_expected.backend != info_actual.backend {
            return Err(DispatchError::ReturnBackendMismatch {
                name: name.to_owned(),
                callable,
            });
        }
        if info_expected.ty != info_actual.ty {
            return Err(DispatchError::ReturnTypeMismatch {
                name: name.to_owned(),
                callable,
                expected: info_expected.ty,
                actual: info_actual.ty,
            });
        }
    }
    Ok(())
}

