#![forbid(unsafe_code)]

//! Control-flow frontends built on the dispatcher's recording
//! discipline: a vectorized if-statement lowered to a two-callable
//! indirect call, and a while-loop recorded as a single loop
//! instruction (or iterated eagerly in evaluated mode).

mod cond;
mod loop_;
pub mod state;

use vx_core::Index64;
use vx_ad::{AdContext, AdError};
use vx_dispatch::DispatchError;
use vx_ir::IrError;

pub use cond::{BranchFn, if_stmt};
pub use loop_::{BodyFn, CondFn, while_loop};
pub use state::{StateTree, release_state, retain_state};

#[cfg(test)]
mod tests;

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum CflowError {
    InvalidCondition { detail: String },
    /// The two branches of an if-statement disagree on the shape of
    /// their result.
    ReturnShapeMismatch { slot: String, detail: String },
    /// A loop iteration changed the set, order, names, or types of the
    /// state variables.
    LoopStateChanged { name: String, detail: String },
    /// A loop state variable changed to an incompatible size.
    LoopSizeConflict {
        name: String,
        from: usize,
        to: usize,
    },
    InternalInvariant(String),
    Dispatch(DispatchError),
    Ir(IrError),
    Ad(AdError),
}

impl std::fmt::Display for CflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidCondition { detail } => {
                write!(f, "unsupported condition: {detail}")
            }
            Self::ReturnShapeMismatch { slot, detail } => write!(
                f,
                "inconsistent return values of 'true_fn' and 'false_fn' at '{slot}': {detail}"
            ),
            Self::LoopStateChanged { name, detail } => write!(
                f,
                "the structure of loop state variable '{name}' changed across \
                 iterations: {detail}"
            ),
            Self::LoopSizeConflict { name, from, to } => write!(
                f,
                "loop state variable '{name}' changed from size {from} to \
                 incompatible size {to}"
            ),
            Self::InternalInvariant(detail) => write!(f, "internal invariant violated: {detail}"),
            Self::Dispatch(err) => write!(f, "{err}"),
            Self::Ir(err) => write!(f, "{err}"),
            Self::Ad(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for CflowError {}

impl From<DispatchError> for CflowError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

impl From<IrError> for CflowError {
    fn from(value: IrError) -> Self {
        Self::Ir(value)
    }
}

impl From<AdError> for CflowError {
    fn from(value: AdError) -> Self {
        Self::Ad(value)
    }
}

// ── Shared frontend types ──────────────────────────────────────────

/// Execution mode of a control-flow frontend. `Auto` picks scalar for a
/// scalar condition and otherwise follows the engine's symbolic-calls
/// flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CflowMode {
    Auto,
    Scalar,
    Symbolic,
    Evaluated,
}

/// A branch/loop condition: either a host scalar or a boolean lane
/// vector.
#[derive(Debug, Clone, Copy)]
pub enum Condition {
    Scalar(bool),
    Var(Index64),
}

/// Restores the symbolic-calls flag on drop, so an explicit
/// symbolic/evaluated mode request cannot leak past the frontend.
pub(crate) struct FlagGuard<'a> {
    ctx: &'a AdContext,
    previous: bool,
}

impl<'a> FlagGuard<'a> {
    pub fn set(ctx: &'a AdContext, mode: CflowMode) -> Option<Self> {
        let enable = match mode {
            CflowMode::Symbolic => true,
            CflowMode::Evaluated => false,
            CflowMode::Auto | CflowMode::Scalar => return None,
        };
        let previous = ctx.ir().set_symbolic_calls(enable);
        Some(Self { ctx, previous })
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.ctx.ir().set_symbolic_calls(self.previous);
    }
}

/// Owned composite handles released together on drop.
pub(crate) struct ReleaseList<'a> {
    ctx: &'a AdContext,
    pub handles: Vec<Index64>,
}

impl<'a> ReleaseList<'a> {
    pub fn new(ctx: &'a AdContext) -> Self {
        Self {
            ctx,
            handles: Vec::new(),
        }
    }

    pub fn from(ctx: &'a AdContext, handles: Vec<Index64>) -> Self {
        Self { ctx, handles }
    }

    /// Hands the handles to the caller without releasing them.
    pub fn take(mut self) -> Vec<Index64> {
        std::mem::take(&mut self.handles)
    }
}

impl Drop for ReleaseList<'_> {
    fn drop(&mut self) {
        for handle in &self.handles {
            if !handle.is_empty() {
                let _ = self.ctx.release(*handle);
            }
        }
    }
}

/// Structure-only copy of a tree: every leaf handle replaced by the
/// empty sentinel.
pub(crate) fn template_of(state: &StateTree) -> StateTree {
    match state {
        StateTree::Leaf(_) => StateTree::Leaf(Index64::ZERO),
        StateTree::Tuple(items) => StateTree::Tuple(items.iter().map(template_of).collect()),
        StateTree::List(items) => StateTree::List(items.iter().map(template_of).collect()),
        StateTree::Dict(items) => StateTree::Dict(
            items
                .iter()
                .map(|(key, item)| (key.clone(), template_of(item)))
                .collect(),
        ),
        StateTree::Record { type_name, fields } => StateTree::Record {
            type_name: type_name.clone(),
            fields: fields
                .iter()
                .map(|(field, item)| (field.clone(), template_of(item)))
                .collect(),
        },
    }
}
