//! User-defined AD graph nodes.

use crate::{AdContext, AdError};

/// A node whose forward and backward behavior is supplied by the caller
/// rather than derived from recorded edges. The dispatcher uses this to
/// hook an entire recorded indirect call into the AD graph as a single
/// node; the implementations re-enter the dispatcher to propagate
/// tangents and cotangents through the callable bodies.
///
/// Implementations receive `&self`: any mutable working state belongs in
/// interior-mutable fields.
pub trait CustomOp {
    fn name(&self) -> &str;

    /// Propagate tangents from the op's inputs to its outputs.
    fn forward(&self, ctx: &AdContext) -> Result<(), AdError>;

    /// Propagate cotangents from the op's outputs to its inputs.
    fn backward(&self, ctx: &AdContext) -> Result<(), AdError>;
}
