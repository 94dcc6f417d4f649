//! Differentiable op wrappers: each creates the IR instruction and, when
//! a floating-point result depends on a tracked input, an AD node whose
//! edges carry the local partial derivatives.
//!
//! Results are only tracked for float types; integer and boolean
//! arithmetic always comes back with a zero AD half.

use vx_core::{Index64, ReduceOp, VarType};

use crate::graph::{Edge, Weight};
use crate::{AdContext, AdError};

impl AdContext {
    fn tracked_result(
        &self,
        out_ir: u32,
        edges: Vec<(Index64, Weight)>,
    ) -> Result<Index64, AdError> {
        let ty = self.ir().var_type(out_ir)?;
        let any_tracked = edges.iter().any(|(source, _)| source.is_tracked());
        if !ty.is_float() || !any_tracked {
            // Unused weight handles must not leak.
            for (_, weight) in &edges {
                crate::graph::release_weight(weight, self.ir())?;
            }
            return Ok(Index64::from_ir(out_ir));
        }
        let mut live = Vec::with_capacity(edges.len());
        for (source, weight) in edges {
            if source.is_tracked() {
                live.push(Edge {
                    source: source.ad_id(),
                    weight,
                });
            } else {
                crate::graph::release_weight(&weight, self.ir())?;
            }
        }
        let size = self.ir().var_size(out_ir)?;
        let node = self.alloc_node(ty, size, live)?;
        Ok(Index64::new(node, out_ir))
    }

    pub fn add(&self, a: Index64, b: Index64) -> Result<Index64, AdError> {
        let out = self.ir().add(a.ir_id(), b.ir_id())?;
        let ty = self.ir().var_type(out)?;
        self.tracked_result(
            out,
            vec![
                (a, Weight::Partial(self.one_literal(ty))),
                (b, Weight::Partial(self.one_literal(ty))),
            ],
        )
    }

    pub fn sub(&self, a: Index64, b: Index64) -> Result<Index64, AdError> {
        let out = self.ir().sub(a.ir_id(), b.ir_id())?;
        let ty = self.ir().var_type(out)?;
        let one = self.one_literal(ty);
        let minus_one = self.ir().neg(one)?;
        self.tracked_result(
            out,
            vec![
                (a, Weight::Partial(one)),
                (b, Weight::Partial(minus_one)),
            ],
        )
    }

    pub fn mul(&self, a: Index64, b: Index64) -> Result<Index64, AdError> {
        let out = self.ir().mul(a.ir_id(), b.ir_id())?;
        self.ir().inc_ref(b.ir_id())?;
        self.ir().inc_ref(a.ir_id())?;
        self.tracked_result(
            out,
            vec![
                (a, Weight::Partial(b.ir_id())),
                (b, Weight::Partial(a.ir_id())),
            ],
        )
    }

    pub fn div(&self, a: Index64, b: Index64) -> Result<Index64, AdError> {
        let out = self.ir().div(a.ir_id(), b.ir_id())?;
        let ty = self.ir().var_type(out)?;
        if !ty.is_float() || (!a.is_tracked() && !b.is_tracked()) {
            return Ok(Index64::from_ir(out));
        }
        // d(a/b)/da = 1/b, d(a/b)/db = -a/b²
        let one = self.one_literal(ty);
        let inv_b = self.ir().div(one, b.ir_id())?;
        self.ir().dec_ref(one)?;
        let b_sq = self.ir().mul(b.ir_id(), b.ir_id())?;
        let a_over = self.ir().div(a.ir_id(), b_sq)?;
        self.ir().dec_ref(b_sq)?;
        let db = self.ir().neg(a_over)?;
        self.ir().dec_ref(a_over)?;
        self.tracked_result(
            out,
            vec![(a, Weight::Partial(inv_b)), (b, Weight::Partial(db))],
        )
    }

    pub fn neg(&self, a: Index64) -> Result<Index64, AdError> {
        let out = self.ir().neg(a.ir_id())?;
        let ty = self.ir().var_type(out)?;
        let one = self.one_literal(ty);
        let minus_one = self.ir().neg(one)?;
        self.ir().dec_ref(one)?;
        self.tracked_result(out, vec![(a, Weight::Partial(minus_one))])
    }

    pub fn abs(&self, a: Index64) -> Result<Index64, AdError> {
        let out = self.ir().abs(a.ir_id())?;
        let ty = self.ir().var_type(out)?;
        if !ty.is_float() || !a.is_tracked() {
            return Ok(Index64::from_ir(out));
        }
        let zero = self.ir().zero(ty, 1);
        let non_negative = self.ir().ge(a.ir_id(), zero)?;
        self.ir().dec_ref(zero)?;
        let sign = self.signed_unit(ty, non_negative)?;
        self.ir().dec_ref(non_negative)?;
        self.tracked_result(out, vec![(a, Weight::Partial(sign))])
    }

    pub fn min(&self, a: Index64, b: Index64) -> Result<Index64, AdError> {
        let out = self.ir().min(a.ir_id(), b.ir_id())?;
        let chose_a = self.ir().le(a.ir_id(), b.ir_id())?;
        let result = self.choice_result(out, a, b, chose_a);
        self.ir().dec_ref(chose_a)?;
        result
    }

    pub fn max(&self, a: Index64, b: Index64) -> Result<Index64, AdError> {
        let out = self.ir().max(a.ir_id(), b.ir_id())?;
        let chose_a = self.ir().ge(a.ir_id(), b.ir_id())?;
        let result = self.choice_result(out, a, b, chose_a);
        self.ir().dec_ref(chose_a)?;
        result
    }

    /// Lane-wise choice between two values under a boolean condition
    /// (plain IR handle); gradients flow to whichever side was chosen.
    pub fn select(&self, cond: u32, a: Index64, b: Index64) -> Result<Index64, AdError> {
        let out = self.ir().select(cond, a.ir_id(), b.ir_id())?;
        self.choice_result(out, a, b, cond)
    }

    fn choice_result(
        &self,
        out: u32,
        a: Index64,
        b: Index64,
        chose_a: u32,
    ) -> Result<Index64, AdError> {
        let ty = self.ir().var_type(out)?;
        if !ty.is_float() || (!a.is_tracked() && !b.is_tracked()) {
            return Ok(Index64::from_ir(out));
        }
        let one = self.one_literal(ty);
        let zero = self.ir().zero(ty, 1);
        let da = self.ir().select(chose_a, one, zero)?;
        let db = self.ir().select(chose_a, zero, one)?;
        self.ir().dec_ref(one)?;
        self.ir().dec_ref(zero)?;
        self.tracked_result(
            out,
            vec![(a, Weight::Partial(da)), (b, Weight::Partial(db))],
        )
    }

    fn signed_unit(&self, ty: VarType, non_negative: u32) -> Result<u32, AdError> {
        let one = self.one_literal(ty);
        let minus_one = self.ir().neg(one)?;
        let sign = self.ir().select(non_negative, one, minus_one)?;
        self.ir().dec_ref(one)?;
        self.ir().dec_ref(minus_one)?;
        Ok(sign)
    }

    /// AD-aware gather: the backward pass scatter-adds the incoming
    /// gradient back onto the source.
    pub fn gather(&self, src: Index64, index: u32, mask: u32) -> Result<Index64, AdError> {
        let out = self.ir().gather(src.ir_id(), index, mask)?;
        let source_size = self.ir().var_size(src.ir_id())?;
        self.ir().inc_ref(index)?;
        self.ir().inc_ref(mask)?;
        self.tracked_result(
            out,
            vec![(
                src,
                Weight::Gather {
                    index,
                    mask,
                    source_size,
                },
            )],
        )
    }

    /// AD-aware scatter: gradients flow back to the written value via a
    /// gather, and to the carried target with the written lanes masked
    /// out (or untouched for an additive reduction).
    pub fn scatter(
        &self,
        target: Index64,
        value: Index64,
        index: u32,
        mask: u32,
        reduce: ReduceOp,
    ) -> Result<Index64, AdError> {
        let out = self
            .ir()
            .scatter(target.ir_id(), value.ir_id(), index, mask, reduce)?;
        let ty = self.ir().var_type(out)?;
        self.ir().inc_ref(index)?;
        self.ir().inc_ref(mask)?;
        let value_weight = Weight::ScatterValue { index, mask };
        let target_weight = match reduce {
            ReduceOp::Add => Weight::Partial(self.one_literal(ty)),
            ReduceOp::None => {
                self.ir().inc_ref(index)?;
                self.ir().inc_ref(mask)?;
                Weight::ScatterTarget { index, mask }
            }
        };
        self.tracked_result(out, vec![(value, value_weight), (target, target_weight)])
    }
}
