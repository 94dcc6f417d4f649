#![forbid(unsafe_code)]

//! Shared harness for the end-to-end conformance suites: context
//! construction per strategy, reference callables, and a
//! finite-difference helper for gradient checks.

use std::rc::Rc;

use vx_core::{BackendKind, Index64};
use vx_ad::AdContext;
use vx_dispatch::{CallCallback, CallConfig, DispatchError, Instance, call};

pub use vx_test_utils::{TestResult, TestStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Recorded,
    Evaluated,
}

impl Strategy {
    #[must_use]
    pub fn as_test_strategy(self) -> TestStrategy {
        match self {
            Self::Recorded => TestStrategy::Recorded,
            Self::Evaluated => TestStrategy::Evaluated,
        }
    }
}

/// A fresh context with the symbolic-calls flag matching the strategy.
#[must_use]
pub fn context(strategy: Strategy) -> AdContext {
    let ctx = AdContext::new(BackendKind::Host);
    ctx.ir()
        .set_symbolic_calls(matches!(strategy, Strategy::Recorded));
    ctx
}

/// `f_i(x) = coeffs[i - 1] * x`, differentiable in `x`.
#[must_use]
pub fn scale_callback(coeffs: Vec<f64>) -> Rc<dyn CallCallback> {
    Rc::new(
        move |ctx: &AdContext,
              instance: &Instance,
              args: &[Index64],
              rv: &mut Vec<Index64>|
              -> Result<(), DispatchError> {
            let id = instance.id().max(1) as usize;
            let coefficient = coeffs.get(id - 1).copied().unwrap_or(0.0);
            let c = ctx.ir().literal_f64(coefficient, 1);
            let scaled = ctx.mul(args[0], Index64::from_ir(c))?;
            ctx.ir().dec_ref(c)?;
            rv.push(scaled);
            Ok(())
        },
    )
}

/// Dispatch `scale_callback` over plain (untracked) inputs and read the
/// single output back as `f64` lanes.
pub fn dispatch_scale_plain(
    ctx: &AdContext,
    coeffs: &[f64],
    ids: &[u32],
    values: &[f64],
) -> Result<Vec<f64>, DispatchError> {
    let arg = ctx.ir().array_f64(values);
    let index = ctx.ir().array_u32(ids);
    let mut rv = Vec::new();
    call(
        ctx,
        &CallConfig::indexed("scale", coeffs.len() as u32),
        index,
        0,
        &[Index64::from_ir(arg)],
        &mut rv,
        scale_callback(coeffs.to_vec()),
    )?;
    let out = ctx.ir().to_vec_f64(rv[0].ir_id())?;
    for handle in rv {
        ctx.release(handle).map_err(DispatchError::Ad)?;
    }
    ctx.ir().dec_ref(arg)?;
    ctx.ir().dec_ref(index)?;
    Ok(out)
}

/// Central finite difference of a scalar map.
pub fn finite_difference(
    mut f: impl FnMut(f64) -> f64,
    at: f64,
    epsilon: f64,
) -> f64 {
    (f(at + epsilon) - f(at - epsilon)) / (2.0 * epsilon)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harness_scale_matches_both_strategies() {
        for strategy in [Strategy::Recorded, Strategy::Evaluated] {
            let ctx = context(strategy);
            let out = dispatch_scale_plain(
                &ctx,
                &[2.0, 3.0],
                &[1, 2, 1],
                &[1.0, 10.0, 100.0],
            )
            .expect("dispatch");
            assert_eq!(out, vec![2.0, 30.0, 200.0], "{strategy:?}");
        }
    }

    #[test]
    fn test_log_schema_contract() {
        let fixture_id =
            vx_test_utils::fixture_id_from_json(&("conformance", "scale")).expect("digest");
        let log = vx_test_utils::TestLogV1::unit(
            vx_test_utils::test_id(module_path!(), "test_log_schema_contract"),
            fixture_id,
            TestStrategy::Recorded,
            TestResult::Pass,
        );
        assert_eq!(log.schema_version, vx_test_utils::TEST_LOG_SCHEMA_VERSION);
    }

    #[test]
    fn finite_difference_of_square() {
        let derivative = finite_difference(|x| x * x, 3.0, 1e-4);
        assert!((derivative - 6.0).abs() < 1e-6);
    }
}
