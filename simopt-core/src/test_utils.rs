//! Canned models, spaces and KPI sets shared by unit tests.

use crate::dispatch::{Model, ModelError, ModelOutput, RunContext};
use crate::kpi::{KpiOp, KpiSet, KpiSpec};
use crate::space::{ParameterSpace, ParameterVector};
use crate::table::Table;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// A KPI set with a single `score` objective (maximised), read from the
/// final row of a `score` column.
pub fn score_kpis() -> KpiSet {
    let mut kpis = KpiSet::new();
    kpis.add_kpi("score", KpiSpec::column("score", KpiOp::Final))
        .expect("fresh KPI set");
    kpis.set_objective("score", true).expect("score is registered");
    kpis
}

/// The two-parameter space used throughout the tests: a continuous `a` in
/// `[0, 1]` and an integer `b` in `[1, 5]`.
pub fn small_space() -> ParameterSpace {
    ParameterSpace::builder()
        .with_continuous("a", 0.0, 1.0)
        .with_integer("b", 1, 5)
        .build()
        .expect("valid space")
}

fn score_table(score: f64) -> Result<Table, ModelError> {
    // A short ramp towards the score keeps the table non-trivial.
    let rows = vec![vec![0.0, 0.0], vec![1.0, score / 2.0], vec![2.0, score]];
    Ok(Table::from_rows(vec!["t".to_string(), "score".to_string()], rows)?)
}

/// Deterministic model over [`small_space`]: `score = -a + b / 5`.
pub struct LinearScoreModel;

impl Model for LinearScoreModel {
    fn run(&self, parameters: &ParameterVector, _ctx: &RunContext) -> Result<ModelOutput, ModelError> {
        let a = parameters
            .get("a")
            .and_then(|v| v.as_f64())
            .ok_or("missing parameter `a`")?;
        let b = parameters
            .get("b")
            .and_then(|v| v.as_f64())
            .ok_or("missing parameter `b`")?;

        Ok(score_table(-a + b / 5.0)?.into())
    }

    fn parameter_space(&self) -> ParameterSpace {
        small_space()
    }
}

/// Sleeps for its `delay_ms` parameter, observing cancellation and the
/// deadline in small ticks, then scores the delay itself.
pub struct DelayModel;

impl Model for DelayModel {
    fn run(&self, parameters: &ParameterVector, ctx: &RunContext) -> Result<ModelOutput, ModelError> {
        let delay_ms = parameters
            .get("delay_ms")
            .and_then(|v| v.as_f64())
            .ok_or("missing parameter `delay_ms`")?;

        let mut remaining = Duration::from_millis(delay_ms as u64);
        let tick = Duration::from_millis(5);
        while remaining > Duration::ZERO {
            if ctx.cancel.is_cancelled() || ctx.expired() {
                break;
            }
            let nap = remaining.min(tick);
            std::thread::sleep(nap);
            remaining -= nap;
        }

        Ok(score_table(delay_ms)?.into())
    }

    fn parameter_space(&self) -> ParameterSpace {
        ParameterSpace::builder()
            .with_continuous("delay_ms", 1.0, 1000.0)
            .build()
            .expect("valid space")
    }
}

/// Reports a NaN score on every `every`-th call, making the objective KPI
/// unavailable for those iterations.
pub struct FlakyModel {
    every: u32,
    calls: AtomicU32,
}

impl FlakyModel {
    pub fn new(every: u32) -> Self {
        Self {
            every: every.max(1),
            calls: AtomicU32::new(0),
        }
    }
}

impl Model for FlakyModel {
    fn run(&self, parameters: &ParameterVector, _ctx: &RunContext) -> Result<ModelOutput, ModelError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call % self.every == 0 {
            return Ok(score_table(f64::NAN)?.into());
        }

        let a = parameters
            .get("a")
            .and_then(|v| v.as_f64())
            .ok_or("missing parameter `a`")?;
        Ok(score_table(1.0 - a)?.into())
    }

    fn parameter_space(&self) -> ParameterSpace {
        small_space()
    }
}

/// Always reports a NaN score; every iteration is `kpi-unavailable` unless a
/// fallback recovers it.
pub struct NanScoreModel;

impl Model for NanScoreModel {
    fn run(&self, _parameters: &ParameterVector, _ctx: &RunContext) -> Result<ModelOutput, ModelError> {
        Ok(score_table(f64::NAN)?.into())
    }

    fn parameter_space(&self) -> ParameterSpace {
        small_space()
    }
}
