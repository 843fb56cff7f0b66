mod in_process;
mod output;
mod subprocess;

use crate::result::SimulationResult;
use crate::space::{ParameterDomain, ParameterSpace, ParameterValue, ParameterVector};
pub use in_process::{InProcessDispatcher, Model, ModelError, ModelOutput};
pub use output::{OutputFormat, parse_output};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
pub use subprocess::{CommandSpec, SubprocessConfig, SubprocessDispatcher};
use thiserror::Error;

/// A cooperative cancellation signal shared between the controller and its
/// workers. Cloning yields another handle on the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-call context carried into every dispatch.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Deadline for this call; exceeding it terminates the simulation.
    pub deadline: Option<Instant>,
    /// Cancellation signal; in-process models are expected to observe it.
    pub cancel: CancelToken,
    /// 1-based attempt number, used for retry jittering.
    pub attempt: u32,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            deadline: None,
            cancel: CancelToken::new(),
            attempt: 1,
        }
    }
}

impl RunContext {
    pub fn new(timeout: Option<Duration>, cancel: CancelToken, attempt: u32) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
            cancel,
            attempt,
        }
    }

    /// Time remaining until the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Why a single dispatch failed.
///
/// Each kind has a stable label used in iteration records and progress
/// events.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("parameter validation failed: {0}")]
    ValidationFailed(String),
    #[error("failed to spawn simulation process: {0}")]
    SpawnFailed(String),
    #[error("simulation exceeded its deadline")]
    Timeout,
    #[error("simulation was cancelled")]
    Cancelled,
    #[error("simulation exited with status {status}: {stderr}")]
    ExitNonZero { status: i32, stderr: String },
    #[error("could not parse simulation output: {0}")]
    ParseFailed(String),
    #[error("model error: {0}")]
    ModelInternal(String),
    #[error("objective KPI is missing or not a number")]
    KpiUnavailable,
}

impl DispatchError {
    /// The stable label for this kind, as recorded in iteration records.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ValidationFailed(_) => "validation-failed",
            Self::SpawnFailed(_) => "spawn-failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::ExitNonZero { .. } => "exit-nonzero",
            Self::ParseFailed(_) => "parse-failed",
            Self::ModelInternal(_) => "model-internal",
            Self::KpiUnavailable => "kpi-unavailable",
        }
    }

    /// Whether the retry policy may re-attempt after this failure.
    ///
    /// Validation failures and cancellation are never retried;
    /// `kpi-unavailable` is only recoverable through a fallback result.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SpawnFailed(_)
                | Self::Timeout
                | Self::ExitNonZero { .. }
                | Self::ParseFailed(_)
                | Self::ModelInternal(_)
        )
    }
}

/// The single run-simulation contract the controller dispatches through.
pub trait Dispatcher: Send + Sync {
    fn run(&self, parameters: &ParameterVector, ctx: &RunContext)
        -> Result<SimulationResult, DispatchError>;
}

/// Perturb numeric values by up to ±1% (multiplicative), leaving categorical
/// and boolean values untouched.
///
/// The noise is deterministic in `(name, attempt)`, so a given retry attempt
/// always evaluates the same vector. Attempt zero is the identity. Perturbed
/// values are clamped back into their domain so the result still validates.
pub fn jitter(space: &ParameterSpace, parameters: &ParameterVector, attempt: u32) -> ParameterVector {
    if attempt == 0 {
        return parameters.clone();
    }

    parameters
        .iter()
        .map(|(name, value)| {
            let spec = space.get(name);
            let jittered = match (value, spec.map(|s| &s.domain)) {
                (ParameterValue::F64(v), Some(ParameterDomain::Continuous { min, max })) => {
                    let factor = 1.0 + jitter_noise(name, attempt);
                    ParameterValue::F64((v * factor).clamp(*min, *max))
                }
                (ParameterValue::Int(v), Some(ParameterDomain::Integer { min, max })) => {
                    let factor = 1.0 + jitter_noise(name, attempt);
                    let perturbed = (*v as f64 * factor).round() as i64;
                    ParameterValue::Int(perturbed.clamp(*min, *max))
                }
                // Categorical (and unknown) values pass through unchanged.
                _ => value.clone(),
            };
            (name.clone(), jittered)
        })
        .collect()
}

/// Uniform noise in `[-0.01, 0.01]`, seeded by the parameter name and the
/// attempt number.
fn jitter_noise(name: &str, attempt: u32) -> f64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    attempt.hash(&mut hasher);
    let mut rng = ChaCha8Rng::seed_from_u64(hasher.finish());
    rng.gen_range(-0.01..=0.01)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::ParameterSpace;

    fn space() -> ParameterSpace {
        ParameterSpace::builder()
            .with_continuous("rate", 0.0, 100.0)
            .with_integer("steps", 1, 1000)
            .with_categorical("mode", &["slow", "fast"])
            .build()
            .unwrap()
    }

    fn vector() -> ParameterVector {
        let mut v = ParameterVector::new();
        v.insert("rate".to_string(), ParameterValue::F64(50.0));
        v.insert("steps".to_string(), ParameterValue::Int(500));
        v.insert("mode".to_string(), ParameterValue::Str("fast".to_string()));
        v
    }

    #[test]
    fn test_jitter_attempt_zero_is_identity() {
        let space = space();
        let v = vector();
        assert_eq!(jitter(&space, &v, 0), v);
    }

    #[test]
    fn test_jitter_is_deterministic_and_bounded() {
        let space = space();
        let v = vector();

        let a = jitter(&space, &v, 1);
        let b = jitter(&space, &v, 1);
        assert_eq!(a, b);

        let rate = match a.get("rate").unwrap() {
            ParameterValue::F64(r) => *r,
            other => panic!("unexpected value {other:?}"),
        };
        assert!((rate - 50.0).abs() <= 0.5 + 1e-9);

        // Different attempts perturb differently.
        let c = jitter(&space, &v, 2);
        assert_ne!(a, c);
    }

    #[test]
    fn test_jitter_leaves_categoricals_untouched() {
        let space = space();
        let v = vector();
        let jittered = jitter(&space, &v, 3);
        assert_eq!(
            jittered.get("mode"),
            Some(&ParameterValue::Str("fast".to_string()))
        );
    }

    #[test]
    fn test_jitter_stays_in_domain() {
        let space = space();
        let mut v = vector();
        v.insert("rate".to_string(), ParameterValue::F64(100.0));
        v.insert("steps".to_string(), ParameterValue::Int(1000));

        for attempt in 1..20 {
            let jittered = jitter(&space, &v, attempt);
            assert!(space.validate(&jittered).is_ok(), "attempt {attempt}");
        }
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_error_labels() {
        assert_eq!(DispatchError::Timeout.label(), "timeout");
        assert_eq!(DispatchError::Cancelled.label(), "cancelled");
        assert_eq!(
            DispatchError::ValidationFailed("x".to_string()).label(),
            "validation-failed"
        );
        assert!(DispatchError::Timeout.is_retryable());
        assert!(!DispatchError::Cancelled.is_retryable());
        assert!(!DispatchError::KpiUnavailable.is_retryable());
    }
}
