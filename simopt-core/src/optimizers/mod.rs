mod bayesian;
mod grid;
mod random;

use crate::space::{DecodeError, EncodeError, ParameterSpace, ParameterVector};
pub use bayesian::{Acquisition, BayesianOptimizer, BayesianSettings, GpSurrogate, Surrogate, SurrogateError};
pub use grid::{GridOptimizer, GridSettings};
pub use random::{RandomOptimizer, RandomSettings};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Opaque identifier tying an observation back to its proposal. Handles are
/// dense and assigned in proposal order, which also breaks best-value ties.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ProposalHandle(u64);

impl ProposalHandle {
    pub fn index(&self) -> u64 {
        self.0
    }
}

impl Display for ProposalHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The next step an optimizer asks the controller to evaluate.
#[derive(Debug, Clone, PartialEq)]
pub enum Proposal {
    Candidate {
        vector: ParameterVector,
        handle: ProposalHandle,
    },
    /// The budget is exhausted; no further candidates will be produced.
    Done,
}

/// Feedback for one proposal: the scalar objective, or a failure marker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    Value(f64),
    Failed,
}

/// Whether the objective is maximised or minimised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Maximise,
    Minimise,
}

impl Direction {
    pub fn from_maximise(maximise: bool) -> Self {
        if maximise {
            Self::Maximise
        } else {
            Self::Minimise
        }
    }

    /// Is `a` strictly better than `b` in this direction?
    pub fn is_improvement(&self, a: f64, b: f64) -> bool {
        match self {
            Self::Maximise => a > b,
            Self::Minimise => a < b,
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum OptimizerError {
    #[error("unknown proposal handle {0}")]
    UnknownHandle(ProposalHandle),
    #[error("proposal handle {0} has already been observed")]
    AlreadyObserved(ProposalHandle),
    #[error("grid settings require at least one point per dimension")]
    ZeroGridPoints,
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
}

/// The uniform ask/tell contract all optimizers implement.
///
/// `propose` and `observe` must be externally serialised; the controller
/// holds a mutex around the optimizer. Observations may arrive in any order
/// relative to proposals.
pub trait Optimizer: Send {
    /// Ask for the next parameter vector to evaluate.
    fn propose(&mut self) -> Result<Proposal, OptimizerError>;

    /// Tell the optimizer the outcome of a proposal.
    fn observe(&mut self, handle: ProposalHandle, observation: Observation) -> Result<(), OptimizerError>;

    /// The best vector observed so far among ok observations.
    fn best(&self) -> Option<(ParameterVector, f64)>;

    fn direction(&self) -> Direction;
}

/// Bookkeeping shared by every optimizer: handle assignment, outstanding
/// proposals and best-so-far tracking.
#[derive(Debug)]
pub(crate) struct ProposalLedger {
    direction: Direction,
    issued: u64,
    observed: HashSet<u64>,
    outstanding: HashMap<u64, ParameterVector>,
    best: Option<(u64, ParameterVector, f64)>,
}

impl ProposalLedger {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            issued: 0,
            observed: HashSet::new(),
            outstanding: HashMap::new(),
            best: None,
        }
    }

    /// Register a new proposal and return its handle.
    pub fn issue(&mut self, vector: ParameterVector) -> ProposalHandle {
        let handle = ProposalHandle(self.issued);
        self.issued += 1;
        self.outstanding.insert(handle.0, vector);
        handle
    }

    pub fn issued(&self) -> u64 {
        self.issued
    }

    /// Validate and record an observation, returning the vector it belongs
    /// to. Updates best-so-far for ok observations, breaking ties in favour
    /// of the earliest proposal.
    pub fn record(
        &mut self,
        handle: ProposalHandle,
        observation: Observation,
    ) -> Result<ParameterVector, OptimizerError> {
        if handle.0 >= self.issued {
            return Err(OptimizerError::UnknownHandle(handle));
        }
        if !self.observed.insert(handle.0) {
            return Err(OptimizerError::AlreadyObserved(handle));
        }

        let vector = self
            .outstanding
            .remove(&handle.0)
            .ok_or(OptimizerError::UnknownHandle(handle))?;

        if let Observation::Value(value) = observation {
            let better = match &self.best {
                None => true,
                Some((best_handle, _, best_value)) => {
                    self.direction.is_improvement(value, *best_value)
                        || (value == *best_value && handle.0 < *best_handle)
                }
            };
            if better {
                self.best = Some((handle.0, vector.clone(), value));
            }
        }

        Ok(vector)
    }

    pub fn best(&self) -> Option<(ParameterVector, f64)> {
        self.best.as_ref().map(|(_, v, value)| (v.clone(), *value))
    }
}

/// Tagged optimizer settings, resolved into a boxed [`Optimizer`] at run
/// time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum OptimizerConfig {
    Grid(GridSettings),
    Random(RandomSettings),
    Bayesian(BayesianSettings),
}

impl OptimizerConfig {
    pub fn build(
        &self,
        space: &ParameterSpace,
        direction: Direction,
    ) -> Result<Box<dyn Optimizer>, OptimizerError> {
        match self {
            Self::Grid(settings) => Ok(Box::new(GridOptimizer::new(
                space.clone(),
                direction,
                settings.clone(),
            )?)),
            Self::Random(settings) => Ok(Box::new(RandomOptimizer::new(
                space.clone(),
                direction,
                settings.clone(),
            ))),
            Self::Bayesian(settings) => Ok(Box::new(BayesianOptimizer::new(
                space.clone(),
                direction,
                settings.clone(),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::ParameterValue;

    fn vector(x: f64) -> ParameterVector {
        let mut v = ParameterVector::new();
        v.insert("x".to_string(), ParameterValue::F64(x));
        v
    }

    #[test]
    fn test_ledger_rejects_unknown_and_duplicate_handles() {
        let mut ledger = ProposalLedger::new(Direction::Maximise);
        let handle = ledger.issue(vector(0.0));

        let err = ledger
            .record(ProposalHandle(99), Observation::Value(1.0))
            .unwrap_err();
        assert_eq!(err, OptimizerError::UnknownHandle(ProposalHandle(99)));

        ledger.record(handle, Observation::Value(1.0)).unwrap();
        let err = ledger.record(handle, Observation::Value(2.0)).unwrap_err();
        assert_eq!(err, OptimizerError::AlreadyObserved(handle));
    }

    #[test]
    fn test_ledger_best_maximise() {
        let mut ledger = ProposalLedger::new(Direction::Maximise);
        let a = ledger.issue(vector(0.1));
        let b = ledger.issue(vector(0.2));
        let c = ledger.issue(vector(0.3));

        ledger.record(a, Observation::Value(1.0)).unwrap();
        ledger.record(b, Observation::Value(3.0)).unwrap();
        ledger.record(c, Observation::Failed).unwrap();

        let (best_vector, best_value) = ledger.best().unwrap();
        assert_eq!(best_vector, vector(0.2));
        assert_eq!(best_value, 3.0);
    }

    #[test]
    fn test_ledger_ties_break_to_earliest_proposal() {
        let mut ledger = ProposalLedger::new(Direction::Minimise);
        let a = ledger.issue(vector(0.1));
        let b = ledger.issue(vector(0.2));

        // Completion order is reversed; the earlier proposal still wins.
        ledger.record(b, Observation::Value(5.0)).unwrap();
        ledger.record(a, Observation::Value(5.0)).unwrap();

        let (best_vector, _) = ledger.best().unwrap();
        assert_eq!(best_vector, vector(0.1));
    }

    #[test]
    fn test_failed_observations_do_not_set_best() {
        let mut ledger = ProposalLedger::new(Direction::Maximise);
        let a = ledger.issue(vector(0.1));
        ledger.record(a, Observation::Failed).unwrap();
        assert!(ledger.best().is_none());
    }
}
