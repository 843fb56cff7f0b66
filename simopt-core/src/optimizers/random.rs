use super::{Direction, Observation, Optimizer, OptimizerError, Proposal, ProposalHandle, ProposalLedger};
use crate::space::{ParameterSpace, ParameterVector};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

fn default_seed() -> u64 {
    RandomSettings::default().seed
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomSettings {
    /// Number of proposals before the optimizer reports `Done`.
    #[serde(alias = "iterations")]
    pub num_iterations: u64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for RandomSettings {
    fn default() -> Self {
        Self {
            num_iterations: 100,
            seed: 0,
        }
    }
}

/// Uniform random search over the space.
///
/// Each dimension is sampled independently from a seeded PRNG, so a given
/// seed and propose order always yields the same sequence of vectors.
/// Observations only feed best-so-far tracking.
pub struct RandomOptimizer {
    space: ParameterSpace,
    settings: RandomSettings,
    rng: ChaCha8Rng,
    ledger: ProposalLedger,
}

impl RandomOptimizer {
    pub fn new(space: ParameterSpace, direction: Direction, settings: RandomSettings) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(settings.seed);
        Self {
            space,
            settings,
            rng,
            ledger: ProposalLedger::new(direction),
        }
    }
}

impl Optimizer for RandomOptimizer {
    fn propose(&mut self) -> Result<Proposal, OptimizerError> {
        if self.ledger.issued() >= self.settings.num_iterations {
            return Ok(Proposal::Done);
        }

        let vector = self.space.sample(&mut self.rng);
        let handle = self.ledger.issue(vector.clone());

        Ok(Proposal::Candidate { vector, handle })
    }

    fn observe(&mut self, handle: ProposalHandle, observation: Observation) -> Result<(), OptimizerError> {
        self.ledger.record(handle, observation)?;
        Ok(())
    }

    fn best(&self) -> Option<(ParameterVector, f64)> {
        self.ledger.best()
    }

    fn direction(&self) -> Direction {
        self.ledger.direction
    }
}
