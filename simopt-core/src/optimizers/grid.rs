use super::{Direction, Observation, Optimizer, OptimizerError, Proposal, ProposalHandle, ProposalLedger};
use crate::space::{ParameterDomain, ParameterSpace, ParameterValue, ParameterVector};
use serde::{Deserialize, Serialize};

fn default_num_points() -> usize {
    GridSettings::default().num_points
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSettings {
    /// Number of points enumerated per continuous or integer dimension.
    #[serde(default = "default_num_points", alias = "numPoints")]
    pub num_points: usize,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self { num_points: 5 }
    }
}

/// Exhaustive search over the Cartesian product of per-dimension value
/// sequences, visited in lexicographic order. Observations only feed
/// best-so-far tracking.
#[derive(Debug)]
pub struct GridOptimizer {
    sequences: Vec<(String, Vec<ParameterValue>)>,
    total: usize,
    cursor: usize,
    ledger: ProposalLedger,
}

impl GridOptimizer {
    pub fn new(
        space: ParameterSpace,
        direction: Direction,
        settings: GridSettings,
    ) -> Result<Self, OptimizerError> {
        if settings.num_points == 0 {
            return Err(OptimizerError::ZeroGridPoints);
        }

        let sequences: Vec<(String, Vec<ParameterValue>)> = space
            .iter()
            .map(|(name, spec)| (name.to_string(), dimension_values(&spec.domain, settings.num_points)))
            .collect();

        let total = sequences.iter().map(|(_, values)| values.len()).product();

        Ok(Self {
            sequences,
            total,
            cursor: 0,
            ledger: ProposalLedger::new(direction),
        })
    }

    /// Total number of grid points that will be proposed.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Decompose a flat index into the vector at that grid position, with
    /// the last dimension varying fastest.
    fn vector_at(&self, index: usize) -> ParameterVector {
        let mut remainder = index;
        let mut vector = ParameterVector::new();
        for (name, values) in self.sequences.iter().rev() {
            let idx = remainder % values.len();
            remainder /= values.len();
            vector.insert(name.clone(), values[idx].clone());
        }
        vector
    }
}

/// The sequence of values a grid visits along one dimension.
fn dimension_values(domain: &ParameterDomain, num_points: usize) -> Vec<ParameterValue> {
    match domain {
        ParameterDomain::Continuous { min, max } => {
            if num_points == 1 {
                vec![ParameterValue::F64(*min)]
            } else {
                (0..num_points)
                    .map(|i| {
                        let t = i as f64 / (num_points - 1) as f64;
                        ParameterValue::F64(min + t * (max - min))
                    })
                    .collect()
            }
        }
        ParameterDomain::Integer { min, max } => {
            let width = (max - min + 1) as usize;
            if num_points == 1 {
                vec![ParameterValue::Int(*min)]
            } else if width <= num_points {
                // Fewer representable integers than requested points:
                // enumerate each exactly once.
                (*min..=*max).map(ParameterValue::Int).collect()
            } else {
                let mut values: Vec<i64> = (0..num_points)
                    .map(|i| {
                        let t = i as f64 / (num_points - 1) as f64;
                        (*min as f64 + t * (max - min) as f64).round() as i64
                    })
                    .collect();
                values.dedup();
                values.into_iter().map(ParameterValue::Int).collect()
            }
        }
        ParameterDomain::Categorical { values } => values.clone(),
    }
}

impl Optimizer for GridOptimizer {
    fn propose(&mut self) -> Result<Proposal, OptimizerError> {
        if self.cursor >= self.total {
            return Ok(Proposal::Done);
        }

        let vector = self.vector_at(self.cursor);
        self.cursor += 1;
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
