use super::{Direction, Observation, Optimizer, OptimizerError, Proposal, ProposalHandle, ProposalLedger};
use crate::space::{ParameterSpace, ParameterVector};
use nalgebra::{Cholesky, DMatrix, DVector};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, SQRT_2};
use thiserror::Error;
use tracing::{debug, warn};

/// Exploration margin used by the expected-improvement and
/// probability-of-improvement acquisitions.
const ACQUISITION_XI: f64 = 0.01;
/// Confidence-bound width used by the LCB acquisition.
const ACQUISITION_KAPPA: f64 = 2.0;
/// Standard deviation of the local perturbations added around the incumbent
/// when searching the acquisition surface.
const LOCAL_PERTURBATION: f64 = 0.08;
/// Margin, as a fraction of the observed objective span, added to the worst
/// observed value when standing in for a failed observation.
const FAILURE_MARGIN: f64 = 0.1;

/// Acquisition function maximised over the surrogate to pick the next point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Acquisition {
    #[serde(rename = "EI")]
    ExpectedImprovement,
    #[serde(rename = "LCB")]
    LowerConfidenceBound,
    #[serde(rename = "PI")]
    ProbabilityOfImprovement,
}

impl Default for Acquisition {
    fn default() -> Self {
        Self::ExpectedImprovement
    }
}

fn default_n_initial_points() -> usize {
    BayesianSettings::default().n_initial_points
}

fn default_n_candidates() -> usize {
    BayesianSettings::default().n_candidates
}

fn default_seed() -> u64 {
    0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BayesianSettings {
    /// Number of proposals before the optimizer reports `Done`.
    #[serde(alias = "iterations")]
    pub num_iterations: u64,
    /// Uniform random proposals made before the surrogate is first fit.
    #[serde(default = "default_n_initial_points", alias = "initialPoints")]
    pub n_initial_points: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub acquisition: Acquisition,
    /// Candidates evaluated against the acquisition per proposal.
    #[serde(default = "default_n_candidates")]
    pub n_candidates: usize,
}

impl Default for BayesianSettings {
    fn default() -> Self {
        Self {
            num_iterations: 50,
            n_initial_points: 5,
            seed: 0,
            acquisition: Acquisition::default(),
            n_candidates: 256,
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum SurrogateError {
    #[error("surrogate has not been fit")]
    NotFitted,
    #[error("no observations to fit on")]
    NoData,
    #[error("kernel matrix is singular")]
    SingularKernel,
    #[error("training inputs and targets have different lengths")]
    LengthMismatch,
}

/// The regression model a Bayesian optimizer fits over its observations.
///
/// Inputs are the space's encoded representation normalised to the unit box.
/// The optimizer minimises internally, so smaller predicted means are
/// better.
pub trait Surrogate: Send {
    fn fit(&mut self, inputs: &[Vec<f64>], targets: &[f64]) -> Result<(), SurrogateError>;

    /// Posterior mean and standard deviation at a point.
    fn predict(&self, input: &[f64]) -> Result<(f64, f64), SurrogateError>;
}

struct FittedGp {
    inputs: Vec<Vec<f64>>,
    /// Inverse of the regularised kernel matrix.
    inverse: DMatrix<f64>,
    /// Inverse applied to the standardised targets.
    alpha: DVector<f64>,
    target_mean: f64,
    target_scale: f64,
}

/// A Gaussian-process surrogate with a squared-exponential kernel.
///
/// Targets are standardised before fitting and the kernel matrix is
/// regularised with an escalating ridge until it factorises.
pub struct GpSurrogate {
    lengthscale: f64,
    fitted: Option<FittedGp>,
}

impl Default for GpSurrogate {
    fn default() -> Self {
        Self {
            lengthscale: 0.2,
            fitted: None,
        }
    }
}

impl GpSurrogate {
    pub fn new(lengthscale: f64) -> Self {
        Self {
            lengthscale,
            fitted: None,
        }
    }

    fn kernel(&self, a: &[f64], b: &[f64]) -> f64 {
        let squared: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum();
        (-0.5 * squared / self.lengthscale.powi(2)).exp()
    }
}

impl Surrogate for GpSurrogate {
    fn fit(&mut self, inputs: &[Vec<f64>], targets: &[f64]) -> Result<(), SurrogateError> {
        if inputs.len() != targets.len() {
            return Err(SurrogateError::LengthMismatch);
        }
        if inputs.is_empty() {
            return Err(SurrogateError::NoData);
        }

        let n = targets.len();
        let target_mean = targets.iter().sum::<f64>() / n as f64;
        let variance = targets.iter().map(|t| (t - target_mean).powi(2)).sum::<f64>() / n as f64;
        let target_scale = if variance > 0.0 { variance.sqrt() } else { 1.0 };

        let standardised: Vec<f64> = targets.iter().map(|t| (t - target_mean) / target_scale).collect();

        let base = DMatrix::from_fn(n, n, |i, j| self.kernel(&inputs[i], &inputs[j]));

        let mut ridge = 1e-8;
        let fitted = loop {
            let matrix = &base + DMatrix::identity(n, n) * ridge;
            if let Some(cholesky) = Cholesky::new(matrix) {
                let inverse = cholesky.inverse();
                let alpha = &inverse * DVector::from_vec(standardised.clone());
                break FittedGp {
                    inputs: inputs.to_vec(),
                    inverse,
                    alpha,
                    target_mean,
                    target_scale,
                };
            }
            ridge *= 100.0;
            if ridge > 1e-2 {
                return Err(SurrogateError::SingularKernel);
            }
        };

        self.fitted = Some(fitted);
        Ok(())
    }

    fn predict(&self, input: &[f64]) -> Result<(f64, f64), SurrogateError> {
        let fitted = self.fitted.as_ref().ok_or(SurrogateError::NotFitted)?;

        let k_star = DVector::from_fn(fitted.inputs.len(), |i, _| self.kernel(input, &fitted.inputs[i]));

        let mean = fitted.target_mean + fitted.target_scale * k_star.dot(&fitted.alpha);

        let v = &fitted.inverse * &k_star;
        let variance = (self.kernel(input, input) - k_star.dot(&v)).max(0.0);
        let std = variance.sqrt() * fitted.target_scale;

        Ok((mean, std))
    }
}

/// Bayesian optimisation over the encoded continuous relaxation of the
/// space.
///
/// The first `n_initial_points` proposals are uniform random draws; once
/// that many observations have been received, subsequent proposals maximise
/// the acquisition over a surrogate fit on everything observed so far.
/// Failed observations enter the fit at a pessimistic sentinel value so the
/// surrogate learns to avoid them.
pub struct BayesianOptimizer {
    space: ParameterSpace,
    settings: BayesianSettings,
    rng: ChaCha8Rng,
    ledger: ProposalLedger,
    surrogate: Box<dyn Surrogate>,
    /// Normalised encoded inputs and internal (minimised) targets; `None`
    /// marks a failed observation.
    history: Vec<(Vec<f64>, Option<f64>)>,
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl BayesianOptimizer {
    pub fn new(space: ParameterSpace, direction: Direction, settings: BayesianSettings) -> Self {
        Self::with_surrogate(space, direction, settings, Box::<GpSurrogate>::default())
    }

    /// Use a custom surrogate strategy in place of the default Gaussian
    /// process.
    pub fn with_surrogate(
        space: ParameterSpace,
        direction: Direction,
        settings: BayesianSettings,
        surrogate: Box<dyn Surrogate>,
    ) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(settings.seed);
        let lower = space.lower_bounds();
        let upper = space.upper_bounds();
        Self {
            space,
            settings,
            rng,
            ledger: ProposalLedger::new(direction),
            surrogate,
            history: Vec::new(),
            lower,
            upper,
        }
    }

    fn normalise(&self, encoded: &[f64]) -> Vec<f64> {
        encoded
            .iter()
            .zip(self.lower.iter().zip(self.upper.iter()))
            .map(|(e, (lo, hi))| if hi > lo { (e - lo) / (hi - lo) } else { 0.0 })
            .collect()
    }

    fn denormalise(&self, unit: &[f64]) -> Vec<f64> {
        unit.iter()
            .zip(self.lower.iter().zip(self.upper.iter()))
            .map(|(u, (lo, hi))| lo + u * (hi - lo))
            .collect()
    }

    /// Internal targets are minimised; negate when the caller maximises.
    fn internal_value(&self, value: f64) -> f64 {
        match self.ledger.direction {
            Direction::Maximise => -value,
            Direction::Minimise => value,
        }
    }

    /// Training targets with failed observations replaced by a pessimistic
    /// sentinel: the worst observed target plus a margin proportional to the
    /// observed span. `None` when nothing succeeded yet.
    fn fit_targets(&self) -> Option<(Vec<Vec<f64>>, Vec<f64>)> {
        let ok: Vec<f64> = self.history.iter().filter_map(|(_, y)| *y).collect();
        if ok.is_empty() {
            return None;
        }

        let worst = ok.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let best = ok.iter().cloned().fold(f64::INFINITY, f64::min);
        let span = worst - best;
        let sentinel = if span > 0.0 { worst + FAILURE_MARGIN * span } else { worst + 1.0 };

        let (inputs, targets) = self
            .history
            .iter()
            .map(|(x, y)| (x.clone(), y.unwrap_or(sentinel)))
            .unzip();
        Some((inputs, targets))
    }

    fn propose_by_surrogate(&mut self) -> Result<Option<ParameterVector>, OptimizerError> {
        let (inputs, targets) = match self.fit_targets() {
            Some(data) => data,
            None => return Ok(None),
        };

        if let Err(e) = self.surrogate.fit(&inputs, &targets) {
            warn!("surrogate fit failed ({e}); falling back to a random proposal");
            return Ok(None);
        }

        // Incumbent among ok observations only.
        let (incumbent, best_target) = self
            .history
            .iter()
            .filter_map(|(x, y)| y.map(|y| (x, y)))
            .fold((None, f64::INFINITY), |(bx, by), (x, y)| {
                if y < by { (Some(x), y) } else { (bx, by) }
            });

        let dimension = self.space.dimension();
        let normal = Normal::new(0.0, LOCAL_PERTURBATION).unwrap();

        let mut candidates: Vec<Vec<f64>> = (0..self.settings.n_candidates)
            .map(|_| (0..dimension).map(|_| self.rng.gen_range(0.0..=1.0)).collect())
            .collect();
        if let Some(incumbent) = incumbent {
            for _ in 0..(self.settings.n_candidates / 8).max(1) {
                let perturbed = incumbent
                    .iter()
                    .map(|u| (u + normal.sample(&mut self.rng)).clamp(0.0, 1.0))
                    .collect();
                candidates.push(perturbed);
            }
        }

        let mut best_candidate: Option<(&Vec<f64>, f64)> = None;
        for candidate in &candidates {
            let (mean, std) = match self.surrogate.predict(candidate) {
                Ok(prediction) => prediction,
                Err(e) => {
                    warn!("surrogate prediction failed ({e}); falling back to a random proposal");
                    return Ok(None);
                }
            };
            let score = acquisition_score(self.settings.acquisition, mean, std, best_target);
            match &best_candidate {
                Some((_, best_score)) if score <= *best_score => {}
                _ => best_candidate = Some((candidate, score)),
            }
        }

        let (winner, score) = match best_candidate {
            Some(found) => found,
            None => return Ok(None),
        };
        debug!("acquisition maximum {score:.6}");

        let encoded = self.denormalise(winner);
        let vector = self.space.decode(&encoded)?;
        Ok(Some(vector))
    }
}

fn acquisition_score(acquisition: Acquisition, mean: f64, std: f64, best_target: f64) -> f64 {
    match acquisition {
        Acquisition::LowerConfidenceBound => -(mean - ACQUISITION_KAPPA * std),
        Acquisition::ExpectedImprovement => {
            if std <= f64::EPSILON {
                return 0.0;
            }
            let z = (best_target - mean - ACQUISITION_XI) / std;
            (best_target - mean - ACQUISITION_XI) * normal_cdf(z) + std * normal_pdf(z)
        }
        Acquisition::ProbabilityOfImprovement => {
            if std <= f64::EPSILON {
                return 0.0;
            }
            normal_cdf((best_target - mean - ACQUISITION_XI) / std)
        }
    }
}

fn normal_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * PI).sqrt()
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / SQRT_2))
}

/// Abramowitz & Stegun 7.1.26 rational approximation; absolute error below
/// 1.5e-7, which is ample for acquisition ranking.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let polynomial = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));

    sign * (1.0 - polynomial * (-x * x).exp())
}

impl Optimizer for BayesianOptimizer {
    fn propose(&mut self) -> Result<Proposal, OptimizerError> {
        if self.ledger.issued() >= self.settings.num_iterations {
            return Ok(Proposal::Done);
        }

        let warming_up = self.ledger.issued() < self.settings.n_initial_points as u64
            || self.history.len() < self.settings.n_initial_points;

        let vector = if warming_up {
            // Not enough observations to fit a surrogate; keep sampling.
            self.space.sample(&mut self.rng)
        } else {
            match self.propose_by_surrogate()? {
                Some(vector) => vector,
                None => self.space.sample(&mut self.rng),
            }
        };

        let handle = self.ledger.issue(vector.clone());
        Ok(Proposal::Candidate { vector, handle })
    }

    fn observe(&mut self, handle: ProposalHandle, observation: Observation) -> Result<(), OptimizerError> {
        let vector = self.ledger.record(handle, observation)?;

        let encoded = self.space.encode(&vector)?;
        let normalised = self.normalise(&encoded);
        let target = match observation {
            Observation::Value(value) => Some(self.internal_value(value)),
            Observation::Failed => None,
        };
        self.history.push((normalised, target));

        Ok(())
    }

    fn best(&self) -> Option<(ParameterVector, f64)> {
        self.ledger.best()
    }

    fn direction(&self) -> Direction {
        self.ledger.direction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    fn one_dimensional_space() -> ParameterSpace {
        ParameterSpace::builder().with_continuous("x", 0.0, 1.0).build().unwrap()
    }

    #[test]
    fn test_normal_cdf() {
        assert_approx_eq!(f64, normal_cdf(0.0), 0.5, epsilon = 1e-7);
        assert!(normal_cdf(2.0) > 0.97);
        assert!(normal_cdf(-2.0) < 0.03);
        assert!(normal_cdf(1.0) > normal_cdf(0.5));
    }

    #[test]
    fn test_gp_interpolates_training_points() {
        let mut gp = GpSurrogate::default();
        let inputs = vec![vec![0.0], vec![0.5], vec![1.0]];
        let targets = vec![1.0, 0.2, 0.9];
        gp.fit(&inputs, &targets).unwrap();

        for (input, target) in inputs.iter().zip(targets.iter()) {
            let (mean, std) = gp.predict(input).unwrap();
            assert_approx_eq!(f64, mean, *target, epsilon = 1e-2);
            assert!(std < 0.05, "std {std} at training point");
        }

        // Uncertainty grows away from the data.
        let (_, far_std) = gp.predict(&[0.25]).unwrap();
        let (_, near_std) = gp.predict(&[0.5]).unwrap();
        assert!(far_std > near_std);
    }

    #[test]
    fn test_gp_errors() {
        let mut gp = GpSurrogate::default();
        assert_eq!(gp.predict(&[0.0]).unwrap_err(), SurrogateError::NotFitted);
        assert_eq!(gp.fit(&[], &[]).unwrap_err(), SurrogateError::NoData);
        assert_eq!(
            gp.fit(&[vec![0.0]], &[1.0, 2.0]).unwrap_err(),
            SurrogateError::LengthMismatch
        );
    }

    #[test]
    fn test_duplicate_training_points_are_regularised() {
        let mut gp = GpSurrogate::default();
        let inputs = vec![vec![0.3], vec![0.3], vec![0.7]];
        let targets = vec![1.0, 1.0, 2.0];
        gp.fit(&inputs, &targets).unwrap();
        let (mean, _) = gp.predict(&[0.3]).unwrap();
        assert_approx_eq!(f64, mean, 1.0, epsilon = 0.1);
    }

    #[test]
    fn test_expected_improvement_prefers_lower_means() {
        let better = acquisition_score(Acquisition::ExpectedImprovement, 0.1, 0.1, 0.5);
        let worse = acquisition_score(Acquisition::ExpectedImprovement, 0.9, 0.1, 0.5);
        assert!(better > worse);
        // Zero uncertainty yields zero improvement.
        assert_approx_eq!(
            f64,
            acquisition_score(Acquisition::ExpectedImprovement, 0.1, 0.0, 0.5),
            0.0
        );
    }

    #[test]
    fn test_initial_proposals_do_not_require_observations() {
        let mut optimizer = BayesianOptimizer::new(
            one_dimensional_space(),
            Direction::Minimise,
            BayesianSettings {
                num_iterations: 10,
                n_initial_points: 3,
                seed: 1,
                ..BayesianSettings::default()
            },
        );

        // No observations are ever fed back; the optimizer must keep
        // producing valid uniform proposals rather than fitting.
        for _ in 0..10 {
            match optimizer.propose().unwrap() {
                Proposal::Candidate { vector, .. } => {
                    assert!(optimizer.space.validate(&vector).is_ok());
                }
                Proposal::Done => panic!("budget exhausted early"),
            }
        }
        assert_eq!(optimizer.propose().unwrap(), Proposal::Done);
    }

    #[test]
    fn test_failed_observations_use_pessimistic_sentinel() {
        let mut optimizer = BayesianOptimizer::new(
            one_dimensional_space(),
            Direction::Minimise,
            BayesianSettings {
                num_iterations: 10,
                n_initial_points: 3,
                seed: 2,
                ..BayesianSettings::default()
            },
        );

        for i in 0..4 {
            let handle = match optimizer.propose().unwrap() {
                Proposal::Candidate { handle, .. } => handle,
                Proposal::Done => panic!("budget exhausted early"),
            };
            // Odd proposals fail.
            let observation = if i % 2 == 1 {
                Observation::Failed
            } else {
                Observation::Value(i as f64)
            };
            optimizer.observe(handle, observation).unwrap();
        }

        let (_, targets) = optimizer.fit_targets().unwrap();
        // Ok targets are 0.0 and 2.0; failures sit above the worst by 10% of
        // the span.
        assert_approx_eq!(f64, targets[0], 0.0);
        assert_approx_eq!(f64, targets[2], 2.0);
        assert_approx_eq!(f64, targets[1], 2.2, epsilon = 1e-9);
        assert_approx_eq!(f64, targets[3], 2.2, epsilon = 1e-9);
    }

    #[test]
    fn test_optimises_a_smooth_function() {
        let space = one_dimensional_space();
        let mut optimizer = BayesianOptimizer::new(
            space.clone(),
            Direction::Minimise,
            BayesianSettings {
                num_iterations: 30,
                n_initial_points: 5,
                seed: 5,
                ..BayesianSettings::default()
            },
        );

        let mut count = 0;
        loop {
            match optimizer.propose().unwrap() {
                Proposal::Done => break,
                Proposal::Candidate { vector, handle } => {
                    assert!(space.validate(&vector).is_ok());
                    let x = vector.get("x").unwrap().as_f64().unwrap();
                    let y = (x - 0.3).powi(2);
                    optimizer.observe(handle, Observation::Value(y)).unwrap();
                    count += 1;
                }
            }
        }

        assert_eq!(count, 30);
        let (_, best_value) = optimizer.best().unwrap();
        assert!(best_value < 0.05, "best value {best_value}");
    }

    #[test]
    fn test_maximisation_negates_internally() {
        let mut optimizer = BayesianOptimizer::new(
            one_dimensional_space(),
            Direction::Maximise,
            BayesianSettings {
                num_iterations: 4,
                n_initial_points: 2,
                seed: 3,
                ..BayesianSettings::default()
            },
        );

        let handle = match optimizer.propose().unwrap() {
            Proposal::Candidate { handle, .. } => handle,
            Proposal::Done => panic!("budget exhausted early"),
        };
        optimizer.observe(handle, Observation::Value(5.0)).unwrap();

        // Stored internal target is the negated objective.
        assert_approx_eq!(f64, optimizer.history[0].1.unwrap(), -5.0);
        // The externally visible best is on the original scale.
        let (_, best) = optimizer.best().unwrap();
        assert_approx_eq!(f64, best, 5.0);
    }
}
