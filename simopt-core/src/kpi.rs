use crate::result::SimulationResult;
use crate::table::Table;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug, PartialEq)]
pub enum KpiError {
    #[error("KPI name `{0}` already exists")]
    DuplicateName(String),
    #[error("objective is already set to `{existing}`")]
    ObjectiveAlreadySet { existing: String },
    #[error("KPI `{0}` is not registered")]
    UnknownKpi(String),
}

/// Reductions that can be applied to a table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KpiOp {
    Max,
    Min,
    Mean,
    Sum,
    /// Sample standard deviation (one degree of freedom); NaN for fewer than
    /// two values.
    Std,
    /// The last row of the column.
    Final,
}

impl KpiOp {
    /// Reduce the given values to a scalar.
    ///
    /// NaN cells are skipped; an empty or all-NaN input reduces to NaN.
    pub fn apply<V>(&self, values: V) -> f64
    where
        V: IntoIterator<Item = f64>,
    {
        match self {
            Self::Final => {
                let mut last = f64::NAN;
                for v in values {
                    if !v.is_nan() {
                        last = v;
                    }
                }
                last
            }
            Self::Max => {
                let mut total = f64::NAN;
                for v in values {
                    if !v.is_nan() && !(v <= total) {
                        total = v;
                    }
                }
                total
            }
            Self::Min => {
                let mut total = f64::NAN;
                for v in values {
                    if !v.is_nan() && !(v >= total) {
                        total = v;
                    }
                }
                total
            }
            Self::Sum => {
                let mut total = f64::NAN;
                for v in values {
                    if !v.is_nan() {
                        total = if total.is_nan() { v } else { total + v };
                    }
                }
                total
            }
            Self::Mean => {
                let mut count = 0_usize;
                let mut total = 0.0;
                for v in values {
                    if !v.is_nan() {
                        count += 1;
                        total += v;
                    }
                }
                if count == 0 {
                    f64::NAN
                } else {
                    total / count as f64
                }
            }
            Self::Std => {
                let finite: Vec<f64> = values.into_iter().filter(|v| !v.is_nan()).collect();
                if finite.len() < 2 {
                    return f64::NAN;
                }
                let n = finite.len() as f64;
                let mean = finite.iter().sum::<f64>() / n;
                let var = finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
                var.sqrt()
            }
        }
    }
}

/// Comparison a row filter applies between a cell and its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Predicate {
    LessThan,
    GreaterThan,
    EqualTo,
    LessThanOrEqualTo,
    GreaterThanOrEqualTo,
}

fn default_tolerance() -> f64 {
    1e-9
}

/// Restrict a column reduction to the rows where another column satisfies a
/// predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowFilter {
    pub column: String,
    pub predicate: Predicate,
    pub threshold: f64,
    /// Absolute tolerance for `EqualTo` comparisons.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

impl RowFilter {
    pub fn new(column: &str, predicate: Predicate, threshold: f64) -> Self {
        Self {
            column: column.to_string(),
            predicate,
            threshold,
            tolerance: default_tolerance(),
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Does a cell pass this filter?
    pub fn matches(&self, value: f64) -> bool {
        match self.predicate {
            Predicate::LessThan => value < self.threshold,
            Predicate::GreaterThan => value > self.threshold,
            Predicate::EqualTo => (value - self.threshold).abs() <= self.tolerance,
            Predicate::LessThanOrEqualTo => value <= self.threshold,
            Predicate::GreaterThanOrEqualTo => value >= self.threshold,
        }
    }
}

/// A scalar-valued reduction over a simulation's tabular output.
pub enum KpiSpec {
    /// Apply a named operation to a column, optionally after a row filter.
    Column {
        column: String,
        op: KpiOp,
        filter: Option<RowFilter>,
    },
    /// A user-supplied reduction over the whole table.
    Custom(Box<dyn Fn(&Table) -> f64 + Send + Sync>),
}

impl KpiSpec {
    pub fn column(column: &str, op: KpiOp) -> Self {
        Self::Column {
            column: column.to_string(),
            op,
            filter: None,
        }
    }

    pub fn filtered_column(column: &str, op: KpiOp, filter: RowFilter) -> Self {
        Self::Column {
            column: column.to_string(),
            op,
            filter: Some(filter),
        }
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Table) -> f64 + Send + Sync + 'static,
    {
        Self::Custom(Box::new(f))
    }

    /// Evaluate against a table. Unknown columns reduce to NaN so a
    /// misconfigured KPI surfaces as `kpi-unavailable` rather than aborting
    /// the whole experiment.
    fn evaluate(&self, name: &str, table: &Table) -> f64 {
        match self {
            Self::Custom(f) => f(table),
            Self::Column { column, op, filter } => {
                let values = match table.column(column) {
                    Ok(values) => values,
                    Err(_) => {
                        warn!("KPI `{name}` refers to unknown column `{column}`");
                        return f64::NAN;
                    }
                };

                match filter {
                    None => op.apply(values.iter().copied()),
                    Some(f) => {
                        let mask = match table.column(&f.column) {
                            Ok(mask) => mask,
                            Err(_) => {
                                warn!("KPI `{name}` filters on unknown column `{}`", f.column);
                                return f64::NAN;
                            }
                        };
                        op.apply(
                            mask.iter()
                                .zip(values.iter())
                                .filter(|(m, _)| f.matches(**m))
                                .map(|(_, v)| *v),
                        )
                    }
                }
            }
        }
    }
}

impl fmt::Debug for KpiSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Column { column, op, filter } => f
                .debug_struct("Column")
                .field("column", column)
                .field("op", op)
                .field("filter", filter)
                .finish(),
            Self::Custom(_) => f.debug_struct("Custom").finish_non_exhaustive(),
        }
    }
}

/// The objective KPI of an experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct Objective {
    pub name: String,
    pub maximise: bool,
}

/// The registered KPIs of an experiment, at most one of which is the
/// objective.
#[derive(Debug, Default)]
pub struct KpiSet {
    kpis: Vec<(String, KpiSpec)>,
    objective: Option<Objective>,
}

impl KpiSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a KPI. Duplicate names are an error.
    pub fn add_kpi(&mut self, name: &str, spec: KpiSpec) -> Result<(), KpiError> {
        if self.kpis.iter().any(|(n, _)| n == name) {
            return Err(KpiError::DuplicateName(name.to_string()));
        }
        self.kpis.push((name.to_string(), spec));
        Ok(())
    }

    /// Mark a registered KPI as the scalar optimisation target. Only one
    /// objective is allowed per experiment.
    pub fn set_objective(&mut self, name: &str, maximise: bool) -> Result<(), KpiError> {
        if let Some(existing) = &self.objective {
            return Err(KpiError::ObjectiveAlreadySet {
                existing: existing.name.clone(),
            });
        }
        if !self.kpis.iter().any(|(n, _)| n == name) {
            return Err(KpiError::UnknownKpi(name.to_string()));
        }
        self.objective = Some(Objective {
            name: name.to_string(),
            maximise,
        });
        Ok(())
    }

    pub fn objective(&self) -> Option<&Objective> {
        self.objective.as_ref()
    }

    pub fn len(&self) -> usize {
        self.kpis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kpis.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.kpis.iter().map(|(n, _)| n.as_str())
    }

    /// Run every registered reducer against the result's time series and
    /// merge with the KPIs the simulation already carries. The simulation's
    /// own values win on a name collision.
    pub fn apply(&self, result: &SimulationResult) -> BTreeMap<String, f64> {
        let mut kpis = result.kpis.clone();

        for (name, spec) in &self.kpis {
            if kpis.contains_key(name) {
                continue;
            }
            kpis.insert(name.clone(), spec.evaluate(name, &result.time_series));
        }

        kpis
    }

    /// Extract the objective value from an applied KPI map.
    ///
    /// `None` when the objective KPI is missing or NaN; the caller treats
    /// that iteration as failed with `kpi-unavailable`.
    pub fn objective_value(&self, kpis: &BTreeMap<String, f64>) -> Option<f64> {
        let objective = self.objective.as_ref()?;
        kpis.get(&objective.name).copied().filter(|v| !v.is_nan())
    }
}
