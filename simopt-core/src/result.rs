use crate::space::ParameterVector;
use crate::table::Table;
use std::collections::BTreeMap;

/// The standard container produced by one simulation run.
///
/// Results are immutable once built; the KPI aggregator merges any KPIs the
/// simulation computed in-process with its own column reductions, with the
/// simulation's values taking precedence on a name collision.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationResult {
    /// Rows are time steps or samples; columns are named state variables.
    pub time_series: Table,
    /// KPIs the simulation itself reported, if any.
    pub kpis: BTreeMap<String, f64>,
    /// Free-form run metadata (model version, wall clock, seeds used).
    pub metadata: BTreeMap<String, String>,
    /// The parameter vector that produced this result.
    pub parameters: ParameterVector,
}

impl SimulationResult {
    pub fn new(time_series: Table, parameters: ParameterVector) -> Self {
        Self {
            time_series,
            kpis: BTreeMap::new(),
            metadata: BTreeMap::new(),
            parameters,
        }
    }

    pub fn with_kpi(mut self, name: &str, value: f64) -> Self {
        self.kpis.insert(name.to_string(), value);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}
