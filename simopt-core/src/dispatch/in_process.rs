use super::{DispatchError, Dispatcher, RunContext};
use crate::kpi::KpiSpec;
use crate::result::SimulationResult;
use crate::space::{ParameterSpace, ParameterVector};
use crate::table::Table;
use std::collections::BTreeMap;

/// Errors raised inside a user model surface as `model-internal` failures.
pub type ModelError = Box<dyn std::error::Error + Send + Sync>;

/// What a model invocation may return: either a bare table, which the
/// dispatcher wraps, or a fully-formed result carrying in-process KPIs and
/// metadata.
pub enum ModelOutput {
    Table(Table),
    Result(SimulationResult),
}

impl From<Table> for ModelOutput {
    fn from(table: Table) -> Self {
        Self::Table(table)
    }
}

impl From<SimulationResult> for ModelOutput {
    fn from(result: SimulationResult) -> Self {
        Self::Result(result)
    }
}

/// The capability set a user-supplied simulation model provides to the
/// in-process backend.
pub trait Model: Send + Sync {
    /// Run the simulation for one parameter vector.
    ///
    /// Long-running models should observe `ctx.cancel` and return early when
    /// it fires; cancellation of in-process models is cooperative.
    fn run(&self, parameters: &ParameterVector, ctx: &RunContext) -> Result<ModelOutput, ModelError>;

    /// The space of parameters this model accepts.
    fn parameter_space(&self) -> ParameterSpace;

    /// KPIs the model suggests computing over its output. The experiment
    /// builder may register these in addition to user-defined KPIs.
    fn kpi_definitions(&self) -> Vec<(String, KpiSpec)> {
        Vec::new()
    }

    /// Model-specific validation beyond the space's own checks.
    fn validate_parameters(&self, _parameters: &ParameterVector) -> Result<(), String> {
        Ok(())
    }

    /// Free-form model metadata copied into every result.
    fn metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// Dispatch backend that invokes a [`Model`] directly within the engine's
/// address space.
pub struct InProcessDispatcher<M> {
    model: M,
}

impl<M: Model> InProcessDispatcher<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &M {
        &self.model
    }
}

impl<M: Model> Dispatcher for InProcessDispatcher<M> {
    fn run(
        &self,
        parameters: &ParameterVector,
        ctx: &RunContext,
    ) -> Result<SimulationResult, DispatchError> {
        if ctx.cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        self.model
            .validate_parameters(parameters)
            .map_err(DispatchError::ValidationFailed)?;

        let output = self
            .model
            .run(parameters, ctx)
            .map_err(|e| DispatchError::ModelInternal(e.to_string()))?;

        // A cooperative model that noticed the cancel or overran the deadline
        // may still have returned something; the signal wins.
        if ctx.cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        if ctx.expired() {
            return Err(DispatchError::Timeout);
        }

        let mut result = match output {
            ModelOutput::Table(table) => SimulationResult::new(table, parameters.clone()),
            ModelOutput::Result(result) => result,
        };

        result.parameters = parameters.clone();
        for (key, value) in self.model.metadata() {
            result.metadata.entry(key).or_insert(value);
        }

        Ok(result)
    }
}
