//! A generalised optimisation engine for black-box simulation models.
//!
//! Given a typed parameter space, a set of KPIs computed over tabular
//! simulation output and one objective KPI, an [`experiment::Experiment`]
//! iteratively proposes parameter vectors through an ask/tell
//! [`optimizers::Optimizer`], dispatches simulation runs in-process or as
//! subprocesses, aggregates KPIs, and reports the best-found configuration
//! alongside an append-only iteration log and a live progress stream.

pub mod dispatch;
pub mod experiment;
pub mod kpi;
pub mod optimizers;
pub mod progress;
pub mod result;
pub mod space;
pub mod store;
pub mod table;
pub mod test_utils;
