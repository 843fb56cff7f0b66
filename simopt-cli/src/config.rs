use anyhow::{bail, Context};
use serde::Deserialize;
use simopt_core::dispatch::{CommandSpec, OutputFormat, SubprocessConfig, SubprocessDispatcher};
use simopt_core::experiment::{Experiment, OnError, RetryPolicy};
use simopt_core::kpi::{KpiOp, KpiSet, KpiSpec, RowFilter};
use simopt_core::optimizers::OptimizerConfig;
use simopt_core::space::{ParameterSpace, ParameterSpec};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// A complete experiment description, as read from a JSON file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentFile {
    pub parameters: BTreeMap<String, ParameterSpec>,
    pub kpis: Vec<KpiEntry>,
    pub optimizer: OptimizerConfig,
    pub command: CommandEntry,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Per-simulation timeout in seconds.
    #[serde(default)]
    pub per_call_timeout: Option<f64>,
    #[serde(default)]
    pub retry: RetryEntry,
    #[serde(default)]
    pub save_base_path: Option<PathBuf>,
}

fn default_parallelism() -> usize {
    1
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KpiEntry {
    pub name: String,
    pub column: String,
    pub operation: KpiOp,
    #[serde(default)]
    pub filter: Option<RowFilter>,
    #[serde(default)]
    pub objective: bool,
    #[serde(default = "default_maximise", alias = "maximize")]
    pub maximise: bool,
}

fn default_maximise() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Shell(String),
    Argv(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandEntry {
    pub command: CommandLine,
    #[serde(default = "default_param_format")]
    pub param_format: String,
    #[serde(default = "default_output_format")]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub output_file: Option<PathBuf>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_param_format() -> String {
    "--{name} {value}".to_string()
}

fn default_output_format() -> OutputFormat {
    OutputFormat::Csv
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryEntry {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_on_error")]
    pub on_error: OnError,
}

impl Default for RetryEntry {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            on_error: default_on_error(),
        }
    }
}

fn default_max_attempts() -> u32 {
    1
}

fn default_on_error() -> OnError {
    OnError::Raise
}

impl ExperimentFile {
    /// Resolve the description into a runnable experiment. Command-line
    /// overrides win over the file's own settings.
    pub fn into_experiment(
        self,
        parallelism_override: Option<usize>,
        save_override: Option<PathBuf>,
    ) -> anyhow::Result<Experiment> {
        let mut space_builder = ParameterSpace::builder();
        for (name, spec) in self.parameters {
            space_builder = space_builder.with_spec(&name, spec);
        }
        let space = space_builder.build().context("invalid parameter space")?;

        let mut kpis = KpiSet::new();
        let mut objective: Option<(String, bool)> = None;
        for entry in self.kpis {
            let spec = match entry.filter {
                None => KpiSpec::column(&entry.column, entry.operation),
                Some(filter) => KpiSpec::filtered_column(&entry.column, entry.operation, filter),
            };
            kpis.add_kpi(&entry.name, spec)
                .with_context(|| format!("invalid KPI `{}`", entry.name))?;
            if entry.objective {
                if let Some((existing, _)) = &objective {
                    bail!("both `{existing}` and `{}` are marked objective", entry.name);
                }
                objective = Some((entry.name, entry.maximise));
            }
        }
        let (name, maximise) = match objective {
            Some(objective) => objective,
            None => bail!("no KPI is marked `objective`"),
        };
        kpis.set_objective(&name, maximise)?;

        let command = match self.command.command {
            CommandLine::Shell(line) => CommandSpec::Shell(line),
            CommandLine::Argv(argv) => CommandSpec::Argv(argv),
        };
        let mut subprocess = SubprocessConfig::new(command, self.command.output_format)
            .with_param_format(&self.command.param_format);
        if let Some(path) = self.command.output_file {
            subprocess = subprocess.with_output_file(path);
        }
        if let Some(dir) = self.command.working_dir {
            subprocess = subprocess.with_working_dir(dir);
        }
        for (key, value) in &self.command.env {
            subprocess = subprocess.with_env(key, value);
        }

        let mut builder = Experiment::builder()
            .with_space(space)
            .with_kpis(kpis)
            .with_optimizer(self.optimizer)
            .with_dispatcher(SubprocessDispatcher::new(subprocess))
            .with_parallelism(parallelism_override.unwrap_or(self.parallelism))
            .with_retry_policy(RetryPolicy {
                max_attempts: self.retry.max_attempts,
                on_error: self.retry.on_error,
                fallback_result: None,
            });

        if let Some(seconds) = self.per_call_timeout {
            builder = builder.with_per_call_timeout(Duration::from_secs_f64(seconds));
        }
        if let Some(base) = save_override.or(self.save_base_path) {
            builder = builder.with_save_base_path(base);
        }

        Ok(builder.build()?)
    }
}
