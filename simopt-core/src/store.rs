use crate::progress::RunSummary;
use crate::space::ParameterVector;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("a record for step {0} already exists")]
    DuplicateStep(u64),
    #[error("CSV error with file at `{path}`: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("IO error with file at `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error with file at `{path}`: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Terminal status of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationStatus {
    Ok,
    Failed,
    /// The run was cancelled while this iteration was in flight.
    Cancelled,
}

/// One row in the results store: the outcome of a single proposal, however
/// many dispatch attempts it took.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IterationRecord {
    /// 1-based, assigned at proposal time.
    pub step: u64,
    pub parameters: ParameterVector,
    pub kpis: BTreeMap<String, f64>,
    /// The objective KPI; `None` for failed iterations.
    pub objective_value: Option<f64>,
    pub status: IterationStatus,
    /// Stable error label for failed iterations (`timeout`, `exit-nonzero`…).
    pub error: Option<String>,
    /// Dispatch attempts made, bounded by the retry policy.
    pub attempts: u32,
    pub elapsed_ms: u64,
}

/// Append-only log of [`IterationRecord`]s, ordered by step.
///
/// The controller is the single writer; records may arrive in completion
/// order and are kept sorted by their proposal-time step.
#[derive(Debug, Default)]
pub struct ResultsStore {
    records: Vec<IterationRecord>,
}

impl ResultsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record at its step position.
    pub fn append(&mut self, record: IterationRecord) -> Result<(), StoreError> {
        match self.records.binary_search_by_key(&record.step, |r| r.step) {
            Ok(_) => Err(StoreError::DuplicateStep(record.step)),
            Err(position) => {
                self.records.insert(position, record);
                Ok(())
            }
        }
    }

    /// All records, in ascending step order.
    pub fn all(&self) -> &[IterationRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The ok record with the extremal objective value, ties broken by the
    /// earliest step.
    pub fn best(&self, maximise: bool) -> Option<&IterationRecord> {
        self.records
            .iter()
            .filter(|r| r.status == IterationStatus::Ok)
            .filter_map(|r| r.objective_value.map(|v| (r, v)))
            .reduce(|(best, best_value), (record, value)| {
                let better = if maximise { value > best_value } else { value < best_value };
                if better { (record, value) } else { (best, best_value) }
            })
            .map(|(record, _)| record)
    }

    /// Write one CSV row per record with all parameters and KPIs flattened
    /// into columns.
    pub fn export_csv<P: AsRef<Path>>(&self, path: P) -> Result<(), StoreError> {
        let path = path.as_ref();
        let csv_error = |source| StoreError::Csv {
            path: path.to_path_buf(),
            source,
        };

        let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;

        let parameter_names: BTreeSet<&str> = self
            .records
            .iter()
            .flat_map(|r| r.parameters.keys().map(|n| n.as_str()))
            .collect();
        let kpi_names: BTreeSet<&str> = self
            .records
            .iter()
            .flat_map(|r| r.kpis.keys().map(|n| n.as_str()))
            .collect();

        let mut header = vec!["step", "status", "error", "attempts", "elapsed_ms"];
        header.extend(parameter_names.iter().copied());
        header.extend(kpi_names.iter().copied());
        header.push("objective");
        writer.write_record(&header).map_err(csv_error)?;

        for record in &self.records {
            let mut row = vec![
                record.step.to_string(),
                match record.status {
                    IterationStatus::Ok => "ok".to_string(),
                    IterationStatus::Failed => "failed".to_string(),
                    IterationStatus::Cancelled => "cancelled".to_string(),
                },
                record.error.clone().unwrap_or_default(),
                record.attempts.to_string(),
                record.elapsed_ms.to_string(),
            ];
            for name in &parameter_names {
                row.push(
                    record
                        .parameters
                        .get(*name)
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                );
            }
            for name in &kpi_names {
                row.push(
                    record
                        .kpis
                        .get(*name)
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                );
            }
            row.push(
                record
                    .objective_value
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            );
            writer.write_record(&row).map_err(csv_error)?;
        }

        writer.flush().map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Write the best-result summary as JSON.
    pub fn write_best_json<P: AsRef<Path>>(&self, path: P, summary: &RunSummary) -> Result<(), StoreError> {
        write_json(path.as_ref(), summary)
    }

    /// Write per-KPI descriptive statistics over the ok iterations.
    pub fn write_summary_json<P: AsRef<Path>>(&self, path: P) -> Result<(), StoreError> {
        write_json(path.as_ref(), &self.summary())
    }

    /// Per-KPI min/max/mean/std over ok iterations, plus status counts.
    pub fn summary(&self) -> StoreSummary {
        let mut by_kpi: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for record in self.records.iter().filter(|r| r.status == IterationStatus::Ok) {
            for (name, value) in &record.kpis {
                if value.is_finite() {
                    by_kpi.entry(name.clone()).or_default().push(*value);
                }
            }
        }

        let kpis = by_kpi
            .into_iter()
            .map(|(name, values)| {
                let n = values.len() as f64;
                let mean = values.iter().sum::<f64>() / n;
                let std = if values.len() < 2 {
                    f64::NAN
                } else {
                    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
                };
                let stats = KpiStatistics {
                    min: values.iter().cloned().fold(f64::INFINITY, f64::min),
                    max: values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                    mean,
                    std,
                };
                (name, stats)
            })
            .collect();

        StoreSummary {
            kpis,
            ok: self.count(IterationStatus::Ok),
            failed: self.count(IterationStatus::Failed),
            cancelled: self.count(IterationStatus::Cancelled),
        }
    }

    fn count(&self, status: IterationStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct KpiStatistics {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StoreSummary {
    pub kpis: BTreeMap<String, KpiStatistics>,
    pub ok: usize,
    pub failed: usize,
    pub cancelled: usize,
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let io_error = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::create(path).map_err(io_error)?;
    serde_json::to_writer_pretty(&mut file, value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    file.write_all(b"\n").map_err(io_error)?;
    Ok(())
}
