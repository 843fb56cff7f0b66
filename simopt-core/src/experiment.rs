use crate::dispatch::{jitter, CancelToken, DispatchError, Dispatcher, InProcessDispatcher, Model, RunContext};
use crate::kpi::{KpiError, KpiSet};
use crate::optimizers::{
    Direction, Observation, Optimizer, OptimizerConfig, OptimizerError, Proposal, ProposalHandle,
};
use crate::progress::{ProgressEvent, ProgressSender, RunSummary};
use crate::result::SimulationResult;
use crate::space::{ParameterSpace, ParameterVector};
use crate::store::{IterationRecord, IterationStatus, ResultsStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Tick used when the controller waits for completions, so cancellation and
/// the global deadline are observed promptly.
const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum ExperimentError {
    #[error("parameter space is empty")]
    EmptySpace,
    #[error("no objective KPI has been set")]
    NoObjective,
    #[error("no optimizer has been configured")]
    NoOptimizer,
    #[error("no dispatcher has been configured")]
    NoDispatcher,
    #[error("parallelism must be at least 1")]
    ZeroParallelism,
    #[error("retry policy must allow at least one attempt")]
    ZeroAttempts,
    #[error("retry policy `fallback` requires a fallback result")]
    MissingFallback,
    #[error("optimizer error: {0}")]
    Optimizer(#[from] OptimizerError),
    #[error("KPI error: {0}")]
    Kpi(#[from] KpiError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// What the controller does once an iteration has exhausted its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// Record the iteration as failed.
    Raise,
    /// Re-attempt with jittered parameters; record as failed after
    /// exhaustion.
    Retry,
    /// Substitute a configured fallback result, with KPIs recomputed by the
    /// aggregator.
    Fallback,
}

/// Retry behaviour for failing dispatches.
///
/// Every policy re-attempts retryable failures up to `max_attempts`; `Retry`
/// additionally jitters the parameters on each re-attempt, and `Fallback`
/// substitutes a canned result once attempts are exhausted.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub on_error: OnError,
    pub fallback_result: Option<SimulationResult>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            on_error: OnError::Raise,
            fallback_result: None,
        }
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone)]
pub struct FinalResults {
    pub best_parameters: Option<ParameterVector>,
    pub best_kpis: BTreeMap<String, f64>,
    /// Number of recorded iterations.
    pub iterations: usize,
    pub elapsed: Duration,
    pub cancelled: bool,
    pub records: Vec<IterationRecord>,
}

impl FinalResults {
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            best_parameters: self.best_parameters.clone(),
            best_kpis: self.best_kpis.clone(),
            iterations: self.iterations,
            elapsed_time: self.elapsed.as_secs_f64(),
        }
    }
}

/// Builder for [`Experiment`] instances.
pub struct ExperimentBuilder {
    space: Option<ParameterSpace>,
    kpis: KpiSet,
    optimizer: Option<OptimizerConfig>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    parallelism: usize,
    max_iterations: Option<u64>,
    per_call_timeout: Option<Duration>,
    global_timeout: Option<Duration>,
    retry: RetryPolicy,
    save_base_path: Option<PathBuf>,
    shutdown_grace: Duration,
}

impl Default for ExperimentBuilder {
    fn default() -> Self {
        Self {
            space: None,
            kpis: KpiSet::new(),
            optimizer: None,
            dispatcher: None,
            parallelism: 1,
            max_iterations: None,
            per_call_timeout: None,
            global_timeout: None,
            retry: RetryPolicy::default(),
            save_base_path: None,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ExperimentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_space(mut self, space: ParameterSpace) -> Self {
        self.space = Some(space);
        self
    }

    pub fn with_kpis(mut self, kpis: KpiSet) -> Self {
        self.kpis = kpis;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn with_dispatcher<D: Dispatcher + 'static>(mut self, dispatcher: D) -> Self {
        self.dispatcher = Some(Arc::new(dispatcher));
        self
    }

    /// Dispatch in-process to the given model, registering the KPIs the
    /// model suggests for its own output. KPIs the user has already
    /// registered under the same name win.
    pub fn with_in_process_model<M: Model + 'static>(mut self, model: M) -> Self {
        for (name, spec) in model.kpi_definitions() {
            if self.kpis.add_kpi(&name, spec).is_err() {
                debug!("model KPI `{name}` is already registered; keeping the user's definition");
            }
        }
        self.dispatcher = Some(Arc::new(InProcessDispatcher::new(model)));
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Cap the number of proposals regardless of the optimizer's own budget.
    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn with_per_call_timeout(mut self, timeout: Duration) -> Self {
        self.per_call_timeout = Some(timeout);
        self
    }

    /// Cancel the whole run once this much wall-clock time has passed.
    pub fn with_global_timeout(mut self, timeout: Duration) -> Self {
        self.global_timeout = Some(timeout);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Prefix for the result files written after the run.
    pub fn with_save_base_path<P: Into<PathBuf>>(mut self, base: P) -> Self {
        self.save_base_path = Some(base.into());
        self
    }

    /// How long cancellation waits for in-flight workers before marking
    /// their iterations as cancelled.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn build(self) -> Result<Experiment, ExperimentError> {
        let space = self.space.ok_or(ExperimentError::EmptySpace)?;
        if space.is_empty() {
            return Err(ExperimentError::EmptySpace);
        }
        if self.kpis.objective().is_none() {
            return Err(ExperimentError::NoObjective);
        }
        let optimizer = self.optimizer.ok_or(ExperimentError::NoOptimizer)?;
        let dispatcher = self.dispatcher.ok_or(ExperimentError::NoDispatcher)?;
        if self.parallelism == 0 {
            return Err(ExperimentError::ZeroParallelism);
        }
        if self.retry.max_attempts == 0 {
            return Err(ExperimentError::ZeroAttempts);
        }
        if self.retry.on_error == OnError::Fallback && self.retry.fallback_result.is_none() {
            return Err(ExperimentError::MissingFallback);
        }

        Ok(Experiment {
            space: Arc::new(space),
            kpis: Arc::new(self.kpis),
            optimizer,
            dispatcher,
            parallelism: self.parallelism,
            max_iterations: self.max_iterations,
            per_call_timeout: self.per_call_timeout,
            global_timeout: self.global_timeout,
            retry: self.retry,
            save_base_path: self.save_base_path,
            shutdown_grace: self.shutdown_grace,
        })
    }
}

/// A fully-configured optimisation experiment.
///
/// All mutable state lives inside a single [`run`](Self::run) call; the
/// experiment itself can be run repeatedly and multiple experiments can run
/// concurrently in one process.
pub struct Experiment {
    space: Arc<ParameterSpace>,
    kpis: Arc<KpiSet>,
    optimizer: OptimizerConfig,
    dispatcher: Arc<dyn Dispatcher>,
    parallelism: usize,
    max_iterations: Option<u64>,
    per_call_timeout: Option<Duration>,
    global_timeout: Option<Duration>,
    retry: RetryPolicy,
    save_base_path: Option<PathBuf>,
    shutdown_grace: Duration,
}

impl std::fmt::Debug for Experiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Experiment")
            .field("optimizer", &self.optimizer)
            .field("parallelism", &self.parallelism)
            .field("max_iterations", &self.max_iterations)
            .field("per_call_timeout", &self.per_call_timeout)
            .field("global_timeout", &self.global_timeout)
            .field("retry", &self.retry)
            .field("save_base_path", &self.save_base_path)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}

/// A claimed proposal travelling through a worker.
struct Job {
    step: u64,
    handle: ProposalHandle,
    vector: ParameterVector,
}

/// The state shared between the controller and its workers. Holding the
/// mutex serialises `propose` calls and step assignment.
struct Coordinator {
    optimizer: Box<dyn Optimizer>,
    next_step: u64,
    proposals_issued: u64,
    max_iterations: Option<u64>,
    done: bool,
    in_flight: HashMap<u64, (ProposalHandle, ParameterVector)>,
}

impl Coordinator {
    fn claim(&mut self) -> Result<Option<Job>, OptimizerError> {
        if self.done {
            return Ok(None);
        }
        if let Some(cap) = self.max_iterations {
            if self.proposals_issued >= cap {
                self.done = true;
                return Ok(None);
            }
        }

        match self.optimizer.propose()? {
            Proposal::Done => {
                self.done = true;
                Ok(None)
            }
            Proposal::Candidate { vector, handle } => {
                let step = self.next_step;
                self.next_step += 1;
                self.proposals_issued += 1;
                self.in_flight.insert(step, (handle, vector.clone()));
                Ok(Some(Job { step, handle, vector }))
            }
        }
    }
}

/// One finished iteration, reported from a worker to the controller.
struct IterationOutcome {
    step: u64,
    handle: ProposalHandle,
    parameters: ParameterVector,
    kpis: BTreeMap<String, f64>,
    objective: Option<f64>,
    status: IterationStatus,
    error: Option<String>,
    attempts: u32,
    elapsed_ms: u64,
}

enum WorkerMessage {
    Finished(IterationOutcome),
    Fatal(OptimizerError),
    Exited,
}

impl Experiment {
    pub fn builder() -> ExperimentBuilder {
        ExperimentBuilder::new()
    }

    /// Run the experiment to completion.
    pub fn run(&self) -> Result<FinalResults, ExperimentError> {
        self.run_with(CancelToken::new(), None)
    }

    /// Run with an externally-owned cancellation token.
    pub fn run_with_cancel(&self, cancel: CancelToken) -> Result<FinalResults, ExperimentError> {
        self.run_with(cancel, None)
    }

    /// Run, emitting progress events to the given stream.
    pub fn run_with_progress(&self, progress: ProgressSender) -> Result<FinalResults, ExperimentError> {
        self.run_with(CancelToken::new(), Some(progress))
    }

    pub fn run_with(
        &self,
        cancel: CancelToken,
        progress: Option<ProgressSender>,
    ) -> Result<FinalResults, ExperimentError> {
        let start = Instant::now();

        match self.run_inner(&cancel, progress.as_ref(), start) {
            Ok(results) => Ok(results),
            Err(e) => {
                // Controller-level failures surface on the stream as an
                // `error` event; per-iteration failures never reach here.
                if let Some(progress) = &progress {
                    progress.send(ProgressEvent::Error {
                        message: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    fn run_inner(
        &self,
        cancel: &CancelToken,
        progress: Option<&ProgressSender>,
        start: Instant,
    ) -> Result<FinalResults, ExperimentError> {
        let direction = Direction::from_maximise(
            self.kpis.objective().map(|o| o.maximise).unwrap_or(true),
        );
        let optimizer = self.optimizer.build(&self.space, direction)?;

        let coordinator = Arc::new(Mutex::new(Coordinator {
            optimizer,
            next_step: 1,
            proposals_issued: 0,
            max_iterations: self.max_iterations,
            done: false,
            in_flight: HashMap::new(),
        }));

        let (sender, receiver) = mpsc::channel();

        info!(
            "starting experiment: {} workers, {} dimension(s)",
            self.parallelism,
            self.space.dimension()
        );

        let mut workers = Vec::with_capacity(self.parallelism);
        for worker_id in 0..self.parallelism {
            workers.push(self.spawn_worker(worker_id, coordinator.clone(), cancel.clone(), sender.clone()));
        }
        drop(sender);

        let (store, cancelled) = self.collect(coordinator.clone(), receiver, cancel, progress, start)?;

        for worker in workers {
            if worker.is_finished() {
                let _ = worker.join();
            }
            // Workers that outlived the shutdown grace are left to drain on
            // their own; their iterations are already recorded as cancelled.
        }

        let results = self.finalise(&store, cancelled, start);

        if let Some(progress) = progress {
            progress.send(ProgressEvent::Complete {
                result: results.summary(),
            });
        }

        if let Some(base) = &self.save_base_path {
            save_results(&store, &results, base)?;
        }

        Ok(results)
    }

    fn spawn_worker(
        &self,
        worker_id: usize,
        coordinator: Arc<Mutex<Coordinator>>,
        cancel: CancelToken,
        sender: Sender<WorkerMessage>,
    ) -> thread::JoinHandle<()> {
        let space = self.space.clone();
        let kpis = self.kpis.clone();
        let dispatcher = self.dispatcher.clone();
        let retry = self.retry.clone();
        let per_call_timeout = self.per_call_timeout;

        thread::spawn(move || {
            loop {
                if cancel.is_cancelled() {
                    break;
                }

                let claimed = {
                    let mut coordinator = coordinator.lock().expect("coordinator lock poisoned");
                    coordinator.claim()
                };

                let job = match claimed {
                    Ok(Some(job)) => job,
                    Ok(None) => break,
                    Err(e) => {
                        let _ = sender.send(WorkerMessage::Fatal(e));
                        break;
                    }
                };

                debug!("worker {worker_id} evaluating step {}", job.step);
                let outcome = evaluate(
                    &job,
                    space.as_ref(),
                    kpis.as_ref(),
                    dispatcher.as_ref(),
                    &retry,
                    per_call_timeout,
                    &cancel,
                );

                if sender.send(WorkerMessage::Finished(outcome)).is_err() {
                    // The controller has gone away (shutdown grace expired).
                    break;
                }
            }

            let _ = sender.send(WorkerMessage::Exited);
        })
    }

    /// Receive completions until all workers exit, the run is cancelled and
    /// drained, or the global deadline fires.
    fn collect(
        &self,
        coordinator: Arc<Mutex<Coordinator>>,
        receiver: Receiver<WorkerMessage>,
        cancel: &CancelToken,
        progress: Option<&ProgressSender>,
        start: Instant,
    ) -> Result<(ResultsStore, bool), ExperimentError> {
        let mut store = ResultsStore::new();
        let mut exited = 0;
        let mut fatal: Option<OptimizerError> = None;
        let mut cancel_seen_at: Option<Instant> = None;

        loop {
            if let Some(global) = self.global_timeout {
                if start.elapsed() >= global && !cancel.is_cancelled() {
                    info!("global deadline reached; cancelling run");
                    cancel.cancel();
                }
            }
            if cancel.is_cancelled() && cancel_seen_at.is_none() {
                cancel_seen_at = Some(Instant::now());
            }

            match receiver.recv_timeout(COMPLETION_POLL_INTERVAL) {
                Ok(WorkerMessage::Finished(outcome)) => {
                    self.record_outcome(&coordinator, &mut store, progress, outcome)?;
                }
                Ok(WorkerMessage::Fatal(e)) => {
                    fatal.get_or_insert(e);
                    cancel.cancel();
                }
                Ok(WorkerMessage::Exited) => {
                    exited += 1;
                    if exited == self.parallelism {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(seen) = cancel_seen_at {
                        if seen.elapsed() >= self.shutdown_grace {
                            warn!("shutdown grace expired with workers still in flight");
                            break;
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if let Some(e) = fatal {
            return Err(e.into());
        }

        // Anything still in flight was cut off by cancellation; record it so
        // no proposal is lost.
        let in_flight: Vec<(u64, (ProposalHandle, ParameterVector))> = {
            let mut coordinator = coordinator.lock().expect("coordinator lock poisoned");
            coordinator.in_flight.drain().collect()
        };
        for (step, (handle, vector)) in in_flight {
            let outcome = IterationOutcome {
                step,
                handle,
                parameters: vector,
                kpis: BTreeMap::new(),
                objective: None,
                status: IterationStatus::Cancelled,
                error: Some(DispatchError::Cancelled.label().to_string()),
                attempts: 0,
                elapsed_ms: 0,
            };
            self.record_outcome(&coordinator, &mut store, progress, outcome)?;
        }

        Ok((store, cancel.is_cancelled()))
    }

    /// Serialise the observe/append/emit sequence for one completion.
    fn record_outcome(
        &self,
        coordinator: &Arc<Mutex<Coordinator>>,
        store: &mut ResultsStore,
        progress: Option<&ProgressSender>,
        outcome: IterationOutcome,
    ) -> Result<(), ExperimentError> {
        {
            let mut coordinator = coordinator.lock().expect("coordinator lock poisoned");
            coordinator.in_flight.remove(&outcome.step);

            let observation = match outcome.objective {
                Some(value) => Observation::Value(value),
                None => Observation::Failed,
            };
            coordinator.optimizer.observe(outcome.handle, observation)?;
        }

        let record = IterationRecord {
            step: outcome.step,
            parameters: outcome.parameters,
            kpis: outcome.kpis,
            objective_value: outcome.objective,
            status: outcome.status,
            error: outcome.error,
            attempts: outcome.attempts,
            elapsed_ms: outcome.elapsed_ms,
        };

        if let Some(progress) = progress {
            progress.send(ProgressEvent::Step {
                step: record.step,
                parameters: record.parameters.clone(),
                kpis: record.kpis.clone(),
                objective_value: record.objective_value,
                elapsed_ms: record.elapsed_ms,
                error: record.error.clone(),
            });
        }

        store.append(record)?;
        Ok(())
    }

    fn finalise(&self, store: &ResultsStore, cancelled: bool, start: Instant) -> FinalResults {
        let maximise = self.kpis.objective().map(|o| o.maximise).unwrap_or(true);
        let best = store.best(maximise);

        let results = FinalResults {
            best_parameters: best.map(|r| r.parameters.clone()),
            best_kpis: best.map(|r| r.kpis.clone()).unwrap_or_default(),
            iterations: store.len(),
            elapsed: start.elapsed(),
            cancelled,
            records: store.all().to_vec(),
        };

        info!(
            "experiment finished: {} iteration(s) in {:.3}s{}",
            results.iterations,
            results.elapsed.as_secs_f64(),
            if cancelled { " (cancelled)" } else { "" }
        );

        results
    }
}

/// Run one claimed proposal through validation, dispatch (with retries) and
/// KPI aggregation.
fn evaluate(
    job: &Job,
    space: &ParameterSpace,
    kpis: &KpiSet,
    dispatcher: &dyn Dispatcher,
    retry: &RetryPolicy,
    per_call_timeout: Option<Duration>,
    cancel: &CancelToken,
) -> IterationOutcome {
    let start = Instant::now();

    let failure = |error: DispatchError, attempts: u32, status: IterationStatus| IterationOutcome {
        step: job.step,
        handle: job.handle,
        parameters: job.vector.clone(),
        kpis: BTreeMap::new(),
        objective: None,
        status,
        error: Some(error.label().to_string()),
        attempts,
        elapsed_ms: start.elapsed().as_millis() as u64,
    };

    // A proposal outside the space is recorded immediately; it is never
    // dispatched or retried.
    if let Err(errors) = space.validate(&job.vector) {
        let joined = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return failure(DispatchError::ValidationFailed(joined), 0, IterationStatus::Failed);
    }

    let mut last_error = None;
    let mut attempts = 0;

    for attempt in 1..=retry.max_attempts {
        attempts = attempt;

        // Only the `retry` policy perturbs re-attempts.
        let parameters = if retry.on_error == OnError::Retry && attempt > 1 {
            jitter(space, &job.vector, attempt - 1)
        } else {
            job.vector.clone()
        };

        let ctx = RunContext::new(per_call_timeout, cancel.clone(), attempt);

        match dispatcher.run(&parameters, &ctx) {
            Ok(result) => {
                let values = kpis.apply(&result);
                match kpis.objective_value(&values) {
                    Some(objective) => {
                        return IterationOutcome {
                            step: job.step,
                            handle: job.handle,
                            parameters,
                            kpis: values,
                            objective: Some(objective),
                            status: IterationStatus::Ok,
                            error: None,
                            attempts,
                            elapsed_ms: start.elapsed().as_millis() as u64,
                        };
                    }
                    None => {
                        // The objective KPI is missing or NaN; only a
                        // fallback can recover this.
                        last_error = Some(DispatchError::KpiUnavailable);
                        break;
                    }
                }
            }
            Err(DispatchError::Cancelled) => {
                return failure(DispatchError::Cancelled, attempts, IterationStatus::Cancelled);
            }
            Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                warn!(
                    "step {} attempt {attempt} failed ({}); retrying",
                    job.step,
                    e.label()
                );
                last_error = Some(e);
            }
            Err(e) => {
                let retryable = e.is_retryable();
                last_error = Some(e);
                if !retryable {
                    break;
                }
            }
        }
    }

    let error = last_error.unwrap_or(DispatchError::KpiUnavailable);

    if retry.on_error == OnError::Fallback {
        if let Some(fallback) = &retry.fallback_result {
            let values = kpis.apply(fallback);
            if let Some(objective) = kpis.objective_value(&values) {
                debug!("step {} recovered via fallback result", job.step);
                return IterationOutcome {
                    step: job.step,
                    handle: job.handle,
                    parameters: job.vector.clone(),
                    kpis: values,
                    objective: Some(objective),
                    status: IterationStatus::Ok,
                    error: None,
                    attempts,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                };
            }
        }
    }

    failure(error, attempts, IterationStatus::Failed)
}

/// Write the result file set at the configured base path.
fn save_results(store: &ResultsStore, results: &FinalResults, base: &PathBuf) -> Result<(), ExperimentError> {
    let base = base.as_os_str().to_string_lossy();
    store.export_csv(format!("{base}_iterations.csv"))?;
    store.write_best_json(format!("{base}_best.json"), &results.summary())?;
    store.write_summary_json(format!("{base}_summary.json"))?;
    Ok(())
}
