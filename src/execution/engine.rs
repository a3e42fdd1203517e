//! Pipeline Execution Engine
//!
//! Drives one pipeline through its state machine:
//!
//! ```text
//! pending ──start──▶ running ──last step ok──▶ completed
//!    │                  │
//!    └──────────────────┴──first failure / cancel──▶ failed
//! ```
//!
//! Steps run strictly in declared order, one at a time. Every transition is
//! committed before the next one is attempted, so a crashed run can be
//! resumed from the first step that is not `completed`.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::catalog::ResourceCatalog;
use crate::config::EngineConfig;
use crate::error::FailureKind;
use crate::layout::{write_snapshot, OutputLayout};
use crate::pipeline::model::now;
use crate::pipeline::{ConfigType, Pipeline, PipelineConfig, PipelineStep, RunStatus, ValueMap};
use crate::store::{RetryPolicy, StepCompletion, Store, StoreError};

use super::executor::{CancelToken, ExecutorRegistry, StepContext, StepExecutor, StepFailure, StepOutput};
use super::resolver::{resolve_inputs, ResolveError};

/// How often a waiting engine checks for cancellation and deadlines.
const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("pipeline {id} is {status}; expected {expected}")]
    InvalidState {
        id: Uuid,
        status: RunStatus,
        expected: &'static str,
    },

    #[error("step '{name}' is {status}; only pending steps can be executed")]
    StepNotPending { name: String, status: RunStatus },

    #[error("failed to write config snapshot {}: {source}", path.display())]
    Snapshot {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Failed {
        /// The failing step, if the failure is attributable to one.
        step: Option<String>,
        kind: FailureKind,
        reason: String,
    },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

/// Terminal result of executing a single step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed(PipelineStep),
    Failed {
        step: PipelineStep,
        kind: FailureKind,
        reason: String,
    },
}

/// What came back from the executor thread.
enum Invocation {
    Finished(Result<StepOutput, StepFailure>),
    /// The deadline passed; carries the executor's answer if it arrived
    /// within the grace period.
    Overdue(Option<Result<StepOutput, StepFailure>>),
    Panicked,
}

/// Pipeline execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use circrunner::execution::{CancelToken, CommandExecutor, Engine, ExecutorRegistry};
/// use circrunner::layout::OutputLayout;
/// use circrunner::store::Store;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = Arc::new(Store::open("circrunner.db")?);
///     let registry = ExecutorRegistry::new().with_default(CommandExecutor::new());
///     let mut engine = Engine::new(store, Arc::new(registry), OutputLayout::new("user_outputs"));
///     engine.set_step_timeout(Some(std::time::Duration::from_secs(3600)));
///
///     let id = "6f0d3c1e-8a9b-4a57-9d3e-0c3f4d1f2a11".parse()?;
///     let outcome = engine.start(id, &CancelToken::new())?;
///     println!("{:?}", outcome);
///     Ok(())
/// }
/// ```
pub struct Engine {
    store: Arc<Store>,
    catalog: Arc<dyn ResourceCatalog>,
    registry: Arc<ExecutorRegistry>,
    layout: OutputLayout,
    step_timeout: Option<Duration>,
    cancel_grace: Duration,
    retry: RetryPolicy,
    /// Executor threads that outlived their deadline and grace period.
    abandoned: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Creates an engine that resolves resources against `store`.
    pub fn new(store: Arc<Store>, registry: Arc<ExecutorRegistry>, layout: OutputLayout) -> Self {
        let catalog: Arc<dyn ResourceCatalog> = store.clone();
        Self {
            store,
            catalog,
            registry,
            layout,
            step_timeout: None,
            cancel_grace: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            abandoned: Mutex::new(Vec::new()),
        }
    }

    /// Creates an engine with timeouts, retries and layout taken from `config`.
    pub fn from_config(
        store: Arc<Store>,
        registry: Arc<ExecutorRegistry>,
        config: &EngineConfig,
    ) -> Self {
        let mut engine = Self::new(store, registry, OutputLayout::new(&config.output_dir));
        engine.set_step_timeout(config.step_timeout());
        engine.set_cancel_grace(config.cancel_grace());
        engine.set_retry_policy(RetryPolicy::from(config));
        engine
    }

    /// Replaces the catalog used for resource inputs.
    pub fn set_catalog(&mut self, catalog: Arc<dyn ResourceCatalog>) {
        self.catalog = catalog;
    }

    /// Sets the per-step deadline. `None` lets steps run indefinitely.
    pub fn set_step_timeout(&mut self, timeout: Option<Duration>) {
        self.step_timeout = timeout;
    }

    /// Sets how long an overdue step may take to stop after being signalled.
    pub fn set_cancel_grace(&mut self, grace: Duration) {
        self.cancel_grace = grace;
    }

    pub fn set_retry_policy(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Starts a `pending` pipeline and runs it to a terminal state.
    ///
    /// Returns `Err` only when a precondition fails or the store cannot be
    /// written; every other failure is persisted and reported as
    /// [`RunOutcome::Failed`].
    pub fn start(&self, id: Uuid, cancel: &CancelToken) -> Result<RunOutcome, EngineError> {
        let pipeline = self.persist("load pipeline", || self.store.get_pipeline(id))?;
        if pipeline.status != RunStatus::Pending {
            return Err(EngineError::InvalidState {
                id,
                status: pipeline.status,
                expected: "pending",
            });
        }

        let steps = self.persist("load steps", || self.store.get_steps(id))?;
        if steps.is_empty() {
            return self.fail_pipeline(
                id,
                None,
                FailureKind::ConfigurationError,
                "pipeline has no steps",
            );
        }
        if cancel.is_cancelled() {
            return self.fail_pipeline(id, None, FailureKind::Cancelled, "cancelled before start");
        }

        let started = self.persist("start pipeline", || {
            self.store
                .update_pipeline_status(id, RunStatus::Running, Some("Pipeline started"))
        });
        match started {
            Ok(_) => {}
            // Lost a race with a concurrent cancel.
            Err(EngineError::Persistence(StoreError::InvalidTransition { from, .. })) => {
                return Err(EngineError::InvalidState {
                    id,
                    status: from,
                    expected: "pending",
                })
            }
            Err(e) => return Err(e),
        }

        info!(
            "Starting pipeline '{}' ({}, {} steps)",
            pipeline.name,
            id,
            steps.len()
        );
        self.run_steps(&pipeline, steps, cancel)
    }

    /// Continues a pipeline after a restart.
    ///
    /// A `pending` pipeline is simply started. A `running` one has its stale
    /// `running` steps reset to `pending` and continues from the first step
    /// that is not `completed`. Terminal pipelines cannot be resumed.
    pub fn resume(&self, id: Uuid, cancel: &CancelToken) -> Result<RunOutcome, EngineError> {
        let pipeline = self.persist("load pipeline", || self.store.get_pipeline(id))?;

        match pipeline.status {
            RunStatus::Pending => return self.start(id, cancel),
            RunStatus::Running => {}
            status => {
                return Err(EngineError::InvalidState {
                    id,
                    status,
                    expected: "pending or running",
                })
            }
        }

        let mut steps = self.persist("load steps", || self.store.get_steps(id))?;

        for step in steps.iter_mut().filter(|s| s.status == RunStatus::Running) {
            warn!("Step '{}' was interrupted; resetting to pending", step.name);
            let step_id = step.id;
            let note = format!("Step {} was interrupted and will be re-run", step.name);
            *step = self.persist("reset stale step", || self.store.reset_stale_step(step_id, &note))?;
        }

        // The process died after a step failed but before the pipeline did.
        if let Some(failed) = steps.iter().find(|s| s.status == RunStatus::Failed) {
            let (kind, reason) = self.recorded_failure(failed)?;
            return self.fail_pipeline(id, Some(&failed.name), kind, reason);
        }

        if cancel.is_cancelled() {
            return self.fail_pipeline(id, None, FailureKind::Cancelled, "cancelled before resume");
        }

        info!("Resuming pipeline '{}' ({})", pipeline.name, id);
        self.persist("append log", || {
            self.store.append_log(id, None, "Pipeline resumed")
        })?;
        self.run_steps(&pipeline, steps, cancel)
    }

    /// Requests cancellation.
    ///
    /// A `pending` pipeline fails immediately. A `running` one is signalled
    /// through `token`; the running step finishes or aborts on its own and
    /// the run then fails with a cancellation reason. Returns the status the
    /// pipeline has after the request.
    pub fn cancel(&self, id: Uuid, token: &CancelToken) -> Result<RunStatus, EngineError> {
        let pipeline = self.persist("load pipeline", || self.store.get_pipeline(id))?;

        match pipeline.status {
            RunStatus::Pending => {
                token.cancel();
                let note = FailureKind::Cancelled.log_entry("Pipeline cancelled before start");
                let failed = self.persist("cancel pipeline", || {
                    self.store
                        .update_pipeline_status(id, RunStatus::Failed, Some(&note))
                });
                match failed {
                    Ok(p) => {
                        info!("Cancelled pending pipeline {}", id);
                        Ok(p.status)
                    }
                    // A worker started it in the meantime; the token stops it.
                    Err(EngineError::Persistence(StoreError::InvalidTransition { .. })) => {
                        Ok(RunStatus::Running)
                    }
                    Err(e) => Err(e),
                }
            }
            RunStatus::Running => {
                token.cancel();
                self.persist("append log", || {
                    self.store.append_log(id, None, "Cancellation requested")
                })?;
                info!("Cancellation requested for pipeline {}", id);
                Ok(RunStatus::Running)
            }
            status => Err(EngineError::InvalidState {
                id,
                status,
                expected: "pending or running",
            }),
        }
    }

    /// Resolves inputs for one `pending` step of a `running` pipeline and
    /// executes it. Later steps are not touched.
    pub fn execute_step(&self, step_id: Uuid, cancel: &CancelToken) -> Result<StepOutcome, EngineError> {
        let step = self.persist("load step", || self.store.get_step(step_id))?;
        let pipeline = self.persist("load pipeline", || self.store.get_pipeline(step.pipeline_id))?;
        if pipeline.status != RunStatus::Running {
            return Err(EngineError::InvalidState {
                id: pipeline.id,
                status: pipeline.status,
                expected: "running",
            });
        }

        let steps = self.persist("load steps", || self.store.get_steps(pipeline.id))?;
        let run_dir = self
            .layout
            .pipeline(pipeline.user_id, pipeline.id)
            .ensure_run_dir()
            .map_err(StoreError::Io)?;

        let outcome = self.run_step(&steps, step.position, &run_dir, cancel);
        self.reap_abandoned();
        outcome
    }

    fn run_steps(
        &self,
        pipeline: &Pipeline,
        steps: Vec<PipelineStep>,
        cancel: &CancelToken,
    ) -> Result<RunOutcome, EngineError> {
        let outcome = self.drive(pipeline, steps, cancel);
        self.reap_abandoned();
        outcome
    }

    /// Blocks until every executor thread left behind by a deadline has
    /// exited. At most one step may be executing at any time, so the caller
    /// must not move on while an abandoned one is still running.
    fn reap_abandoned(&self) {
        let stragglers: Vec<JoinHandle<()>> = self.abandoned.lock().drain(..).collect();
        for handle in stragglers {
            let name = handle.thread().name().unwrap_or("step").to_string();
            warn!("Waiting for abandoned executor thread '{}' to exit", name);
            if handle.join().is_err() {
                warn!("Abandoned executor thread '{}' panicked", name);
            }
        }
    }

    fn drive(
        &self,
        pipeline: &Pipeline,
        mut steps: Vec<PipelineStep>,
        cancel: &CancelToken,
    ) -> Result<RunOutcome, EngineError> {
        let layout = self.layout.pipeline(pipeline.user_id, pipeline.id);
        let run_dir = match layout.ensure_run_dir() {
            Ok(dir) => dir,
            Err(e) => {
                return self.fail_pipeline(
                    pipeline.id,
                    None,
                    FailureKind::ExecutorError,
                    format!("could not create run directory: {}", e),
                )
            }
        };

        for position in 0..steps.len() {
            if steps[position].status == RunStatus::Completed {
                debug!("Step '{}' already completed; skipping", steps[position].name);
                continue;
            }

            if cancel.is_cancelled() {
                let reason = format!("cancelled before step {}", steps[position].name);
                return self.fail_pipeline(pipeline.id, None, FailureKind::Cancelled, reason);
            }

            match self.run_step(&steps, position, &run_dir, cancel)? {
                StepOutcome::Completed(step) => {
                    let name = step.name.clone();
                    steps[position] = step;
                    if cancel.is_cancelled() {
                        let reason = format!("cancelled after step {}", name);
                        return self.fail_pipeline(pipeline.id, None, FailureKind::Cancelled, reason);
                    }
                }
                StepOutcome::Failed { step, kind, reason } => {
                    let reason = format!("step {} failed: {}", step.name, reason);
                    return self.fail_pipeline(pipeline.id, Some(&step.name), kind, reason);
                }
            }
        }

        self.complete(pipeline, &steps)
    }

    fn run_step(
        &self,
        steps: &[PipelineStep],
        position: usize,
        run_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<StepOutcome, EngineError> {
        let step = &steps[position];
        if step.status != RunStatus::Pending {
            return Err(EngineError::StepNotPending {
                name: step.name.clone(),
                status: step.status,
            });
        }

        let inputs = match resolve_inputs(step, steps, self.catalog.as_ref()) {
            Ok(inputs) => inputs,
            Err(ResolveError::Catalog(e)) => return Err(EngineError::Persistence(e)),
            Err(e) => return self.fail_step(step, e.kind(), e.to_string(), None, String::new()),
        };

        let Some(executor) = self.registry.get(&step.name) else {
            let reason = format!("no executor registered for step '{}'", step.name);
            return self.fail_step(step, FailureKind::ExecutorError, reason, None, String::new());
        };

        let running = self.persist("mark step running", || {
            self.store.mark_step_running(step.id, &inputs)
        })?;
        info!(
            "Running step {}/{}: {}",
            position + 1,
            steps.len(),
            running.name
        );

        let ctx = StepContext {
            pipeline_id: running.pipeline_id,
            step_id: running.id,
            step_name: running.name.clone(),
            working_dir: run_dir.to_path_buf(),
            cancel: CancelToken::new(),
            cancel_grace: self.cancel_grace,
        };

        match self.invoke(executor, running.parameters.clone(), inputs, ctx, cancel) {
            Invocation::Finished(Ok(output)) => {
                let mut logs = Vec::new();
                if !output.log_text.is_empty() {
                    logs.push(output.log_text);
                }
                logs.push(format!("Step {} completed successfully", running.name));

                let completion = StepCompletion {
                    status: RunStatus::Completed,
                    results: Some(output.results),
                    logs,
                };
                let done = self.persist("complete step", || {
                    self.store.finish_step(running.id, &completion)
                })?;
                info!("Step '{}' completed", done.name);
                Ok(StepOutcome::Completed(done))
            }
            Invocation::Finished(Err(failure)) => {
                let kind = if failure.aborted || cancel.is_cancelled() {
                    FailureKind::Cancelled
                } else {
                    FailureKind::ExecutorError
                };
                self.fail_step(&running, kind, failure.message, failure.results, failure.log_text)
            }
            Invocation::Overdue(answer) => {
                let limit = self.step_timeout.unwrap_or_default();
                let reason = format!("exceeded its deadline of {}s", limit.as_secs());
                let (results, log_text) = match answer {
                    Some(Ok(output)) => (Some(output.results), output.log_text),
                    Some(Err(failure)) => (failure.results, failure.log_text),
                    None => (None, String::new()),
                };
                self.fail_step(&running, FailureKind::DeadlineExceeded, reason, results, log_text)
            }
            Invocation::Panicked => {
                let reason = format!("executor for step '{}' panicked", running.name);
                self.fail_step(&running, FailureKind::ExecutorError, reason, None, String::new())
            }
        }
    }

    /// Runs the executor on its own thread and waits for it, forwarding
    /// pipeline cancellation and enforcing the deadline.
    fn invoke(
        &self,
        executor: Arc<dyn StepExecutor>,
        parameters: ValueMap,
        inputs: ValueMap,
        ctx: StepContext,
        cancel: &CancelToken,
    ) -> Invocation {
        let step_cancel = ctx.cancel.clone();
        let step_name = ctx.step_name.clone();
        let (tx, rx) = channel();

        let spawned = thread::Builder::new()
            .name(format!("step-{}", step_name))
            .spawn(move || {
                let result = executor.execute(&parameters, &inputs, &ctx);
                // The engine may have stopped waiting.
                let _ = tx.send(result);
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                return Invocation::Finished(Err(StepFailure::new(format!(
                    "could not start executor thread: {}",
                    e
                ))))
            }
        };

        let started = Instant::now();
        let mut grace_until: Option<Instant> = None;

        loop {
            let answer = match rx.recv_timeout(WAIT_SLICE) {
                Ok(result) => Some(result),
                Err(RecvTimeoutError::Disconnected) => None,
                Err(RecvTimeoutError::Timeout) => {
                    self.check_progress(&step_name, started, &mut grace_until, cancel, &step_cancel);
                    if grace_until.map_or(false, |until| Instant::now() >= until) {
                        error!(
                            "Step '{}' did not stop within {:?}; failing it",
                            step_name, self.cancel_grace
                        );
                        self.abandoned.lock().push(handle);
                        return Invocation::Overdue(None);
                    }
                    continue;
                }
            };

            // The thread is done once it has answered or hung up.
            if handle.join().is_err() {
                debug!("Executor thread for step '{}' panicked", step_name);
            }
            return match (answer, grace_until) {
                (Some(result), Some(_)) => Invocation::Overdue(Some(result)),
                (Some(result), None) => Invocation::Finished(result),
                (None, _) => Invocation::Panicked,
            };
        }
    }

    /// Forwards pipeline cancellation to the step and starts the grace
    /// period once the deadline has passed.
    fn check_progress(
        &self,
        step_name: &str,
        started: Instant,
        grace_until: &mut Option<Instant>,
        cancel: &CancelToken,
        step_cancel: &CancelToken,
    ) {
        if cancel.is_cancelled() && !step_cancel.is_cancelled() {
            info!("Signalling step '{}' to stop", step_name);
            step_cancel.cancel();
        }

        if let (None, Some(limit)) = (*grace_until, self.step_timeout) {
            if started.elapsed() >= limit {
                warn!(
                    "Step '{}' exceeded its deadline of {:?}; signalling it to stop",
                    step_name, limit
                );
                step_cancel.cancel();
                *grace_until = Some(Instant::now() + self.cancel_grace);
            }
        }
    }

    /// Persists a failed step (from `pending` or `running`) with whatever it
    /// produced and a `[Kind]` log entry.
    fn fail_step(
        &self,
        step: &PipelineStep,
        kind: FailureKind,
        reason: String,
        results: Option<ValueMap>,
        log_text: String,
    ) -> Result<StepOutcome, EngineError> {
        let mut logs = Vec::new();
        if !log_text.is_empty() {
            logs.push(log_text);
        }
        logs.push(kind.log_entry(format!("Step {} failed: {}", step.name, reason)));

        let completion = StepCompletion {
            status: RunStatus::Failed,
            results,
            logs,
        };
        let failed = self.persist("fail step", || self.store.finish_step(step.id, &completion))?;

        error!("Step '{}' failed [{}]: {}", failed.name, kind, reason);
        Ok(StepOutcome::Failed {
            step: failed,
            kind,
            reason,
        })
    }

    fn fail_pipeline(
        &self,
        id: Uuid,
        step: Option<&str>,
        kind: FailureKind,
        reason: impl Into<String>,
    ) -> Result<RunOutcome, EngineError> {
        let reason = reason.into();
        let note = kind.log_entry(format!("Pipeline failed: {}", reason));
        self.persist("fail pipeline", || {
            self.store
                .update_pipeline_status(id, RunStatus::Failed, Some(&note))
        })?;

        error!("Pipeline {} failed [{}]: {}", id, kind, reason);
        Ok(RunOutcome::Failed {
            step: step.map(str::to_string),
            kind,
            reason,
        })
    }

    /// Writes the final snapshot and marks the pipeline completed.
    ///
    /// A snapshot that cannot be written leaves the pipeline `running`.
    fn complete(&self, pipeline: &Pipeline, steps: &[PipelineStep]) -> Result<RunOutcome, EngineError> {
        let merged: ValueMap = steps
            .iter()
            .map(|s| {
                let results = s.results.clone().unwrap_or_default();
                (s.name.clone(), results.into())
            })
            .collect();
        let json = serde_json::to_string_pretty(&merged).map_err(StoreError::from)?;

        let path = self
            .layout
            .pipeline(pipeline.user_id, pipeline.id)
            .config_file(ConfigType::Final);
        write_snapshot(&path, &json).map_err(|source| EngineError::Snapshot {
            path: path.clone(),
            source,
        })?;

        let config = PipelineConfig {
            id: Uuid::new_v4(),
            pipeline_id: pipeline.id,
            config_type: ConfigType::Final,
            config_data: json,
            file_path: path.to_string_lossy().into_owned(),
            date_added: now(),
        };
        self.persist("complete pipeline", || {
            self.store
                .complete_pipeline(pipeline.id, &config, "Pipeline completed successfully")
        })?;

        info!("Pipeline '{}' completed ({} steps)", pipeline.name, steps.len());
        Ok(RunOutcome::Completed)
    }

    /// The kind and reason recorded in a failed step's logs.
    fn recorded_failure(&self, step: &PipelineStep) -> Result<(FailureKind, String), EngineError> {
        let logs = self.persist("load step logs", || self.store.get_step_logs(step.id))?;
        let recorded = logs.iter().rev().find_map(|log| {
            FailureKind::parse_log_entry(&log.text).map(|(kind, msg)| (kind, msg.to_string()))
        });
        Ok(recorded.unwrap_or_else(|| {
            (
                FailureKind::ExecutorError,
                format!("step {} failed", step.name),
            )
        }))
    }

    fn persist<T, F>(&self, what: &str, op: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Result<T, StoreError>,
    {
        self.retry.run(what, op).map_err(|e| {
            error!("Could not {}: {}", what, e);
            EngineError::Persistence(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{InputSource, StepRef, Value};
    use crate::store::test_support::registration;
    use crate::store::Registration;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    fn output(field: &str, value: &str) -> StepOutput {
        let mut results = ValueMap::new();
        results.insert(field.to_string(), Value::from(value));
        StepOutput::new(results)
    }

    fn produce(_: &ValueMap, _: &ValueMap, _: &StepContext) -> Result<StepOutput, StepFailure> {
        Ok(output("output_path", "/tmp/x").with_log("produced"))
    }

    fn echo_inputs(_: &ValueMap, inputs: &ValueMap, _: &StepContext) -> Result<StepOutput, StepFailure> {
        Ok(StepOutput::new(inputs.clone()))
    }

    fn broken(_: &ValueMap, _: &ValueMap, _: &StepContext) -> Result<StepOutput, StepFailure> {
        Err(StepFailure::new("tool exited with code 2")
            .with_results(output("partial", "yes").results)
            .with_log("stderr: boom"))
    }

    fn wait_for_cancel(_: &ValueMap, _: &ValueMap, ctx: &StepContext) -> Result<StepOutput, StepFailure> {
        while !ctx.cancel.is_cancelled() {
            thread::sleep(Duration::from_millis(10));
        }
        Err(StepFailure::aborted("stopped on request"))
    }

    struct Fixture {
        _dir: TempDir,
        engine: Engine,
    }

    fn fixture(registry: ExecutorRegistry) -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut engine = Engine::new(store, Arc::new(registry), OutputLayout::new(dir.path()));
        engine.set_retry_policy(RetryPolicy::none());
        Fixture { _dir: dir, engine }
    }

    /// Three steps; step2 reads `field` of step1 (position 1 reads 0).
    fn chained(field: &str) -> Registration {
        let mut reg = registration("chain", 3);
        reg.steps[1].input_mapping.insert(
            "source".into(),
            InputSource::step_output(StepRef::Index(0), field),
        );
        reg.steps[1].requires_input_file = true;
        reg
    }

    #[test]
    fn test_sequential_run_completes() {
        let fx = fixture(
            ExecutorRegistry::new()
                .with("step0", produce)
                .with_default(echo_inputs),
        );
        let reg = chained("output_path");
        fx.engine.store().register_pipeline(&reg).unwrap();

        let outcome = fx.engine.start(reg.pipeline.id, &CancelToken::new()).unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let store = fx.engine.store();
        let pipeline = store.get_pipeline(reg.pipeline.id).unwrap();
        assert_eq!(pipeline.status, RunStatus::Completed);
        assert!(pipeline.start_time.is_some() && pipeline.end_time.is_some());

        let steps = store.get_steps(reg.pipeline.id).unwrap();
        assert!(steps.iter().all(|s| s.status == RunStatus::Completed));
        assert!(steps.iter().all(|s| s.end_time >= s.start_time));
        assert_eq!(
            steps[1].input_files.as_ref().unwrap()["source"].as_str(),
            Some("/tmp/x")
        );

        let final_config = store
            .get_config(reg.pipeline.id, ConfigType::Final)
            .unwrap()
            .unwrap();
        assert!(final_config.config_data.contains("/tmp/x"));
        assert!(Path::new(&final_config.file_path).exists());

        let logs = store.get_logs(reg.pipeline.id).unwrap();
        assert_eq!(logs.last().unwrap().text, "Pipeline completed successfully");
        assert!(logs.iter().any(|l| l.text == "produced"));
    }

    #[test]
    fn test_missing_field_stops_pipeline() {
        let fx = fixture(
            ExecutorRegistry::new()
                .with("step0", produce)
                .with_default(echo_inputs),
        );
        let reg = chained("missing");
        fx.engine.store().register_pipeline(&reg).unwrap();

        let outcome = fx.engine.start(reg.pipeline.id, &CancelToken::new()).unwrap();
        match outcome {
            RunOutcome::Failed { step, kind, .. } => {
                assert_eq!(step.as_deref(), Some("step1"));
                assert_eq!(kind, FailureKind::MissingResultField);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let steps = fx.engine.store().get_steps(reg.pipeline.id).unwrap();
        assert_eq!(steps[0].status, RunStatus::Completed);
        assert_eq!(steps[1].status, RunStatus::Failed);
        assert!(steps[1].start_time.is_none());
        assert_eq!(steps[2].status, RunStatus::Pending);
        assert_eq!(
            fx.engine.store().get_pipeline(reg.pipeline.id).unwrap().status,
            RunStatus::Failed
        );
    }

    #[test]
    fn test_executor_failure_keeps_partial_output() {
        let fx = fixture(ExecutorRegistry::new().with_default(broken));
        let reg = registration("broken", 2);
        fx.engine.store().register_pipeline(&reg).unwrap();

        let outcome = fx.engine.start(reg.pipeline.id, &CancelToken::new()).unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Failed { kind: FailureKind::ExecutorError, .. }
        ));

        let store = fx.engine.store();
        let steps = store.get_steps(reg.pipeline.id).unwrap();
        assert_eq!(steps[0].status, RunStatus::Failed);
        assert_eq!(steps[0].result_field("partial").and_then(Value::as_str), Some("yes"));
        assert_eq!(steps[1].status, RunStatus::Pending);

        let step_logs: Vec<String> = store
            .get_step_logs(steps[0].id)
            .unwrap()
            .into_iter()
            .map(|l| l.text)
            .collect();
        assert!(step_logs.contains(&"stderr: boom".to_string()));
        assert!(step_logs
            .last()
            .unwrap()
            .starts_with("[ExecutorError] Step step0 failed"));
    }

    #[test]
    fn test_unregistered_step_fails() {
        let fx = fixture(ExecutorRegistry::new());
        let reg = registration("unknown", 1);
        fx.engine.store().register_pipeline(&reg).unwrap();

        let outcome = fx.engine.start(reg.pipeline.id, &CancelToken::new()).unwrap();
        match outcome {
            RunOutcome::Failed { kind, reason, .. } => {
                assert_eq!(kind, FailureKind::ExecutorError);
                assert!(reason.contains("no executor registered"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_empty_pipeline_is_configuration_error() {
        let fx = fixture(ExecutorRegistry::new());
        let reg = registration("empty", 0);
        fx.engine.store().register_pipeline(&reg).unwrap();

        let outcome = fx.engine.start(reg.pipeline.id, &CancelToken::new()).unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Failed { kind: FailureKind::ConfigurationError, .. }
        ));
    }

    #[test]
    fn test_start_requires_pending() {
        let fx = fixture(ExecutorRegistry::new().with_default(produce));
        let reg = registration("twice", 1);
        fx.engine.store().register_pipeline(&reg).unwrap();

        fx.engine.start(reg.pipeline.id, &CancelToken::new()).unwrap();
        let err = fx.engine.start(reg.pipeline.id, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));

        let err = fx.engine.resume(reg.pipeline.id, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
    }

    #[test]
    fn test_cancel_pending_pipeline() {
        let fx = fixture(ExecutorRegistry::new().with_default(produce));
        let reg = registration("cancel-me", 2);
        fx.engine.store().register_pipeline(&reg).unwrap();

        let token = CancelToken::new();
        assert_eq!(fx.engine.cancel(reg.pipeline.id, &token).unwrap(), RunStatus::Failed);
        assert!(token.is_cancelled());

        let logs = fx.engine.store().get_logs(reg.pipeline.id).unwrap();
        assert!(logs.last().unwrap().text.starts_with("[Cancelled]"));
        assert!(fx
            .engine
            .store()
            .get_steps(reg.pipeline.id)
            .unwrap()
            .iter()
            .all(|s| s.status == RunStatus::Pending));

        let err = fx.engine.cancel(reg.pipeline.id, &token).unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
    }

    #[test]
    fn test_cancel_during_step_leaves_next_pending() {
        let fx = fixture(ExecutorRegistry::new().with_default(wait_for_cancel));
        let reg = registration("cancel-running", 2);
        fx.engine.store().register_pipeline(&reg).unwrap();

        let token = CancelToken::new();
        let remote = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            remote.cancel();
        });

        let outcome = fx.engine.start(reg.pipeline.id, &token).unwrap();
        canceller.join().unwrap();

        assert!(matches!(
            outcome,
            RunOutcome::Failed { kind: FailureKind::Cancelled, .. }
        ));
        let steps = fx.engine.store().get_steps(reg.pipeline.id).unwrap();
        assert_eq!(steps[0].status, RunStatus::Failed);
        assert_eq!(steps[1].status, RunStatus::Pending);
    }

    #[test]
    fn test_deadline_exceeded() {
        let mut fx = fixture(ExecutorRegistry::new().with_default(wait_for_cancel));
        fx.engine.set_step_timeout(Some(Duration::from_millis(100)));
        fx.engine.set_cancel_grace(Duration::from_secs(5));
        let reg = registration("slow", 1);
        fx.engine.store().register_pipeline(&reg).unwrap();

        let outcome = fx.engine.start(reg.pipeline.id, &CancelToken::new()).unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Failed { kind: FailureKind::DeadlineExceeded, .. }
        ));
        let steps = fx.engine.store().get_steps(reg.pipeline.id).unwrap();
        assert_eq!(steps[0].status, RunStatus::Failed);
    }

    #[test]
    fn test_overdue_step_is_waited_for() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let stubborn = move |_: &ValueMap, _: &ValueMap, _: &StepContext| -> Result<StepOutput, StepFailure> {
            // Ignores its cancel token.
            thread::sleep(Duration::from_millis(600));
            flag.store(true, Ordering::SeqCst);
            Ok(StepOutput::default())
        };

        let mut fx = fixture(ExecutorRegistry::new().with_default(stubborn));
        fx.engine.set_step_timeout(Some(Duration::from_millis(100)));
        fx.engine.set_cancel_grace(Duration::ZERO);
        let reg = registration("stubborn", 2);
        fx.engine.store().register_pipeline(&reg).unwrap();

        let outcome = fx.engine.start(reg.pipeline.id, &CancelToken::new()).unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Failed { kind: FailureKind::DeadlineExceeded, .. }
        ));
        assert!(finished.load(Ordering::SeqCst));
        assert!(fx.engine.abandoned.lock().is_empty());

        let steps = fx.engine.store().get_steps(reg.pipeline.id).unwrap();
        assert_eq!(steps[0].status, RunStatus::Failed);
        assert_eq!(steps[1].status, RunStatus::Pending);
    }

    #[test]
    fn test_locked_database_leaves_step_running_until_resume() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("runs.db");
        let store = Arc::new(Store::open(&db_path).unwrap());
        store.set_busy_timeout(Duration::from_millis(50)).unwrap();

        // The first run takes a write lock from another connection while the
        // step is executing, so its completion cannot be committed.
        let lock: Arc<Mutex<Option<rusqlite::Connection>>> = Arc::new(Mutex::new(None));
        let holder = lock.clone();
        let locked_once = Arc::new(AtomicBool::new(false));
        let locking = move |_: &ValueMap, _: &ValueMap, _: &StepContext| -> Result<StepOutput, StepFailure> {
            if !locked_once.swap(true, Ordering::SeqCst) {
                let conn = rusqlite::Connection::open(&db_path).unwrap();
                conn.execute_batch("BEGIN EXCLUSIVE").unwrap();
                *holder.lock() = Some(conn);
            }
            Ok(output("output_path", "/tmp/x"))
        };

        let registry = Arc::new(ExecutorRegistry::new().with_default(locking));
        let mut engine = Engine::new(store.clone(), registry, OutputLayout::new(dir.path().join("out")));
        engine.set_retry_policy(RetryPolicy::new(3, Duration::from_millis(10)));

        let reg = registration("locked", 2);
        store.register_pipeline(&reg).unwrap();

        let err = engine.start(reg.pipeline.id, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, EngineError::Persistence(ref e) if e.is_transient()));

        // Release the lock; the last durable state is still `running`.
        lock.lock().take();
        assert_eq!(store.get_step(reg.steps[0].id).unwrap().status, RunStatus::Running);
        assert_eq!(store.get_pipeline(reg.pipeline.id).unwrap().status, RunStatus::Running);

        let outcome = engine.resume(reg.pipeline.id, &CancelToken::new()).unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert!(store
            .get_steps(reg.pipeline.id)
            .unwrap()
            .iter()
            .all(|s| s.status == RunStatus::Completed));
    }

    #[test]
    fn test_resume_skips_completed_and_reruns_stale() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let counting = move |_: &ValueMap, _: &ValueMap, _: &StepContext| -> Result<StepOutput, StepFailure> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(output("output_path", "/tmp/y"))
        };

        let fx = fixture(ExecutorRegistry::new().with_default(counting));
        let reg = registration("interrupted", 3);
        let store = fx.engine.store();
        store.register_pipeline(&reg).unwrap();

        // Simulate a crash: step0 done, step1 left running.
        store
            .update_pipeline_status(reg.pipeline.id, RunStatus::Running, None)
            .unwrap();
        store.mark_step_running(reg.steps[0].id, &ValueMap::new()).unwrap();
        store
            .finish_step(
                reg.steps[0].id,
                &StepCompletion {
                    status: RunStatus::Completed,
                    results: Some(output("output_path", "/tmp/x").results),
                    logs: Vec::new(),
                },
            )
            .unwrap();
        store.mark_step_running(reg.steps[1].id, &ValueMap::new()).unwrap();

        let outcome = fx.engine.resume(reg.pipeline.id, &CancelToken::new()).unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let steps = store.get_steps(reg.pipeline.id).unwrap();
        assert_eq!(steps[0].result_field("output_path").and_then(Value::as_str), Some("/tmp/x"));
        assert!(steps.iter().all(|s| s.status == RunStatus::Completed));
    }

    #[test]
    fn test_resume_finalizes_recorded_step_failure() {
        let fx = fixture(ExecutorRegistry::new().with_default(produce));
        let reg = registration("half-failed", 2);
        let store = fx.engine.store();
        store.register_pipeline(&reg).unwrap();

        store
            .update_pipeline_status(reg.pipeline.id, RunStatus::Running, None)
            .unwrap();
        store.mark_step_running(reg.steps[0].id, &ValueMap::new()).unwrap();
        store
            .finish_step(
                reg.steps[0].id,
                &StepCompletion {
                    status: RunStatus::Failed,
                    results: None,
                    logs: vec![FailureKind::ExecutorError.log_entry("Step step0 failed: boom")],
                },
            )
            .unwrap();

        let outcome = fx.engine.resume(reg.pipeline.id, &CancelToken::new()).unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Failed { kind: FailureKind::ExecutorError, .. }
        ));
        let steps = store.get_steps(reg.pipeline.id).unwrap();
        assert_eq!(steps[1].status, RunStatus::Pending);
    }

    #[test]
    fn test_execute_single_step() {
        let fx = fixture(ExecutorRegistry::new().with_default(produce));
        let reg = registration("manual", 2);
        let store = fx.engine.store();
        store.register_pipeline(&reg).unwrap();

        let err = fx
            .engine
            .execute_step(reg.steps[0].id, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));

        store
            .update_pipeline_status(reg.pipeline.id, RunStatus::Running, None)
            .unwrap();
        let outcome = fx
            .engine
            .execute_step(reg.steps[0].id, &CancelToken::new())
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Completed(_)));
        assert_eq!(store.get_step(reg.steps[1].id).unwrap().status, RunStatus::Pending);

        let err = fx
            .engine
            .execute_step(reg.steps[0].id, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::StepNotPending { .. }));
    }
}
