//! Pipeline Orchestrator
//!
//! Accepts submissions, persists them and queues them for a bounded pool of
//! background workers (one worker by default, so at most one step runs at a
//! time across all pipelines). Jobs are taken from the queue first-in,
//! first-out. A per-pipeline lease keeps a pipeline from being run by two
//! workers at once when the pool is larger than one.

pub mod status;
pub mod worker;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{ConfigError, EngineConfig};
use crate::error::FailureKind;
use crate::execution::{CancelToken, Engine, EngineError, ExecutorRegistry};
use crate::layout::write_snapshot;
use crate::pipeline::model::now;
use crate::pipeline::validator::describe;
use crate::pipeline::{
    validate_request, ConfigType, Pipeline, PipelineConfig, PipelineLog, PipelineRequest,
    PipelineStep, RunStatus,
};
use crate::store::{Registration, RetryPolicy, Store, StoreError};

pub use status::{BlockedReason, PipelineStatus, StepStatus};
pub use worker::Job;

use worker::Worker;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("resource {0} does not exist")]
    UnknownResource(Uuid),

    #[error("config snapshot path {} is already in use", .0.display())]
    ConfigPathTaken(PathBuf),

    #[error("failed to write config snapshot {}: {source}", path.display())]
    Snapshot { path: PathBuf, source: io::Error },

    #[error("pipeline {0} is being run and cannot be deleted")]
    Busy(Uuid),

    #[error("the run queue is closed")]
    QueueClosed,

    #[error("failed to start worker: {0}")]
    Worker(io::Error),

    #[error("failed to serialize request: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub id: Uuid,
    /// `pending`, or `failed` for a request with configuration errors.
    pub status: RunStatus,
}

/// State shared between the orchestrator handle and its workers.
pub(crate) struct Shared {
    pub(crate) engine: Engine,
    retry: RetryPolicy,
    tokens: Mutex<HashMap<Uuid, CancelToken>>,
    leases: Mutex<HashSet<Uuid>>,
    outstanding: Mutex<usize>,
    idle: Condvar,
}

impl Shared {
    /// The cancel token for a pipeline, created on first use.
    pub(crate) fn token(&self, id: Uuid) -> CancelToken {
        self.tokens.lock().entry(id).or_default().clone()
    }

    pub(crate) fn acquire_lease(&self, id: Uuid) -> bool {
        self.leases.lock().insert(id)
    }

    pub(crate) fn release_lease(&self, id: Uuid) {
        self.leases.lock().remove(&id);
        self.tokens.lock().remove(&id);
    }

    fn is_leased(&self, id: Uuid) -> bool {
        self.leases.lock().contains(&id)
    }

    fn job_queued(&self) {
        *self.outstanding.lock() += 1;
    }

    pub(crate) fn job_done(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }
}

/// Submission front end and worker pool.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use circrunner::config::EngineConfig;
/// use circrunner::execution::{CommandExecutor, ExecutorRegistry};
/// use circrunner::orchestrator::Orchestrator;
/// use circrunner::pipeline::load_request;
/// use circrunner::store::Store;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = EngineConfig::default();
///     let store = Arc::new(Store::open(&config.database_path)?);
///     let registry = ExecutorRegistry::new().with_default(CommandExecutor::new());
///     let orchestrator = Orchestrator::new(store, Arc::new(registry), &config)?;
///
///     let submission = orchestrator.submit(&load_request("pipeline.yaml")?)?;
///     orchestrator.wait_idle();
///     println!("{:?}", orchestrator.status(submission.id)?.pipeline.status);
///     Ok(())
/// }
/// ```
pub struct Orchestrator {
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Vec<Worker>,
}

impl Orchestrator {
    /// Builds the engine from `config` and starts `worker_pool_size` workers.
    pub fn new(
        store: Arc<Store>,
        registry: Arc<ExecutorRegistry>,
        config: &EngineConfig,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let engine = Engine::from_config(store, registry, config);
        Self::with_engine(engine, RetryPolicy::from(config), config.worker_pool_size)
    }

    /// Starts `workers` workers around an already configured engine.
    pub fn with_engine(
        engine: Engine,
        retry: RetryPolicy,
        workers: usize,
    ) -> Result<Self, OrchestratorError> {
        let shared = Arc::new(Shared {
            engine,
            retry,
            tokens: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashSet::new()),
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
        });

        let (sender, receiver) = channel();
        let queue = Arc::new(Mutex::new(receiver));

        let count = workers.max(1);
        let workers = (0..count)
            .map(|id| Worker::spawn(id, Arc::clone(&queue), Arc::clone(&shared)))
            .collect::<io::Result<Vec<_>>>()
            .map_err(OrchestratorError::Worker)?;

        info!("Started {} worker(s)", count);
        Ok(Self {
            shared,
            sender: Mutex::new(Some(sender)),
            workers,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        self.shared.engine.store()
    }

    /// Persists a request without queueing it.
    ///
    /// Unknown resources reject the request with nothing persisted. A request
    /// with configuration errors is persisted with zero steps and
    /// immediately marked `failed`.
    pub fn register(&self, request: &PipelineRequest) -> Result<Submission, OrchestratorError> {
        for resource_id in &request.resources {
            if self.store().resource(*resource_id)?.is_none() {
                return Err(OrchestratorError::UnknownResource(*resource_id));
            }
        }

        let pipeline = Pipeline {
            id: Uuid::new_v4(),
            name: request.name.trim().to_string(),
            user_id: request.user_id,
            status: RunStatus::Pending,
            created_at: now(),
            start_time: None,
            end_time: None,
            notes: request.notes.clone(),
        };
        let id = pipeline.id;
        let log = format!("Pipeline {} registered successfully", pipeline.name);

        if let Err(errors) = validate_request(request) {
            let reason = describe(&errors).replace('\n', "; ");
            let registration = Registration {
                pipeline,
                steps: Vec::new(),
                resources: request.resources.clone(),
                initial_config: None,
                log,
            };
            self.persist("register pipeline", || {
                self.store().register_pipeline(&registration)
            })?;

            let note = FailureKind::ConfigurationError.log_entry(format!("Pipeline failed: {}", reason));
            self.persist("fail pipeline", || {
                self.store()
                    .update_pipeline_status(id, RunStatus::Failed, Some(&note))
            })?;

            warn!("Pipeline {} rejected: {}", id, reason);
            return Ok(Submission {
                id,
                status: RunStatus::Failed,
            });
        }

        let steps: Vec<PipelineStep> = request
            .steps
            .iter()
            .enumerate()
            .map(|(position, def)| PipelineStep {
                id: Uuid::new_v4(),
                pipeline_id: id,
                position,
                name: def.name.trim().to_string(),
                parameters: def.parameters.clone(),
                requires_input_file: def.requires_input_file,
                input_files: None,
                status: RunStatus::Pending,
                start_time: None,
                end_time: None,
                results: None,
                input_mapping: def.input_mapping.clone(),
            })
            .collect();

        let initial_config = self.write_initial_config(&pipeline, request)?;
        let config_path = PathBuf::from(&initial_config.file_path);
        let registration = Registration {
            pipeline,
            steps,
            resources: request.resources.clone(),
            initial_config: Some(initial_config),
            log,
        };

        if let Err(e) = self.persist("register pipeline", || {
            self.store().register_pipeline(&registration)
        }) {
            if let Err(cleanup) = fs::remove_file(&config_path) {
                debug!("Could not remove {}: {}", config_path.display(), cleanup);
            }
            return Err(e);
        }

        info!(
            "Registered pipeline '{}' ({}) with {} steps",
            registration.pipeline.name,
            id,
            registration.steps.len()
        );
        Ok(Submission {
            id,
            status: RunStatus::Pending,
        })
    }

    /// Persists a request and queues it to start. Returns immediately.
    pub fn submit(&self, request: &PipelineRequest) -> Result<Submission, OrchestratorError> {
        let submission = self.register(request)?;
        if submission.status == RunStatus::Pending {
            self.enqueue(Job::Start(submission.id))?;
        }
        Ok(submission)
    }

    /// Appends a job to the run queue.
    pub fn enqueue(&self, job: Job) -> Result<(), OrchestratorError> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(OrchestratorError::QueueClosed)?;

        self.shared.token(job.pipeline_id());
        self.shared.job_queued();
        if sender.send(job).is_err() {
            self.shared.job_done();
            return Err(OrchestratorError::QueueClosed);
        }
        debug!("Queued {:?}", job);
        Ok(())
    }

    /// Queues every interrupted (`running`) pipeline for resumption, then
    /// every `pending` one, oldest first. Returns the number queued.
    pub fn recover(&self) -> Result<usize, OrchestratorError> {
        let interrupted = self.store().list_pipelines_by_status(RunStatus::Running)?;
        let pending = self.store().list_pipelines_by_status(RunStatus::Pending)?;

        let mut resumed = 0;
        for pipeline in &interrupted {
            // Running here, not interrupted.
            if self.shared.is_leased(pipeline.id) {
                continue;
            }
            warn!("Pipeline {} was interrupted; queueing resume", pipeline.id);
            self.enqueue(Job::Resume(pipeline.id))?;
            resumed += 1;
        }
        for pipeline in &pending {
            self.enqueue(Job::Start(pipeline.id))?;
        }

        let queued = resumed + pending.len();
        if queued > 0 {
            info!(
                "Recovered {} interrupted and {} pending pipeline(s)",
                resumed,
                pending.len()
            );
        }
        Ok(queued)
    }

    /// Cancels a pending or running pipeline. Returns its status after the
    /// request; a running pipeline fails once its current step returns.
    pub fn cancel(&self, id: Uuid) -> Result<RunStatus, OrchestratorError> {
        let token = self.shared.token(id);
        let status = self.shared.engine.cancel(id, &token);
        if !self.shared.is_leased(id) {
            self.shared.tokens.lock().remove(&id);
        }
        Ok(status?)
    }

    /// Pipeline status, per-step status and the blocking reason, if any.
    pub fn status(&self, id: Uuid) -> Result<PipelineStatus, OrchestratorError> {
        let pipeline = self.store().get_pipeline(id)?;
        let steps = self.store().get_steps(id)?;
        let logs = self.store().get_logs(id)?;
        Ok(PipelineStatus::build(pipeline, &steps, &logs))
    }

    /// All log entries of a pipeline, oldest first.
    pub fn logs(&self, id: Uuid) -> Result<Vec<PipelineLog>, OrchestratorError> {
        // Distinguish "no logs" from "no pipeline".
        self.store().get_pipeline(id)?;
        Ok(self.store().get_logs(id)?)
    }

    /// Log entries of one step, oldest first.
    pub fn step_logs(&self, step_id: Uuid) -> Result<Vec<PipelineLog>, OrchestratorError> {
        self.store().get_step(step_id)?;
        Ok(self.store().get_step_logs(step_id)?)
    }

    /// Lists pipelines, newest first.
    pub fn list(&self, user_id: Option<Uuid>) -> Result<Vec<Pipeline>, OrchestratorError> {
        Ok(self.store().list_pipelines(user_id)?)
    }

    /// Deletes a pipeline and everything it owns. Refused while a worker of
    /// this orchestrator is running it.
    pub fn delete(&self, id: Uuid) -> Result<(), OrchestratorError> {
        if self.shared.is_leased(id) {
            return Err(OrchestratorError::Busy(id));
        }
        self.store().delete_pipeline(id)?;
        info!("Deleted pipeline {}", id);
        Ok(())
    }

    /// Blocks until every queued job has been processed.
    pub fn wait_idle(&self) {
        let mut outstanding = self.shared.outstanding.lock();
        while *outstanding > 0 {
            self.shared.idle.wait(&mut outstanding);
        }
    }

    /// Closes the queue and waits for the workers to finish what was queued.
    pub fn shutdown(&mut self) {
        self.sender.lock().take();
        for worker in &mut self.workers {
            worker.join();
        }
        self.workers.clear();
    }

    fn write_initial_config(
        &self,
        pipeline: &Pipeline,
        request: &PipelineRequest,
    ) -> Result<PipelineConfig, OrchestratorError> {
        let json = serde_json::to_string_pretty(request)?;

        let path = match &request.config_path {
            Some(path) => {
                let path = PathBuf::from(path);
                if path.exists() {
                    return Err(OrchestratorError::ConfigPathTaken(path));
                }
                path
            }
            None => self
                .shared
                .engine
                .layout()
                .pipeline(pipeline.user_id, pipeline.id)
                .config_file(ConfigType::Initial),
        };

        write_snapshot(&path, &json).map_err(|source| OrchestratorError::Snapshot {
            path: path.clone(),
            source,
        })?;

        Ok(PipelineConfig {
            id: Uuid::new_v4(),
            pipeline_id: pipeline.id,
            config_type: ConfigType::Initial,
            config_data: json,
            file_path: path.to_string_lossy().into_owned(),
            date_added: now(),
        })
    }

    fn persist<T, F>(&self, what: &str, op: F) -> Result<T, OrchestratorError>
    where
        F: FnMut() -> Result<T, StoreError>,
    {
        Ok(self.shared.retry.run(what, op)?)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{StepContext, StepFailure, StepOutput};
    use crate::layout::OutputLayout;
    use crate::pipeline::{InputSource, Resource, ResourceType, StepDefinition, StepRef, Value, ValueMap};
    use tempfile::{tempdir, TempDir};

    fn produce(_: &ValueMap, _: &ValueMap, _: &StepContext) -> Result<StepOutput, StepFailure> {
        let mut results = ValueMap::new();
        results.insert("output_path".into(), Value::from("/tmp/x"));
        Ok(StepOutput::new(results))
    }

    fn orchestrator(dir: &TempDir) -> Orchestrator {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = ExecutorRegistry::new().with_default(produce);
        let engine = Engine::new(store, Arc::new(registry), OutputLayout::new(dir.path()));
        Orchestrator::with_engine(engine, RetryPolicy::none(), 1).unwrap()
    }

    fn request(steps: usize) -> PipelineRequest {
        (0..steps).fold(PipelineRequest::new("test", Uuid::new_v4()), |req, i| {
            req.with_step(StepDefinition::new(format!("step{}", i)))
        })
    }

    #[test]
    fn test_submit_runs_to_completion() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(&dir);

        let submission = orch.submit(&request(2)).unwrap();
        assert_eq!(submission.status, RunStatus::Pending);
        orch.wait_idle();

        let status = orch.status(submission.id).unwrap();
        assert_eq!(status.pipeline.status, RunStatus::Completed);
        assert_eq!(status.progress(), (2, 2));
        assert!(!status.is_blocked());

        let initial = orch
            .store()
            .get_config(submission.id, ConfigType::Initial)
            .unwrap()
            .unwrap();
        let on_disk = fs::read_to_string(&initial.file_path).unwrap();
        assert_eq!(on_disk, initial.config_data);

        let logs = orch.logs(submission.id).unwrap();
        assert_eq!(logs[0].text, "Pipeline test registered successfully");
    }

    #[test]
    fn test_invalid_request_fails_without_steps() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(&dir);

        let bad = PipelineRequest::new("bad", Uuid::new_v4()).with_step(
            StepDefinition::new("only")
                .with_input("x", InputSource::Shorthand(StepRef::Name("later".into()))),
        );
        let submission = orch.submit(&bad).unwrap();
        assert_eq!(submission.status, RunStatus::Failed);

        let status = orch.status(submission.id).unwrap();
        assert!(status.steps.is_empty());
        assert_eq!(
            status.blocked.unwrap().kind,
            FailureKind::ConfigurationError
        );
    }

    #[test]
    fn test_unknown_resource_persists_nothing() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(&dir);

        let err = orch
            .submit(&request(1).with_resource(Uuid::new_v4()))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownResource(_)));
        assert!(orch.list(None).unwrap().is_empty());
    }

    #[test]
    fn test_resources_are_bound() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(&dir);
        let genome = Resource::new("hg38", ResourceType::Genome, "/ref/hg38.fa", Uuid::new_v4());
        orch.store().add_resource(&genome).unwrap();

        let submission = orch.register(&request(1).with_resource(genome.id)).unwrap();
        let bound = orch.store().pipeline_resources(submission.id).unwrap();
        assert_eq!(bound, vec![genome]);
    }

    #[test]
    fn test_register_then_recover() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(&dir);

        let first = orch.register(&request(1)).unwrap();
        let second = orch.register(&request(1)).unwrap();
        assert_eq!(orch.recover().unwrap(), 2);
        orch.wait_idle();

        for id in [first.id, second.id] {
            assert_eq!(orch.status(id).unwrap().pipeline.status, RunStatus::Completed);
        }
        assert_eq!(orch.recover().unwrap(), 0);
    }

    #[test]
    fn test_cancel_and_delete_pending() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(&dir);

        let submission = orch.register(&request(1)).unwrap();
        assert_eq!(orch.cancel(submission.id).unwrap(), RunStatus::Failed);
        assert_eq!(
            orch.status(submission.id).unwrap().blocked.unwrap().kind,
            FailureKind::Cancelled
        );

        orch.delete(submission.id).unwrap();
        assert!(matches!(
            orch.status(submission.id).unwrap_err(),
            OrchestratorError::Store(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_caller_config_path_must_be_unused() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(&dir);
        let path = dir.path().join("mine.json");

        let mut req = request(1);
        req.config_path = Some(path.to_string_lossy().into_owned());
        orch.register(&req).unwrap();
        assert!(path.exists());

        let err = orch.register(&req).unwrap_err();
        assert!(matches!(err, OrchestratorError::ConfigPathTaken(_)));
    }

    #[test]
    fn test_enqueue_after_shutdown() {
        let dir = tempdir().unwrap();
        let mut orch = orchestrator(&dir);
        orch.shutdown();
        assert!(matches!(
            orch.enqueue(Job::Start(Uuid::new_v4())).unwrap_err(),
            OrchestratorError::QueueClosed
        ));
    }
}
