//! Step Executor Contract
//!
//! An executor performs one step's actual computation. The engine treats it
//! as a black box: it hands over parameters and resolved inputs and gets back
//! either a result map with log text or a failure.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::ValueMap;

/// Cooperative stop signal shared between a caller and a running step.
///
/// Executors should poll [`CancelToken::is_cancelled`] and return promptly,
/// finishing any write already in progress.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What an executor sees besides its parameters and inputs.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub pipeline_id: Uuid,
    pub step_id: Uuid,
    pub step_name: String,
    /// The pipeline's run directory, shared by all of its steps.
    pub working_dir: PathBuf,
    pub cancel: CancelToken,
    /// How long a cancelled step may take to wind down before it is forced.
    pub cancel_grace: Duration,
}

/// Successful step output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    pub results: ValueMap,
    pub log_text: String,
}

impl StepOutput {
    pub fn new(results: ValueMap) -> Self {
        Self {
            results,
            log_text: String::new(),
        }
    }

    pub fn with_log(mut self, log_text: impl Into<String>) -> Self {
        self.log_text = log_text.into();
        self
    }
}

/// Executor-reported failure. Whatever the executor produced before failing
/// is kept and persisted with the failed step.
#[derive(Debug, Clone, Default, PartialEq, Error)]
#[error("{message}")]
pub struct StepFailure {
    pub message: String,
    pub results: Option<ValueMap>,
    pub log_text: String,
    /// Set when the executor stopped because it was cancelled.
    pub aborted: bool,
}

impl StepFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// A failure caused by honouring a cancellation request.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self {
            aborted: true,
            ..Self::new(message)
        }
    }

    pub fn with_results(mut self, results: ValueMap) -> Self {
        self.results = Some(results);
        self
    }

    pub fn with_log(mut self, log_text: impl Into<String>) -> Self {
        self.log_text = log_text.into();
        self
    }
}

/// Runs one step. Implementations may block for the whole tool invocation.
pub trait StepExecutor: Send + Sync {
    fn execute(
        &self,
        parameters: &ValueMap,
        inputs: &ValueMap,
        ctx: &StepContext,
    ) -> Result<StepOutput, StepFailure>;
}

impl<F> StepExecutor for F
where
    F: Fn(&ValueMap, &ValueMap, &StepContext) -> Result<StepOutput, StepFailure> + Send + Sync,
{
    fn execute(
        &self,
        parameters: &ValueMap,
        inputs: &ValueMap,
        ctx: &StepContext,
    ) -> Result<StepOutput, StepFailure> {
        self(parameters, inputs, ctx)
    }
}

/// Maps step names to executors, with an optional fallback.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
    default: Option<Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the executor for steps named `name`.
    pub fn register(&mut self, name: impl Into<String>, executor: impl StepExecutor + 'static) {
        self.executors.insert(name.into(), Arc::new(executor));
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, name: impl Into<String>, executor: impl StepExecutor + 'static) -> Self {
        self.register(name, executor);
        self
    }

    /// Sets the executor used for steps without a named registration.
    pub fn set_default(&mut self, executor: impl StepExecutor + 'static) {
        self.default = Some(Arc::new(executor));
    }

    pub fn with_default(mut self, executor: impl StepExecutor + 'static) -> Self {
        self.set_default(executor);
        self
    }

    /// The executor for a step name, falling back to the default.
    pub fn get(&self, name: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors
            .get(name)
            .cloned()
            .or_else(|| self.default.clone())
    }

    /// Registered step names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.names())
            .field("default", &self.default.is_some())
            .finish()
    }
}
