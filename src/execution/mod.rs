//! Pipeline Execution Module
//!
//! Runs pipelines step by step against the persistent store.
//!
//! # Architecture
//!
//! - [`engine`]: Pipeline state machine (start, resume, cancel, single steps)
//! - [`resolver`]: Turns input mappings into concrete input values
//! - [`executor`]: The contract opaque step implementations fulfil
//! - [`step`]: Built-in executor that runs shell command templates

pub mod engine;
pub mod executor;
pub mod resolver;
pub mod step;

pub use engine::{Engine, EngineError, RunOutcome, StepOutcome};
pub use executor::{
    CancelToken, ExecutorRegistry, StepContext, StepExecutor, StepFailure, StepOutput,
};
pub use resolver::{resolve_inputs, ResolveError};
pub use step::CommandExecutor;
