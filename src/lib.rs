//! CircRunner - Pipeline Execution Engine for circRNA Analyses
//!
//! Tracks and executes multi-step analysis pipelines on behalf of users.
//! A pipeline is an ordered list of steps; each step's inputs come either
//! from the resource catalog or from result fields of earlier steps. Steps
//! run one at a time, and every status change, result and log line is
//! committed to SQLite so interrupted runs can be resumed.
//!
//! # Architecture
//!
//! - [`pipeline`]: Data model, submission parsing and validation
//! - [`store`]: Transactional SQLite persistence
//! - [`catalog`]: Resource lookup used for input resolution
//! - [`execution`]: State machine, input resolution and step executors
//! - [`orchestrator`]: Submission, run queue and worker pool
//! - [`monitoring`]: Run timelines
//! - [`config`]: Engine settings
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use circrunner::{load_request, CommandExecutor, EngineConfig, ExecutorRegistry, Orchestrator, Store};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::from_env()?;
//!     let store = Arc::new(Store::open(&config.database_path)?);
//!     let registry = ExecutorRegistry::new().with_default(CommandExecutor::new());
//!
//!     let orchestrator = Orchestrator::new(store, Arc::new(registry), &config)?;
//!     let submission = orchestrator.submit(&load_request("pipeline.yaml")?)?;
//!
//!     // Wait for the background worker
//!     orchestrator.wait_idle();
//!     println!("{}", orchestrator.status(submission.id)?.pipeline.status);
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod execution;
pub mod layout;
pub mod monitoring;
pub mod orchestrator;
pub mod pipeline;
pub mod store;

// Re-export commonly used types
pub use catalog::ResourceCatalog;
pub use config::EngineConfig;
pub use error::FailureKind;
pub use execution::{CancelToken, CommandExecutor, Engine, ExecutorRegistry, StepExecutor};
pub use orchestrator::{Orchestrator, PipelineStatus};
pub use pipeline::{load_request, PipelineRequest, RunStatus, StepDefinition};
pub use store::Store;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "CircRunner";
