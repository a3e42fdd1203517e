//! Pipeline Definition Module
//!
//! Provides the data model for pipelines and their steps, along with
//! loading and validation of submissions.
//!
//! # Structure
//!
//! - [`value`]: Dynamic parameter/result values
//! - [`model`]: Core entities (Pipeline, PipelineStep, Resource, ...)
//! - [`chain`]: The step dependency relation
//! - [`parser`]: YAML/JSON loading
//! - [`validator`]: Submission checks

pub mod chain;
pub mod model;
pub mod parser;
pub mod validator;
pub mod value;

pub use chain::{ChainError, DependencyChain, DependencyEdge};
pub use model::{
    ConfigType, InputMapping, InputSource, Pipeline, PipelineConfig, PipelineLog,
    PipelineRequest, PipelineStep, ReadResource, ReadStatus, Resource, ResourceType, RunStatus,
    StepDefinition, StepRef,
};
pub use parser::{load_request, parse_request, save_request};
pub use validator::{validate_request, ValidationError};
pub use value::{Value, ValueMap};
