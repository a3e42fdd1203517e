//! Pipeline Data Model
//!
//! Entities persisted by the engine and the submission request that creates
//! them.
//!
//! # Example Submission Format
//!
//! ```yaml
//! name: circrna-annotation
//! user_id: 6f0d3c1e-8a9b-4a57-9d3e-0c3f4d1f2a11
//! resources:
//!   - 1b4e28ba-2fa1-11d2-883f-0016d3cca427
//! steps:
//!   - name: BWAAligner
//!     requires_input_file: true
//!     parameters:
//!       threads: 8
//!     input_mapping:
//!       genome: { resource: 1b4e28ba-2fa1-11d2-883f-0016d3cca427 }
//!       reads: { reads: SRR1234567 }
//!
//!   - name: CIRI2Processor
//!     requires_input_file: true
//!     input_mapping:
//!       sam_directory: BWAAligner
//!       annotation: { step: 0, field: gtf_path }
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::value::ValueMap;

/// Current time at the microsecond precision timestamps are stored with.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Lifecycle status shared by pipelines and steps.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    /// Returns the database/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    /// Returns true for `completed` and `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Valid transitions: `pending -> running | failed`,
    /// `running -> completed | failed`. Terminal states have no exits.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

/// One full execution run of an ordered sequence of steps.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub id: Uuid,
    pub name: String,
    pub user_id: Uuid,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

/// Reference to an earlier step, by declared position or by name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum StepRef {
    Index(usize),
    Name(String),
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepRef::Index(i) => write!(f, "#{}", i),
            StepRef::Name(name) => f.write_str(name),
        }
    }
}

/// Where a step's required input comes from.
///
/// A bare step reference (`sam_directory: BWAAligner`) is shorthand for the
/// result field named like the input key.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum InputSource {
    /// An uploaded reference file in the catalog.
    Resource { resource: Uuid },
    /// A registered sequencing-read set, by accession.
    Reads { reads: String },
    /// A result field of a strictly earlier step.
    StepOutput {
        step: StepRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
    Shorthand(StepRef),
}

impl InputSource {
    /// Creates a reference to `field` of an earlier step.
    pub fn step_output(step: StepRef, field: impl Into<String>) -> Self {
        InputSource::StepOutput {
            step,
            field: Some(field.into()),
        }
    }

    /// Returns the referenced step and result field, if this is a step
    /// reference. `input_key` names the field when the mapping omits it.
    pub fn step_reference<'a>(&'a self, input_key: &'a str) -> Option<(&'a StepRef, &'a str)> {
        match self {
            InputSource::StepOutput { step, field } => {
                Some((step, field.as_deref().unwrap_or(input_key)))
            }
            InputSource::Shorthand(step) => Some((step, input_key)),
            _ => None,
        }
    }
}

/// Declaration of every required input of a step, keyed by input name.
pub type InputMapping = std::collections::BTreeMap<String, InputSource>;

/// A single unit of work within a pipeline.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PipelineStep {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    /// Zero-based declared position; the execution order.
    pub position: usize,
    pub name: String,
    pub parameters: ValueMap,
    pub requires_input_file: bool,
    /// Inputs as resolved when the step was started.
    pub input_files: Option<ValueMap>,
    pub status: RunStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub results: Option<ValueMap>,
    pub input_mapping: InputMapping,
}

impl PipelineStep {
    /// Looks up a field of this step's persisted result payload.
    pub fn result_field(&self, field: &str) -> Option<&super::value::Value> {
        self.results.as_ref().and_then(|r| r.get(field))
    }
}

/// Kind of uploaded reference file.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceType {
    Genome,
    Annotation,
    Peptide,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Genome => "GENOME",
            ResourceType::Annotation => "ANNOTATION",
            ResourceType::Peptide => "PEPTIDE",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GENOME" => Ok(ResourceType::Genome),
            "ANNOTATION" => Ok(ResourceType::Annotation),
            "PEPTIDE" => Ok(ResourceType::Peptide),
            other => Err(format!(
                "unknown resource type '{}' (expected GENOME, ANNOTATION or PEPTIDE)",
                other
            )),
        }
    }
}

/// An uploaded reference file (genome, annotation, peptide).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Resource {
    pub id: Uuid,
    pub name: String,
    pub resource_type: ResourceType,
    pub species: Option<String>,
    pub version: Option<String>,
    pub file_path: String,
    /// Size in MB.
    pub file_size: Option<i64>,
    pub uploaded_by: Uuid,
    pub date_added: DateTime<Utc>,
}

impl Resource {
    /// Creates a resource record with a fresh identifier.
    pub fn new(
        name: impl Into<String>,
        resource_type: ResourceType,
        file_path: impl Into<String>,
        uploaded_by: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            resource_type,
            species: None,
            version: None,
            file_path: file_path.into(),
            file_size: None,
            uploaded_by,
            date_added: now(),
        }
    }

    pub fn with_species(mut self, species: impl Into<String>) -> Self {
        self.species = Some(species.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_file_size(mut self, size_mb: i64) -> Self {
        self.file_size = Some(size_mb);
        self
    }
}

/// Download state of a sequencing-read set.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReadStatus {
    Registered,
    Downloaded,
    Failed,
}

impl ReadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadStatus::Registered => "registered",
            ReadStatus::Downloaded => "downloaded",
            ReadStatus::Failed => "failed",
        }
    }
}

impl FromStr for ReadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registered" => Ok(ReadStatus::Registered),
            "downloaded" => Ok(ReadStatus::Downloaded),
            "failed" => Ok(ReadStatus::Failed),
            other => Err(format!("unknown read status '{}'", other)),
        }
    }
}

/// A registered sequencing-read set (SRA run).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReadResource {
    pub id: Uuid,
    pub srr_id: String,
    pub bioproject_id: String,
    pub description: String,
    pub file_path: String,
    pub file_size: i64,
    pub status: ReadStatus,
    pub date_added: DateTime<Utc>,
}

impl ReadResource {
    pub fn new(
        srr_id: impl Into<String>,
        bioproject_id: impl Into<String>,
        file_path: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            srr_id: srr_id.into(),
            bioproject_id: bioproject_id.into(),
            description: "No description provided".to_string(),
            file_path: file_path.into(),
            file_size: 0,
            status: ReadStatus::Registered,
            date_added: now(),
        }
    }

    pub fn with_status(mut self, status: ReadStatus) -> Self {
        self.status = status;
        self
    }
}

/// Snapshot kind of a pipeline configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    Initial,
    Final,
}

impl ConfigType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigType::Initial => "initial",
            ConfigType::Final => "final",
        }
    }
}

impl FromStr for ConfigType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(ConfigType::Initial),
            "final" => Ok(ConfigType::Final),
            other => Err(format!("unknown config type '{}'", other)),
        }
    }
}

/// A materialized configuration snapshot.
///
/// `config_data` holds the JSON document text exactly as written to
/// `file_path`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub config_type: ConfigType,
    pub config_data: String,
    pub file_path: String,
    pub date_added: DateTime<Utc>,
}

/// An append-only log entry. `step_id == None` marks a pipeline-level entry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PipelineLog {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub step_id: Option<Uuid>,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Declaration of one step in a submission.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepDefinition {
    pub name: String,

    #[serde(default)]
    pub parameters: ValueMap,

    #[serde(default)]
    pub requires_input_file: bool,

    #[serde(default)]
    pub input_mapping: InputMapping,
}

impl StepDefinition {
    /// Creates a step definition with no parameters or inputs.
    ///
    /// # Example
    ///
    /// ```
    /// use circrunner::pipeline::{InputSource, StepDefinition, StepRef};
    ///
    /// let step = StepDefinition::new("CIRI2Processor")
    ///     .with_parameter("threads", 4i64)
    ///     .with_input(
    ///         "sam_directory",
    ///         InputSource::step_output(StepRef::Name("BWAAligner".into()), "sam_directory"),
    ///     );
    /// assert!(step.requires_input_file);
    /// ```
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            parameters: ValueMap::new(),
            requires_input_file: false,
            input_mapping: InputMapping::new(),
        }
    }

    pub fn with_parameter(
        mut self,
        key: impl Into<String>,
        value: impl Into<super::value::Value>,
    ) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Declares a required input; marks the step as requiring input files.
    pub fn with_input(mut self, key: impl Into<String>, source: InputSource) -> Self {
        self.input_mapping.insert(key.into(), source);
        self.requires_input_file = true;
        self
    }
}

/// A pipeline submission: ordered step definitions plus resources to bind.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PipelineRequest {
    pub name: String,
    pub user_id: Uuid,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    #[serde(default)]
    pub steps: Vec<StepDefinition>,

    /// Resource identifiers to bind to the run.
    #[serde(default)]
    pub resources: Vec<Uuid>,

    /// Caller-supplied path for the initial configuration snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
}

impl PipelineRequest {
    pub fn new(name: impl Into<String>, user_id: Uuid) -> Self {
        Self {
            name: name.into(),
            user_id,
            notes: None,
            steps: Vec::new(),
            resources: Vec::new(),
            config_path: None,
        }
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_resource(mut self, resource_id: Uuid) -> Self {
        self.resources.push(resource_id);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}
