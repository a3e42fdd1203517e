//! Status query results.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::FailureKind;
use crate::pipeline::{Pipeline, PipelineLog, PipelineStep, RunStatus};

/// Why a pipeline cannot make further progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockedReason {
    pub kind: FailureKind,
    pub message: String,
}

/// Per-step view in a status report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepStatus {
    pub id: Uuid,
    pub position: usize,
    pub name: String,
    pub status: RunStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl From<&PipelineStep> for StepStatus {
    fn from(step: &PipelineStep) -> Self {
        Self {
            id: step.id,
            position: step.position,
            name: step.name.clone(),
            status: step.status,
            start_time: step.start_time,
            end_time: step.end_time,
        }
    }
}

/// The last committed state of a pipeline and its steps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub pipeline: Pipeline,
    pub steps: Vec<StepStatus>,
    /// Set once the pipeline has failed.
    pub blocked: Option<BlockedReason>,
}

impl PipelineStatus {
    /// Builds a report from persisted rows. The blocking reason is the most
    /// recent `[Kind]` entry among the pipeline-level logs.
    pub fn build(pipeline: Pipeline, steps: &[PipelineStep], logs: &[PipelineLog]) -> Self {
        let blocked = if pipeline.status == RunStatus::Failed {
            let recorded = logs
                .iter()
                .rev()
                .filter(|log| log.step_id.is_none())
                .find_map(|log| FailureKind::parse_log_entry(&log.text));

            Some(match recorded {
                Some((kind, message)) => BlockedReason {
                    kind,
                    message: message.to_string(),
                },
                None => BlockedReason {
                    kind: FailureKind::ExecutorError,
                    message: "no failure reason was recorded".to_string(),
                },
            })
        } else {
            None
        };

        Self {
            steps: steps.iter().map(StepStatus::from).collect(),
            pipeline,
            blocked,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }

    /// The step currently marked `running`, if any.
    pub fn current_step(&self) -> Option<&StepStatus> {
        self.steps.iter().find(|s| s.status == RunStatus::Running)
    }

    /// `(completed steps, total steps)`.
    pub fn progress(&self) -> (usize, usize) {
        let done = self
            .steps
            .iter()
            .filter(|s| s.status == RunStatus::Completed)
            .count();
        (done, self.steps.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::model::now;
    use crate::store::test_support::{pending_pipeline, pending_step};

    fn log(pipeline_id: Uuid, step_id: Option<Uuid>, text: &str) -> PipelineLog {
        PipelineLog {
            id: Uuid::new_v4(),
            pipeline_id,
            step_id,
            text: text.to_string(),
            created_at: now(),
        }
    }

    #[test]
    fn test_running_pipeline_not_blocked() {
        let mut pipeline = pending_pipeline("p", Uuid::new_v4());
        pipeline.status = RunStatus::Running;
        let mut steps = vec![pending_step(pipeline.id, 0), pending_step(pipeline.id, 1)];
        steps[0].status = RunStatus::Completed;
        steps[1].status = RunStatus::Running;

        let status = PipelineStatus::build(pipeline, &steps, &[]);
        assert!(!status.is_blocked());
        assert_eq!(status.progress(), (1, 2));
        assert_eq!(status.current_step().unwrap().name, "step1");
    }

    #[test]
    fn test_failed_pipeline_reports_last_pipeline_reason() {
        let mut pipeline = pending_pipeline("p", Uuid::new_v4());
        pipeline.status = RunStatus::Failed;
        let step = pending_step(pipeline.id, 0);

        let logs = vec![
            log(pipeline.id, None, "Pipeline started"),
            log(pipeline.id, Some(step.id), "[ExecutorError] Step step0 failed: boom"),
            log(
                pipeline.id,
                None,
                "[MissingResultField] Pipeline failed: step step0 failed: no field",
            ),
        ];

        let status = PipelineStatus::build(pipeline, &[step], &logs);
        let blocked = status.blocked.unwrap();
        assert_eq!(blocked.kind, FailureKind::MissingResultField);
        assert!(blocked.message.starts_with("Pipeline failed"));
    }

    #[test]
    fn test_failed_without_recorded_reason() {
        let mut pipeline = pending_pipeline("p", Uuid::new_v4());
        pipeline.status = RunStatus::Failed;

        let status = PipelineStatus::build(pipeline, &[], &[]);
        assert_eq!(status.blocked.unwrap().kind, FailureKind::ExecutorError);
    }
}
