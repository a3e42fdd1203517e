//! Fixtures shared by the store's unit tests.

use std::time::Duration;

use uuid::Uuid;

use crate::pipeline::model::now;
use crate::pipeline::{InputMapping, Pipeline, PipelineStep, RunStatus, Value, ValueMap};

use super::{Registration, Result, Store};

pub(crate) fn pending_pipeline(name: &str, user_id: Uuid) -> Pipeline {
    Pipeline {
        id: Uuid::new_v4(),
        name: name.to_string(),
        user_id,
        status: RunStatus::Pending,
        created_at: now(),
        start_time: None,
        end_time: None,
        notes: None,
    }
}

pub(crate) fn pending_step(pipeline_id: Uuid, position: usize) -> PipelineStep {
    let mut parameters = ValueMap::new();
    parameters.insert("threads".into(), Value::from(4i64));

    PipelineStep {
        id: Uuid::new_v4(),
        pipeline_id,
        position,
        name: format!("step{}", position),
        parameters,
        requires_input_file: false,
        input_files: None,
        status: RunStatus::Pending,
        start_time: None,
        end_time: None,
        results: None,
        input_mapping: InputMapping::new(),
    }
}

/// A pending pipeline with `steps` pending steps and its registration log.
pub(crate) fn registration(name: &str, steps: usize) -> Registration {
    let pipeline = pending_pipeline(name, Uuid::new_v4());
    let steps = (0..steps).map(|i| pending_step(pipeline.id, i)).collect();

    Registration {
        log: format!("Pipeline {} registered successfully", name),
        pipeline,
        steps,
        resources: Vec::new(),
        initial_config: None,
    }
}

impl Store {
    /// Shortens how long a write waits on a database locked elsewhere.
    pub(crate) fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn().busy_timeout(timeout)?;
        Ok(())
    }
}
