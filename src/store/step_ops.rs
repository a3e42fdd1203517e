//! Step records and step status transitions.

use log::debug;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::pipeline::model::now;
use crate::pipeline::{PipelineStep, RunStatus, ValueMap};

use super::log_ops::insert_log;
use super::{
    col_json, col_opt_dt, col_opt_json, col_parse, col_uuid, fmt_opt_dt, Result, Store,
    StoreError,
};

const STEP_COLUMNS: &str = "id, pipeline_id, position, name, parameters, requires_input_file, \
    input_files, status, start_time, end_time, results, input_mapping";

/// Terminal outcome of a step, written together with its log entries.
#[derive(Debug, Clone, PartialEq)]
pub struct StepCompletion {
    /// `Completed` or `Failed`.
    pub status: RunStatus,
    /// Result payload; `None` keeps whatever was stored before.
    pub results: Option<ValueMap>,
    /// Step-level log entries, appended in order.
    pub logs: Vec<String>,
}

impl Store {
    /// Steps of a pipeline in declared order.
    pub fn get_steps(&self, pipeline_id: Uuid) -> Result<Vec<PipelineStep>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pipeline_steps WHERE pipeline_id = ?1 ORDER BY position",
            STEP_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![pipeline_id.to_string()], row_to_step)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_step(&self, step_id: Uuid) -> Result<PipelineStep> {
        fetch_step(&self.conn(), step_id)
    }

    /// `pending -> running`: stamps the start time and records the inputs
    /// the step was started with.
    pub fn mark_step_running(&self, step_id: Uuid, inputs: &ValueMap) -> Result<PipelineStep> {
        self.with_transaction(|tx| {
            let mut step = fetch_step(tx, step_id)?;
            check_transition(&step, RunStatus::Running)?;

            step.status = RunStatus::Running;
            step.start_time = Some(now());
            step.input_files = Some(inputs.clone());

            tx.execute(
                "UPDATE pipeline_steps SET status = ?2, start_time = ?3, input_files = ?4
                 WHERE id = ?1",
                params![
                    step_id.to_string(),
                    step.status.as_str(),
                    fmt_opt_dt(&step.start_time),
                    serde_json::to_string(inputs)?,
                ],
            )?;
            insert_log(
                tx,
                step.pipeline_id,
                Some(step_id),
                &format!("Step {} started", step.name),
            )?;

            debug!("Step {} ({}) is running", step.name, step_id);
            Ok(step)
        })
    }

    /// Moves a step to its terminal status, stores its results and appends
    /// its log entries, all in one transaction.
    pub fn finish_step(&self, step_id: Uuid, completion: &StepCompletion) -> Result<PipelineStep> {
        self.with_transaction(|tx| {
            let mut step = fetch_step(tx, step_id)?;
            check_transition(&step, completion.status)?;

            step.status = completion.status;
            step.end_time = Some(now());
            if let Some(results) = &completion.results {
                step.results = Some(results.clone());
            }

            let results_json = step
                .results
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            tx.execute(
                "UPDATE pipeline_steps SET status = ?2, end_time = ?3, results = ?4 WHERE id = ?1",
                params![
                    step_id.to_string(),
                    step.status.as_str(),
                    fmt_opt_dt(&step.end_time),
                    results_json,
                ],
            )?;

            for text in &completion.logs {
                insert_log(tx, step.pipeline_id, Some(step_id), text)?;
            }

            debug!("Step {} ({}) is {}", step.name, step_id, step.status);
            Ok(step)
        })
    }

    /// Returns a step left `running` by an interrupted process to `pending`.
    ///
    /// This is the one move outside the transition table; it is only valid
    /// for recovery, before the step is re-executed.
    pub fn reset_stale_step(&self, step_id: Uuid, note: &str) -> Result<PipelineStep> {
        self.with_transaction(|tx| {
            let mut step = fetch_step(tx, step_id)?;
            if step.status != RunStatus::Running {
                return Err(StoreError::InvalidTransition {
                    entity: "step",
                    id: step_id,
                    from: step.status,
                    to: RunStatus::Pending,
                });
            }

            step.status = RunStatus::Pending;
            step.start_time = None;
            step.end_time = None;
            step.input_files = None;
            step.results = None;

            tx.execute(
                "UPDATE pipeline_steps
                 SET status = 'pending', start_time = NULL, end_time = NULL,
                     input_files = NULL, results = NULL
                 WHERE id = ?1",
                params![step_id.to_string()],
            )?;
            insert_log(tx, step.pipeline_id, Some(step_id), note)?;
            Ok(step)
        })
    }
}

fn check_transition(step: &PipelineStep, next: RunStatus) -> Result<()> {
    if step.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            entity: "step",
            id: step.id,
            from: step.status,
            to: next,
        })
    }
}

pub(super) fn insert_step(conn: &Connection, step: &PipelineStep) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO pipeline_steps ({})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            STEP_COLUMNS
        ),
        params![
            step.id.to_string(),
            step.pipeline_id.to_string(),
            step.position as i64,
            step.name,
            serde_json::to_string(&step.parameters)?,
            step.requires_input_file,
            step.input_files.as_ref().map(serde_json::to_string).transpose()?,
            step.status.as_str(),
            fmt_opt_dt(&step.start_time),
            fmt_opt_dt(&step.end_time),
            step.results.as_ref().map(serde_json::to_string).transpose()?,
            serde_json::to_string(&step.input_mapping)?,
        ],
    )?;
    Ok(())
}

fn fetch_step(conn: &Connection, step_id: Uuid) -> Result<PipelineStep> {
    conn.query_row(
        &format!("SELECT {} FROM pipeline_steps WHERE id = ?1", STEP_COLUMNS),
        params![step_id.to_string()],
        row_to_step,
    )
    .optional()?
    .ok_or_else(|| StoreError::not_found("step", step_id))
}

fn row_to_step(row: &Row<'_>) -> rusqlite::Result<PipelineStep> {
    Ok(PipelineStep {
        id: col_uuid(row, 0)?,
        pipeline_id: col_uuid(row, 1)?,
        position: row.get::<_, i64>(2)? as usize,
        name: row.get(3)?,
        parameters: col_json(row, 4)?,
        requires_input_file: row.get(5)?,
        input_files: col_opt_json(row, 6)?,
        status: col_parse(row, 7)?,
        start_time: col_opt_dt(row, 8)?,
        end_time: col_opt_dt(row, 9)?,
        results: col_opt_json(row, 10)?,
        input_mapping: col_json(row, 11)?,
    })
}
