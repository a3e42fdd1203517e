//! Pipeline records, resource bindings and status transitions.

use log::debug;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::pipeline::model::now;
use crate::pipeline::{Pipeline, PipelineConfig, PipelineStep, Resource, RunStatus};

use super::config_ops::insert_config;
use super::log_ops::insert_log;
use super::resource_ops::{row_to_resource, RESOURCE_COLUMNS};
use super::step_ops::insert_step;
use super::{col_dt, col_opt_dt, col_parse, col_uuid, fmt_dt, fmt_opt_dt, Result, Store, StoreError};

const PIPELINE_COLUMNS: &str = "id, name, user_id, status, created_at, start_time, end_time, notes";

/// Everything written when a pipeline is registered, committed as one unit.
#[derive(Debug, Clone)]
pub struct Registration {
    pub pipeline: Pipeline,
    pub steps: Vec<PipelineStep>,
    pub resources: Vec<Uuid>,
    pub initial_config: Option<PipelineConfig>,
    /// Pipeline-level log entry recorded with the registration.
    pub log: String,
}

impl Store {
    /// Persists a new pipeline with its steps, bindings, initial snapshot and
    /// registration log entry.
    pub fn register_pipeline(&self, registration: &Registration) -> Result<()> {
        let pipeline = &registration.pipeline;

        self.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO pipelines (id, name, user_id, status, created_at, start_time, end_time, notes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    pipeline.id.to_string(),
                    pipeline.name,
                    pipeline.user_id.to_string(),
                    pipeline.status.as_str(),
                    fmt_dt(&pipeline.created_at),
                    fmt_opt_dt(&pipeline.start_time),
                    fmt_opt_dt(&pipeline.end_time),
                    pipeline.notes,
                ],
            )?;

            for step in &registration.steps {
                insert_step(tx, step)?;
            }

            for resource_id in &registration.resources {
                bind_resource(tx, pipeline.id, *resource_id)?;
            }

            if let Some(config) = &registration.initial_config {
                insert_config(tx, config)?;
            }

            insert_log(tx, pipeline.id, None, &registration.log)?;
            Ok(())
        })?;

        debug!(
            "Registered pipeline {} ({} steps, {} resources)",
            pipeline.id,
            registration.steps.len(),
            registration.resources.len()
        );
        Ok(())
    }

    pub fn get_pipeline(&self, id: Uuid) -> Result<Pipeline> {
        fetch_pipeline(&self.conn(), id)
    }

    /// Lists pipelines newest first, optionally restricted to one owner.
    pub fn list_pipelines(&self, user_id: Option<Uuid>) -> Result<Vec<Pipeline>> {
        let conn = self.conn();
        let rows = match user_id {
            Some(user) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM pipelines WHERE user_id = ?1
                     ORDER BY created_at DESC, rowid DESC",
                    PIPELINE_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![user.to_string()], row_to_pipeline)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM pipelines ORDER BY created_at DESC, rowid DESC",
                    PIPELINE_COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], row_to_pipeline)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(rows)
    }

    /// Lists pipelines in one status, oldest first (queue order).
    pub fn list_pipelines_by_status(&self, status: RunStatus) -> Result<Vec<Pipeline>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pipelines WHERE status = ?1 ORDER BY created_at ASC, rowid ASC",
            PIPELINE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![status.as_str()], row_to_pipeline)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Moves a pipeline to `next`, stamping start/end times, and appends
    /// `note` as a pipeline-level log entry in the same transaction.
    pub fn update_pipeline_status(
        &self,
        id: Uuid,
        next: RunStatus,
        note: Option<&str>,
    ) -> Result<Pipeline> {
        self.with_transaction(|tx| transition_pipeline(tx, id, next, note))
    }

    /// Records the final config snapshot and marks the pipeline completed.
    pub fn complete_pipeline(
        &self,
        id: Uuid,
        final_config: &PipelineConfig,
        note: &str,
    ) -> Result<Pipeline> {
        self.with_transaction(|tx| {
            insert_config(tx, final_config)?;
            transition_pipeline(tx, id, RunStatus::Completed, Some(note))
        })
    }

    /// Deletes a pipeline; steps, bindings, configs and logs cascade.
    pub fn delete_pipeline(&self, id: Uuid) -> Result<()> {
        let affected = self
            .conn()
            .execute("DELETE FROM pipelines WHERE id = ?1", params![id.to_string()])?;
        if affected == 0 {
            return Err(StoreError::not_found("pipeline", id));
        }
        debug!("Deleted pipeline {}", id);
        Ok(())
    }

    /// Resources bound to a pipeline.
    pub fn pipeline_resources(&self, id: Uuid) -> Result<Vec<Resource>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM resources
             JOIN pipeline_resources ON pipeline_resources.resource_id = resources.id
             WHERE pipeline_resources.pipeline_id = ?1
             ORDER BY name",
            RESOURCE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![id.to_string()], row_to_resource)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn bind_resource(conn: &Connection, pipeline_id: Uuid, resource_id: Uuid) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM resources WHERE id = ?1)",
        params![resource_id.to_string()],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(StoreError::not_found("resource", resource_id));
    }
    conn.execute(
        "INSERT OR IGNORE INTO pipeline_resources (pipeline_id, resource_id) VALUES (?1, ?2)",
        params![pipeline_id.to_string(), resource_id.to_string()],
    )?;
    Ok(())
}

pub(super) fn fetch_pipeline(conn: &Connection, id: Uuid) -> Result<Pipeline> {
    conn.query_row(
        &format!("SELECT {} FROM pipelines WHERE id = ?1", PIPELINE_COLUMNS),
        params![id.to_string()],
        row_to_pipeline,
    )
    .optional()?
    .ok_or_else(|| StoreError::not_found("pipeline", id))
}

fn transition_pipeline(
    conn: &Connection,
    id: Uuid,
    next: RunStatus,
    note: Option<&str>,
) -> Result<Pipeline> {
    let mut pipeline = fetch_pipeline(conn, id)?;
    if !pipeline.status.can_transition_to(next) {
        return Err(StoreError::InvalidTransition {
            entity: "pipeline",
            id,
            from: pipeline.status,
            to: next,
        });
    }

    let at = now();
    match next {
        RunStatus::Running => pipeline.start_time = Some(at),
        RunStatus::Completed | RunStatus::Failed => pipeline.end_time = Some(at),
        RunStatus::Pending => {}
    }
    pipeline.status = next;

    conn.execute(
        "UPDATE pipelines SET status = ?2, start_time = ?3, end_time = ?4 WHERE id = ?1",
        params![
            id.to_string(),
            next.as_str(),
            fmt_opt_dt(&pipeline.start_time),
            fmt_opt_dt(&pipeline.end_time),
        ],
    )?;

    if let Some(text) = note {
        insert_log(conn, id, None, text)?;
    }

    Ok(pipeline)
}

fn row_to_pipeline(row: &Row<'_>) -> rusqlite::Result<Pipeline> {
    Ok(Pipeline {
        id: col_uuid(row, 0)?,
        name: row.get(1)?,
        user_id: col_uuid(row, 2)?,
        status: col_parse(row, 3)?,
        created_at: col_dt(row, 4)?,
        start_time: col_opt_dt(row, 5)?,
        end_time: col_opt_dt(row, 6)?,
        notes: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ResourceType, ValueMap};
    use crate::store::test_support::{pending_pipeline, registration};

    #[test]
    fn test_register_and_get() {
        let store = Store::open_in_memory().unwrap();
        let reg = registration("circ", 2);
        store.register_pipeline(&reg).unwrap();

        let loaded = store.get_pipeline(reg.pipeline.id).unwrap();
        assert_eq!(loaded, reg.pipeline);
        assert_eq!(store.get_steps(reg.pipeline.id).unwrap().len(), 2);

        let logs = store.get_logs(reg.pipeline.id).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].text, "Pipeline circ registered successfully");
        assert!(logs[0].step_id.is_none());
    }

    #[test]
    fn test_get_missing_pipeline() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.get_pipeline(Uuid::new_v4()),
            Err(StoreError::NotFound { entity: "pipeline", .. })
        ));
    }

    #[test]
    fn test_unknown_resource_rolls_back_registration() {
        let store = Store::open_in_memory().unwrap();
        let mut reg = registration("circ", 1);
        reg.resources.push(Uuid::new_v4());

        let err = store.register_pipeline(&reg).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "resource", .. }));
        assert!(store.list_pipelines(None).unwrap().is_empty());
    }

    #[test]
    fn test_bound_resources() {
        let store = Store::open_in_memory().unwrap();
        let user = Uuid::new_v4();
        let genome = Resource::new("hg38", ResourceType::Genome, "/ref/hg38.fa", user);
        store.add_resource(&genome).unwrap();

        let mut reg = registration("circ", 1);
        reg.resources = vec![genome.id, genome.id];
        store.register_pipeline(&reg).unwrap();

        let bound = store.pipeline_resources(reg.pipeline.id).unwrap();
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].id, genome.id);
    }

    #[test]
    fn test_status_transitions_stamp_times() {
        let store = Store::open_in_memory().unwrap();
        let reg = registration("circ", 1);
        let id = reg.pipeline.id;
        store.register_pipeline(&reg).unwrap();

        let running = store
            .update_pipeline_status(id, RunStatus::Running, Some("Pipeline started"))
            .unwrap();
        assert!(running.start_time.is_some());
        assert!(running.end_time.is_none());

        let failed = store
            .update_pipeline_status(id, RunStatus::Failed, Some("[ExecutorError] boom"))
            .unwrap();
        assert!(failed.end_time.unwrap() >= failed.start_time.unwrap());
        assert_eq!(store.get_pipeline(id).unwrap(), failed);
        assert_eq!(store.get_logs(id).unwrap().len(), 3);
    }

    #[test]
    fn test_terminal_status_is_final() {
        let store = Store::open_in_memory().unwrap();
        let reg = registration("circ", 1);
        let id = reg.pipeline.id;
        store.register_pipeline(&reg).unwrap();
        store
            .update_pipeline_status(id, RunStatus::Failed, None)
            .unwrap();

        for next in [RunStatus::Running, RunStatus::Completed, RunStatus::Failed] {
            let err = store.update_pipeline_status(id, next, Some("x")).unwrap_err();
            assert!(matches!(err, StoreError::InvalidTransition { .. }));
        }
        // Rejected transitions leave no log entry behind.
        assert_eq!(store.get_logs(id).unwrap().len(), 1);
    }

    #[test]
    fn test_list_by_user_newest_first() {
        let store = Store::open_in_memory().unwrap();
        let user = Uuid::new_v4();

        let mut first = pending_pipeline("first", user);
        first.created_at = now() - chrono::Duration::seconds(10);
        let second = pending_pipeline("second", user);
        let other = pending_pipeline("other", Uuid::new_v4());

        for pipeline in [&first, &second, &other] {
            store
                .register_pipeline(&Registration {
                    pipeline: pipeline.clone(),
                    steps: Vec::new(),
                    resources: Vec::new(),
                    initial_config: None,
                    log: "registered".into(),
                })
                .unwrap();
        }

        let names: Vec<_> = store
            .list_pipelines(Some(user))
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["second", "first"]);
        assert_eq!(store.list_pipelines(None).unwrap().len(), 3);

        let pending: Vec<_> = store
            .list_pipelines_by_status(RunStatus::Pending)
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(pending[0], "first");
    }

    #[test]
    fn test_delete_cascades() {
        let store = Store::open_in_memory().unwrap();
        let reg = registration("circ", 2);
        let id = reg.pipeline.id;
        store.register_pipeline(&reg).unwrap();

        let step_id = reg.steps[0].id;
        store.mark_step_running(step_id, &ValueMap::new()).unwrap();
        store.append_log(id, Some(step_id), "tool output").unwrap();

        store.delete_pipeline(id).unwrap();
        assert!(store.get_pipeline(id).is_err());
        assert!(store.get_steps(id).unwrap().is_empty());
        assert!(store.get_logs(id).unwrap().is_empty());
        assert!(matches!(
            store.delete_pipeline(id),
            Err(StoreError::NotFound { .. })
        ));
    }
}
