//! Append-only log sink.
//!
//! Entries are never updated or deleted except by the pipeline cascade.
//! Reads are ordered by creation time, with insertion order breaking ties.

use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::pipeline::model::now;
use crate::pipeline::PipelineLog;

use super::pipeline_ops::fetch_pipeline;
use super::{col_dt, col_opt_uuid, col_uuid, fmt_dt, Result, Store};

const LOG_COLUMNS: &str = "id, pipeline_id, step_id, text, created_at";

impl Store {
    /// Appends a log entry. `step_id == None` records a pipeline-level entry.
    pub fn append_log(
        &self,
        pipeline_id: Uuid,
        step_id: Option<Uuid>,
        text: &str,
    ) -> Result<PipelineLog> {
        self.with_transaction(|tx| {
            fetch_pipeline(tx, pipeline_id)?;
            insert_log(tx, pipeline_id, step_id, text)
        })
    }

    /// All entries of a pipeline, pipeline-level and step-level, oldest first.
    pub fn get_logs(&self, pipeline_id: Uuid) -> Result<Vec<PipelineLog>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pipeline_logs WHERE pipeline_id = ?1
             ORDER BY created_at ASC, rowid ASC",
            LOG_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![pipeline_id.to_string()], row_to_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Entries of one step, oldest first.
    pub fn get_step_logs(&self, step_id: Uuid) -> Result<Vec<PipelineLog>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pipeline_logs WHERE step_id = ?1
             ORDER BY created_at ASC, rowid ASC",
            LOG_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![step_id.to_string()], row_to_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

pub(super) fn insert_log(
    conn: &Connection,
    pipeline_id: Uuid,
    step_id: Option<Uuid>,
    text: &str,
) -> Result<PipelineLog> {
    let entry = PipelineLog {
        id: Uuid::new_v4(),
        pipeline_id,
        step_id,
        text: text.to_string(),
        created_at: now(),
    };
    conn.execute(
        &format!(
            "INSERT INTO pipeline_logs ({}) VALUES (?1, ?2, ?3, ?4, ?5)",
            LOG_COLUMNS
        ),
        params![
            entry.id.to_string(),
            pipeline_id.to_string(),
            step_id.map(|id| id.to_string()),
            entry.text,
            fmt_dt(&entry.created_at),
        ],
    )?;
    Ok(entry)
}

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<PipelineLog> {
    Ok(PipelineLog {
        id: col_uuid(row, 0)?,
        pipeline_id: col_uuid(row, 1)?,
        step_id: col_opt_uuid(row, 2)?,
        text: row.get(3)?,
        created_at: col_dt(row, 4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::registration;
    use crate::store::StoreError;

    #[test]
    fn test_logs_union_in_order() {
        let store = Store::open_in_memory().unwrap();
        let reg = registration("circ", 2);
        let id = reg.pipeline.id;
        store.register_pipeline(&reg).unwrap();

        store.append_log(id, Some(reg.steps[0].id), "a").unwrap();
        store.append_log(id, None, "b").unwrap();
        store.append_log(id, Some(reg.steps[1].id), "c").unwrap();
        store.append_log(id, Some(reg.steps[0].id), "d").unwrap();

        let all: Vec<_> = store
            .get_logs(id)
            .unwrap()
            .into_iter()
            .map(|l| l.text)
            .collect();
        assert_eq!(
            all,
            vec!["Pipeline circ registered successfully", "a", "b", "c", "d"]
        );

        let logs = store.get_logs(id).unwrap();
        assert!(logs.windows(2).all(|w| w[0].created_at <= w[1].created_at));

        let first_step: Vec<_> = store
            .get_step_logs(reg.steps[0].id)
            .unwrap()
            .into_iter()
            .map(|l| l.text)
            .collect();
        assert_eq!(first_step, vec!["a", "d"]);
    }

    #[test]
    fn test_append_to_missing_pipeline() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.append_log(Uuid::new_v4(), None, "orphan"),
            Err(StoreError::NotFound { .. })
        ));
    }
}
