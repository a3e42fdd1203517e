//! Configuration snapshots, one per type per pipeline.

use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::pipeline::{ConfigType, PipelineConfig};

use super::{col_dt, col_parse, col_uuid, fmt_dt, Result, Store};

const CONFIG_COLUMNS: &str = "id, pipeline_id, config_type, config_data, file_path, date_added";

impl Store {
    pub fn get_config(
        &self,
        pipeline_id: Uuid,
        config_type: ConfigType,
    ) -> Result<Option<PipelineConfig>> {
        let config = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {} FROM pipeline_configs WHERE pipeline_id = ?1 AND config_type = ?2",
                    CONFIG_COLUMNS
                ),
                params![pipeline_id.to_string(), config_type.as_str()],
                row_to_config,
            )
            .optional()?;
        Ok(config)
    }
}

/// Inserts a snapshot; a second snapshot of the same type is a constraint
/// violation.
pub(super) fn insert_config(conn: &Connection, config: &PipelineConfig) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO pipeline_configs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            CONFIG_COLUMNS
        ),
        params![
            config.id.to_string(),
            config.pipeline_id.to_string(),
            config.config_type.as_str(),
            config.config_data,
            config.file_path,
            fmt_dt(&config.date_added),
        ],
    )?;
    Ok(())
}

fn row_to_config(row: &Row<'_>) -> rusqlite::Result<PipelineConfig> {
    Ok(PipelineConfig {
        id: col_uuid(row, 0)?,
        pipeline_id: col_uuid(row, 1)?,
        config_type: col_parse(row, 2)?,
        config_data: row.get(3)?,
        file_path: row.get(4)?,
        date_added: col_dt(row, 5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::model::now;
    use crate::store::test_support::registration;

    fn snapshot(pipeline_id: Uuid, config_type: ConfigType, data: &str) -> PipelineConfig {
        PipelineConfig {
            id: Uuid::new_v4(),
            pipeline_id,
            config_type,
            config_data: data.to_string(),
            file_path: format!("/out/{}/{}_config.json", pipeline_id, config_type.as_str()),
            date_added: now(),
        }
    }

    #[test]
    fn test_initial_config_is_byte_identical() {
        let store = Store::open_in_memory().unwrap();
        let mut reg = registration("circ", 1);
        let data = "{\n  \"name\": \"circ\",\n  \"threads\": 8,\n  \"ratio\": 0.10\n}";
        reg.initial_config = Some(snapshot(reg.pipeline.id, ConfigType::Initial, data));
        store.register_pipeline(&reg).unwrap();

        let loaded = store
            .get_config(reg.pipeline.id, ConfigType::Initial)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.config_data.as_bytes(), data.as_bytes());
        assert_eq!(Some(loaded), reg.initial_config);
        assert!(store
            .get_config(reg.pipeline.id, ConfigType::Final)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_one_snapshot_per_type() {
        let store = Store::open_in_memory().unwrap();
        let reg = registration("circ", 1);
        store.register_pipeline(&reg).unwrap();

        let id = reg.pipeline.id;
        store
            .with_transaction(|tx| insert_config(tx, &snapshot(id, ConfigType::Initial, "{}")))
            .unwrap();

        let mut duplicate = snapshot(id, ConfigType::Initial, "{}");
        duplicate.file_path = "/elsewhere.json".into();
        assert!(store
            .with_transaction(|tx| insert_config(tx, &duplicate))
            .is_err());
    }
}
