//! Uploaded reference files and registered sequencing-read sets.

use log::info;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::pipeline::{ReadResource, ReadStatus, Resource, ResourceType};

use super::{col_dt, col_parse, col_uuid, fmt_dt, Result, Store, StoreError};

pub(super) const RESOURCE_COLUMNS: &str =
    "id, name, resource_type, species, version, file_path, file_size, uploaded_by, date_added";

const READ_COLUMNS: &str =
    "id, srr_id, bioproject_id, description, file_path, file_size, status, date_added";

/// Listing filter for the catalog; `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceFilter {
    pub resource_type: Option<ResourceType>,
    pub species: Option<String>,
}

impl ResourceFilter {
    pub fn of_type(resource_type: ResourceType) -> Self {
        Self {
            resource_type: Some(resource_type),
            species: None,
        }
    }

    pub fn with_species(mut self, species: impl Into<String>) -> Self {
        self.species = Some(species.into());
        self
    }
}

impl Store {
    pub fn add_resource(&self, resource: &Resource) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO resources ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                RESOURCE_COLUMNS
            ),
            params![
                resource.id.to_string(),
                resource.name,
                resource.resource_type.as_str(),
                resource.species,
                resource.version,
                resource.file_path,
                resource.file_size,
                resource.uploaded_by.to_string(),
                fmt_dt(&resource.date_added),
            ],
        )?;
        info!(
            "Resource {} ({}) added: {}",
            resource.name, resource.resource_type, resource.id
        );
        Ok(())
    }

    pub fn resource(&self, id: Uuid) -> Result<Option<Resource>> {
        let resource = self
            .conn()
            .query_row(
                &format!("SELECT {} FROM resources WHERE id = ?1", RESOURCE_COLUMNS),
                params![id.to_string()],
                row_to_resource,
            )
            .optional()?;
        Ok(resource)
    }

    /// Lists resources by type and/or species, ordered by name.
    pub fn resources(&self, filter: &ResourceFilter) -> Result<Vec<Resource>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM resources
             WHERE (?1 IS NULL OR resource_type = ?1)
               AND (?2 IS NULL OR species = ?2)
             ORDER BY name, date_added",
            RESOURCE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(
                params![
                    filter.resource_type.map(|t| t.as_str()),
                    filter.species.as_deref(),
                ],
                row_to_resource,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Replaces the file behind a resource. The identifier, name and type
    /// stay the same.
    pub fn replace_resource(
        &self,
        id: Uuid,
        file_path: &str,
        file_size: Option<i64>,
        version: Option<&str>,
    ) -> Result<Resource> {
        let affected = self.conn().execute(
            "UPDATE resources
             SET file_path = ?2, file_size = ?3, version = COALESCE(?4, version)
             WHERE id = ?1",
            params![id.to_string(), file_path, file_size, version],
        )?;
        if affected == 0 {
            return Err(StoreError::not_found("resource", id));
        }
        info!("Resource {} replaced with {}", id, file_path);
        self.resource(id)?
            .ok_or_else(|| StoreError::not_found("resource", id))
    }

    pub fn add_read_resource(&self, reads: &ReadResource) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO read_resources ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                READ_COLUMNS
            ),
            params![
                reads.id.to_string(),
                reads.srr_id,
                reads.bioproject_id,
                reads.description,
                reads.file_path,
                reads.file_size,
                reads.status.as_str(),
                fmt_dt(&reads.date_added),
            ],
        )?;
        Ok(())
    }

    /// Looks up a read set by SRR accession.
    pub fn read_resource(&self, srr_id: &str) -> Result<Option<ReadResource>> {
        let reads = self
            .conn()
            .query_row(
                &format!("SELECT {} FROM read_resources WHERE srr_id = ?1", READ_COLUMNS),
                params![srr_id],
                row_to_read_resource,
            )
            .optional()?;
        Ok(reads)
    }

    pub fn set_read_status(&self, srr_id: &str, status: ReadStatus) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE read_resources SET status = ?2 WHERE srr_id = ?1",
            params![srr_id, status.as_str()],
        )?;
        if affected == 0 {
            return Err(StoreError::not_found("read resource", srr_id));
        }
        Ok(())
    }
}

pub(super) fn row_to_resource(row: &Row<'_>) -> rusqlite::Result<Resource> {
    Ok(Resource {
        id: col_uuid(row, 0)?,
        name: row.get(1)?,
        resource_type: col_parse(row, 2)?,
        species: row.get(3)?,
        version: row.get(4)?,
        file_path: row.get(5)?,
        file_size: row.get(6)?,
        uploaded_by: col_uuid(row, 7)?,
        date_added: col_dt(row, 8)?,
    })
}

fn row_to_read_resource(row: &Row<'_>) -> rusqlite::Result<ReadResource> {
    Ok(ReadResource {
        id: col_uuid(row, 0)?,
        srr_id: row.get(1)?,
        bioproject_id: row.get(2)?,
        description: row.get(3)?,
        file_path: row.get(4)?,
        file_size: row.get(5)?,
        status: col_parse(row, 6)?,
        date_added: col_dt(row, 7)?,
    })
}
