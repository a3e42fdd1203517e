//! Resource Catalog
//!
//! Read-only view of uploaded reference files and registered read sets.
//! The engine only looks resources up by identifier; listings exist for
//! display.

use uuid::Uuid;

use crate::pipeline::{ReadResource, ReadStatus, Resource};
use crate::store::{ResourceFilter, Store, StoreError};

/// Lookup interface the engine resolves resource inputs against.
pub trait ResourceCatalog: Send + Sync {
    /// Returns the resource, or `None` if no such resource exists.
    fn get_resource(&self, id: Uuid) -> Result<Option<Resource>, StoreError>;

    /// Returns a usable read set by accession. Read sets whose download
    /// failed are treated as absent.
    fn get_read_resource(&self, srr_id: &str) -> Result<Option<ReadResource>, StoreError>;

    /// Lists resources by type and/or species.
    fn list_resources(&self, filter: &ResourceFilter) -> Result<Vec<Resource>, StoreError>;
}

impl ResourceCatalog for Store {
    fn get_resource(&self, id: Uuid) -> Result<Option<Resource>, StoreError> {
        self.resource(id)
    }

    fn get_read_resource(&self, srr_id: &str) -> Result<Option<ReadResource>, StoreError> {
        Ok(self
            .read_resource(srr_id)?
            .filter(|reads| reads.status != ReadStatus::Failed))
    }

    fn list_resources(&self, filter: &ResourceFilter) -> Result<Vec<Resource>, StoreError> {
        self.resources(filter)
    }
}
