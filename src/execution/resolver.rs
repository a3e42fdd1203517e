//! Step Input Resolution
//!
//! Turns a step's input mapping into concrete values before the step runs.
//! Resolution is all-or-nothing: the first unresolvable input fails the
//! whole step and the executor never sees a partial input map.

use log::debug;
use thiserror::Error;
use uuid::Uuid;

use crate::catalog::ResourceCatalog;
use crate::error::FailureKind;
use crate::pipeline::{ChainError, DependencyChain, InputSource, PipelineStep, RunStatus, Value, ValueMap};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("input '{input}' references resource {resource}, which does not exist")]
    MissingResource { input: String, resource: Uuid },

    #[error("input '{input}' references read set '{accession}', which is not available")]
    MissingReadResource { input: String, accession: String },

    #[error("input '{input}' depends on step '{step}', which is {status}")]
    UnresolvedDependency {
        input: String,
        step: String,
        status: RunStatus,
    },

    #[error("input '{input}': step '{step}' produced no result field '{field}'")]
    MissingResultField {
        input: String,
        step: String,
        field: String,
    },

    #[error("{0}")]
    InvalidReference(#[from] ChainError),

    #[error("catalog lookup failed: {0}")]
    Catalog(#[from] StoreError),
}

impl ResolveError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ResolveError::MissingResource { .. } | ResolveError::MissingReadResource { .. } => {
                FailureKind::MissingResource
            }
            ResolveError::UnresolvedDependency { .. } => FailureKind::UnresolvedDependency,
            ResolveError::MissingResultField { .. } => FailureKind::MissingResultField,
            ResolveError::InvalidReference(_) => FailureKind::ConfigurationError,
            ResolveError::Catalog(_) => FailureKind::PersistenceError,
        }
    }
}

/// Resolves every input of `step` against the catalog and the persisted
/// state of earlier steps in `steps` (the whole pipeline, in order).
///
/// Reads only; calling it twice on unchanged state yields the same map.
pub fn resolve_inputs(
    step: &PipelineStep,
    steps: &[PipelineStep],
    catalog: &dyn ResourceCatalog,
) -> Result<ValueMap, ResolveError> {
    let chain = DependencyChain::build(
        steps
            .iter()
            .map(|s| (s.name.as_str(), &s.input_mapping)),
    )?;

    let mut resolved = ValueMap::new();

    for (input, source) in &step.input_mapping {
        let value = match source {
            InputSource::Resource { resource } => {
                let found = catalog.get_resource(*resource)?.ok_or_else(|| {
                    ResolveError::MissingResource {
                        input: input.clone(),
                        resource: *resource,
                    }
                })?;
                Value::from(found.file_path)
            }
            InputSource::Reads { reads } => {
                let found = catalog.get_read_resource(reads)?.ok_or_else(|| {
                    ResolveError::MissingReadResource {
                        input: input.clone(),
                        accession: reads.clone(),
                    }
                })?;
                Value::from(found.file_path)
            }
            InputSource::StepOutput { .. } | InputSource::Shorthand(_) => {
                let Some((step_ref, field)) = source.step_reference(input) else {
                    continue;
                };
                let position = chain.position_of(step.position, input, step_ref)?;
                let producer = &steps[position];

                if producer.status != RunStatus::Completed {
                    return Err(ResolveError::UnresolvedDependency {
                        input: input.clone(),
                        step: producer.name.clone(),
                        status: producer.status,
                    });
                }

                producer
                    .result_field(field)
                    .cloned()
                    .ok_or_else(|| ResolveError::MissingResultField {
                        input: input.clone(),
                        step: producer.name.clone(),
                        field: field.to_string(),
                    })?
            }
        };

        debug!("Step '{}' input '{}' = {}", step.name, input, value);
        resolved.insert(input.clone(), value);
    }

    Ok(resolved)
}
