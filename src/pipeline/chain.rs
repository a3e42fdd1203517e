//! Step Dependency Chain
//!
//! Steps run in declared order, and an input may only come from a strictly
//! earlier step. The dependency relation is therefore a path with labelled
//! edges: each edge says which result field of which earlier step feeds
//! which input of a later one.

use thiserror::Error;

use super::model::{InputMapping, StepRef};

/// An input-mapping reference that does not point at an earlier step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("step '{step}' input '{input}' references unknown step '{reference}'")]
    UnknownStep {
        step: String,
        input: String,
        reference: String,
    },

    #[error("step '{step}' input '{input}' references step '{reference}', which does not run before it")]
    NotEarlier {
        step: String,
        input: String,
        reference: String,
    },
}

/// "Input `input` of step `consumer` is result field `field` of step `producer`."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub consumer: usize,
    pub input: String,
    pub producer: usize,
    pub field: String,
}

/// The ordered steps of a pipeline and the named edges between them.
#[derive(Debug, Clone, Default)]
pub struct DependencyChain {
    step_names: Vec<String>,
    edges: Vec<DependencyEdge>,
}

impl DependencyChain {
    /// Builds the chain from `(step name, input mapping)` pairs in declared
    /// order. Every step reference must point at a strictly earlier step.
    pub fn build<'a, I>(steps: I) -> Result<Self, ChainError>
    where
        I: IntoIterator<Item = (&'a str, &'a InputMapping)>,
    {
        let mut chain = DependencyChain::default();
        let mut mappings = Vec::new();

        for (name, mapping) in steps {
            chain.step_names.push(name.to_string());
            mappings.push(mapping);
        }

        for (consumer, mapping) in mappings.into_iter().enumerate() {
            for (input, source) in mapping {
                let Some((step_ref, field)) = source.step_reference(input) else {
                    continue;
                };
                let producer = chain.position_of(consumer, input, step_ref)?;
                chain.edges.push(DependencyEdge {
                    consumer,
                    input: input.clone(),
                    producer,
                    field: field.to_string(),
                });
            }
        }

        Ok(chain)
    }

    /// Resolves a reference made by the step at `consumer` to a position.
    pub fn position_of(
        &self,
        consumer: usize,
        input: &str,
        step_ref: &StepRef,
    ) -> Result<usize, ChainError> {
        let consumer_name = self
            .step_names
            .get(consumer)
            .cloned()
            .unwrap_or_else(|| format!("#{}", consumer));

        let position = match step_ref {
            StepRef::Index(index) if *index < self.step_names.len() => *index,
            StepRef::Name(name) => self
                .step_names
                .iter()
                .position(|n| n == name)
                .ok_or_else(|| ChainError::UnknownStep {
                    step: consumer_name.clone(),
                    input: input.to_string(),
                    reference: name.clone(),
                })?,
            StepRef::Index(_) => {
                return Err(ChainError::UnknownStep {
                    step: consumer_name,
                    input: input.to_string(),
                    reference: step_ref.to_string(),
                })
            }
        };

        if position >= consumer {
            return Err(ChainError::NotEarlier {
                step: consumer_name,
                input: input.to_string(),
                reference: step_ref.to_string(),
            });
        }

        Ok(position)
    }

    /// All edges, ordered by consumer then input name.
    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.step_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.step_names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::model::InputSource;

    fn mapping(entries: &[(&str, InputSource)]) -> InputMapping {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_linear_chain_edges() {
        let first = InputMapping::new();
        let second = mapping(&[(
            "sam_directory",
            InputSource::step_output(StepRef::Name("align".into()), "sam_dir"),
        )]);
        let third = mapping(&[("sam_directory", InputSource::Shorthand(StepRef::Index(1)))]);

        let chain = DependencyChain::build(vec![
            ("align", &first),
            ("detect", &second),
            ("annotate", &third),
        ])
        .unwrap();

        assert_eq!(chain.len(), 3);
        assert_eq!(chain.edges().len(), 2);

        let edges = chain.edges();
        assert_eq!((edges[0].consumer, edges[0].producer), (1, 0));
        assert_eq!(edges[0].field, "sam_dir");
        assert_eq!((edges[1].consumer, edges[1].producer), (2, 1));
        assert_eq!(edges[1].field, "sam_directory");
    }

    #[test]
    fn test_resource_inputs_are_not_edges() {
        let first = mapping(&[("reads", InputSource::Reads { reads: "SRR1".into() })]);
        let chain = DependencyChain::build(vec![("download", &first)]).unwrap();
        assert!(chain.edges().is_empty());
    }

    #[test]
    fn test_unknown_step_name() {
        let first = InputMapping::new();
        let second = mapping(&[("x", InputSource::Shorthand(StepRef::Name("nope".into())))]);
        let err = DependencyChain::build(vec![("a", &first), ("b", &second)]).unwrap_err();
        assert!(matches!(err, ChainError::UnknownStep { .. }));
    }

    #[test]
    fn test_forward_and_self_references_rejected() {
        let forward = mapping(&[("x", InputSource::Shorthand(StepRef::Index(1)))]);
        let empty = InputMapping::new();
        let err = DependencyChain::build(vec![("a", &forward), ("b", &empty)]).unwrap_err();
        assert!(matches!(err, ChainError::NotEarlier { .. }));

        let selfref = mapping(&[("x", InputSource::Shorthand(StepRef::Name("a".into())))]);
        let err = DependencyChain::build(vec![("a", &selfref)]).unwrap_err();
        assert!(matches!(err, ChainError::NotEarlier { .. }));
    }

    #[test]
    fn test_index_out_of_range() {
        let first = InputMapping::new();
        let second = mapping(&[("x", InputSource::Shorthand(StepRef::Index(7)))]);
        let err = DependencyChain::build(vec![("a", &first), ("b", &second)]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "step 'b' input 'x' references unknown step '#7'"
        );
    }
}
