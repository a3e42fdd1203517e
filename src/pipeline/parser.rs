//! Pipeline Request Parser
//!
//! Loads pipeline submissions from YAML or JSON files. Parsing only checks
//! the document's shape; semantic validation happens at submission, so an
//! invalid request still becomes a recorded (failed) pipeline.

use std::error::Error;
use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::PipelineRequest;

/// Loads a pipeline request from a file.
///
/// Files ending in `.json` are parsed as JSON, everything else as YAML.
///
/// # Example
///
/// ```rust,no_run
/// use circrunner::pipeline::load_request;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let request = load_request("circrna.yaml")?;
///     println!("Loaded {} steps", request.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_request(path: impl AsRef<Path>) -> Result<PipelineRequest, Box<dyn Error>> {
    let path = path.as_ref();
    info!("Loading pipeline request from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| {
        format!(
            "Failed to read pipeline file '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        )
    })?;

    debug!("Request content loaded ({} bytes)", content.len());

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let request = parse_request(&content, is_json)?;

    info!(
        "Parsed pipeline '{}': {} steps, {} resources",
        request.name,
        request.steps.len(),
        request.resources.len()
    );

    Ok(request)
}

/// Parses a pipeline request from text.
pub fn parse_request(content: &str, is_json: bool) -> Result<PipelineRequest, String> {
    if is_json {
        serde_json::from_str(content)
            .map_err(|e| format!("Failed to parse pipeline JSON: {}. Check the file format.", e))
    } else {
        serde_yaml::from_str(content)
            .map_err(|e| format!("Failed to parse pipeline YAML: {}. Check the file format.", e))
    }
}

/// Saves a pipeline request to a YAML file.
pub fn save_request(request: &PipelineRequest, path: impl AsRef<Path>) -> Result<(), Box<dyn Error>> {
    let yaml_content = serde_yaml::to_string(request)?;
    fs::write(path.as_ref(), yaml_content)?;
    info!("Pipeline request saved to: {}", path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::model::{InputSource, StepDefinition, StepRef};
    use tempfile::tempdir;
    use uuid::Uuid;

    const REQUEST_YAML: &str = r#"
name: circrna-annotation
user_id: 6f0d3c1e-8a9b-4a57-9d3e-0c3f4d1f2a11
notes: pilot run
steps:
  - name: SRRDataManager
    parameters:
      accession: SRR1234567
  - name: BWAAligner
    requires_input_file: true
    parameters:
      threads: 8
    input_mapping:
      compact_directory: SRRDataManager
"#;

    #[test]
    fn test_parse_yaml_request() {
        let request = parse_request(REQUEST_YAML, false).unwrap();
        assert_eq!(request.name, "circrna-annotation");
        assert_eq!(request.notes.as_deref(), Some("pilot run"));
        assert_eq!(request.steps.len(), 2);
        assert_eq!(
            request.steps[1].input_mapping["compact_directory"],
            InputSource::Shorthand(StepRef::Name("SRRDataManager".into()))
        );
    }

    #[test]
    fn test_parse_json_request() {
        let json = r#"{
            "name": "j",
            "user_id": "6f0d3c1e-8a9b-4a57-9d3e-0c3f4d1f2a11",
            "steps": [{"name": "a", "parameters": {"command": "true"}}]
        }"#;
        let request = parse_request(json, true).unwrap();
        assert_eq!(request.steps[0].parameters["command"].as_str(), Some("true"));
    }

    #[test]
    fn test_parse_invalid() {
        let err = parse_request("steps: [", false).unwrap_err();
        assert!(err.contains("Failed to parse pipeline YAML"));
    }

    #[test]
    fn test_empty_step_list_still_parses() {
        let yaml = "name: empty\nuser_id: 6f0d3c1e-8a9b-4a57-9d3e-0c3f4d1f2a11\nsteps: []\n";
        let request = parse_request(yaml, false).unwrap();
        assert!(request.steps.is_empty());
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempdir().unwrap();
        let yaml_path = dir.path().join("pipeline.yaml");
        fs::write(&yaml_path, REQUEST_YAML).unwrap();
        assert_eq!(load_request(&yaml_path).unwrap().steps.len(), 2);

        let json_path = dir.path().join("pipeline.json");
        let request = load_request(&yaml_path).unwrap();
        fs::write(&json_path, serde_json::to_string(&request).unwrap()).unwrap();
        assert_eq!(load_request(&json_path).unwrap(), request);
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_request("/nonexistent/pipeline.yaml");
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("saved.yaml");
        let request = PipelineRequest::new("saved", Uuid::new_v4())
            .with_step(StepDefinition::new("a").with_parameter("threads", 2i64));

        save_request(&request, &path).unwrap();
        assert_eq!(load_request(&path).unwrap(), request);
    }
}
