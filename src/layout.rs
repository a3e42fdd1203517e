//! Pipeline Output Layout
//!
//! Each pipeline owns a directory under the output root:
//!
//! ```text
//! <output_dir>/<user_id>/<pipeline_id>/
//!     configs/initial_config.json
//!     configs/final_config.json
//!     run/                         working directory handed to executors
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use uuid::Uuid;

use crate::pipeline::ConfigType;

/// Root of all pipeline output directories.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory layout of one pipeline.
    pub fn pipeline(&self, user_id: Uuid, pipeline_id: Uuid) -> PipelineLayout {
        PipelineLayout {
            base: self
                .root
                .join(user_id.to_string())
                .join(pipeline_id.to_string()),
        }
    }
}

/// Directories and files belonging to one pipeline.
#[derive(Debug, Clone)]
pub struct PipelineLayout {
    base: PathBuf,
}

impl PipelineLayout {
    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn run_dir(&self) -> PathBuf {
        self.base.join("run")
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.base.join("configs")
    }

    /// Engine-generated path of a config snapshot.
    pub fn config_file(&self, config_type: ConfigType) -> PathBuf {
        self.configs_dir()
            .join(format!("{}_config.json", config_type.as_str()))
    }

    /// Creates the run directory if needed and returns it.
    pub fn ensure_run_dir(&self) -> io::Result<PathBuf> {
        let dir = self.run_dir();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            debug!("Created run directory: {}", dir.display());
        }
        Ok(dir)
    }
}

/// Writes a config snapshot, creating parent directories as needed.
pub fn write_snapshot(path: &Path, json: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, json)?;
    debug!("Wrote config snapshot: {}", path.display());
    Ok(())
}
