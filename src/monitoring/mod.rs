//! Run Monitoring Module
//!
//! Reporting helpers built from persisted run state.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Step start/end timing for Gantt charts

pub mod timeline;

pub use timeline::{ExecutionTimeline, TimelineEntry};
