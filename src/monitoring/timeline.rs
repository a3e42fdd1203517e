//! Run Timeline
//!
//! Rebuilds a pipeline's step timing from persisted start/end timestamps and
//! renders it as an ASCII Gantt chart.

use chrono::{DateTime, Duration, Utc};

use crate::orchestrator::StepStatus;
use crate::pipeline::RunStatus;

/// Chart width in characters.
const CHART_WIDTH: f64 = 50.0;

/// Timing of one step that has started.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub step_name: String,
    pub status: RunStatus,
    pub start: DateTime<Utc>,
    /// `None` while the step is still running.
    pub end: Option<DateTime<Utc>>,
}

impl TimelineEntry {
    /// Elapsed time, measured up to `now` for a running step.
    pub fn duration(&self, now: DateTime<Utc>) -> Duration {
        self.end.unwrap_or(now) - self.start
    }

    fn marker(&self) -> char {
        match self.status {
            RunStatus::Failed => 'x',
            RunStatus::Running => '>',
            _ => '#',
        }
    }
}

/// Step timing of one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionTimeline {
    entries: Vec<TimelineEntry>,
}

impl ExecutionTimeline {
    /// Collects every step that has a start time, in start order. Steps
    /// that never ran are left out.
    pub fn from_steps(steps: &[StepStatus]) -> Self {
        let mut entries: Vec<TimelineEntry> = steps
            .iter()
            .filter_map(|step| {
                step.start_time.map(|start| TimelineEntry {
                    step_name: step.name.clone(),
                    status: step.status,
                    start,
                    end: step.end_time,
                })
            })
            .collect();
        entries.sort_by_key(|e| e.start);
        Self { entries }
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// From the first start to the last end (or `now` if still running).
    pub fn span(&self, now: DateTime<Utc>) -> Duration {
        let Some(first) = self.entries.first() else {
            return Duration::zero();
        };
        let last = self
            .entries
            .iter()
            .map(|e| e.end.unwrap_or(now))
            .max()
            .unwrap_or(first.start);
        last - first.start
    }

    /// Generates an ASCII Gantt chart.
    ///
    /// `#` marks completed time, `x` a failed step and `>` a step that is
    /// still running.
    pub fn gantt_chart(&self, now: DateTime<Utc>) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let Some(first) = self.entries.first() else {
            return output;
        };
        let origin = first.start;
        let total_ms = self.span(now).num_milliseconds();

        if total_ms <= 0 {
            for entry in &self.entries {
                output.push_str(&format!(
                    "{} |{}| (0 ms)\n",
                    truncate(&entry.step_name, 12),
                    entry.marker()
                ));
            }
            output.push_str("\nTotal: 0 ms\n");
            return output;
        }

        let scale = CHART_WIDTH / total_ms as f64;

        for entry in &self.entries {
            let offset = (entry.start - origin).num_milliseconds().max(0);
            let duration = entry.duration(now).num_milliseconds().max(0);

            let start_pos = (offset as f64 * scale) as usize;
            let width = (duration as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&entry.marker().to_string().repeat(width));

            output.push_str(&format!(
                "{} |{}| ({} ms)\n",
                truncate(&entry.step_name, 12),
                bar,
                duration
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_ms));
        output
    }

    /// Step durations in milliseconds, for steps that have finished.
    pub fn durations(&self) -> Vec<(String, i64)> {
        self.entries
            .iter()
            .filter_map(|e| {
                e.end
                    .map(|end| (e.step_name.clone(), (end - e.start).num_milliseconds()))
            })
            .collect()
    }
}

/// Pads or cuts a name to exactly `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn step(name: &str, status: RunStatus, start: Option<i64>, end: Option<i64>) -> StepStatus {
        StepStatus {
            id: Uuid::new_v4(),
            position: 0,
            name: name.to_string(),
            status,
            start_time: start.map(at),
            end_time: end.map(at),
        }
    }

    #[test]
    fn test_pending_steps_are_left_out() {
        let timeline = ExecutionTimeline::from_steps(&[
            step("align", RunStatus::Completed, Some(0), Some(100)),
            step("detect", RunStatus::Pending, None, None),
        ]);
        assert_eq!(timeline.entries().len(), 1);
        assert_eq!(timeline.durations(), vec![("align".to_string(), 100)]);
    }

    #[test]
    fn test_gantt_chart_generation() {
        let timeline = ExecutionTimeline::from_steps(&[
            step("step1", RunStatus::Completed, Some(0), Some(500)),
            step("step2", RunStatus::Failed, Some(500), Some(1000)),
        ]);

        let chart = timeline.gantt_chart(at(2000));
        assert!(chart.contains("step1"));
        assert!(chart.contains("xxxx"));
        assert!(chart.contains("Total: 1000 ms"));
    }

    #[test]
    fn test_running_step_measured_to_now() {
        let timeline = ExecutionTimeline::from_steps(&[step(
            "slow",
            RunStatus::Running,
            Some(0),
            None,
        )]);

        assert_eq!(timeline.span(at(300)).num_milliseconds(), 300);
        assert!(timeline.durations().is_empty());
        assert!(timeline.gantt_chart(at(300)).contains(">>>"));
    }

    #[test]
    fn test_gantt_chart_empty() {
        let timeline = ExecutionTimeline::default();
        assert!(timeline.is_empty());
        let chart = timeline.gantt_chart(at(0));
        assert!(chart.contains("Timeline"));
        assert!(!chart.contains("Total"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 8), "short   ");
        assert_eq!(truncate("CIRI2Processor", 12), "CIRI2Proc...");
    }
}
