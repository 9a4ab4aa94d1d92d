use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter, Write};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::ArcStr;
use crate::plan::TaskId;
use crate::utils::as_elapsed;

/// Lifecycle of a task.
///
/// `Pending -> Eligible -> Running -> {Success, Failed, Timeout}` for tasks
/// which get to run. A task whose dependency did not succeed goes straight
/// to `Skipped`, and tasks never dispatched before cancellation end up
/// `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Eligible,
    Running,
    Success,
    Failed,
    Timeout,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Timeout | Self::Skipped | Self::Cancelled
        )
    }

    /// The task ran and did not succeed.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Timeout)
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Eligible => "eligible",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    Failed,
    Cancelled,
}

impl Display for RunOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Final record of a single task.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub id: TaskId,
    pub category: ArcStr,
    pub files: usize,
    pub depends_on: Vec<TaskId>,
    pub status: TaskStatus,
    /// When a worker picked the task up.
    pub start: Option<Instant>,
    pub duration: Option<Duration>,
    pub output: String,
    pub error: Option<String>,
}

impl TaskReport {
    pub(crate) fn new(id: TaskId, category: &str, status: TaskStatus) -> Self {
        Self {
            id,
            category: category.into(),
            files: 0,
            depends_on: Vec::new(),
            status,
            start: None,
            duration: None,
            output: String::new(),
            error: None,
        }
    }
}

/// Outcome of a scheduler run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// One report per planned task, indexed by [`TaskId`].
    pub tasks: Vec<TaskReport>,
    pub outcome: RunOutcome,
    pub duration: Duration,
}

impl RunSummary {
    /// Summary of a run with nothing to do.
    pub fn empty() -> Self {
        Self {
            tasks: Vec::new(),
            outcome: RunOutcome::Success,
            duration: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Success
    }

    pub fn task(&self, id: TaskId) -> Option<&TaskReport> {
        self.tasks.get(id.0)
    }

    pub fn task_for(&self, category: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| &*t.category == category)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(TaskStatus::Success)
    }

    pub fn failed(&self) -> usize {
        self.count(TaskStatus::Failed)
    }

    pub fn timed_out(&self) -> usize {
        self.count(TaskStatus::Timeout)
    }

    pub fn skipped(&self) -> usize {
        self.count(TaskStatus::Skipped)
    }

    pub fn cancelled(&self) -> usize {
        self.count(TaskStatus::Cancelled)
    }

    /// Tasks which ran and failed or timed out.
    pub fn failures(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| t.status.is_failure())
    }

    pub fn succeeded_categories(&self) -> BTreeSet<&str> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Success)
            .map(|t| &*t.category)
            .collect()
    }

    /// Renders the task graph as a Mermaid diagram.
    ///
    /// Successful tasks are shaded from green to red by duration. Failed tasks
    /// are red, timed out ones orange, skipped and cancelled ones grey.
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        // writing into a String cannot fail
        let _ = self.write_mermaid(&mut f);
        f
    }

    fn write_mermaid(&self, f: &mut String) -> fmt::Result {
        writeln!(f, "graph LR")?;

        let durations = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Success)
            .filter_map(|t| t.duration)
            .map(|d| d.as_secs_f64());

        let (mut min, mut max) = durations.fold((f64::MAX, f64::MIN), |(lo, hi), d| (lo.min(d), hi.max(d)));
        if min > max {
            min = 0.0;
            max = 0.0;
        }
        if (max - min).abs() < f64::EPSILON {
            max = min + 1.0;
        }

        for task in &self.tasks {
            let name = task.category.replace('"', "\\\"");
            let label = match task.duration {
                Some(duration) => format!("{} {:.2?}", task.status, duration),
                None => task.status.to_string(),
            };

            let color = match task.status {
                TaskStatus::Success => {
                    let secs = task.duration.unwrap_or_default().as_secs_f64();
                    gradient((secs - min) / (max - min))
                }
                TaskStatus::Failed => "#F87171".to_string(),
                TaskStatus::Timeout => "#FB923C".to_string(),
                _ => "#D1D5DB".to_string(),
            };

            writeln!(f, "    {}[\"{}\\n{}\"]", task.id.0, name, label)?;
            writeln!(f, "    style {} fill:{}", task.id.0, color)?;
        }

        for task in &self.tasks {
            for dependency in &task.depends_on {
                writeln!(f, "    {} --> {}", dependency.0, task.id.0)?;
            }
        }

        Ok(())
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn gradient(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);
    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };
    format!("#{r:02X}{g:02X}00")
}

impl Display for RunSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for task in &self.tasks {
            let duration = match task.duration {
                Some(duration) => as_elapsed(duration).to_string(),
                None => "-".to_string(),
            };
            writeln!(
                f,
                "{:>5}  {:<9}  {:>8}  {} ({} files)",
                task.id, task.status, duration, task.category, task.files
            )?;
            if let Some(error) = &task.error {
                for line in error.lines() {
                    writeln!(f, "         {line}")?;
                }
            }
        }

        write!(
            f,
            "{}: {} succeeded, {} failed, {} timed out, {} skipped, {} cancelled in {}",
            self.outcome,
            self.succeeded(),
            self.failed(),
            self.timed_out(),
            self.skipped(),
            self.cancelled(),
            as_elapsed(self.duration)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(id: usize, category: &str, status: TaskStatus, ms: Option<u64>) -> TaskReport {
        let mut report = TaskReport::new(TaskId(id), category, status);
        report.duration = ms.map(Duration::from_millis);
        report
    }

    fn summary() -> RunSummary {
        let mut docs = report(2, "docs", TaskStatus::Skipped, None);
        docs.depends_on = vec![TaskId(1)];
        let mut app = report(1, "app", TaskStatus::Failed, Some(20));
        app.depends_on = vec![TaskId(0)];
        app.error = Some("compile error\nline 2".into());

        RunSummary {
            tasks: vec![report(0, "lib", TaskStatus::Success, Some(10)), app, docs],
            outcome: RunOutcome::Failed,
            duration: Duration::from_millis(35),
        }
    }

    #[test]
    fn test_counts() {
        let summary = summary();
        assert_eq!(summary.succeeded(), 1);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.skipped(), 1);
        assert_eq!(summary.failures().map(|t| t.id).collect::<Vec<_>>(), vec![TaskId(1)]);
        assert_eq!(summary.succeeded_categories().into_iter().collect::<Vec<_>>(), vec!["lib"]);
        assert!(!summary.is_success());
        assert!(RunSummary::empty().is_success());
    }

    #[test]
    fn test_display_lists_errors() {
        let text = summary().to_string();
        assert!(text.contains("failed"));
        assert!(text.contains("         line 2"));
        assert!(text.ends_with("failed: 1 succeeded, 1 failed, 0 timed out, 1 skipped, 0 cancelled in 35ms"));
    }

    #[test]
    fn test_mermaid() {
        let mermaid = summary().render_mermaid();
        assert!(mermaid.starts_with("graph LR\n"));
        assert!(mermaid.contains("    0 --> 1\n"));
        assert!(mermaid.contains("    1 --> 2\n"));
        assert!(mermaid.contains("style 1 fill:#F87171"));
        assert!(mermaid.contains("style 0 fill:#00FF00"));
    }

    #[test]
    fn test_status_serde() {
        assert_eq!(serde_json::to_string(&RunOutcome::Cancelled).unwrap(), "\"cancelled\"");
        assert_eq!(format!("{:<8}|", TaskStatus::Timeout), "timeout |");
    }
}
