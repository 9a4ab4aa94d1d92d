//! The boundary between the orchestrator and the actual build steps.
//!
//! An executor receives a [`TaskSpec`] and does whatever building a category
//! means: compiling, copying, rendering. The orchestrator never looks inside,
//! it only cares whether the step succeeded.

use std::fs;
use std::process::Command;

use anyhow::{Context, bail};

use crate::plan::TaskSpec;

/// Result of running one task.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutcome {
    pub success: bool,
    pub output: String,
    pub error: String,
}

impl ExecOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: String::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: error.into(),
        }
    }
}

impl From<anyhow::Result<String>> for ExecOutcome {
    fn from(result: anyhow::Result<String>) -> Self {
        match result {
            Ok(output) => Self::success(output),
            Err(err) => Self::failure(format!("{err:#}")),
        }
    }
}

/// Runs the build step of a task.
///
/// Called from worker threads, possibly for several tasks at once. A call may
/// block for as long as the step takes; the scheduler enforces the timeout.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: &TaskSpec) -> ExecOutcome;
}

impl<F> TaskExecutor for F
where
    F: Fn(&TaskSpec) -> anyhow::Result<String> + Send + Sync,
{
    fn execute(&self, task: &TaskSpec) -> ExecOutcome {
        self(task).into()
    }
}

/// Copies every member file into the task's output directory, keeping the
/// relative layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyExecutor;

impl CopyExecutor {
    fn copy(task: &TaskSpec) -> anyhow::Result<String> {
        fs::create_dir_all(&task.output)
            .with_context(|| format!("Couldn't create output directory {}", task.output))?;

        let mut bytes = 0;
        for file in &task.files {
            let from = task.root.join(&**file);
            let into = task.output.join(&**file);

            if let Some(parent) = into.parent() {
                fs::create_dir_all(parent)?;
            }
            bytes += fs::copy(&from, &into).with_context(|| format!("Couldn't copy {from} to {into}"))?;
        }

        Ok(format!("Copied {} files ({bytes} bytes) to {}", task.files.len(), task.output))
    }
}

impl TaskExecutor for CopyExecutor {
    fn execute(&self, task: &TaskSpec) -> ExecOutcome {
        Self::copy(task).into()
    }
}

/// Runs the category's configured shell command in the project root.
///
/// The command sees the task through the environment:
/// `KAMADO_CATEGORY`, `KAMADO_OUTPUT` and `KAMADO_FILES` (newline separated).
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandExecutor;

impl CommandExecutor {
    fn run(task: &TaskSpec) -> anyhow::Result<String> {
        let Some(command) = &task.command else {
            bail!("No command configured for category '{}'", task.category);
        };

        let files = task.files.iter().map(|f| &**f).collect::<Vec<_>>().join("\n");

        let output = shell(command)
            .current_dir(&task.root)
            .env("KAMADO_CATEGORY", &*task.category)
            .env("KAMADO_OUTPUT", task.output.as_str())
            .env("KAMADO_FILES", files)
            .output()
            .with_context(|| format!("Couldn't spawn `{command}`"))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("`{command}` exited with {}\n{}", output.status, stderr.trim_end());
        }

        Ok(stdout)
    }
}

impl TaskExecutor for CommandExecutor {
    fn execute(&self, task: &TaskSpec) -> ExecOutcome {
        Self::run(task).into()
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}
