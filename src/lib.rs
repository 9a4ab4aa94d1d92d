#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod config;
mod core;
mod error;
mod executor;
mod extract;
pub mod graph;
mod manifest;
mod plan;
mod scan;
pub mod scheduler;
mod scope;
mod utils;

use crate::graph::{DependencyGraph, Ordering};

pub use crate::config::{Category, CategoryDef, Config, ConfigBuilder};
pub use crate::core::{ArcStr, Hash32};
pub use crate::error::*;
pub use crate::executor::{CommandExecutor, CopyExecutor, ExecOutcome, TaskExecutor};
pub use crate::extract::{DependencyExtractor, RegexExtractor, Rule};
pub use crate::manifest::{MANIFEST_VERSION, Manifest, RunRecord, Stats};
pub use crate::plan::{Plan, TaskId, TaskSpec};
pub use crate::scan::{FileEntry, FileInventory, Scanner};
pub use crate::scheduler::{
    CancellationToken, RunOutcome, RunSummary, Scheduler, TaskReport, TaskStatus,
};
pub use crate::scope::{BuildTarget, Scope, resolve};

/// What a run should build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildRequest {
    /// Categories to consider. Empty means all of them.
    pub categories: Vec<String>,
    /// Rebuild every category regardless of the manifest.
    pub force_all: bool,
}

impl BuildRequest {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn category(mut self, name: impl Into<String>) -> Self {
        self.categories.push(name.into());
        self
    }

    pub fn force(mut self) -> Self {
        self.force_all = true;
        self
    }
}

/// Everything computed ahead of execution.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub graph: DependencyGraph,
    pub ordering: Ordering,
    pub scope: Scope,
    pub plan: Plan,
}

/// Wires the pipeline together: graph, cycle check, ordering, scope, plan,
/// schedule, manifest.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: Config,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Token cancelling runs started by this orchestrator. Once cancelled it
    /// stays cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn scan(&self) -> Result<FileInventory, OrchestratorError> {
        Ok(Scanner::new(&self.config).scan()?)
    }

    /// Dry run: works out what a run would do without executing anything or
    /// touching the manifest.
    pub fn plan<E>(
        &self,
        inventory: &FileInventory,
        extractor: &E,
        request: &BuildRequest,
    ) -> Result<Prepared, OrchestratorError>
    where
        E: DependencyExtractor + ?Sized,
    {
        let manifest = Manifest::load(&self.config.manifest_path());
        self.prepare(inventory, extractor, &manifest, request)
    }

    /// Builds whatever is stale in `inventory`, then records the outcome in
    /// the manifest.
    ///
    /// A dependency cycle or an invalid request fails the run before any task
    /// is dispatched. Task failures do not: they are reported in the returned
    /// summary. Failing to save the manifest is only logged.
    pub fn run<E, X>(
        &self,
        inventory: &FileInventory,
        extractor: &E,
        executor: X,
        request: &BuildRequest,
    ) -> Result<RunSummary, OrchestratorError>
    where
        E: DependencyExtractor + ?Sized,
        X: TaskExecutor + 'static,
    {
        let path = self.config.manifest_path();
        let mut manifest = Manifest::load(&path);

        let prepared = self.prepare(inventory, extractor, &manifest, request)?;

        let summary = Scheduler::new(&self.config)
            .with_cancellation(self.cancel.clone())
            .run(&prepared.plan, executor)?;

        manifest.commit(&prepared.graph, &self.config, &summary);
        manifest.record_run(&summary, self.config.history_limit());

        if let Err(err) = manifest.save(&path) {
            tracing::warn!(%path, "Couldn't save manifest: {err}");
        }

        Ok(summary)
    }

    /// Scans the project and runs it with the default extractor.
    pub fn build<X>(&self, executor: X, request: &BuildRequest) -> Result<RunSummary, OrchestratorError>
    where
        X: TaskExecutor + 'static,
    {
        let inventory = self.scan()?;
        self.run(&inventory, &RegexExtractor::default(), executor, request)
    }

    fn prepare<E>(
        &self,
        inventory: &FileInventory,
        extractor: &E,
        manifest: &Manifest,
        request: &BuildRequest,
    ) -> Result<Prepared, OrchestratorError>
    where
        E: DependencyExtractor + ?Sized,
    {
        let graph = DependencyGraph::build(inventory, extractor);

        if let Some(cycle) = graph::find_cycle(&graph) {
            tracing::error!(%cycle, "Dependency cycle detected, nothing will be built");
            return Err(CycleError(cycle).into());
        }

        let ordering = graph::sort(&graph)?;

        let requested: Vec<&str> = request.categories.iter().map(String::as_str).collect();
        let scope = resolve(
            &graph,
            &ordering,
            manifest,
            &self.config,
            &requested,
            request.force_all,
        )?;
        let plan = Plan::new(&scope, &graph, &self.config)?;

        Ok(Prepared {
            graph,
            ordering,
            scope,
            plan,
        })
    }
}

/// Installs a console subscriber with progress bars for the scheduler.
///
/// The filter is taken from `RUST_LOG`, defaulting to `info`.
#[cfg(feature = "logging")]
pub fn init_logging() -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let indicatif = tracing_indicatif::IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()
}
