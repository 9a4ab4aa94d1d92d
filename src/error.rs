use thiserror::Error;

use crate::graph::Cycle;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("Invalid configuration:\n{0}")]
    Config(#[from] ConfigError),

    #[error("Error while scanning the project:\n{0}")]
    Scan(#[from] ScanError),

    #[error("Couldn't start worker thread.\n{0}")]
    Worker(#[from] std::io::Error),
}

/// The dependency graph is not a DAG, so no build order exists.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Dependency cycle detected: {0}")]
pub struct CycleError(pub Cycle);

impl CycleError {
    pub fn cycle(&self) -> &Cycle {
        &self.0
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Concurrency limit must be at least 1")]
    ZeroConcurrency,

    #[error("Task timeout must be greater than zero")]
    ZeroTimeout,

    #[error("History limit must be at least 1")]
    ZeroHistory,

    #[error("No build categories are defined")]
    NoCategories,

    #[error("Category '{0}' is defined more than once")]
    DuplicateCategory(String),

    #[error("Category '{0}' is not defined")]
    UnknownCategory(String),

    #[error("Category '{category}' depends on undefined category '{dependency}'")]
    UnknownDependency { category: String, dependency: String },

    #[error("Category dependencies form a cycle: {}", .0.join(" -> "))]
    CategoryCycle(Vec<String>),

    #[error("Couldn't compile glob pattern.\n{0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Couldn't read configuration file.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't parse configuration file.\n{0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Couldn't load data from file.\n{0}")]
    FileSystem(#[from] std::io::Error),

    #[error("File name '{0}' is not valid UTF-8")]
    NonUtf8Name(String),
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't serialize manifest.\n{0}")]
    Json(#[from] serde_json::Error),

    #[error("Couldn't move manifest into place.\n{0}")]
    Persist(#[from] tempfile::PersistError),
}
