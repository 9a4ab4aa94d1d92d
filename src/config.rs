//! Immutable run configuration.
//!
//! A [`Config`] is assembled once, either through [`Config::builder`] or by
//! deserializing a JSON document with [`Config::from_json_file`], and then
//! passed by reference into the graph builder, planner and scheduler. Nothing
//! downstream mutates it.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::core::ArcStr;
use crate::error::ConfigError;

/// Number of run summaries kept in the manifest history.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Default per-task timeout.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Serialized definition of a build category, e.g. `code` or `tests`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategoryDef {
    pub name: String,
    /// Glob patterns, relative to the project root, selecting member files.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Where the category's build output goes.
    #[serde(default)]
    pub output: Option<Utf8PathBuf>,
    /// Other categories which must be built first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Multiplier applied to member file sizes when estimating task cost.
    #[serde(default = "default_weight")]
    pub weight: u64,
    /// Shell command run by [`CommandExecutor`](crate::CommandExecutor).
    #[serde(default)]
    pub command: Option<String>,
}

fn default_weight() -> u64 {
    1
}

impl CategoryDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            patterns: Vec::new(),
            output: None,
            depends_on: Vec::new(),
            weight: default_weight(),
            command: None,
        }
    }

    pub fn pattern(mut self, glob: impl Into<String>) -> Self {
        self.patterns.push(glob.into());
        self
    }

    pub fn output(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn depends_on(mut self, category: impl Into<String>) -> Self {
        self.depends_on.push(category.into());
        self
    }

    pub fn weight(mut self, weight: u64) -> Self {
        self.weight = weight;
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }
}

/// A validated build category.
#[derive(Debug, Clone)]
pub struct Category {
    pub name: ArcStr,
    pub patterns: Vec<Pattern>,
    pub output: Utf8PathBuf,
    pub depends_on: Vec<ArcStr>,
    pub weight: u64,
    pub command: Option<String>,
}

impl Category {
    pub fn matches(&self, path: &Utf8Path) -> bool {
        self.patterns.iter().any(|p| p.matches(path.as_str()))
    }
}

/// Builder for [`Config`]. Also the on-disk JSON shape of the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigBuilder {
    pub root: Utf8PathBuf,
    pub categories: Vec<CategoryDef>,
    /// Worker pool size; `None` means the number of available CPUs.
    pub concurrency: Option<usize>,
    pub task_timeout_ms: u64,
    pub manifest_path: Utf8PathBuf,
    pub history_limit: usize,
    pub strict: bool,
    pub poll_interval_ms: u64,
    pub ignore: Vec<String>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            root: Utf8PathBuf::from("."),
            categories: Vec::new(),
            concurrency: None,
            task_timeout_ms: as_millis(DEFAULT_TASK_TIMEOUT),
            manifest_path: Utf8PathBuf::from(".kamado/manifest.json"),
            history_limit: DEFAULT_HISTORY_LIMIT,
            strict: false,
            poll_interval_ms: 50,
            ignore: vec![
                ".git/**".into(),
                ".kamado/**".into(),
                "dist/**".into(),
                "target/**".into(),
            ],
        }
    }
}

impl ConfigBuilder {
    pub fn root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn category(mut self, category: CategoryDef) -> Self {
        self.categories.push(category);
        self
    }

    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_ms = as_millis(timeout);
        self
    }

    pub fn manifest_path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.manifest_path = path.into();
        self
    }

    pub fn history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = as_millis(interval);
        self
    }

    pub fn ignore(mut self, glob: impl Into<String>) -> Self {
        self.ignore.push(glob.into());
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        let concurrency = match self.concurrency {
            Some(limit) => NonZeroUsize::new(limit).ok_or(ConfigError::ZeroConcurrency)?,
            None => std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
        };

        if self.task_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        if self.history_limit == 0 {
            return Err(ConfigError::ZeroHistory);
        }

        if self.categories.is_empty() {
            return Err(ConfigError::NoCategories);
        }

        let mut seen = HashSet::new();
        for def in &self.categories {
            if !seen.insert(def.name.as_str()) {
                return Err(ConfigError::DuplicateCategory(def.name.clone()));
            }
        }

        for def in &self.categories {
            for dependency in &def.depends_on {
                if !seen.contains(dependency.as_str()) {
                    return Err(ConfigError::UnknownDependency {
                        category: def.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let declared: BTreeMap<&str, Vec<&str>> = self
            .categories
            .iter()
            .map(|def| {
                let deps = def.depends_on.iter().map(String::as_str).collect();
                (def.name.as_str(), deps)
            })
            .collect();

        if let Some(cycle) = find_category_cycle(&declared) {
            return Err(ConfigError::CategoryCycle(cycle));
        }

        let categories = self
            .categories
            .into_iter()
            .map(|def| -> Result<Category, ConfigError> {
                let patterns = def
                    .patterns
                    .iter()
                    .map(|p| Pattern::new(p))
                    .collect::<Result<_, _>>()?;

                let output = def
                    .output
                    .unwrap_or_else(|| Utf8PathBuf::from("dist").join(&def.name));

                Ok(Category {
                    name: def.name.into(),
                    patterns,
                    output,
                    depends_on: def.depends_on.into_iter().map(Into::into).collect(),
                    weight: def.weight,
                    command: def.command,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let ignore = self
            .ignore
            .iter()
            .map(|p| Pattern::new(p))
            .collect::<Result<_, _>>()?;

        Ok(Config {
            inner: Arc::new(ConfigInner {
                root: self.root,
                categories,
                concurrency,
                task_timeout: Duration::from_millis(self.task_timeout_ms),
                manifest_path: self.manifest_path,
                history_limit: self.history_limit,
                strict: self.strict,
                poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
                ignore,
            }),
        })
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
pub(crate) fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Depth-first search over declared category dependencies.
pub(crate) fn find_category_cycle(graph: &BTreeMap<&str, Vec<&str>>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Active,
        Done,
    }

    fn visit<'a>(
        node: &'a str,
        graph: &BTreeMap<&'a str, Vec<&'a str>>,
        marks: &mut BTreeMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::Active) => {
                let start = path.iter().position(|n| *n == node).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
                cycle.push(node.to_string());
                return Some(cycle);
            }
            None => {}
        }

        marks.insert(node, Mark::Active);
        path.push(node);

        for &next in graph.get(node).into_iter().flatten() {
            if let Some(cycle) = visit(next, graph, marks, path) {
                return Some(cycle);
            }
        }

        path.pop();
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks = BTreeMap::new();
    let mut path = Vec::new();

    graph
        .keys()
        .find_map(|&node| visit(node, graph, &mut marks, &mut path))
}

struct ConfigInner {
    root: Utf8PathBuf,
    categories: Vec<Category>,
    concurrency: NonZeroUsize,
    task_timeout: Duration,
    manifest_path: Utf8PathBuf,
    history_limit: usize,
    strict: bool,
    poll_interval: Duration,
    ignore: Vec<Pattern>,
}

/// Validated, immutable orchestrator configuration. Cheap to clone.
#[derive(Clone)]
pub struct Config {
    inner: Arc<ConfigInner>,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reads a JSON configuration document. Relative `root` values are taken
    /// relative to the directory containing the file.
    pub fn from_json_file(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)?;
        let mut builder: ConfigBuilder = serde_json::from_str(&data)?;

        if builder.root.is_relative()
            && let Some(parent) = path.parent()
        {
            builder.root = parent.join(&builder.root);
        }

        builder.build()
    }

    pub fn root(&self) -> &Utf8Path {
        &self.inner.root
    }

    pub fn categories(&self) -> &[Category] {
        &self.inner.categories
    }

    pub fn category(&self, name: &str) -> Option<&Category> {
        self.inner.categories.iter().find(|c| &*c.name == name)
    }

    /// First category whose patterns match the given root-relative path.
    pub fn categorize(&self, path: &Utf8Path) -> Option<&Category> {
        self.inner.categories.iter().find(|c| c.matches(path))
    }

    /// The `seeds` plus every category declaring a dependency on one of them,
    /// directly or through other categories.
    pub fn downstream<'a>(&'a self, seeds: impl IntoIterator<Item = &'a str>) -> BTreeSet<&'a str> {
        let mut acc: BTreeSet<&'a str> = seeds.into_iter().collect();

        // declared dependencies are acyclic, this settles within one pass per
        // category
        loop {
            let before = acc.len();
            for category in self.categories() {
                if category.depends_on.iter().any(|d| acc.contains(&**d)) {
                    acc.insert(&category.name);
                }
            }
            if acc.len() == before {
                break;
            }
        }

        acc
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency.get()
    }

    pub fn task_timeout(&self) -> Duration {
        self.inner.task_timeout
    }

    /// Manifest location, resolved against the project root when relative.
    pub fn manifest_path(&self) -> Utf8PathBuf {
        if self.inner.manifest_path.is_absolute() {
            self.inner.manifest_path.clone()
        } else {
            self.inner.root.join(&self.inner.manifest_path)
        }
    }

    pub fn history_limit(&self) -> usize {
        self.inner.history_limit
    }

    pub fn strict(&self) -> bool {
        self.inner.strict
    }

    pub fn poll_interval(&self) -> Duration {
        self.inner.poll_interval
    }

    pub fn is_ignored(&self, path: &Utf8Path) -> bool {
        self.inner.ignore.iter().any(|p| p.matches(path.as_str()))
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("root", &self.inner.root)
            .field("categories", &self.inner.categories)
            .field("concurrency", &self.inner.concurrency)
            .field("task_timeout", &self.inner.task_timeout)
            .field("manifest_path", &self.inner.manifest_path)
            .field("history_limit", &self.inner.history_limit)
            .field("strict", &self.inner.strict)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code() -> CategoryDef {
        CategoryDef::new("code").pattern("src/**/*.rs")
    }

    #[test]
    fn test_defaults() {
        let config = Config::builder().category(code()).build().unwrap();

        assert!(config.concurrency() >= 1);
        assert_eq!(config.history_limit(), DEFAULT_HISTORY_LIMIT);
        assert_eq!(config.task_timeout(), DEFAULT_TASK_TIMEOUT);
        assert_eq!(
            config.category("code").unwrap().output,
            Utf8PathBuf::from("dist/code")
        );
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = Config::builder()
            .category(code())
            .concurrency(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ZeroConcurrency));
    }

    #[test]
    fn test_missing_categories_rejected() {
        let err = Config::builder().build().unwrap_err();
        assert!(matches!(err, ConfigError::NoCategories));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = Config::builder()
            .category(code().depends_on("assets"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDependency { .. }));
    }

    #[test]
    fn test_duplicate_category_rejected() {
        let err = Config::builder()
            .category(code())
            .category(code())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateCategory(name) if name == "code"));
    }

    #[test]
    fn test_category_cycle_rejected() {
        let err = Config::builder()
            .category(CategoryDef::new("a").depends_on("b"))
            .category(CategoryDef::new("b").depends_on("a"))
            .build()
            .unwrap_err();

        match err {
            ConfigError::CategoryCycle(path) => assert_eq!(path, vec!["a", "b", "a"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_downstream_follows_declared_dependents() {
        let config = Config::builder()
            .category(CategoryDef::new("assets"))
            .category(CategoryDef::new("styles").depends_on("assets"))
            .category(CategoryDef::new("site").depends_on("styles"))
            .category(CategoryDef::new("feeds"))
            .build()
            .unwrap();

        let names: Vec<&str> = config.downstream(["assets"]).into_iter().collect();
        assert_eq!(names, vec!["assets", "site", "styles"]);
        assert_eq!(config.downstream(["feeds"]).len(), 1);
        assert!(config.downstream(None).is_empty());
    }

    #[test]
    fn test_huge_timeout_saturates() {
        let builder = Config::builder().task_timeout(Duration::MAX);
        assert_eq!(builder.task_timeout_ms, u64::MAX);

        let config = builder.category(code()).build().unwrap();
        assert_eq!(config.task_timeout(), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_categorize_first_match_wins() {
        let config = Config::builder()
            .category(CategoryDef::new("tests").pattern("src/**/*_test.rs"))
            .category(code())
            .build()
            .unwrap();

        let hit = config.categorize(Utf8Path::new("src/lib_test.rs")).unwrap();
        assert_eq!(&*hit.name, "tests");
        let hit = config.categorize(Utf8Path::new("src/lib.rs")).unwrap();
        assert_eq!(&*hit.name, "code");
        assert!(config.categorize(Utf8Path::new("README.md")).is_none());
    }

    #[test]
    fn test_from_json_ignores_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("kamado.json")).unwrap();
        std::fs::write(
            &path,
            r#"{
                "concurrency": 3,
                "task_timeout_ms": 1500,
                "future_option": true,
                "categories": [
                    { "name": "code", "patterns": ["src/*.c"], "weight": 2 },
                    { "name": "docs", "patterns": ["docs/*.md"], "depends_on": ["code"] }
                ]
            }"#,
        )
        .unwrap();

        let config = Config::from_json_file(&path).unwrap();
        assert_eq!(config.concurrency(), 3);
        assert_eq!(config.task_timeout(), Duration::from_millis(1500));
        assert_eq!(config.root(), path.parent().unwrap().join("."));
        assert_eq!(config.category("code").unwrap().weight, 2);
        assert_eq!(
            config.category("docs").unwrap().depends_on,
            vec![ArcStr::from("code")]
        );
    }
}
