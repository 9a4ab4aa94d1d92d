//! Persisted build state.
//!
//! The manifest maps every file of the last successful build to its content
//! hash, and keeps a short history of previous runs. A missing or unreadable
//! manifest is never an error: it simply means everything is stale.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fs;
use std::io::Write;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::core::Hash32;
use crate::error::ManifestError;
use crate::graph::{DependencyGraph, FileNode};
use crate::scheduler::{RunOutcome, RunSummary};

/// Current on-disk schema version.
pub const MANIFEST_VERSION: u32 = 1;

/// One entry of the run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default)]
    pub succeeded: usize,
    #[serde(default)]
    pub failed: usize,
    #[serde(default)]
    pub skipped: usize,
    pub outcome: RunOutcome,
}

/// Aggregates over every recorded run, including those no longer in the
/// history window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stats {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub average_duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub version: u32,
    pub created: DateTime<Utc>,
    /// Oldest first.
    pub history: VecDeque<RunRecord>,
    /// Relative path to hex encoded content hash.
    pub files: BTreeMap<String, String>,
    /// Files each file depended on when its hash was stored. Files without
    /// dependencies have no entry.
    pub dependencies: BTreeMap<String, BTreeSet<String>>,
    pub stats: Stats,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            created: Utc::now(),
            history: VecDeque::new(),
            files: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            stats: Stats::default(),
        }
    }
}

impl Manifest {
    /// Loads the manifest stored at `path`.
    ///
    /// A missing file yields an empty manifest. So does a file which cannot be
    /// read or parsed, which additionally logs a warning: the next run then
    /// rebuilds everything and overwrites it.
    pub fn load(path: &Utf8Path) -> Self {
        match Self::try_load(path) {
            Ok(Some(manifest)) => {
                tracing::debug!(%path, files = manifest.files.len(), "Loaded manifest");
                manifest
            }
            Ok(None) => {
                tracing::debug!(%path, "No manifest found, starting fresh");
                Self::default()
            }
            Err(err) => {
                tracing::warn!(%path, "Ignoring unreadable manifest: {err}");
                Self::default()
            }
        }
    }

    /// Like [`Manifest::load`], but reports failures instead of hiding them.
    pub fn try_load(path: &Utf8Path) -> Result<Option<Self>, ManifestError> {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        Ok(Some(serde_json::from_str(&data)?))
    }

    /// Writes the manifest atomically: the data goes to a temporary file next
    /// to `path` which is then renamed over it.
    pub fn save(&self, path: &Utf8Path) -> Result<(), ManifestError> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_str().is_empty() => dir,
            _ => Utf8Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut file, self)?;
        file.write_all(b"\n")?;
        file.as_file().sync_all()?;
        file.persist(path)?;

        tracing::debug!(%path, files = self.files.len(), "Saved manifest");
        Ok(())
    }

    /// True when no hash is stored for `path`, or the stored one differs.
    pub fn is_stale(&self, path: &str, hash: &Hash32) -> bool {
        match self.files.get(path) {
            Some(stored) => *stored != hash.to_hex(),
            None => true,
        }
    }

    pub fn stored_hash(&self, path: &str) -> Option<Hash32> {
        self.files.get(path).and_then(|hex| Hash32::from_hex(hex))
    }

    pub fn record_hash(&mut self, path: &str, hash: &Hash32) {
        self.files.insert(path.to_string(), hash.to_hex());
    }

    /// Stores the hash and the current dependencies of a file.
    pub fn record_node(&mut self, node: &FileNode) {
        self.record_hash(&node.path, &node.hash);

        if node.dependencies.is_empty() {
            self.dependencies.remove(&*node.path);
        } else {
            let dependencies = node.dependencies.iter().map(|d| d.to_string()).collect();
            self.dependencies.insert(node.path.to_string(), dependencies);
        }
    }

    /// Stored files which are no longer part of the graph.
    pub fn removed<'a>(&'a self, graph: &'a DependencyGraph) -> impl Iterator<Item = &'a str> {
        self.files
            .keys()
            .map(String::as_str)
            .filter(move |path| !graph.contains(path))
    }

    /// True when a file `path` depended on at its last commit is gone.
    pub fn lost_dependency(&self, graph: &DependencyGraph, path: &str) -> bool {
        self.dependencies
            .get(path)
            .is_some_and(|stored| stored.iter().any(|d| !graph.contains(d)))
    }

    /// Folds the results of a run into the stored state.
    ///
    /// A file is pending when it is stale or lost one of its dependencies. Its
    /// new state is only committed once every category it affects was rebuilt
    /// successfully: its own, those of its transitive dependents, and every
    /// category declaring a dependency on one of those. Otherwise it stays
    /// pending and the affected targets are picked up again next run.
    ///
    /// A file which disappeared is forgotten under the same condition, with
    /// the category it would belong to standing in for its own.
    pub fn commit(&mut self, graph: &DependencyGraph, config: &Config, summary: &RunSummary) {
        let succeeded = summary.succeeded_categories();
        let rebuilt = |affected: BTreeSet<&str>| affected.iter().all(|c| succeeded.contains(*c));

        let mut committed = 0;
        let mut held = 0;

        for node in graph.nodes() {
            let pending = self.is_stale(&node.path, &node.hash) || self.lost_dependency(graph, &node.path);

            if pending {
                if !rebuilt(config.downstream(affected_categories(graph, &node.path))) {
                    held += 1;
                    continue;
                }
                committed += 1;
            }

            self.record_node(node);
        }

        let removed: Vec<String> = self.removed(graph).map(str::to_string).collect();
        let mut pruned = 0;

        for path in removed {
            let category = config.categorize(Utf8Path::new(&path)).map(|c| &*c.name);
            if rebuilt(config.downstream(category)) {
                self.files.remove(&path);
                pruned += 1;
            } else {
                held += 1;
            }
        }

        let files = &self.files;
        self.dependencies.retain(|path, _| files.contains_key(path));

        tracing::debug!(committed, held, pruned, "Updated manifest");
    }

    /// Appends a run to the history, keeping at most `limit` entries, and
    /// updates the aggregate stats.
    pub fn record_run(&mut self, summary: &RunSummary, limit: usize) {
        let now = Utc::now();
        let duration_ms = crate::config::as_millis(summary.duration);

        self.stats.total_runs += 1;
        match summary.outcome {
            RunOutcome::Success => self.stats.successful_runs += 1,
            RunOutcome::Failed | RunOutcome::Cancelled => self.stats.failed_runs += 1,
        }
        let n = self.stats.total_runs as f64;
        self.stats.average_duration_ms += (duration_ms as f64 - self.stats.average_duration_ms) / n;

        self.history.push_back(RunRecord {
            id: format!("{}-{}", now.format("%Y%m%dT%H%M%S"), self.stats.total_runs),
            timestamp: now,
            duration_ms,
            succeeded: summary.succeeded(),
            failed: summary.failed() + summary.timed_out(),
            skipped: summary.skipped(),
            outcome: summary.outcome,
        });

        while self.history.len() > limit {
            self.history.pop_front();
        }
    }

    pub fn last_run(&self) -> Option<&RunRecord> {
        self.history.back()
    }
}

/// Categories of `path` and of every file transitively depending on it.
fn affected_categories<'g>(graph: &'g DependencyGraph, path: &'g str) -> BTreeSet<&'g str> {
    let mut categories = BTreeSet::new();
    let mut seen = HashSet::new();
    let mut stack = vec![path];

    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        if let Some(node) = graph.node(current) {
            if let Some(category) = &node.category {
                categories.insert(&**category);
            }
            stack.extend(node.dependents.iter().map(|d| &**d));
        }
    }

    categories
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::config::CategoryDef;
    use crate::scan::{FileEntry, FileInventory};
    use crate::plan::TaskId;
    use crate::scheduler::{TaskReport, TaskStatus};

    fn temp_path(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().join("state/manifest.json")).unwrap()
    }

    fn summary(outcome: RunOutcome, ms: u64, tasks: &[(&str, TaskStatus)]) -> RunSummary {
        RunSummary {
            tasks: tasks
                .iter()
                .enumerate()
                .map(|(i, (category, status))| TaskReport::new(TaskId(i), category, *status))
                .collect(),
            outcome,
            duration: Duration::from_millis(ms),
        }
    }

    /// `code` owns `*.c`, `docs` owns `*.md`, plus any `extra` categories.
    fn config(extra: &[CategoryDef]) -> Config {
        extra
            .iter()
            .cloned()
            .fold(
                Config::builder()
                    .category(CategoryDef::new("code").pattern("*.c"))
                    .category(CategoryDef::new("docs").pattern("*.md")),
                |builder, def| builder.category(def),
            )
            .build()
            .unwrap()
    }

    fn graph_of(files: &[(&str, &str, Option<&str>)]) -> DependencyGraph {
        let inventory: FileInventory = files
            .iter()
            .map(|(path, content, category)| {
                FileEntry::from_content(*path, content.as_bytes().to_vec(), *category)
            })
            .collect();

        DependencyGraph::build(&inventory, &crate::graph::tests::lines)
    }

    /// `util.h` (uncategorized) <- `main.c` (code) <- `docs.md` (docs), plus a
    /// free-standing `notes.txt`.
    fn graph() -> DependencyGraph {
        graph_of(&[
            ("util.h", "", None),
            ("main.c", "util.h", Some("code")),
            ("docs.md", "main.c", Some("docs")),
            ("notes.txt", "", None),
        ])
    }

    fn both(code: TaskStatus, docs: TaskStatus) -> RunSummary {
        summary(RunOutcome::Success, 10, &[("code", code), ("docs", docs)])
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::load(&temp_path(&dir));
        assert!(manifest.files.is_empty());
        assert!(manifest.history.is_empty());
        assert_eq!(manifest.version, MANIFEST_VERSION);
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ not json").unwrap();

        assert!(Manifest::try_load(&path).is_err());
        assert!(Manifest::load(&path).files.is_empty());
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            r#"{"version": 1, "files": {"a.c": "00"}, "future": [1, 2, 3]}"#,
        )
        .unwrap();

        let manifest = Manifest::load(&path);
        assert_eq!(manifest.files.get("a.c").map(String::as_str), Some("00"));
        assert_eq!(manifest.stats, Stats::default());
    }

    #[test]
    fn test_round_trip_with_bounded_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir);

        let mut manifest = Manifest::default();
        manifest.record_hash("src/main.c", &Hash32::hash(b"int main;"));
        for i in 0..5 {
            let outcome = if i == 3 { RunOutcome::Failed } else { RunOutcome::Success };
            manifest.record_run(&summary(outcome, 100 * (i + 1), &[]), 3);
        }
        manifest.save(&path).unwrap();

        let loaded = Manifest::load(&path);
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.history.len(), 3);
        assert_eq!(loaded.history.front().unwrap().duration_ms, 300);
        assert_eq!(loaded.stats.total_runs, 5);
        assert_eq!(loaded.stats.successful_runs, 4);
        assert_eq!(loaded.stats.failed_runs, 1);
        assert!((loaded.stats.average_duration_ms - 300.0).abs() < 1e-9);
        assert_eq!(loaded.last_run().unwrap().outcome, RunOutcome::Success);
    }

    #[test]
    fn test_is_stale() {
        let mut manifest = Manifest::default();
        let hash = Hash32::hash(b"a");
        assert!(manifest.is_stale("a", &hash));

        manifest.record_hash("a", &hash);
        assert!(!manifest.is_stale("a", &hash));
        assert!(manifest.is_stale("a", &Hash32::hash(b"b")));
        assert_eq!(manifest.stored_hash("a"), Some(hash));
    }

    #[test]
    fn test_commit_all_succeeded() {
        let graph = graph();
        let mut manifest = Manifest::default();
        manifest.record_hash("gone.c", &Hash32::hash(b"x"));

        manifest.commit(&graph, &config(&[]), &both(TaskStatus::Success, TaskStatus::Success));

        assert!(graph.nodes().all(|n| !manifest.is_stale(&n.path, &n.hash)));
        assert!(!manifest.files.contains_key("gone.c"));
        assert_eq!(
            manifest.dependencies.get("docs.md"),
            Some(&BTreeSet::from(["main.c".to_string()]))
        );
        assert!(!manifest.dependencies.contains_key("notes.txt"));
    }

    #[test]
    fn test_commit_holds_files_of_failed_categories() {
        let graph = graph();
        let mut manifest = Manifest::default();

        manifest.commit(&graph, &config(&[]), &both(TaskStatus::Success, TaskStatus::Failed));

        // everything feeding into docs stays stale
        assert!(!manifest.files.contains_key("util.h"));
        assert!(!manifest.files.contains_key("main.c"));
        assert!(!manifest.files.contains_key("docs.md"));
        // affects nothing, always committed
        assert!(manifest.files.contains_key("notes.txt"));
    }

    #[test]
    fn test_commit_holds_files_feeding_failed_declared_consumer() {
        let graph = graph();
        let config = config(&[CategoryDef::new("site").depends_on("code")]);
        let mut manifest = Manifest::default();

        let run = summary(
            RunOutcome::Failed,
            10,
            &[
                ("code", TaskStatus::Success),
                ("docs", TaskStatus::Success),
                ("site", TaskStatus::Failed),
            ],
        );
        manifest.commit(&graph, &config, &run);

        // site consumes code, so code's inputs wait for it
        assert!(!manifest.files.contains_key("util.h"));
        assert!(!manifest.files.contains_key("main.c"));
        assert!(manifest.files.contains_key("docs.md"));
        assert!(manifest.files.contains_key("notes.txt"));
    }

    #[test]
    fn test_removed_file_kept_until_its_category_rebuilt() {
        let graph = graph();
        let config = config(&[]);
        let mut manifest = Manifest::default();
        manifest.record_hash("gone.c", &Hash32::hash(b"x"));
        manifest.record_hash("gone.txt", &Hash32::hash(b"y"));

        manifest.commit(&graph, &config, &both(TaskStatus::Failed, TaskStatus::Skipped));
        assert_eq!(manifest.removed(&graph).collect::<Vec<_>>(), vec!["gone.c"]);

        manifest.commit(&graph, &config, &both(TaskStatus::Success, TaskStatus::Success));
        assert_eq!(manifest.removed(&graph).count(), 0);
    }

    #[test]
    fn test_lost_dependency_stays_pending_until_rebuilt() {
        let config = config(&[]);
        let mut manifest = Manifest::default();
        manifest.commit(&graph(), &config, &both(TaskStatus::Success, TaskStatus::Success));

        // util.h is deleted, main.c still names it
        let after = graph_of(&[
            ("main.c", "util.h", Some("code")),
            ("docs.md", "main.c", Some("docs")),
            ("notes.txt", "", None),
        ]);
        assert!(!manifest.is_stale("main.c", &after.node("main.c").unwrap().hash));
        assert!(manifest.lost_dependency(&after, "main.c"));
        assert!(!manifest.lost_dependency(&after, "docs.md"));

        manifest.commit(&after, &config, &both(TaskStatus::Failed, TaskStatus::Skipped));
        assert!(manifest.lost_dependency(&after, "main.c"));
        assert!(!manifest.files.contains_key("util.h"));

        manifest.commit(&after, &config, &both(TaskStatus::Success, TaskStatus::Success));
        assert!(!manifest.lost_dependency(&after, "main.c"));
        assert!(!manifest.dependencies.contains_key("main.c"));
    }
}
