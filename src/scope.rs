//! Build scope resolution: which targets does this run have to rebuild?

use std::collections::{BTreeMap, BTreeSet, HashSet};

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::{Category, Config};
use crate::core::ArcStr;
use crate::error::ConfigError;
use crate::graph::{DependencyGraph, Ordering};
use crate::manifest::Manifest;

/// Everything belonging to one category, rebuilt as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTarget {
    pub category: ArcStr,
    pub members: BTreeSet<ArcStr>,
    pub output: Utf8PathBuf,
    /// Declared category level dependencies.
    pub depends_on: Vec<ArcStr>,
    pub weight: u64,
    pub command: Option<String>,
}

impl BuildTarget {
    fn new(category: &Category, members: BTreeSet<ArcStr>) -> Self {
        Self {
            category: category.name.clone(),
            members,
            output: category.output.clone(),
            depends_on: category.depends_on.clone(),
            weight: category.weight,
            command: category.command.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    /// Files whose content differs from the manifest.
    pub stale: BTreeSet<ArcStr>,
    /// Files recorded in the manifest which no longer exist.
    pub removed: BTreeSet<ArcStr>,
    /// Stale files, files which lost a dependency, and everything
    /// transitively depending on them.
    pub dirty: BTreeSet<ArcStr>,
    /// Included targets, keyed by category, in configuration order.
    pub targets: Vec<BuildTarget>,
}

impl Scope {
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn target(&self, category: &str) -> Option<&BuildTarget> {
        self.targets.iter().find(|t| &*t.category == category)
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(|t| &*t.category)
    }
}

/// Works out the targets to rebuild.
///
/// A file is dirty when it is stale, when a file it depended on was removed,
/// or when any of its dependencies is dirty. Walking the topological order
/// once is enough to propagate that, since every dependency is visited before
/// its dependents. A target is included when forced, when one of its members
/// is dirty or was removed, or when a category it declares a dependency on is
/// included.
///
/// `requested` restricts the result to the named categories, an empty slice
/// means all of them.
pub fn resolve(
    graph: &DependencyGraph,
    ordering: &Ordering,
    manifest: &Manifest,
    config: &Config,
    requested: &[&str],
    force_all: bool,
) -> Result<Scope, ConfigError> {
    for name in requested {
        if config.category(name).is_none() {
            return Err(ConfigError::UnknownCategory(name.to_string()));
        }
    }

    let stale: BTreeSet<ArcStr> = graph
        .nodes()
        .filter(|node| manifest.is_stale(&node.path, &node.hash))
        .map(|node| node.path.clone())
        .collect();

    let removed: BTreeSet<ArcStr> = manifest.removed(graph).map(ArcStr::from).collect();

    let mut dirty: HashSet<&str> = HashSet::with_capacity(stale.len());
    for path in ordering.iter() {
        let is_dirty = stale.contains(path)
            || manifest.lost_dependency(graph, path)
            || graph
                .dependencies_of(path)
                .any(|dependency| dirty.contains(&**dependency));
        if is_dirty {
            dirty.insert(path);
        }
    }

    let mut members: BTreeMap<&str, BTreeSet<ArcStr>> = BTreeMap::new();
    for node in graph.nodes() {
        if let Some(category) = &node.category {
            members.entry(category).or_default().insert(node.path.clone());
        }
    }

    let vacated: HashSet<&str> = removed
        .iter()
        .filter_map(|path| config.categorize(Utf8Path::new(&**path)))
        .map(|category| &*category.name)
        .collect();

    let included = config.downstream(
        config
            .categories()
            .iter()
            .filter(|category| {
                force_all
                    || vacated.contains(&*category.name)
                    || members
                        .get(&*category.name)
                        .is_some_and(|files| files.iter().any(|f| dirty.contains(&**f)))
            })
            .map(|category| &*category.name),
    );

    let targets: Vec<BuildTarget> = config
        .categories()
        .iter()
        .filter(|category| included.contains(&*category.name))
        .filter(|category| requested.is_empty() || requested.contains(&&*category.name))
        .map(|category| {
            let files = members.get(&*category.name).cloned().unwrap_or_default();
            BuildTarget::new(category, files)
        })
        .collect();

    let dirty: BTreeSet<ArcStr> = ordering
        .iter()
        .filter(|path| dirty.contains(&***path))
        .cloned()
        .collect();

    tracing::info!(
        stale = stale.len(),
        removed = removed.len(),
        dirty = dirty.len(),
        targets = targets.len(),
        "Resolved build scope"
    );

    Ok(Scope {
        stale,
        removed,
        dirty,
        targets,
    })
}
