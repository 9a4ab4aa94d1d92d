//! The file level dependency graph.
//!
//! Nodes live in an ordered map keyed by their root-relative path, and refer
//! to each other by key only. Edges point from a dependency to its
//! dependent: if `main.c` includes `util.h`, the edge is `util.h -> main.c`.
//! Both the cycle detector and the topological sorter walk the graph in that
//! direction.
//!
//! Once built the graph is never mutated. Every later stage of the pipeline
//! borrows it read-only.

mod cycle;
mod order;

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Instant, SystemTime};

use camino::Utf8Path;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::core::{ArcStr, Hash32};
use crate::extract::DependencyExtractor;
use crate::scan::{FileEntry, FileInventory};

pub use crate::graph::cycle::{Cycle, find_cycle};
pub use crate::graph::order::{Ordering, sort};

/// A file and its position in the dependency graph.
#[derive(Debug, Clone)]
pub struct FileNode {
    pub path: ArcStr,
    pub hash: Hash32,
    pub modified: Option<SystemTime>,
    pub size: u64,
    pub category: Option<ArcStr>,
    /// Files this file references.
    pub dependencies: BTreeSet<ArcStr>,
    /// Files referencing this file. Derived from `dependencies`.
    pub dependents: BTreeSet<ArcStr>,
}

/// A derived `(dependency, dependent)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DependencyEdge<'a> {
    pub dependency: &'a str,
    pub dependent: &'a str,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<ArcStr, FileNode>,
}

impl DependencyGraph {
    /// Builds the graph for an inventory.
    ///
    /// The extractor runs once per file, in parallel. References which do not
    /// resolve to another file of the inventory are dropped, as are self
    /// references. The result only depends on the inventory contents, never on
    /// the order in which files were discovered.
    pub fn build<E>(inventory: &FileInventory, extractor: &E) -> Self
    where
        E: DependencyExtractor + ?Sized,
    {
        let s = Instant::now();
        let entries: Vec<&FileEntry> = inventory.iter().collect();

        let resolved: Vec<(ArcStr, BTreeSet<ArcStr>)> = entries
            .par_iter()
            .map(|entry| {
                let path = Utf8Path::new(&*entry.path);
                let references = extractor.extract(&entry.content_str(), path);

                let dependencies = references
                    .iter()
                    .filter_map(|reference| resolve_reference(reference, &entry.path, inventory))
                    .collect::<BTreeSet<_>>();

                (entry.path.clone(), dependencies)
            })
            .collect();

        let mut nodes: BTreeMap<ArcStr, FileNode> = entries
            .iter()
            .map(|entry| {
                let node = FileNode {
                    path: entry.path.clone(),
                    hash: entry.hash,
                    modified: entry.modified,
                    size: entry.size,
                    category: entry.category.clone(),
                    dependencies: BTreeSet::new(),
                    dependents: BTreeSet::new(),
                };
                (entry.path.clone(), node)
            })
            .collect();

        for (path, dependencies) in resolved {
            for dependency in &dependencies {
                if let Some(node) = nodes.get_mut(dependency) {
                    node.dependents.insert(path.clone());
                }
            }

            if let Some(node) = nodes.get_mut(&path) {
                node.dependencies = dependencies;
            }
        }

        let graph = Self { nodes };

        tracing::debug!(
            nodes = graph.len(),
            edges = graph.edge_count(),
            elapsed = ?s.elapsed(),
            "Built dependency graph"
        );

        graph
    }

    pub fn node(&self, path: &str) -> Option<&FileNode> {
        self.nodes.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    /// Nodes in lexical path order.
    pub fn nodes(&self) -> impl DoubleEndedIterator<Item = &FileNode> {
        self.nodes.values()
    }

    pub fn paths(&self) -> impl DoubleEndedIterator<Item = &ArcStr> {
        self.nodes.keys()
    }

    pub fn dependencies_of(&self, path: &str) -> impl DoubleEndedIterator<Item = &ArcStr> {
        self.nodes
            .get(path)
            .into_iter()
            .flat_map(|node| node.dependencies.iter())
    }

    pub fn dependents_of(&self, path: &str) -> impl DoubleEndedIterator<Item = &ArcStr> {
        self.nodes
            .get(path)
            .into_iter()
            .flat_map(|node| node.dependents.iter())
    }

    /// All edges, ordered by dependency then dependent.
    pub fn edges(&self) -> impl Iterator<Item = DependencyEdge<'_>> {
        self.nodes.values().flat_map(|node| {
            node.dependents.iter().map(move |dependent| DependencyEdge {
                dependency: &node.path,
                dependent,
            })
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.nodes.values().map(|n| n.dependencies.len()).sum()
    }
}

/// Maps a raw reference found in `from` onto a file of the inventory.
///
/// Candidates are tried in order: the reference relative to the referencing
/// file's directory, then relative to the project root (skipped for `./` and
/// `../` references), each also with the referencing file's extension
/// appended when the reference has none.
fn resolve_reference(reference: &str, from: &str, inventory: &FileInventory) -> Option<ArcStr> {
    let from_path = Utf8Path::new(from);
    let base = from_path.parent().map(Utf8Path::as_str).unwrap_or("");
    let extension = from_path.extension();

    let mut candidates = Vec::with_capacity(4);

    if let Some(absolute) = reference.strip_prefix('/') {
        candidates.extend(normalize(absolute));
    } else {
        candidates.extend(normalize(&format!("{base}/{reference}")));
        if !reference.starts_with("./") && !reference.starts_with("../") {
            candidates.extend(normalize(reference));
        }
    }

    let has_extension = Utf8Path::new(reference).extension().is_some();

    candidates
        .into_iter()
        .flat_map(|candidate| {
            let with_ext = match extension {
                Some(ext) if !has_extension => Some(format!("{candidate}.{ext}")),
                _ => None,
            };
            std::iter::once(candidate).chain(with_ext)
        })
        .find_map(|candidate| {
            if candidate == from {
                return None;
            }
            inventory.get(&candidate).map(|entry| entry.path.clone())
        })
}

/// Collapses `.` and `..` segments. Returns `None` for paths escaping the root.
fn normalize(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
