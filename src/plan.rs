//! Task planning: turns a build scope into a DAG of tasks.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;
use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::config::{Config, find_category_cycle};
use crate::core::ArcStr;
use crate::error::ConfigError;
use crate::graph::DependencyGraph;
use crate::scope::{BuildTarget, Scope};

/// Identifier of a task within one plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub usize);

impl TaskId {
    pub(crate) fn index(self) -> NodeIndex {
        NodeIndex::new(self.0)
    }
}

impl From<NodeIndex> for TaskId {
    fn from(index: NodeIndex) -> Self {
        Self(index.index())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything an executor needs to know about a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub id: TaskId,
    pub category: ArcStr,
    /// Member files, relative to `root`, in lexical order.
    pub files: Vec<ArcStr>,
    pub root: Utf8PathBuf,
    /// Output location, already resolved against `root`.
    pub output: Utf8PathBuf,
    pub command: Option<String>,
    pub estimated_cost: u64,
}

impl TaskSpec {
    pub fn name(&self) -> &str {
        &self.category
    }
}

/// The tasks of a run and the order constraints between them.
///
/// Edges point from a dependency to its dependent, the same direction as in
/// the file graph.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    graph: Graph<Arc<TaskSpec>, ()>,
}

impl Plan {
    /// Plans one task per target of the scope.
    ///
    /// A task depends on the tasks of every category owning a file one of its
    /// members depends on, and on its declared category dependencies. Only
    /// categories which are part of the plan count.
    pub fn new(scope: &Scope, graph: &DependencyGraph, config: &Config) -> Result<Self, ConfigError> {
        let mut tasks: Graph<Arc<TaskSpec>, ()> = Graph::with_capacity(scope.targets.len(), 0);
        let mut by_category: BTreeMap<&str, NodeIndex> = BTreeMap::new();

        for target in &scope.targets {
            let id = TaskId(tasks.node_count());
            let spec = TaskSpec {
                id,
                category: target.category.clone(),
                files: target.members.iter().cloned().collect(),
                root: config.root().to_owned(),
                output: config.root().join(&target.output),
                command: target.command.clone(),
                estimated_cost: estimate_cost(target, graph),
            };
            let index = tasks.add_node(Arc::new(spec));
            by_category.insert(&target.category, index);
        }

        let mut requires: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for target in &scope.targets {
            let mut dependencies: BTreeSet<&str> = target
                .members
                .iter()
                .flat_map(|member| graph.dependencies_of(member))
                .filter_map(|dependency| graph.node(dependency)?.category.as_deref())
                .collect();
            dependencies.extend(target.depends_on.iter().map(|d| &**d));
            dependencies.remove(&*target.category);
            dependencies.retain(|d| by_category.contains_key(d));

            let index = by_category[&*target.category];
            for dependency in &dependencies {
                tasks.add_edge(by_category[dependency], index, ());
            }

            requires.insert(&target.category, dependencies.into_iter().collect());
        }

        if petgraph::algo::toposort(&tasks, None).is_err() {
            let cycle = find_category_cycle(&requires).unwrap_or_default();
            return Err(ConfigError::CategoryCycle(cycle));
        }

        tracing::info!(tasks = tasks.node_count(), edges = tasks.edge_count(), "Planned tasks");

        Ok(Self { graph: tasks })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Tasks in plan order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskSpec> {
        self.graph.node_weights().map(|spec| &**spec)
    }

    pub fn task(&self, id: TaskId) -> Option<&TaskSpec> {
        self.graph.node_weight(id.index()).map(|spec| &**spec)
    }

    pub fn task_for(&self, category: &str) -> Option<&TaskSpec> {
        self.tasks().find(|task| &*task.category == category)
    }

    pub(crate) fn shared(&self, id: TaskId) -> Arc<TaskSpec> {
        self.graph[id.index()].clone()
    }

    /// Tasks that must finish before `id` may start, in ascending order.
    pub fn dependencies(&self, id: TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks waiting on `id`, in ascending order.
    pub fn dependents(&self, id: TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Tasks which can start right away.
    pub fn roots(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.graph
            .node_indices()
            .filter(|&i| self.graph.neighbors_directed(i, Direction::Incoming).next().is_none())
            .map(TaskId::from)
    }

    fn neighbors(&self, id: TaskId, direction: Direction) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(id.index(), direction)
            .map(TaskId::from)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Total size of the member files, scaled by the category weight.
fn estimate_cost(target: &BuildTarget, graph: &DependencyGraph) -> u64 {
    target
        .members
        .iter()
        .filter_map(|member| graph.node(member))
        .fold(0u64, |acc, node| acc.saturating_add(node.size))
        .saturating_mul(target.weight)
}
