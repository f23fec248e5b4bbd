//! Operation graph: the intermediate representation a recipe is compiled
//! into before execution.

use crate::{
    canonical,
    error::{Error, Result},
    Digest, Platform,
};
use serde::Serialize;
use std::{
    cmp::Reverse,
    collections::{BTreeMap, BinaryHeap, HashMap},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationKind {
    /// Materialize a base filesystem (image pull, stage reference, or scratch)
    Source,
    /// Run a command against the accumulated filesystem
    Exec,
    /// Import files from the build context or a prior stage
    File,
    /// Mutate image metadata without touching the filesystem
    Meta,
}

/// Immutable IR node. Created by the engine from recipe instructions and
/// never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct Operation {
    pub kind: OperationKind,
    /// For Exec: argv (shell form arrives as `[sh, -c, script]`).
    /// For File: leading verb `copy` or `add`, then sources and destination.
    pub command: Vec<String>,
    /// Output IDs of prior operations, plus absolute host paths for File
    pub inputs: Vec<String>,
    /// IDs this operation produces
    pub outputs: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Image reference, destination path, labels, stage alias, ...
    pub metadata: BTreeMap<String, String>,
    pub workdir: String,
    pub user: String,
    pub platform: Platform,
}

/// The hashed view of an operation. `outputs` is deliberately absent so that
/// operations differing only in output labels share one cache key.
#[derive(Serialize)]
struct CacheKeyView<'a> {
    kind: OperationKind,
    command: &'a [String],
    inputs: &'a [String],
    env: &'a BTreeMap<String, String>,
    metadata: &'a BTreeMap<String, String>,
    workdir: &'a str,
    user: &'a str,
    platform: &'a Platform,
}

impl Operation {
    /// Cache key: SHA-256 over the canonical JSON of the operation content.
    pub fn cache_key(&self) -> Result<Digest> {
        canonical::digest_of(&CacheKeyView {
            kind: self.kind,
            command: &self.command,
            inputs: &self.inputs,
            env: &self.env,
            metadata: &self.metadata,
            workdir: &self.workdir,
            user: &self.user,
            platform: &self.platform,
        })
    }

    /// Human-readable provenance line recorded in layer history.
    pub fn created_by(&self) -> String {
        match self.kind {
            OperationKind::Exec => format!("RUN {}", self.command.join(" ")),
            OperationKind::File => self.command.join(" "),
            OperationKind::Source => format!(
                "FROM {}",
                self.metadata.get("image").map(String::as_str).unwrap_or("?")
            ),
            OperationKind::Meta => self.command.join(" "),
        }
    }
}

#[derive(Debug)]
struct Node {
    id: String,
    op: Operation,
    dependencies: Vec<usize>,
    dependents: Vec<usize>,
}

/// Directed acyclic graph of operations, insertion-ordered.
#[derive(Default, Debug)]
pub struct BuildGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl BuildGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_node(&mut self, id: &str, op: Operation) -> Result<()> {
        if self.index.contains_key(id) {
            return Err(Error::DuplicateNode(id.to_string()));
        }
        self.index.insert(id.to_string(), self.nodes.len());
        self.nodes.push(Node {
            id: id.to_string(),
            op,
            dependencies: Vec::new(),
            dependents: Vec::new(),
        });
        Ok(())
    }

    /// Record that `id` consumes the outputs of `depends_on`.
    pub fn add_dependency(&mut self, id: &str, depends_on: &str) -> Result<()> {
        let node = *self
            .index
            .get(id)
            .ok_or_else(|| Error::MissingNode(id.to_string()))?;
        let dep = *self
            .index
            .get(depends_on)
            .ok_or_else(|| Error::MissingNode(depends_on.to_string()))?;
        if !self.nodes[node].dependencies.contains(&dep) {
            self.nodes[node].dependencies.push(dep);
            self.nodes[dep].dependents.push(node);
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Operation> {
        self.index.get(id).map(|&i| &self.nodes[i].op)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.id.as_str())
    }

    /// Kahn's algorithm with insertion order breaking ties, so the result is
    /// stable across runs: every dependency precedes its dependents.
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.dependencies.len()).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(next)) = ready.pop() {
            order.push(self.nodes[next].id.clone());
            for &dependent in &self.nodes[next].dependents {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }
        if order.len() != self.nodes.len() {
            let stuck = in_degree
                .iter()
                .position(|&d| d > 0)
                .map(|i| self.nodes[i].id.clone())
                .unwrap_or_default();
            return Err(Error::GraphCycle(stuck));
        }
        Ok(order)
    }

    /// Cycle detection by DFS recursion-stack coloring.
    pub fn has_cycles(&self) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        fn visit(graph: &BuildGraph, node: usize, colors: &mut [Color]) -> bool {
            colors[node] = Color::Gray;
            for &dep in &graph.nodes[node].dependencies {
                match colors[dep] {
                    Color::Gray => return true,
                    Color::White => {
                        if visit(graph, dep, colors) {
                            return true;
                        }
                    }
                    Color::Black => {}
                }
            }
            colors[node] = Color::Black;
            false
        }

        let mut colors = vec![Color::White; self.nodes.len()];
        (0..self.nodes.len())
            .any(|i| colors[i] == Color::White && visit(self, i, &mut colors))
    }

    /// Prune Meta nodes nothing depends on and whose metadata does not
    /// outlive the current stage. Nodes with dependents are never removed.
    pub fn optimize(&mut self) {
        let removable: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| {
                n.op.kind == OperationKind::Meta
                    && n.dependents.is_empty()
                    && !n.op.metadata.keys().any(|k| metadata_persists(k))
            })
            .map(|(i, _)| i)
            .collect();
        if removable.is_empty() {
            return;
        }
        for &i in removable.iter().rev() {
            log::debug!("pruning dead metadata node {}", self.nodes[i].id);
            let node = self.nodes.remove(i);
            self.index.remove(&node.id);
            for other in &mut self.nodes {
                other.dependencies.retain(|&d| d != i);
                other.dependents.retain(|&d| d != i);
                for d in other
                    .dependencies
                    .iter_mut()
                    .chain(other.dependents.iter_mut())
                {
                    if *d > i {
                        *d -= 1;
                    }
                }
            }
        }
        self.index = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
    }
}

/// Metadata keys that must survive stage boundaries into the image config.
fn metadata_persists(key: &str) -> bool {
    matches!(
        key,
        "cmd" | "entrypoint" | "env" | "workdir" | "user" | "expose" | "volume"
    ) || key.starts_with("label.")
}
