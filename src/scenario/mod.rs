//! Scenario graph model: typed nodes, labeled edges, validation, and the
//! compiled arena form the interpreter walks.
//!
//! A scenario is a directed graph. Stored graphs arrive as JSON with
//! camelCase keys and possibly extra vendor keys; unknown keys are kept in
//! a pass-through carrier so round-tripping a stored scenario is lossless,
//! while interpreter dispatch happens over the typed [`NodeKind`] variants
//! only.
//!
//! # Well-formedness
//!
//! [`ScenarioGraph::compile`] enforces:
//!
//! - exactly one `Start` node, from which every node is reachable;
//! - `Condition` nodes carry both a `yes` and a `no` out-edge;
//! - `Loop` nodes carry at most one `loop` back-edge and one `exit` edge;
//! - `Start`/`Action` nodes have exactly one unlabeled out-edge;
//! - at most [`MAX_NODES`] nodes and [`MAX_EDGES`] edges.

pub mod migrate;
pub mod params;

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

pub use params::{ActionParams, ConditionParams, SwipeDirection};

/// Scenario identifier.
pub type ScenarioId = String;

/// Upper bound on nodes per scenario.
pub const MAX_NODES: usize = 500;

/// Upper bound on edges per scenario.
pub const MAX_EDGES: usize = 1_000;

/// Branch label on an out-edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeLabel {
    Yes,
    No,
    Loop,
    Exit,
}

/// A directed edge between two node ids. Unlabeled edges are the default
/// fall-through path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<EdgeLabel>,
}

/// Node payload, tagged by the `type` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeKind {
    Start,
    End,

    #[serde(rename_all = "camelCase")]
    Action {
        #[serde(flatten)]
        params: ActionParams,
        /// Re-run the action on failure up to this many times.
        #[serde(default)]
        max_retries: u32,
        /// Pause between retry attempts in milliseconds.
        #[serde(default = "params::default_retry_interval")]
        retry_interval: u64,
        /// Per-call driver timeout override in milliseconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
    },

    Condition {
        #[serde(flatten)]
        condition: ConditionParams,
    },

    #[serde(rename_all = "camelCase")]
    Loop {
        /// Iterations of the `loop` back-edge before taking `exit`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        loop_count: Option<u32>,
        /// When `loop_count` is unset, loop until this condition holds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        break_condition: Option<ConditionParams>,
    },
}

impl NodeKind {
    /// Variant name for telemetry.
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::End => "end",
            NodeKind::Action { .. } => "action",
            NodeKind::Condition { .. } => "condition",
            NodeKind::Loop { .. } => "loop",
        }
    }
}

/// One node of a scenario graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Stable id, unique within the scenario.
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Unknown keys from stored graphs, preserved on round-trip.
    #[serde(flatten, default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            kind,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// A stored scenario graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub id: ScenarioId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    /// Unknown top-level keys, preserved on round-trip.
    #[serde(flatten, default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Scenario {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            package: None,
            category: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        label: Option<EdgeLabel>,
    ) -> Self {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
            label,
        });
        self
    }
}

/// Structural problems found while compiling a scenario graph.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Scenario has no start node")]
    MissingStart,

    #[error("Scenario has {0} start nodes, expected exactly one")]
    MultipleStart(usize),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Edge references unknown node: {0}")]
    UnknownNode(String),

    #[error("Scenario has {0} nodes, limit is {MAX_NODES}")]
    TooManyNodes(usize),

    #[error("Scenario has {0} edges, limit is {MAX_EDGES}")]
    TooManyEdges(usize),

    #[error("Node {0} is unreachable from start")]
    Unreachable(String),

    #[error("Condition node {node} is missing its '{branch}' edge")]
    MissingBranch { node: String, branch: &'static str },

    #[error("Node {node} has more than one '{branch}' edge")]
    DuplicateBranch { node: String, branch: &'static str },

    #[error("Node {node} must have exactly one unlabeled out-edge, found {count}")]
    AmbiguousOutEdge { node: String, count: usize },
}

/// Compiled edge using arena indices.
#[derive(Debug, Clone, Copy)]
pub struct CompiledEdge {
    pub from: usize,
    pub to: usize,
    pub label: Option<EdgeLabel>,
}

/// Validated, index-based form of a scenario graph.
#[derive(Debug)]
pub struct ScenarioGraph {
    nodes: Vec<Node>,
    edges: Vec<CompiledEdge>,
    out: Vec<Vec<usize>>,
    start: usize,
}

impl ScenarioGraph {
    /// Validates a scenario and compiles it into arena form.
    pub fn compile(scenario: &Scenario) -> Result<Self, GraphError> {
        if scenario.nodes.len() > MAX_NODES {
            return Err(GraphError::TooManyNodes(scenario.nodes.len()));
        }
        if scenario.edges.len() > MAX_EDGES {
            return Err(GraphError::TooManyEdges(scenario.edges.len()));
        }

        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, node) in scenario.nodes.iter().enumerate() {
            if index.insert(node.id.as_str(), i).is_some() {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
        }

        let starts: Vec<usize> = scenario
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.kind == NodeKind::Start)
            .map(|(i, _)| i)
            .collect();
        let start = match starts.as_slice() {
            [] => return Err(GraphError::MissingStart),
            [single] => *single,
            many => return Err(GraphError::MultipleStart(many.len())),
        };

        let mut edges = Vec::with_capacity(scenario.edges.len());
        let mut out: Vec<Vec<usize>> = vec![Vec::new(); scenario.nodes.len()];
        for edge in &scenario.edges {
            let from = *index
                .get(edge.from.as_str())
                .ok_or_else(|| GraphError::UnknownNode(edge.from.clone()))?;
            let to = *index
                .get(edge.to.as_str())
                .ok_or_else(|| GraphError::UnknownNode(edge.to.clone()))?;
            out[from].push(edges.len());
            edges.push(CompiledEdge {
                from,
                to,
                label: edge.label,
            });
        }

        let graph = Self {
            nodes: scenario.nodes.clone(),
            edges,
            out,
            start,
        };
        graph.check_branches()?;
        graph.check_reachability()?;
        Ok(graph)
    }

    fn check_branches(&self) -> Result<(), GraphError> {
        for (i, node) in self.nodes.iter().enumerate() {
            let labels: Vec<Option<EdgeLabel>> =
                self.out_edges(i).map(|e| e.label).collect();
            let count_of = |label: Option<EdgeLabel>| {
                labels.iter().filter(|l| **l == label).count()
            };

            match &node.kind {
                NodeKind::Condition { .. } => {
                    for (label, name) in [(EdgeLabel::Yes, "yes"), (EdgeLabel::No, "no")] {
                        match count_of(Some(label)) {
                            0 => {
                                return Err(GraphError::MissingBranch {
                                    node: node.id.clone(),
                                    branch: name,
                                });
                            }
                            1 => {}
                            _ => {
                                return Err(GraphError::DuplicateBranch {
                                    node: node.id.clone(),
                                    branch: name,
                                });
                            }
                        }
                    }
                }
                NodeKind::Loop { .. } => {
                    for (label, name) in [(EdgeLabel::Loop, "loop"), (EdgeLabel::Exit, "exit")] {
                        if count_of(Some(label)) > 1 {
                            return Err(GraphError::DuplicateBranch {
                                node: node.id.clone(),
                                branch: name,
                            });
                        }
                    }
                }
                NodeKind::Start | NodeKind::Action { .. } => {
                    let count = count_of(None);
                    if count != 1 || labels.len() != 1 {
                        return Err(GraphError::AmbiguousOutEdge {
                            node: node.id.clone(),
                            count: labels.len(),
                        });
                    }
                }
                NodeKind::End => {}
            }
        }
        Ok(())
    }

    fn check_reachability(&self) -> Result<(), GraphError> {
        let mut seen: HashSet<usize> = HashSet::new();
        let mut queue = VecDeque::from([self.start]);
        seen.insert(self.start);
        while let Some(i) = queue.pop_front() {
            for edge in self.out_edges(i) {
                if seen.insert(edge.to) {
                    queue.push_back(edge.to);
                }
            }
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if !seen.contains(&i) {
                return Err(GraphError::Unreachable(node.id.clone()));
            }
        }
        Ok(())
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn out_edges(&self, idx: usize) -> impl Iterator<Item = &CompiledEdge> {
        self.out[idx].iter().map(|e| &self.edges[*e])
    }

    /// Follows the out-edge with the given label, if present.
    pub fn follow(&self, idx: usize, label: Option<EdgeLabel>) -> Option<usize> {
        self.out_edges(idx)
            .find(|e| e.label == label)
            .map(|e| e.to)
    }
}

#[cfg(test)]
pub(crate) mod test_graphs {
    use super::*;

    /// start → tap → end
    pub fn linear() -> Scenario {
        Scenario::new("linear", "Linear")
            .with_node(Node::new("start", NodeKind::Start))
            .with_node(Node::new(
                "tap1",
                NodeKind::Action {
                    params: ActionParams::Tap {
                        x: None,
                        y: None,
                        x_percent: Some(0.5),
                        y_percent: Some(0.5),
                    },
                    max_retries: 0,
                    retry_interval: 10,
                    timeout: None,
                },
            ))
            .with_node(Node::new("end", NodeKind::End))
            .with_edge("start", "tap1", None)
            .with_edge("tap1", "end", None)
    }
}
