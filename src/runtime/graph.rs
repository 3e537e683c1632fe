//! Graph builder for wiring pipeline nodes
//!
//! Nodes live in an arena and are addressed by [`NodeId`]. Edges are plain
//! index lists on both ends (`pre_nodes` and subscribers). All wiring happens
//! here, before [`Graph::start`] hands the topology to the [`Scheduler`];
//! the running graph has no wiring API.

use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use super::errors::{RunError, WiringError, WiringResult};
use super::hooks::Hooks;
use super::node::{NodeConfig, NodeType, Stage};
use super::scheduler::Scheduler;
use super::watchdog::{DEFAULT_STALL_THRESHOLD, Watchdog};

/// Unique identifier for a node in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

struct NodeEntry {
    config: NodeConfig,
    node_type: NodeType,
    stage: Box<dyn Stage>,
    hooks: Hooks,
    pre_nodes: Vec<NodeId>,
    subscribers: Vec<NodeId>,
}

/// A pipeline under construction
pub struct Graph {
    nodes: Vec<NodeEntry>,
    node_names: HashMap<String, NodeId>,
    stall_threshold: Duration,
}

impl Graph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            node_names: HashMap::new(),
            stall_threshold: DEFAULT_STALL_THRESHOLD,
        }
    }

    /// How long a stage handler may run before the watchdog reports it
    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    /// Add a node. Node names must be unique.
    pub fn add_node<S: Stage>(
        &mut self,
        config: impl Into<NodeConfig>,
        stage: S,
    ) -> WiringResult<NodeId> {
        let config = config.into();

        if self.node_names.contains_key(&config.name) {
            return Err(WiringError::DuplicateName(config.name));
        }
        if config.batch_size == 0 {
            return Err(WiringError::InvalidBatchSize(config.name));
        }

        let id = NodeId(self.nodes.len());
        let node_type = stage.node_type();
        debug!(
            "Adding {} node '{}' (batch {})",
            node_type, config.name, config.batch_size
        );

        self.node_names.insert(config.name.clone(), id);
        self.nodes.push(NodeEntry {
            config,
            node_type,
            stage: Box::new(stage),
            hooks: Hooks::new(),
            pre_nodes: Vec::new(),
            subscribers: Vec::new(),
        });
        Ok(id)
    }

    fn entry(&self, id: NodeId) -> WiringResult<&NodeEntry> {
        self.nodes.get(id.0).ok_or(WiringError::NodeNotFound(id))
    }

    /// Install hooks on a node, replacing any set before
    pub fn set_hooks(&mut self, id: NodeId, hooks: Hooks) -> WiringResult {
        let entry = self
            .nodes
            .get_mut(id.0)
            .ok_or(WiringError::NodeNotFound(id))?;
        entry.hooks = hooks;
        Ok(())
    }

    /// Subscribe `node` to every node in `pre_nodes`.
    ///
    /// Everything is validated before any edge is added, so a rejected call
    /// leaves the graph untouched. Edges that already exist are skipped.
    pub fn attach_to(&mut self, node: NodeId, pre_nodes: &[NodeId]) -> WiringResult {
        let entry = self.entry(node)?;
        if entry.node_type == NodeType::Source {
            return Err(WiringError::SourceWithPredecessors(entry.config.name.clone()));
        }
        for &pre in pre_nodes {
            let pre_entry = self.entry(pre)?;
            if pre == node {
                return Err(WiringError::SelfAttach(entry.config.name.clone()));
            }
            if pre_entry.node_type == NodeType::Sink {
                return Err(WiringError::SinkAsPredecessor {
                    node: entry.config.name.clone(),
                    pre: pre_entry.config.name.clone(),
                });
            }
        }

        for &pre in pre_nodes {
            if self.nodes[node.0].pre_nodes.contains(&pre) {
                continue;
            }
            self.nodes[pre.0].subscribers.push(node);
            self.nodes[node.0].pre_nodes.push(pre);
            debug!(
                "Attached '{}' -> '{}'",
                self.nodes[pre.0].config.name, self.nodes[node.0].config.name
            );
        }
        Ok(())
    }

    /// Remove `node` from all of its predecessors' subscriber lists
    pub fn detach(&mut self, node: NodeId) -> WiringResult {
        self.entry(node)?;
        let pre_nodes = std::mem::take(&mut self.nodes[node.0].pre_nodes);
        for pre in pre_nodes {
            self.nodes[pre.0].subscribers.retain(|&s| s != node);
        }
        debug!("Detached '{}'", self.nodes[node.0].config.name);
        Ok(())
    }

    /// Nodes subscribed to `node`
    pub fn next_nodes(&self, node: NodeId) -> WiringResult<&[NodeId]> {
        Ok(&self.entry(node)?.subscribers)
    }

    /// Nodes `node` is subscribed to
    pub fn pre_nodes(&self, node: NodeId) -> WiringResult<&[NodeId]> {
        Ok(&self.entry(node)?.pre_nodes)
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.node_names.get(name).copied()
    }

    pub fn node_name(&self, node: NodeId) -> Option<&str> {
        self.nodes.get(node.0).map(|e| e.config.name.as_str())
    }

    pub fn node_type(&self, node: NodeId) -> Option<NodeType> {
        self.nodes.get(node.0).map(|e| e.node_type)
    }

    /// The stage's own description of the node
    pub fn describe(&self, node: NodeId) -> Option<String> {
        self.nodes
            .get(node.0)
            .map(|e| e.stage.describe(&e.config.name))
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of edges
    pub fn num_edges(&self) -> usize {
        self.nodes.iter().map(|e| e.subscribers.len()).sum()
    }

    /// Spawn the handling and dispatch threads of every node.
    ///
    /// All nodes start inactive; send a `Start` control meta (or call
    /// [`Scheduler::start_all`]) to get frames moving.
    pub fn start(self) -> Result<Scheduler, RunError> {
        info!(
            "Starting graph with {} nodes and {} edges",
            self.nodes.len(),
            self.num_edges()
        );

        let mut scheduler = Scheduler::new(Watchdog::with_threshold(self.stall_threshold));

        // Phase 1: create every ingress so subscriber handles exist up front
        let launches: Vec<_> = self
            .nodes
            .into_iter()
            .map(|entry| {
                let subscribers: Vec<usize> = entry.subscribers.iter().map(|id| id.0).collect();
                let launch = scheduler.register(
                    entry.config,
                    entry.node_type,
                    entry.hooks,
                    entry.stage,
                );
                (launch, subscribers)
            })
            .collect();

        // Phase 2: resolve subscribers and spawn the loops
        for (launch, subscribers) in launches {
            scheduler.spawn(launch, &subscribers)?;
        }

        info!("Graph started with {} threads", scheduler.num_threads());
        Ok(scheduler)
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}
