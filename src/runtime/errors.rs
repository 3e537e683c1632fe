//! Error types for the runtime system

use std::fmt;

use super::graph::NodeId;
use super::node::NodeType;

/// Error type for graph construction and wiring
#[derive(Debug, thiserror::Error)]
pub enum WiringError {
    #[error("Node {0:?} not found")]
    NodeNotFound(NodeId),

    #[error("Node with name '{0}' already exists")]
    DuplicateName(String),

    #[error("Batch size for node '{0}' must be at least 1")]
    InvalidBatchSize(String),

    #[error("Source node '{0}' must not have any previous nodes")]
    SourceWithPredecessors(String),

    #[error("Sink node '{pre}' must not have any next nodes (attaching '{node}')")]
    SinkAsPredecessor { node: String, pre: String },

    #[error("Node '{0}' cannot be attached to itself")]
    SelfAttach(String),
}

/// Error type for stage handlers
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error("Node-specific error: {0}")]
    NodeError(String),

    #[error("Shutdown signal received")]
    Shutdown,
}

/// A node that stopped because its stage failed
#[derive(Debug)]
pub struct NodeFailure {
    pub node: String,
    pub node_type: NodeType,
    pub reason: String,
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] ({}) {}", self.node, self.node_type, self.reason)
    }
}

/// Error type for starting and joining a running graph
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Failed to spawn thread for node '{node}': {source}")]
    Spawn {
        node: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{} node(s) failed: {}", .0.len(), join_failures(.0))]
    NodesFailed(Vec<NodeFailure>),
}

fn join_failures(failures: &[NodeFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for wiring operations
pub type WiringResult<T = ()> = Result<T, WiringError>;

/// Result type for stage handlers
pub type HandleResult<T = ()> = Result<T, HandleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nodes_failed_lists_every_node() {
        let err = RunError::NodesFailed(vec![
            NodeFailure {
                node: "detector".to_string(),
                node_type: NodeType::Middle,
                reason: "model missing".to_string(),
            },
            NodeFailure {
                node: "screen".to_string(),
                node_type: NodeType::Sink,
                reason: "panicked".to_string(),
            },
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("2 node(s) failed"));
        assert!(msg.contains("[detector] (middle) model missing"));
        assert!(msg.contains("[screen] (sink) panicked"));
    }
}
