//! Stage trait for pipeline nodes
//!
//! Defines the [`Stage`] trait that every concrete node implements, the
//! [`NodeType`] that drives wiring rules, and [`NodeConfig`] with the per-node
//! construction parameters. The runtime owns the queues and threads; a stage
//! only supplies handler bodies.

use std::fmt;
use std::sync::Arc;

pub use super::errors::{HandleError, HandleResult};
use super::meta::{ControlMeta, FrameMeta, Meta};

/// Position of a node in the graph
/// - Sources have no predecessors
/// - Sinks never forward anything downstream
/// - Middle nodes do both
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Source,
    Middle,
    Sink,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            NodeType::Source => "source",
            NodeType::Middle => "middle",
            NodeType::Sink => "sink",
        };
        f.write_str(s)
    }
}

/// A processing stage.
///
/// All handlers run on the node's handling thread, one meta at a time, so
/// `&mut self` is never contended. The default handlers forward their input
/// unchanged, which makes a bare `impl Stage for X {}` an identity middle node.
pub trait Stage: Send + 'static {
    /// Node type used for wiring validation and forwarding rules
    fn node_type(&self) -> NodeType {
        NodeType::Middle
    }

    /// Called once on the handling thread before anything else.
    /// An error here fails the node.
    fn prepare(&mut self, _node_name: &str) -> HandleResult {
        Ok(())
    }

    /// Human-readable description. Defaults to the node name.
    fn describe(&self, node_name: &str) -> String {
        node_name.to_string()
    }

    /// Handle one frame when the batch size is 1.
    /// Returning `Ok(None)` swallows the frame.
    fn handle_frame_meta(&mut self, meta: Arc<FrameMeta>) -> HandleResult<Option<Meta>> {
        Ok(Some(Meta::Frame(meta)))
    }

    /// Handle a full batch when the batch size is greater than 1.
    ///
    /// The members of `batch` are forwarded afterwards in order, so any
    /// change made here (via `Arc::make_mut`) is what downstream sees.
    fn handle_frame_batch(&mut self, _batch: &mut [Arc<FrameMeta>]) -> HandleResult {
        Ok(())
    }

    /// Handle a control meta. The node's active flag has already been
    /// updated by the time this runs. Forwarding the meta is what propagates
    /// start/stop downstream.
    fn handle_control_meta(&mut self, meta: ControlMeta) -> HandleResult<Option<Meta>> {
        Ok(Some(Meta::Control(meta)))
    }

    /// Produce the next meta. Only called on `Source` nodes while active.
    ///
    /// May block (e.g. waiting on a capture device). `Ok(None)` means the
    /// source is exhausted and will not be polled again.
    fn produce(&mut self) -> HandleResult<Option<Meta>> {
        Ok(None)
    }
}

/// Per-node construction parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub name: String,
    /// Number of frames buffered before `handle_frame_batch` runs.
    /// 1 disables batching.
    pub batch_size: usize,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batch_size: 1,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

impl From<&str> for NodeConfig {
    fn from(name: &str) -> Self {
        NodeConfig::new(name)
    }
}

impl From<String> for NodeConfig {
    fn from(name: String) -> Self {
        NodeConfig::new(name)
    }
}
