//! Real-time media pipeline engine with a thread-per-node runtime
//!
//! Frames and control messages ("metas") flow through a directed graph of
//! nodes. Each node runs a user-supplied [`Stage`] on its own handling thread
//! and broadcasts results to its subscribers from a separate dispatch thread.
//!
//! # Architecture
//!
//! - **Graph**: arena of nodes, wired with `attach_to` before anything runs
//! - **Scheduler**: owns the two threads per node, start/stop/shutdown
//! - **Stages**: `Source`, `Middle` and `Sink` behavior, optional batching
//! - **Hooks**: observe metas arriving, being handled and leaving a node
//!
//! # Example
//!
//! ```no_run
//! use framegraph::nodes::{FrameCollector, FrameGenerator, Passthrough};
//! use framegraph::Graph;
//!
//! let mut graph = Graph::new();
//! let src = graph.add_node("cam0", FrameGenerator::new(0, 1280, 720, 25).with_limit(100))?;
//! let osd = graph.add_node("osd", Passthrough::new())?;
//! let (collector, frames) = FrameCollector::new();
//! let sink = graph.add_node("sink", collector)?;
//! graph.attach_to(osd, &[src])?;
//! graph.attach_to(sink, &[osd])?;
//!
//! let scheduler = graph.start()?;
//! scheduler.start_all();
//! for meta in frames.iter().take(100) {
//!     println!("{}", meta);
//! }
//! scheduler.shutdown();
//! scheduler.wait()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod nodes;
pub mod runtime;

pub use runtime::{
    ControlKind, ControlMeta, FrameMeta, Graph, HandleError, HandleResult, HookPoint, Hooks,
    Meta, MetaProbe, NodeConfig, NodeFailure, NodeHandle, NodeId, NodeType, RunError, Scheduler,
    Stage, WiringError, WiringResult,
};
