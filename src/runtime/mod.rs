//! Runtime support for real-time media pipelines
//!
//! A node runs two threads: a handling loop (ingress -> stage -> egress) and
//! a dispatch loop (egress -> every subscriber's ingress). Nodes are wired
//! in a [`Graph`] and run by the [`Scheduler`] it starts.

pub mod errors;
mod gate;
pub mod graph;
pub mod hooks;
mod ingress;
pub mod meta;
pub mod node;
pub mod scheduler;
pub mod watchdog;
mod worker;

pub use errors::{
    HandleError, HandleResult, NodeFailure, RunError, WiringError, WiringResult,
};
pub use graph::{Graph, NodeId};
pub use hooks::{HookPoint, Hooks, MetaHook, MetaProbe};
pub use ingress::NodeHandle;
pub use meta::{ControlKind, ControlMeta, FrameMeta, Meta};
pub use node::{NodeConfig, NodeType, Stage};
pub use scheduler::Scheduler;
pub use watchdog::Watchdog;
