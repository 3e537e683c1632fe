//! Ingress side of a node: the only way a meta enters it
//!
//! A [`NodeHandle`] is cheap to clone and is what upstream dispatch loops (and
//! external injectors) hold for every subscriber. The ingress queue is an
//! unbounded crossbeam channel: many producers, one consumer (the node's
//! handling loop).

use crossbeam_channel::{Receiver as CrossbeamReceiver, Sender as CrossbeamSender};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::{debug, trace};

use super::gate::Gate;
use super::hooks::{HookPoint, Hooks};
use super::meta::{ControlKind, Meta};
use super::node::NodeType;

pub(crate) struct NodeShared {
    pub(crate) name: String,
    pub(crate) node_type: NodeType,
    pub(crate) gate: Gate,
    pub(crate) hooks: Hooks,
    ingress: CrossbeamSender<Meta>,
    /// Serializes push + arriving hook across producers
    ingress_lock: Mutex<()>,
    /// Read-only view of egress, set once the dispatch loop exists
    pub(crate) egress_gauge: OnceLock<CrossbeamReceiver<Meta>>,
    /// Frames each loop has set aside while the node is inactive
    pub(crate) ingress_parked: Arc<AtomicUsize>,
    pub(crate) egress_parked: Arc<AtomicUsize>,
}

impl NodeShared {
    pub(crate) fn ingress_depth(&self) -> usize {
        self.ingress.len() + self.ingress_parked.load(Ordering::Relaxed)
    }

    pub(crate) fn egress_depth(&self) -> usize {
        self.egress_gauge.get().map_or(0, CrossbeamReceiver::len)
            + self.egress_parked.load(Ordering::Relaxed)
    }
}

/// Handle to a running node's ingress
#[derive(Clone)]
pub struct NodeHandle {
    pub(crate) inner: Arc<NodeShared>,
}

impl NodeHandle {
    pub(crate) fn new(
        name: String,
        node_type: NodeType,
        hooks: Hooks,
        ingress: CrossbeamSender<Meta>,
    ) -> Self {
        Self {
            inner: Arc::new(NodeShared {
                name,
                node_type,
                gate: Gate::new(),
                hooks,
                ingress,
                ingress_lock: Mutex::new(()),
                egress_gauge: OnceLock::new(),
                ingress_parked: Arc::new(AtomicUsize::new(0)),
                egress_parked: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn node_type(&self) -> NodeType {
        self.inner.node_type
    }

    pub fn is_active(&self) -> bool {
        self.inner.gate.is_active()
    }

    /// Number of metas waiting to be handled, including frames held back
    /// while the node is inactive
    pub fn ingress_depth(&self) -> usize {
        self.inner.ingress_depth()
    }

    /// Number of results waiting to be dispatched
    pub fn egress_depth(&self) -> usize {
        self.inner.egress_depth()
    }

    /// Push a meta into this node.
    ///
    /// `None` is a no-op. A `Start`/`Stop` control meta flips the active flag
    /// right away, before it is queued, so control takes effect even when the
    /// queue is backed up. Metas sent to a node whose loops have exited are
    /// dropped.
    pub fn meta_flow<M: Into<Option<Meta>>>(&self, meta: M) {
        let Some(meta) = meta.into() else {
            return;
        };
        let node = &self.inner;

        if let Meta::Control(control) = &meta {
            match control.kind {
                ControlKind::Start => {
                    if !node.gate.set_active(true) {
                        debug!("[{}] activated", node.name);
                    }
                }
                ControlKind::Stop => {
                    if node.gate.set_active(false) {
                        debug!("[{}] deactivated", node.name);
                    }
                }
                ControlKind::Custom(_) => {}
            }
        }

        // The channel takes ownership, so keep a copy for the hook. For
        // frames this is a refcount bump.
        let observed = node
            .hooks
            .is_set(HookPoint::Arriving)
            .then(|| meta.clone());

        let _guard = node
            .ingress_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Err(rejected) = node.ingress.send(meta) {
            debug!("[{}] ingress closed, dropping {}", node.name, rejected.0);
            return;
        }
        let depth = node.ingress_depth();
        trace!("[{}] meta flow, ingress depth {}", node.name, depth);
        if let Some(meta) = observed {
            node.hooks
                .fire(HookPoint::Arriving, &node.name, depth, &meta);
        }
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("name", &self.inner.name)
            .field("node_type", &self.inner.node_type)
            .field("active", &self.is_active())
            .field("ingress_depth", &self.ingress_depth())
            .field("egress_depth", &self.egress_depth())
            .finish()
    }
}
