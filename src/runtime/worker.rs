//! The two loops every node runs
//!
//! - [`HandlingLoop`] drains the ingress queue, runs the stage, and pushes
//!   results onto the egress queue.
//! - [`DispatchLoop`] drains the egress queue and broadcasts each meta to
//!   every subscriber's ingress.
//!
//! While the node is inactive neither loop handles or dispatches frames, but
//! control metas keep moving so a Stop (or Start) reaches the rest of the
//! graph. Frames found in the meantime are set aside and go first once the
//! node is active again. Both loops leave as soon as the gate is cancelled,
//! the dispatch loop after flushing its egress queue. Neither loop locks its
//! queue: ingress has one consumer (the handling loop) and egress has one
//! producer and one consumer.

use crossbeam_channel::{
    Receiver as CrossbeamReceiver, Sender as CrossbeamSender, TryRecvError, never,
    select,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace};

use super::errors::{HandleError, HandleResult};
use super::gate::Gate;
use super::hooks::HookPoint;
use super::ingress::{NodeHandle, NodeShared};
use super::meta::{FrameMeta, Meta};
use super::node::{NodeType, Stage};
use super::watchdog::{OperationGuard, WatchdogHandle};

enum Wake {
    Meta(Meta),
    Activated,
    Closed,
}

/// One of a node's queues, read through its gate
struct GatedQueue {
    queue: CrossbeamReceiver<Meta>,
    cancel: CrossbeamReceiver<()>,
    activation: CrossbeamReceiver<()>,
    parked: VecDeque<Meta>,
    /// Shared count of `parked`, read by the depth gauges
    parked_gauge: Arc<AtomicUsize>,
}

impl GatedQueue {
    fn new(
        queue: CrossbeamReceiver<Meta>,
        gate: &Gate,
        activation: CrossbeamReceiver<()>,
        parked_gauge: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            queue,
            cancel: gate.cancel_signal(),
            activation,
            parked: VecDeque::new(),
            parked_gauge,
        }
    }

    /// Queued plus parked
    fn len(&self) -> usize {
        self.queue.len() + self.parked.len()
    }

    fn park(&mut self, meta: Meta) {
        self.parked.push_back(meta);
        self.parked_gauge.store(self.parked.len(), Ordering::Relaxed);
    }

    fn unpark(&mut self) -> Option<Meta> {
        let meta = self.parked.pop_front()?;
        self.parked_gauge.store(self.parked.len(), Ordering::Relaxed);
        Some(meta)
    }

    /// Block for the next meta the node may act on.
    ///
    /// Control metas always come out. Frames come out only while `gate` is
    /// active, parked ones first. `None` once cancelled or disconnected.
    fn next(&mut self, gate: &Gate) -> Option<Meta> {
        loop {
            if gate.is_cancelled() {
                return None;
            }
            if gate.is_active() {
                if let Some(meta) = self.unpark() {
                    return Some(meta);
                }
            }

            let wake = select! {
                recv(self.queue) -> msg => msg.map_or(Wake::Closed, Wake::Meta),
                recv(self.cancel) -> _ => Wake::Closed,
                recv(self.activation) -> _ => Wake::Activated,
            };
            let meta = match wake {
                Wake::Meta(meta) => meta,
                Wake::Activated => continue,
                Wake::Closed => return None,
            };
            if meta.is_control() || (gate.is_active() && self.parked.is_empty()) {
                return Some(meta);
            }
            self.park(meta);
        }
    }

    /// Non-blocking [`next`](Self::next) for a node known to be active
    fn try_next(&mut self) -> Result<Meta, TryRecvError> {
        match self.unpark() {
            Some(meta) => Ok(meta),
            None => self.queue.try_recv(),
        }
    }

    /// Everything left, parked first
    fn drain(&mut self) -> Vec<Meta> {
        let mut rest: Vec<Meta> = self.parked.drain(..).collect();
        self.parked_gauge.store(0, Ordering::Relaxed);
        rest.extend(self.queue.try_iter());
        rest
    }
}

pub(crate) struct HandlingLoop {
    node: Arc<NodeShared>,
    stage: Box<dyn Stage>,
    batch_size: usize,
    batch: Vec<Arc<FrameMeta>>,
    ingress: GatedQueue,
    egress: CrossbeamSender<Meta>,
    watchdog: WatchdogHandle,
    /// Source stage still has frames to produce
    producing: bool,
}

impl HandlingLoop {
    pub(crate) fn new(
        handle: &NodeHandle,
        stage: Box<dyn Stage>,
        batch_size: usize,
        ingress: CrossbeamReceiver<Meta>,
        egress: CrossbeamSender<Meta>,
        watchdog: WatchdogHandle,
    ) -> Self {
        let node = &handle.inner;
        let producing = node.node_type == NodeType::Source;
        // Every Start arrives through ingress, so no activation signal needed
        let ingress = GatedQueue::new(
            ingress,
            &node.gate,
            never(),
            Arc::clone(&node.ingress_parked),
        );
        Self {
            node: Arc::clone(node),
            stage,
            batch_size,
            batch: Vec::with_capacity(batch_size),
            ingress,
            egress,
            watchdog,
            producing,
        }
    }

    /// Run until cancelled or the stage fails.
    /// Returns the number of steps taken: metas handled plus produce calls.
    pub(crate) fn run(mut self) -> HandleResult<usize> {
        self.stage.prepare(&self.node.name)?;
        let mut handled = 0usize;

        loop {
            let step = if self.producing && self.node.gate.is_active() {
                if self.node.gate.is_cancelled() {
                    break;
                }
                // Control metas still get through while a source is busy
                match self.ingress.try_next() {
                    Ok(meta) => self.handle(meta),
                    Err(TryRecvError::Empty) => self.produce(),
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                let Some(meta) = self.ingress.next(&self.node.gate) else {
                    break;
                };
                self.handle(meta)
            };

            match step {
                Ok(()) => handled += 1,
                Err(HandleError::Shutdown) => {
                    debug!("[{}] stage requested shutdown", self.node.name);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if !self.batch.is_empty() {
            debug!(
                "[{}] exiting with {} frame(s) left in an incomplete batch",
                self.node.name,
                self.batch.len()
            );
        }
        Ok(handled)
    }

    fn handle(&mut self, meta: Meta) -> HandleResult {
        // The meta is already off the queue; count it as still there
        let depth = self.ingress.len() + 1;
        self.node
            .hooks
            .fire(HookPoint::BeforeHandle, &self.node.name, depth, &meta);

        match meta {
            Meta::Control(control) => {
                let out = {
                    let _guard = OperationGuard::new(&self.watchdog);
                    self.stage.handle_control_meta(control)?
                };
                self.forward(out);
            }
            Meta::Frame(frame) if self.batch_size <= 1 => {
                let out = {
                    let _guard = OperationGuard::new(&self.watchdog);
                    self.stage.handle_frame_meta(frame)?
                };
                self.forward(out);
            }
            Meta::Frame(frame) => {
                self.batch.push(frame);
                if self.batch.len() < self.batch_size {
                    trace!(
                        "[{}] batch {}/{}",
                        self.node.name,
                        self.batch.len(),
                        self.batch_size
                    );
                    return Ok(());
                }
                {
                    let _guard = OperationGuard::new(&self.watchdog);
                    self.stage.handle_frame_batch(&mut self.batch)?;
                }
                let batch =
                    std::mem::replace(&mut self.batch, Vec::with_capacity(self.batch_size));
                for frame in batch {
                    self.forward(Some(Meta::Frame(frame)));
                }
            }
        }
        Ok(())
    }

    fn produce(&mut self) -> HandleResult {
        let produced = {
            let _guard = OperationGuard::new(&self.watchdog);
            self.stage.produce()?
        };
        match produced {
            Some(meta) => self.forward(Some(meta)),
            None => {
                debug!("[{}] source exhausted", self.node.name);
                self.producing = false;
            }
        }
        Ok(())
    }

    /// Push a result onto egress. Sinks and `None` results stop here.
    fn forward(&self, out: Option<Meta>) {
        let Some(meta) = out else {
            trace!("[{}] meta swallowed", self.node.name);
            return;
        };
        if self.node.node_type == NodeType::Sink {
            return;
        }

        let observed = self
            .node
            .hooks
            .is_set(HookPoint::AfterHandle)
            .then(|| meta.clone());
        if self.egress.send(meta).is_err() {
            debug!("[{}] egress closed, dropping result", self.node.name);
            return;
        }
        let depth = self.egress.len() + self.node.egress_parked.load(Ordering::Relaxed);
        trace!("[{}] handled, egress depth {}", self.node.name, depth);
        if let Some(meta) = observed {
            self.node
                .hooks
                .fire(HookPoint::AfterHandle, &self.node.name, depth, &meta);
        }
    }
}

pub(crate) struct DispatchLoop {
    node: Arc<NodeShared>,
    egress: GatedQueue,
    subscribers: Vec<NodeHandle>,
}

impl DispatchLoop {
    pub(crate) fn new(
        handle: &NodeHandle,
        egress: CrossbeamReceiver<Meta>,
        subscribers: Vec<NodeHandle>,
    ) -> Self {
        let node = &handle.inner;
        let _ = node.egress_gauge.set(egress.clone());
        // A stage may swallow Start, so wake on activation as well
        let egress = GatedQueue::new(
            egress,
            &node.gate,
            node.gate.activation_signal(),
            Arc::clone(&node.egress_parked),
        );
        Self {
            node: Arc::clone(node),
            egress,
            subscribers,
        }
    }

    /// Run until cancelled or the handling loop goes away.
    /// Returns the number of metas dispatched.
    pub(crate) fn run(mut self) -> HandleResult<usize> {
        let mut dispatched = 0usize;

        while let Some(meta) = self.egress.next(&self.node.gate) {
            self.dispatch(meta);
            dispatched += 1;
        }

        // Results the handling loop already produced still go out
        for meta in self.egress.drain() {
            self.dispatch(meta);
            dispatched += 1;
        }
        Ok(dispatched)
    }

    fn dispatch(&self, meta: Meta) {
        let depth = self.egress.len() + 1;
        self.node
            .hooks
            .fire(HookPoint::Leaving, &self.node.name, depth, &meta);
        trace!(
            "[{}] dispatch {} to {} subscriber(s)",
            self.node.name,
            meta,
            self.subscribers.len()
        );
        for subscriber in &self.subscribers {
            subscriber.meta_flow(meta.clone());
        }
    }
}
