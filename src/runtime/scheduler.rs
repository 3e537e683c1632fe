//! Thread-per-node scheduler for a started graph
//!
//! Every node gets two dedicated threads, named after the node:
//!
//! - `<node>:handle` runs the [`HandlingLoop`](super::worker::HandlingLoop)
//! - `<node>:dispatch` runs the [`DispatchLoop`](super::worker::DispatchLoop)
//!
//! A node whose stage fails (or panics) takes only its own loops down. The
//! failure is logged right away and reported again by [`Scheduler::wait`];
//! the rest of the graph keeps running until [`Scheduler::shutdown`].

use crossbeam_channel::{Receiver as CrossbeamReceiver, Sender as CrossbeamSender, unbounded};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

use super::errors::{HandleResult, NodeFailure, RunError};
use super::graph::NodeId;
use super::hooks::Hooks;
use super::ingress::{NodeHandle, NodeShared};
use super::meta::{ControlMeta, Meta};
use super::node::{NodeConfig, NodeType, Stage};
use super::watchdog::Watchdog;
use super::worker::{DispatchLoop, HandlingLoop};

/// A registered node whose loops are not spawned yet
pub(crate) struct NodeLaunch {
    index: usize,
    stage: Box<dyn Stage>,
    batch_size: usize,
    ingress: CrossbeamReceiver<Meta>,
}

struct NodeThread {
    node: usize,
    join: JoinHandle<HandleResult<usize>>,
}

/// Cancels the node's gate and reports completion when a loop thread ends,
/// including by panic
struct ExitNotice {
    node: Arc<NodeShared>,
    thread_name: String,
    completion_tx: CrossbeamSender<String>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        self.node.gate.cancel();
        let _ = self
            .completion_tx
            .send(std::mem::take(&mut self.thread_name));
    }
}

/// Runtime scheduler that executes a started graph
pub struct Scheduler {
    nodes: Vec<NodeHandle>,
    threads: Vec<(String, NodeThread)>,
    completion_tx: Option<CrossbeamSender<String>>,
    completion_rx: Option<CrossbeamReceiver<String>>,
    watchdog: Watchdog,
    watchdog_handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Create a scheduler and start its watchdog monitor
    pub(crate) fn new(watchdog: Watchdog) -> Self {
        let (completion_tx, completion_rx) = unbounded();
        let watchdog_handle = watchdog.start_monitoring_thread();
        info!(
            "Watchdog enabled - will report handlers blocked >{:?}",
            watchdog.threshold()
        );
        Self {
            nodes: Vec::new(),
            threads: Vec::new(),
            completion_tx: Some(completion_tx),
            completion_rx: Some(completion_rx),
            watchdog,
            watchdog_handle: Some(watchdog_handle),
        }
    }

    /// Create the node's ingress and handle. Must be called for every node
    /// before any of them is spawned, so subscriber handles can be resolved.
    pub(crate) fn register(
        &mut self,
        config: NodeConfig,
        node_type: NodeType,
        hooks: Hooks,
        stage: Box<dyn Stage>,
    ) -> NodeLaunch {
        let (ingress_tx, ingress_rx) = unbounded();
        let index = self.nodes.len();
        self.nodes
            .push(NodeHandle::new(config.name, node_type, hooks, ingress_tx));
        NodeLaunch {
            index,
            stage,
            batch_size: config.batch_size,
            ingress: ingress_rx,
        }
    }

    /// Spawn both loops of a registered node
    pub(crate) fn spawn(&mut self, launch: NodeLaunch, subscribers: &[usize]) -> Result<(), RunError> {
        let handle = self.nodes[launch.index].clone();
        let subscribers: Vec<NodeHandle> = subscribers
            .iter()
            .filter_map(|&i| self.nodes.get(i).cloned())
            .collect();
        let (egress_tx, egress_rx) = unbounded();

        debug!(
            "Starting {} node '{}' with {} subscriber(s)",
            handle.node_type(),
            handle.name(),
            subscribers.len()
        );

        let handling = HandlingLoop::new(
            &handle,
            launch.stage,
            launch.batch_size,
            launch.ingress,
            egress_tx,
            self.watchdog.register(handle.name(), "handle"),
        );
        self.spawn_thread(launch.index, &handle, "handle", move || handling.run())?;

        let dispatch = DispatchLoop::new(&handle, egress_rx, subscribers);
        self.spawn_thread(launch.index, &handle, "dispatch", move || dispatch.run())?;
        Ok(())
    }

    fn spawn_thread<F>(
        &mut self,
        index: usize,
        handle: &NodeHandle,
        role: &str,
        body: F,
    ) -> Result<(), RunError>
    where
        F: FnOnce() -> HandleResult<usize> + Send + 'static,
    {
        let thread_name = format!("{}:{}", handle.name(), role);
        let completion_tx = self
            .completion_tx
            .clone()
            .ok_or_else(|| RunError::Spawn {
                node: handle.name().to_string(),
                source: std::io::Error::other("scheduler already joined"),
            })?;
        let notice = ExitNotice {
            node: Arc::clone(&handle.inner),
            thread_name: thread_name.clone(),
            completion_tx,
        };
        let log_name = thread_name.clone();

        let join = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let _notice = notice;
                let result = body();
                match &result {
                    Ok(count) => info!("[{}] Shutdown. Handled {} metas.", log_name, count),
                    Err(e) => error!("[{}] Stage failed: {}", log_name, e),
                }
                result
            })
            .map_err(|source| RunError::Spawn {
                node: handle.name().to_string(),
                source,
            })?;

        self.threads.push((thread_name, NodeThread { node: index, join }));
        Ok(())
    }

    /// Get a reference to the watchdog
    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    /// Handles of all nodes, in insertion order
    pub fn handles(&self) -> &[NodeHandle] {
        &self.nodes
    }

    pub fn handle(&self, id: NodeId) -> Option<&NodeHandle> {
        self.nodes.get(id.as_usize())
    }

    pub fn handle_by_name(&self, name: &str) -> Option<&NodeHandle> {
        self.nodes.iter().find(|h| h.name() == name)
    }

    /// Inject a `Start` control meta into every node, downstream nodes first
    pub fn start_all(&self) {
        info!("Starting all {} nodes", self.nodes.len());
        for handle in self.nodes.iter().rev() {
            handle.meta_flow(Meta::from(ControlMeta::start()));
        }
    }

    /// Inject a `Stop` control meta into every node
    pub fn stop_all(&self) {
        info!("Stopping all {} nodes", self.nodes.len());
        for handle in &self.nodes {
            handle.meta_flow(Meta::from(ControlMeta::stop()));
        }
    }

    /// Signal every loop to exit.
    ///
    /// Metas still waiting in an ingress queue are discarded. Results already
    /// on a node's egress queue are still dispatched.
    pub fn shutdown(&self) {
        debug!("Cancelling {} nodes", self.nodes.len());
        for handle in &self.nodes {
            handle.inner.gate.cancel();
        }
    }

    /// Wait for all node threads to complete.
    ///
    /// Loops only end on [`shutdown`](Self::shutdown) or failure, so this
    /// blocks until one of those happens to every node. Failed and panicked
    /// nodes are collected into [`RunError::NodesFailed`].
    pub fn wait(mut self) -> Result<(), RunError> {
        let Some(completion_rx) = self.completion_rx.take() else {
            return Ok(());
        };

        // Drop the main completion sender so the channel closes when all threads complete
        drop(self.completion_tx.take());

        let total_threads = self.threads.len();
        let mut threads_by_name: HashMap<String, NodeThread> =
            std::mem::take(&mut self.threads).into_iter().collect();
        let mut failures = Vec::new();
        let mut completed = 0;

        info!("Waiting for {} threads to complete...", total_threads);

        while completed < total_threads {
            let Ok(thread_name) = completion_rx.recv() else {
                break;
            };
            completed += 1;
            if let Some(thread) = threads_by_name.remove(&thread_name) {
                if let Some(failure) = self.join_thread(&thread_name, thread) {
                    failures.push(failure);
                }
                debug!(
                    "[{}] Thread completed ({}/{})",
                    thread_name, completed, total_threads
                );
            }
        }

        info!("All {} threads completed", total_threads);
        self.stop_watchdog();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RunError::NodesFailed(failures))
        }
    }

    fn join_thread(&self, thread_name: &str, thread: NodeThread) -> Option<NodeFailure> {
        let reason = match thread.join.join() {
            Ok(Ok(_)) => return None,
            Ok(Err(e)) => e.to_string(),
            Err(payload) => {
                let reason = format!("panicked: {}", panic_message(payload.as_ref()));
                error!("[{}] Thread {}", thread_name, reason);
                reason
            }
        };
        let handle = &self.nodes[thread.node];
        Some(NodeFailure {
            node: handle.name().to_string(),
            node_type: handle.node_type(),
            reason,
        })
    }

    fn stop_watchdog(&mut self) {
        self.watchdog.stop();
        if let Some(handle) = self.watchdog_handle.take() {
            let _ = handle.join();
        }
    }

    /// Get the number of running threads
    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    /// Get the names of all running threads
    pub fn thread_names(&self) -> Vec<String> {
        self.threads.iter().map(|(name, _)| name.clone()).collect()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.shutdown();
        }
        self.watchdog.stop();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::FrameGenerator;
    use crate::runtime::errors::HandleError;
    use crate::runtime::graph::Graph;
    use crate::runtime::hooks::{HookPoint, MetaProbe};
    use crate::runtime::meta::FrameMeta;
    use crossbeam_channel::{Receiver, Sender};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    const TIMEOUT: Duration = Duration::from_secs(2);

    struct CountingSource {
        next: u64,
        last: u64,
    }

    impl Stage for CountingSource {
        fn node_type(&self) -> NodeType {
            NodeType::Source
        }

        fn produce(&mut self) -> HandleResult<Option<Meta>> {
            if self.next > self.last {
                return Ok(None);
            }
            let meta = Meta::from(FrameMeta::empty(self.next, 0));
            self.next += 1;
            Ok(Some(meta))
        }
    }

    struct Relay;

    impl Stage for Relay {}

    struct Collect {
        tx: Sender<Meta>,
    }

    impl Stage for Collect {
        fn node_type(&self) -> NodeType {
            NodeType::Sink
        }

        fn handle_frame_meta(&mut self, meta: Arc<FrameMeta>) -> HandleResult<Option<Meta>> {
            let _ = self.tx.send(Meta::Frame(meta));
            Ok(None)
        }
    }

    /// Sink that logs every frame it receives
    struct Logged {
        events: Arc<Mutex<Vec<String>>>,
        tx: Sender<Meta>,
    }

    impl Stage for Logged {
        fn node_type(&self) -> NodeType {
            NodeType::Sink
        }

        fn handle_frame_meta(&mut self, meta: Arc<FrameMeta>) -> HandleResult<Option<Meta>> {
            self.events
                .lock()
                .unwrap()
                .push(format!("received #{}", meta.frame_index));
            let _ = self.tx.send(Meta::Frame(meta));
            Ok(None)
        }
    }

    struct FailAt(u64);

    impl Stage for FailAt {
        fn handle_frame_meta(&mut self, meta: Arc<FrameMeta>) -> HandleResult<Option<Meta>> {
            if meta.frame_index == self.0 {
                return Err(HandleError::NodeError(format!("bad frame {}", meta.frame_index)));
            }
            Ok(Some(Meta::Frame(meta)))
        }
    }

    struct PanicAt(u64);

    impl Stage for PanicAt {
        fn handle_frame_meta(&mut self, meta: Arc<FrameMeta>) -> HandleResult<Option<Meta>> {
            assert_ne!(meta.frame_index, self.0, "frame {} is cursed", self.0);
            Ok(Some(Meta::Frame(meta)))
        }
    }

    fn collector() -> (Collect, Receiver<Meta>) {
        let (tx, rx) = unbounded();
        (Collect { tx }, rx)
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        while !condition() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    fn frame_indices(rx: &Receiver<Meta>, n: usize) -> Vec<u64> {
        (0..n)
            .map(|_| {
                rx.recv_timeout(TIMEOUT)
                    .unwrap()
                    .as_frame()
                    .map(|f| f.frame_index)
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_source_middle_sink() {
        let mut graph = Graph::new();
        let src = graph
            .add_node("src", CountingSource { next: 1, last: 5 })
            .unwrap();
        let mid = graph.add_node("mid", Relay).unwrap();
        let (sink, rx) = collector();
        let sink = graph.add_node("sink", sink).unwrap();
        graph.attach_to(mid, &[src]).unwrap();
        graph.attach_to(sink, &[mid]).unwrap();

        let scheduler = graph.start().unwrap();
        assert_eq!(scheduler.num_threads(), 6);
        scheduler.start_all();

        assert_eq!(frame_indices(&rx, 5), vec![1, 2, 3, 4, 5]);
        // Sinks never forward
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        let mid = scheduler.handle(mid).unwrap();
        assert_eq!(mid.egress_depth(), 0);
        assert_eq!(mid.ingress_depth(), 0);

        scheduler.shutdown();
        scheduler.wait().unwrap();
    }

    #[test]
    fn test_fan_out_reaches_every_subscriber() {
        let mut graph = Graph::new();
        let src = graph
            .add_node("src", CountingSource { next: 1, last: 3 })
            .unwrap();
        let (left, left_rx) = collector();
        let (right, right_rx) = collector();
        let left = graph.add_node("left", left).unwrap();
        let right = graph.add_node("right", right).unwrap();
        graph.attach_to(left, &[src]).unwrap();
        graph.attach_to(right, &[src]).unwrap();

        let scheduler = graph.start().unwrap();
        scheduler.start_all();

        assert_eq!(frame_indices(&left_rx, 3), vec![1, 2, 3]);
        assert_eq!(frame_indices(&right_rx, 3), vec![1, 2, 3]);

        scheduler.shutdown();
        scheduler.wait().unwrap();
    }

    #[test]
    fn test_failure_is_isolated_to_node() {
        let mut graph = Graph::new();
        let src = graph
            .add_node("src", CountingSource { next: 1, last: 4 })
            .unwrap();
        let bad = graph.add_node("bad", FailAt(2)).unwrap();
        let (after_bad, after_bad_rx) = collector();
        let after_bad = graph.add_node("after_bad", after_bad).unwrap();
        let (healthy, healthy_rx) = collector();
        let healthy = graph.add_node("healthy", healthy).unwrap();
        graph.attach_to(bad, &[src]).unwrap();
        graph.attach_to(after_bad, &[bad]).unwrap();
        graph.attach_to(healthy, &[src]).unwrap();

        let scheduler = graph.start().unwrap();
        scheduler.start_all();

        assert_eq!(frame_indices(&healthy_rx, 4), vec![1, 2, 3, 4]);
        assert_eq!(frame_indices(&after_bad_rx, 1), vec![1]);
        assert!(after_bad_rx.recv_timeout(Duration::from_millis(50)).is_err());

        scheduler.shutdown();
        match scheduler.wait() {
            Err(RunError::NodesFailed(failures)) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].node, "bad");
                assert_eq!(failures[0].node_type, NodeType::Middle);
                assert!(failures[0].reason.contains("bad frame 2"));
            }
            other => panic!("expected NodesFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_panic_is_reported() {
        let mut graph = Graph::new();
        let src = graph
            .add_node("src", CountingSource { next: 1, last: 2 })
            .unwrap();
        let cursed = graph.add_node("cursed", PanicAt(1)).unwrap();
        graph.attach_to(cursed, &[src]).unwrap();

        let scheduler = graph.start().unwrap();
        scheduler.start_all();
        thread::sleep(Duration::from_millis(100));

        scheduler.shutdown();
        match scheduler.wait() {
            Err(RunError::NodesFailed(failures)) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].node, "cursed");
                assert!(failures[0].reason.starts_with("panicked"));
                assert!(failures[0].reason.contains("cursed"));
            }
            other => panic!("expected NodesFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_start_and_stop_all_toggle_every_node() {
        let mut graph = Graph::new();
        let src = graph
            .add_node("src", CountingSource { next: 1, last: 0 })
            .unwrap();
        let mid = graph.add_node("mid", Relay).unwrap();
        graph.attach_to(mid, &[src]).unwrap();

        let scheduler = graph.start().unwrap();
        assert!(scheduler.handles().iter().all(|h| !h.is_active()));

        scheduler.start_all();
        assert!(scheduler.handles().iter().all(|h| h.is_active()));
        scheduler.stop_all();
        assert!(scheduler.handles().iter().all(|h| !h.is_active()));

        scheduler.shutdown();
        scheduler.wait().unwrap();
    }

    #[test]
    fn test_source_stop_reaches_downstream_nodes() {
        let mut graph = Graph::new();
        let src = graph
            .add_node("src", FrameGenerator::new(0, 8, 8, 200).paced())
            .unwrap();
        let mid = graph.add_node("mid", Relay).unwrap();
        let (sink, rx) = collector();
        let sink = graph.add_node("sink", sink).unwrap();
        graph.attach_to(mid, &[src]).unwrap();
        graph.attach_to(sink, &[mid]).unwrap();

        let scheduler = graph.start().unwrap();
        let src_handle = scheduler.handle(src).unwrap();
        let mid_handle = scheduler.handle(mid).unwrap();
        let sink_handle = scheduler.handle(sink).unwrap();

        // Only the source is told; the rest follows the flow
        src_handle.meta_flow(Meta::from(ControlMeta::start()));
        assert!(rx.recv_timeout(TIMEOUT).is_ok());
        assert!(mid_handle.is_active());
        assert!(sink_handle.is_active());

        src_handle.meta_flow(Meta::from(ControlMeta::stop()));
        assert!(wait_until(|| !mid_handle.is_active() && !sink_handle.is_active()));

        scheduler.shutdown();
        scheduler.wait().unwrap();
    }

    #[test]
    fn test_meta_counts_on_running_graph() {
        let mut graph = Graph::new();
        let src = graph
            .add_node("src", CountingSource { next: 1, last: 4 })
            .unwrap();
        let mid = graph.add_node("mid", Relay).unwrap();
        let (sink, rx) = collector();
        let sink = graph.add_node("sink", sink).unwrap();
        graph.attach_to(mid, &[src]).unwrap();
        graph.attach_to(sink, &[mid]).unwrap();
        let counts = MetaProbe::new();
        graph.set_hooks(mid, counts.hooks()).unwrap();

        let scheduler = graph.start().unwrap();
        scheduler
            .handle(src)
            .unwrap()
            .meta_flow(Meta::from(ControlMeta::start()));
        assert_eq!(frame_indices(&rx, 4), vec![1, 2, 3, 4]);

        // Four frames plus the forwarded start, at every point
        assert!(wait_until(|| counts.count(HookPoint::Leaving) == 5));
        scheduler.shutdown();
        scheduler.wait().unwrap();

        for point in HookPoint::ALL {
            assert_eq!(counts.count(point), 5, "{:?}", point);
        }
        assert!(counts.peak_depth(HookPoint::Arriving) >= 1);
        assert!(counts.peak_depth(HookPoint::BeforeHandle) >= 1);
        assert!(counts.peak_depth(HookPoint::Leaving) >= 1);
    }

    #[test]
    fn test_leaving_fires_before_subscriber_receives() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut graph = Graph::new();
        let src = graph
            .add_node("src", CountingSource { next: 1, last: 3 })
            .unwrap();
        let mid = graph.add_node("mid", Relay).unwrap();
        let (tx, rx) = unbounded();
        let sink = graph
            .add_node(
                "sink",
                Logged {
                    events: Arc::clone(&events),
                    tx,
                },
            )
            .unwrap();
        graph.attach_to(mid, &[src]).unwrap();
        graph.attach_to(sink, &[mid]).unwrap();

        let leaving = Arc::clone(&events);
        let hooks = Hooks::new().on_leaving(move |node, _, meta| {
            assert_eq!(node, "mid");
            if let Some(frame) = meta.as_frame() {
                leaving
                    .lock()
                    .unwrap()
                    .push(format!("leaving #{}", frame.frame_index));
            }
        });
        graph.set_hooks(mid, hooks).unwrap();

        let scheduler = graph.start().unwrap();
        scheduler.start_all();
        assert_eq!(frame_indices(&rx, 3), vec![1, 2, 3]);
        scheduler.shutdown();
        scheduler.wait().unwrap();

        let events = events.lock().unwrap();
        let position = |event: String| {
            events
                .iter()
                .position(|e| *e == event)
                .unwrap_or_else(|| panic!("missing {}", event))
        };
        for i in 1..=3 {
            assert!(position(format!("leaving #{}", i)) < position(format!("received #{}", i)));
        }
    }

    #[test]
    fn test_thread_names_and_lookup() {
        let mut graph = Graph::new();
        let id = graph.add_node("osd", Relay).unwrap();
        let scheduler = graph.start().unwrap();

        assert_eq!(
            scheduler.thread_names(),
            vec!["osd:handle".to_string(), "osd:dispatch".to_string()]
        );
        assert_eq!(scheduler.handle(id).map(|h| h.name()), Some("osd"));
        assert!(scheduler.handle_by_name("osd").is_some());
        assert!(scheduler.handle_by_name("nope").is_none());

        // Never activated: shutdown still releases the parked loops
        scheduler.shutdown();
        scheduler.wait().unwrap();
    }
}
