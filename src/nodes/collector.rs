//! Channel-backed sink

use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::Arc;

use crate::runtime::{ControlMeta, FrameMeta, HandleError, HandleResult, Meta, NodeType, Stage};

/// Sink that hands every frame (and optionally every control meta) to a
/// channel. Once the receiver is gone the node shuts itself down.
pub struct FrameCollector {
    tx: Sender<Meta>,
    controls: bool,
}

impl FrameCollector {
    pub fn new() -> (Self, Receiver<Meta>) {
        let (tx, rx) = unbounded();
        (Self { tx, controls: false }, rx)
    }

    /// Also deliver control metas
    pub fn with_controls(mut self) -> Self {
        self.controls = true;
        self
    }

    fn deliver(&self, meta: Meta) -> HandleResult<Option<Meta>> {
        self.tx.send(meta).map_err(|_| HandleError::Shutdown)?;
        Ok(None)
    }
}

impl Stage for FrameCollector {
    fn node_type(&self) -> NodeType {
        NodeType::Sink
    }

    fn handle_frame_meta(&mut self, meta: Arc<FrameMeta>) -> HandleResult<Option<Meta>> {
        self.deliver(Meta::Frame(meta))
    }

    fn handle_frame_batch(&mut self, batch: &mut [Arc<FrameMeta>]) -> HandleResult {
        for frame in batch.iter() {
            self.deliver(Meta::Frame(Arc::clone(frame)))?;
        }
        Ok(())
    }

    fn handle_control_meta(&mut self, meta: ControlMeta) -> HandleResult<Option<Meta>> {
        if self.controls {
            return self.deliver(Meta::Control(meta));
        }
        Ok(None)
    }
}
