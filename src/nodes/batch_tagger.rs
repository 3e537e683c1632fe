//! Batch-aware middle node

use std::sync::Arc;
use tracing::trace;

use crate::runtime::{FrameMeta, HandleResult, Meta, Stage};

/// Default attribute key for the batch sequence number
pub const BATCH_ATTRIBUTE: &str = "batch";

/// Stamps every frame with the sequence number of the batch it was handled in.
///
/// With a batch size of 1 each frame is its own batch.
#[derive(Debug)]
pub struct BatchTagger {
    key: String,
    batches: u64,
}

impl BatchTagger {
    pub fn new() -> Self {
        Self {
            key: BATCH_ATTRIBUTE.to_string(),
            batches: 0,
        }
    }

    /// Attribute key to write instead of `batch`
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    fn tag(&self, frame: &mut Arc<FrameMeta>) {
        Arc::make_mut(frame).set_attribute(self.key.as_str(), self.batches.to_string());
    }
}

impl Default for BatchTagger {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for BatchTagger {
    fn handle_frame_meta(&mut self, mut meta: Arc<FrameMeta>) -> HandleResult<Option<Meta>> {
        self.batches += 1;
        self.tag(&mut meta);
        Ok(Some(Meta::Frame(meta)))
    }

    fn handle_frame_batch(&mut self, batch: &mut [Arc<FrameMeta>]) -> HandleResult {
        self.batches += 1;
        trace!("batch {} with {} frames", self.batches, batch.len());
        for frame in batch.iter_mut() {
            self.tag(frame);
        }
        Ok(())
    }
}
