//! Predicate filter

use std::sync::Arc;
use tracing::trace;

use crate::runtime::{FrameMeta, HandleResult, Meta, Stage};

/// Swallows frames the predicate rejects. Control metas always pass.
pub struct FrameFilter<F> {
    keep: F,
    dropped: u64,
}

impl<F> FrameFilter<F>
where
    F: FnMut(&FrameMeta) -> bool + Send + 'static,
{
    pub fn new(keep: F) -> Self {
        Self { keep, dropped: 0 }
    }

    /// Number of frames swallowed so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl<F> Stage for FrameFilter<F>
where
    F: FnMut(&FrameMeta) -> bool + Send + 'static,
{
    fn handle_frame_meta(&mut self, meta: Arc<FrameMeta>) -> HandleResult<Option<Meta>> {
        if (self.keep)(&meta) {
            return Ok(Some(Meta::Frame(meta)));
        }
        self.dropped += 1;
        trace!("filtered {} ({} dropped)", meta, self.dropped);
        Ok(None)
    }
}
