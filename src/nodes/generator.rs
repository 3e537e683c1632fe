//! Synthetic frame source
//!
//! Stands in for a capture device: produces frames with fixed provenance
//! (channel, size, fps) and an optional real-time pace.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::runtime::{FrameMeta, HandleResult, Meta, NodeType, Stage};

/// Properties of the stream a source produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub channel_index: usize,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub uri: String,
}

impl fmt::Display for StreamInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} (ch={}, {}x{}@{})",
            self.uri, self.channel_index, self.width, self.height, self.fps
        )
    }
}

/// Called with the node name once the stream is open
pub type StreamInfoHook = Box<dyn Fn(&str, &StreamInfo) + Send>;

/// Source node producing numbered frames
pub struct FrameGenerator {
    info: StreamInfo,
    node_name: String,
    on_stream_info: Option<StreamInfoHook>,
    announced: bool,
    limit: Option<u64>,
    paced: bool,
    payload_len: usize,
    frame_index: u64,
    next_deadline: Option<Instant>,
}

impl FrameGenerator {
    /// Unpaced, unlimited generator with empty payloads
    pub fn new(channel_index: usize, width: u32, height: u32, fps: u32) -> Self {
        Self {
            info: StreamInfo {
                channel_index,
                fps,
                width,
                height,
                uri: format!("synthetic://{}", channel_index),
            },
            node_name: String::new(),
            on_stream_info: None,
            announced: false,
            limit: None,
            paced: false,
            payload_len: 0,
            frame_index: 0,
            next_deadline: None,
        }
    }

    /// Stop after `frames` frames
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    /// Emit frames no faster than the stream's fps
    pub fn paced(mut self) -> Self {
        self.paced = true;
        self
    }

    /// Size of each frame's payload in bytes
    pub fn with_payload_len(mut self, len: usize) -> Self {
        self.payload_len = len;
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.info.uri = uri.into();
        self
    }

    /// Report the stream's properties once, when the first frame is about
    /// to be produced
    pub fn on_stream_info<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &StreamInfo) + Send + 'static,
    {
        self.on_stream_info = Some(Box::new(hook));
        self
    }

    pub fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    /// Number of frames produced so far
    pub fn frames_produced(&self) -> u64 {
        self.frame_index
    }

    fn frame_interval(&self) -> Option<Duration> {
        (self.paced && self.info.fps > 0).then(|| Duration::from_secs(1) / self.info.fps)
    }

    fn wait_for_slot(&mut self) {
        let Some(interval) = self.frame_interval() else {
            return;
        };
        let now = Instant::now();
        let deadline = self.next_deadline.unwrap_or(now);
        if deadline > now {
            thread::sleep(deadline - now);
        }
        self.next_deadline = Some(deadline.max(now) + interval);
    }
}

impl Stage for FrameGenerator {
    fn node_type(&self) -> NodeType {
        NodeType::Source
    }

    fn prepare(&mut self, node_name: &str) -> HandleResult {
        self.node_name = node_name.to_string();
        Ok(())
    }

    fn describe(&self, _node_name: &str) -> String {
        self.info.uri.clone()
    }

    fn produce(&mut self) -> HandleResult<Option<Meta>> {
        if self.limit.is_some_and(|limit| self.frame_index >= limit) {
            debug!("{} reached its limit of {} frames", self.info.uri, self.frame_index);
            return Ok(None);
        }
        if !self.announced {
            self.announced = true;
            info!("[{}] opened stream {}", self.node_name, self.info);
            if let Some(hook) = &self.on_stream_info {
                hook(&self.node_name, &self.info);
            }
        }

        self.wait_for_slot();
        self.frame_index += 1;
        // Payload bytes carry the low byte of the index so frames are distinguishable
        let data: Arc<[u8]> = vec![self.frame_index as u8; self.payload_len].into();
        let frame = FrameMeta::new(
            self.frame_index,
            self.info.channel_index,
            self.info.width,
            self.info.height,
            self.info.fps,
            data,
        );
        Ok(Some(Meta::from(frame)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn next_frame(generator: &mut FrameGenerator) -> Option<Arc<FrameMeta>> {
        generator
            .produce()
            .unwrap()
            .and_then(|meta| meta.as_frame().cloned())
    }

    #[test]
    fn test_frames_carry_provenance() {
        let mut generator = FrameGenerator::new(3, 640, 480, 25).with_payload_len(4);
        let frame = next_frame(&mut generator).unwrap();
        assert_eq!(frame.frame_index, 1);
        assert_eq!(frame.channel_index, 3);
        assert_eq!((frame.original_width, frame.original_height), (640, 480));
        assert_eq!(frame.fps, 25);
        assert_eq!(&frame.data[..], &[1, 1, 1, 1]);

        let frame = next_frame(&mut generator).unwrap();
        assert_eq!(frame.frame_index, 2);
        assert_eq!(generator.frames_produced(), 2);
    }

    #[test]
    fn test_limit_exhausts_source() {
        let mut generator = FrameGenerator::new(0, 8, 8, 30).with_limit(2);
        assert!(next_frame(&mut generator).is_some());
        assert!(next_frame(&mut generator).is_some());
        assert!(generator.produce().unwrap().is_none());
        assert!(generator.produce().unwrap().is_none());
    }

    #[test]
    fn test_pacing_spaces_frames() {
        let mut generator = FrameGenerator::new(0, 8, 8, 50).paced();
        let start = Instant::now();
        for _ in 0..4 {
            next_frame(&mut generator).unwrap();
        }
        // First frame is immediate, the next three wait 20ms each
        assert!(start.elapsed() >= Duration::from_millis(55));
    }

    #[test]
    fn test_stream_info_reported_once() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let mut generator = FrameGenerator::new(2, 1280, 720, 15)
            .with_uri("rtsp://cam2/live")
            .with_limit(3)
            .on_stream_info(move |node, info| {
                sink.lock().unwrap().push((node.to_string(), info.clone()));
            });
        generator.prepare("cam2").unwrap();
        assert!(reports.lock().unwrap().is_empty());

        while next_frame(&mut generator).is_some() {}
        assert!(generator.produce().unwrap().is_none());

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        let (node, info) = &reports[0];
        assert_eq!(node, "cam2");
        assert_eq!(
            *info,
            StreamInfo {
                channel_index: 2,
                fps: 15,
                width: 1280,
                height: 720,
                uri: "rtsp://cam2/live".to_string(),
            }
        );
    }

    #[test]
    fn test_stream_info() {
        let generator = FrameGenerator::new(1, 1920, 1080, 30).with_uri("rtsp://cam1/live");
        let info = generator.stream_info();
        assert_eq!(info.channel_index, 1);
        assert_eq!(info.to_string(), "rtsp://cam1/live (ch=1, 1920x1080@30)");
        assert_eq!(generator.describe("cam1"), "rtsp://cam1/live");
        assert_eq!(generator.node_type(), NodeType::Source);
    }
}
