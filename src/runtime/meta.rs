//! Messages carried through the node graph
//!
//! Every item that enters a node is a [`Meta`]: either a control directive
//! or a frame. Frames travel behind an `Arc` so fan-out to several
//! subscribers shares a single payload. A stage that wants to modify a frame
//! goes through [`Arc::make_mut`], which clones the frame if any sibling still
//! holds it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Control directive carried by a [`ControlMeta`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlKind {
    /// Activate the receiving node
    Start,
    /// Deactivate the receiving node
    Stop,
    /// Application-defined directive, ignored by the core
    Custom(String),
}

/// A control message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlMeta {
    pub kind: ControlKind,
    /// Channel this directive addresses
    pub channel_index: usize,
}

impl ControlMeta {
    pub fn new(kind: ControlKind, channel_index: usize) -> Self {
        Self {
            kind,
            channel_index,
        }
    }

    pub fn start() -> Self {
        Self::new(ControlKind::Start, 0)
    }

    pub fn stop() -> Self {
        Self::new(ControlKind::Stop, 0)
    }
}

impl fmt::Display for ControlMeta {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            ControlKind::Start => write!(f, "Control[start, ch={}]", self.channel_index),
            ControlKind::Stop => write!(f, "Control[stop, ch={}]", self.channel_index),
            ControlKind::Custom(name) => {
                write!(f, "Control[{}, ch={}]", name, self.channel_index)
            }
        }
    }
}

/// One video frame plus its provenance
#[derive(Clone, Debug, PartialEq)]
pub struct FrameMeta {
    /// 1-based index assigned by the producing source
    pub frame_index: u64,
    pub channel_index: usize,
    /// Width of the frame as captured, before any resizing
    pub original_width: u32,
    /// Height of the frame as captured, before any resizing
    pub original_height: u32,
    pub fps: u32,
    /// Raw frame bytes. Shared via Arc so copies of the meta don't copy pixels.
    pub data: Arc<[u8]>,
    /// Free-form annotations added by stages
    pub attributes: BTreeMap<String, String>,
}

impl FrameMeta {
    pub fn new(
        frame_index: u64,
        channel_index: usize,
        original_width: u32,
        original_height: u32,
        fps: u32,
        data: Arc<[u8]>,
    ) -> Self {
        Self {
            frame_index,
            channel_index,
            original_width,
            original_height,
            fps,
            data,
            attributes: BTreeMap::new(),
        }
    }

    /// Frame with an empty payload, handy for tests and synthetic sources
    pub fn empty(frame_index: u64, channel_index: usize) -> Self {
        Self::new(frame_index, channel_index, 0, 0, 0, Arc::from(Vec::new()))
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }
}

impl fmt::Display for FrameMeta {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Frame[#{}, ch={}, {}x{}@{}, bytes={}]",
            self.frame_index,
            self.channel_index,
            self.original_width,
            self.original_height,
            self.fps,
            self.data.len()
        )
    }
}

/// A message flowing through the graph
#[derive(Clone, Debug, PartialEq)]
pub enum Meta {
    Control(ControlMeta),
    Frame(Arc<FrameMeta>),
}

impl Meta {
    pub fn is_control(&self) -> bool {
        matches!(self, Meta::Control(_))
    }

    pub fn as_frame(&self) -> Option<&Arc<FrameMeta>> {
        match self {
            Meta::Frame(frame) => Some(frame),
            Meta::Control(_) => None,
        }
    }

    pub fn as_control(&self) -> Option<&ControlMeta> {
        match self {
            Meta::Control(control) => Some(control),
            Meta::Frame(_) => None,
        }
    }

    pub fn channel_index(&self) -> usize {
        match self {
            Meta::Control(control) => control.channel_index,
            Meta::Frame(frame) => frame.channel_index,
        }
    }
}

impl From<ControlMeta> for Meta {
    fn from(meta: ControlMeta) -> Self {
        Meta::Control(meta)
    }
}

impl From<FrameMeta> for Meta {
    fn from(meta: FrameMeta) -> Self {
        Meta::Frame(Arc::new(meta))
    }
}

impl From<Arc<FrameMeta>> for Meta {
    fn from(meta: Arc<FrameMeta>) -> Self {
        Meta::Frame(meta)
    }
}

impl fmt::Display for Meta {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Meta::Control(control) => control.fmt(f),
            Meta::Frame(frame) => frame.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_mut_isolates_fanned_out_frame() {
        let shared = Arc::new(FrameMeta::empty(1, 0));
        let sibling = Arc::clone(&shared);

        let mut local = shared;
        Arc::make_mut(&mut local).set_attribute("label", "car");

        assert_eq!(local.attribute("label"), Some("car"));
        assert_eq!(sibling.attribute("label"), None);
    }

    #[test]
    fn test_display() {
        let frame = FrameMeta::new(7, 2, 1920, 1080, 25, Arc::from(vec![0u8; 16]));
        assert_eq!(frame.to_string(), "Frame[#7, ch=2, 1920x1080@25, bytes=16]");
        assert_eq!(Meta::from(ControlMeta::stop()).to_string(), "Control[stop, ch=0]");
        let custom = ControlMeta::new(ControlKind::Custom("flush".into()), 3);
        assert_eq!(custom.to_string(), "Control[flush, ch=3]");
    }

    #[test]
    fn test_accessors() {
        let meta = Meta::from(FrameMeta::empty(4, 5));
        assert!(!meta.is_control());
        assert_eq!(meta.channel_index(), 5);
        assert_eq!(meta.as_frame().map(|f| f.frame_index), Some(4));
        assert!(meta.as_control().is_none());
    }
}
