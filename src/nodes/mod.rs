//! Built-in stages
//!
//! Small, general-purpose nodes for assembling and testing pipelines:
//! - **Sources**: [`FrameGenerator`] produces synthetic frames
//! - **Middles**: [`Passthrough`], [`FrameFilter`], [`BatchTagger`]
//! - **Sinks**: [`FrameCollector`] hands results to a channel

mod batch_tagger;
mod collector;
mod filter;
mod generator;
mod passthrough;

pub use batch_tagger::{BATCH_ATTRIBUTE, BatchTagger};
pub use collector::FrameCollector;
pub use filter::FrameFilter;
pub use generator::{FrameGenerator, StreamInfo, StreamInfoHook};
pub use passthrough::Passthrough;
