//! Example: multi-channel relay pipeline
//!
//! Several synthetic cameras feed one batching tracker, a filter and a sink
//! that prints what arrives.
//!
//! Usage:
//!   cargo run --release --example relay -- \
//!       --channels 2 --frames 50 --fps 25 --batch 4 --paced
//!
//! Only keep every third frame:
//!   cargo run --release --example relay -- --keep-every 3

use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use framegraph::nodes::{BatchTagger, FrameCollector, FrameFilter, FrameGenerator};
use framegraph::{FrameMeta, Graph, HookPoint, MetaProbe, NodeConfig};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of source channels
    #[arg(short, long, default_value = "2")]
    channels: usize,

    /// Frames produced by each channel
    #[arg(short, long, default_value = "50")]
    frames: u64,

    /// Frame rate of every channel
    #[arg(long, default_value = "25")]
    fps: u32,

    /// Batch size of the tracker node
    #[arg(short, long, default_value = "4")]
    batch: usize,

    /// Emit frames in real time instead of as fast as possible
    #[arg(long)]
    paced: bool,

    /// Keep only frames whose index is a multiple of this
    #[arg(long, default_value = "1")]
    keep_every: u64,

    /// Report stage handlers running longer than this (ms)
    #[arg(long, default_value = "5000")]
    stall_ms: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("=== Relay Example ===");
    info!(
        "{} channel(s), {} frames each at {} fps, tracker batch {}",
        args.channels, args.frames, args.fps, args.batch
    );

    let mut graph = Graph::new().with_stall_threshold(Duration::from_millis(args.stall_ms));

    let mut sources = Vec::with_capacity(args.channels);
    for channel in 0..args.channels {
        let mut generator = FrameGenerator::new(channel, 1280, 720, args.fps)
            .with_limit(args.frames)
            .with_payload_len(64)
            .on_stream_info(|node, info| {
                info!("{} streaming {}x{} at {} fps", node, info.width, info.height, info.fps);
            });
        if args.paced {
            generator = generator.paced();
        }
        info!("Source: {}", generator.stream_info());
        sources.push(graph.add_node(format!("cam{}", channel), generator)?);
    }

    let tracker = graph.add_node(
        NodeConfig::new("tracker").with_batch_size(args.batch),
        BatchTagger::new(),
    )?;
    let keep_every = args.keep_every.max(1);
    let filter = graph.add_node(
        "filter",
        FrameFilter::new(move |f: &FrameMeta| f.frame_index % keep_every == 0),
    )?;
    let (collector, frames) = FrameCollector::new();
    let sink = graph.add_node("sink", collector)?;

    graph.attach_to(tracker, &sources)?;
    graph.attach_to(filter, &[tracker])?;
    graph.attach_to(sink, &[filter])?;

    let probe = MetaProbe::new();
    graph.set_hooks(tracker, probe.hooks())?;

    for id in [tracker, filter, sink] {
        if let Some(description) = graph.describe(id) {
            info!("Node: {}", description);
        }
    }

    let scheduler = graph.start()?;
    scheduler.start_all();

    // The tracker holds back a trailing partial batch, so stop once quiet
    let idle = Duration::from_millis(500).max(Duration::from_secs(2) / args.fps.max(1));
    let mut received = 0usize;
    loop {
        match frames.recv_timeout(idle) {
            Ok(meta) => {
                received += 1;
                if let Some(frame) = meta.as_frame() {
                    info!(
                        "{} batch={}",
                        frame,
                        frame.attribute("batch").unwrap_or("-")
                    );
                }
            }
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Sink went away");
                break;
            }
        }
    }

    scheduler.stop_all();
    scheduler.shutdown();
    scheduler.wait()?;

    info!("Received {} frames", received);
    for point in HookPoint::ALL {
        info!(
            "tracker {:?}: {} metas, peak queue depth {}",
            point,
            probe.count(point),
            probe.peak_depth(point)
        );
    }
    Ok(())
}
