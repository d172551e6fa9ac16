//! keystone-cam - Perspective-corrected camera frame pipeline
//!
//! Takes YUV 4:2:0 camera frames (with arbitrary row and pixel strides),
//! repacks them as NV21, decodes to RGB and warps a fixed quadrilateral of
//! the image onto an upright rectangle of a target aspect ratio. Results are
//! written as PNG snapshots and/or served as a live preview over HTTP.

mod blur;
mod config;
mod decode;
mod display;
mod frame;
mod pipeline;
mod rectify;
mod remap;
mod server;
mod source;
mod worker;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::display::Presenter;
use crate::frame::CropRect;
use crate::pipeline::FramePipeline;
use crate::server::AppState;
use crate::source::SyntheticSource;
use crate::worker::{FrameWorker, StatsSnapshot, SubmitError};

/// keystone-cam - rectify a skewed view of a document or screen
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Raw I420 (.yuv/.i420) or JPEG file, or a directory of them
    #[arg(short, long, conflicts_with = "synthetic")]
    input: Option<PathBuf>,

    /// Frame width for raw input and synthetic frames
    #[arg(long, default_value_t = 1920)]
    width: u32,

    /// Frame height for raw input and synthetic frames
    #[arg(long, default_value_t = 1080)]
    height: u32,

    /// Generate this many synthetic frames instead of reading files
    #[arg(long)]
    synthetic: Option<u64>,

    /// Synthetic frames use one interleaved chroma buffer (pixel stride 2)
    #[arg(long)]
    semi_planar: bool,

    /// Padding bytes at the end of each synthetic luma row
    #[arg(long, default_value_t = 0)]
    row_padding: usize,

    /// Crop synthetic frames to left,top,right,bottom
    #[arg(long, value_parser = parse_crop)]
    crop: Option<CropRect>,

    /// Write rectified and blurred frames here as PNG
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Feed frames at camera pace and drop those arriving while busy
    #[arg(long)]
    live: bool,

    /// Start the preview web server
    #[arg(long)]
    serve: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "keystone.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_crop(s: &str) -> Result<CropRect, String> {
    let parts: Vec<usize> = s
        .split(',')
        .map(|p| p.trim().parse::<usize>().map_err(|e| format!("{}: {}", p, e)))
        .collect::<Result<_, _>>()?;
    match parts.as_slice() {
        [left, top, right, bottom] => Ok(CropRect::new(*left, *top, *right, *bottom)),
        _ => Err("expected left,top,right,bottom".to_string()),
    }
}

/// Where frames come from
enum Input {
    Files(Vec<PathBuf>),
    Synthetic(SyntheticSource, u64),
}

impl Input {
    fn from_args(args: &Args) -> Result<Self> {
        if let Some(path) = &args.input {
            let files = if path.is_dir() {
                source::list_frame_files(path)?
            } else {
                vec![path.clone()]
            };
            if files.is_empty() {
                bail!("No frame files found in {:?}", path);
            }
            info!("Input: {} file(s) from {:?}", files.len(), path);
            return Ok(Input::Files(files));
        }

        let count = args.synthetic.unwrap_or(30);
        let mut generator = SyntheticSource::new(args.width as usize, args.height as usize)
            .semi_planar(args.semi_planar)
            .row_padding(args.row_padding);
        if let Some(crop) = args.crop {
            generator = generator.crop(crop);
        }
        info!("Input: {} synthetic {}x{} frames (semi-planar: {}, row padding: {})",
            count, args.width, args.height, args.semi_planar, args.row_padding);
        Ok(Input::Synthetic(generator, count))
    }
}

/// Push every frame into the worker. In live mode frames arrive at a fixed
/// pace and are dropped when the worker is still busy; otherwise each frame
/// waits for the worker.
fn feed(
    worker: FrameWorker,
    input: Input,
    live: bool,
    interval: Duration,
    width: u32,
    height: u32,
) -> Result<StatsSnapshot> {
    let submit = |frame| -> Result<()> {
        let result = if live {
            worker.submit(frame)
        } else {
            worker.submit_blocking(frame)
        };
        match result {
            Ok(()) | Err(SubmitError::Busy(_)) => Ok(()),
            Err(SubmitError::Stopped(_)) => bail!("Frame worker stopped unexpectedly"),
        }
    };

    let mut next_due = Instant::now();
    let mut pace = || {
        if live {
            next_due += interval;
            if let Some(wait) = next_due.checked_duration_since(Instant::now()) {
                std::thread::sleep(wait);
            }
        }
    };

    match input {
        Input::Files(files) => {
            for (index, path) in files.iter().enumerate() {
                let frame = match source::load_frame(path, width as usize, height as usize) {
                    Ok(frame) => frame.with_sequence(index as u64),
                    Err(e) => {
                        warn!("Skipping {:?}: {:#}", path, e);
                        continue;
                    }
                };
                submit(frame)?;
                pace();
            }
        }
        Input::Synthetic(mut generator, count) => {
            for _ in 0..count {
                submit(generator.next_frame())?;
                pace();
            }
        }
    }

    let stats = worker.stats();
    drop(worker);
    Ok(stats.snapshot())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("keystone-cam v{}", env!("CARGO_PKG_VERSION"));

    let config = config::Config::load_or_create(&args.config)?;
    let serve = args.serve || config.server.enabled;

    let input = Input::from_args(&args)?;

    let pipeline = FramePipeline::new(&config).context("Invalid rectifier configuration")?;
    match pipeline.rectifier().plan(args.width, args.height) {
        Ok(plan) => {
            info!("Rectifying {}x{} -> {}x{} ({:?}, {})",
                args.width, args.height, plan.width, plan.height,
                config.rectifier.output_format, config.decoder.color_space.as_str());
            debug!("Source quad {:?} -> destination {:?}", plan.source, plan.destination);
            debug!("Homography {:?}", plan.transform.matrix());
        }
        Err(e) => warn!("No rectification for {}x{} frames: {}", args.width, args.height, e),
    }

    let (results_tx, results_rx) = mpsc::sync_channel(1);
    let worker = FrameWorker::spawn(
        pipeline,
        results_tx,
        Duration::from_secs(config.pipeline.stats_interval_secs.max(1)),
    )
    .context("Failed to start frame worker")?;

    let state = serve.then(|| Arc::new(AppState::new(config.clone(), worker.stats())));

    let presenter = Presenter::new(state.clone(), args.output_dir.clone())?;
    let presenter_handle = tokio::task::spawn_blocking(move || presenter.run(results_rx));

    let server_handle = state.map(|state| {
        let addr = format!("{}:{}", config.server.host, config.server.port);
        info!("Starting web server at http://{}", addr);
        tokio::spawn(async move { server::run_server(&addr, state).await })
    });

    let live = args.live;
    let interval = Duration::from_millis(config.pipeline.frame_interval_ms);
    let (width, height) = (args.width, args.height);
    let producer = tokio::task::spawn_blocking(move || feed(worker, input, live, interval, width, height));

    let stats = producer.await.context("Producer task panicked")??;
    let shown = presenter_handle.await.context("Presenter task panicked")?;
    info!("Done: {} submitted, {} processed, {} failed, {} dropped, {} presented",
        stats.submitted, stats.processed, stats.failed, stats.dropped, shown);

    if let Some(server_handle) = server_handle {
        info!("Preview server still running, press Ctrl+C to exit");
        tokio::select! {
            result = server_handle => {
                match result {
                    Ok(Ok(())) => info!("Server exited normally"),
                    Ok(Err(e)) => tracing::error!("Server error: {}", e),
                    Err(e) => tracing::error!("Server task panicked: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_crop() {
        assert_eq!(parse_crop("8, 8,40,32").unwrap(), CropRect::new(8, 8, 40, 32));
        assert!(parse_crop("1,2,3").is_err());
        assert!(parse_crop("a,b,c,d").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from(["keystone-cam", "--synthetic", "5", "--semi-planar", "--width", "640", "--height", "480"]);
        assert_eq!(args.synthetic, Some(5));
        assert!(args.semi_planar);
        assert!(args.input.is_none());
        assert!(Args::try_parse_from(["keystone-cam", "--input", "x.yuv", "--synthetic", "3"]).is_err());
    }

    #[test]
    fn test_feed_synthetic_blocking() {
        let mut config = config::Config::default();
        config.decoder.jpeg_round_trip = false;
        config.blur.enabled = false;
        let pipeline = FramePipeline::new(&config).unwrap();
        let (tx, rx) = mpsc::sync_channel(1);
        let worker = FrameWorker::spawn(pipeline, tx, Duration::from_secs(60)).unwrap();
        let consumer = std::thread::spawn(move || rx.iter().count());

        let input = Input::Synthetic(SyntheticSource::new(32, 24), 4);
        let stats = feed(worker, input, false, Duration::ZERO, 32, 24).unwrap();
        assert_eq!(stats.processed, 4);
        assert_eq!(stats.dropped, 0);
        assert_eq!(consumer.join().unwrap(), 4);
    }
}
