//! Result consumer: publishes processed frames to the preview server and
//! optionally writes them to disk.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::pipeline::ProcessedFrame;
use crate::server::AppState;

pub struct Presenter {
    preview: Option<Arc<AppState>>,
    snapshot_dir: Option<PathBuf>,
    shown: u64,
}

impl Presenter {
    pub fn new(preview: Option<Arc<AppState>>, snapshot_dir: Option<PathBuf>) -> Result<Self> {
        if let Some(dir) = &snapshot_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create output directory {:?}", dir))?;
            info!("Writing snapshots to {:?}", dir);
        }
        Ok(Self {
            preview,
            snapshot_dir,
            shown: 0,
        })
    }

    pub fn present(&mut self, frame: ProcessedFrame) -> Result<()> {
        debug!("Frame {}: {}x{} in {} us (remap {} / decode {} / rectify {} / blur {})",
            frame.sequence,
            frame.rectified.width(),
            frame.rectified.height(),
            frame.timings.total_us(),
            frame.timings.remap_us,
            frame.timings.decode_us,
            frame.timings.rectify_us,
            frame.timings.blur_us);

        if let Some(state) = &self.preview {
            state.update_preview(&frame);
        }

        if let Some(dir) = &self.snapshot_dir {
            write_snapshots(dir, &frame)?;
        }

        self.shown += 1;
        Ok(())
    }

    /// Consume results until the worker side hangs up
    pub fn run(mut self, results: Receiver<ProcessedFrame>) -> u64 {
        for frame in results {
            let sequence = frame.sequence;
            if let Err(e) = self.present(frame) {
                warn!("Failed to present frame {}: {:#}", sequence, e);
            }
        }
        self.shown
    }
}

fn write_snapshots(dir: &Path, frame: &ProcessedFrame) -> Result<()> {
    let path = dir.join(format!("frame_{:06}_rectified.png", frame.sequence));
    frame
        .rectified
        .save(&path)
        .with_context(|| format!("Failed to write {:?}", path))?;

    if let Some(blurred) = &frame.blurred {
        let path = dir.join(format!("frame_{:06}_blurred.png", frame.sequence));
        blurred
            .save(&path)
            .with_context(|| format!("Failed to write {:?}", path))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::FrameTimings;
    use image::RgbImage;
    use std::sync::mpsc;

    fn processed(sequence: u64) -> ProcessedFrame {
        let img = RgbImage::from_pixel(8, 6, image::Rgb([1, 2, 3]));
        ProcessedFrame {
            sequence,
            blurred: Some(img.clone()),
            rectified: img,
            timings: FrameTimings::default(),
        }
    }

    #[test]
    fn test_writes_png_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let mut presenter = Presenter::new(None, Some(out.clone())).unwrap();
        presenter.present(processed(3)).unwrap();

        let rectified = image::open(out.join("frame_000003_rectified.png")).unwrap();
        assert_eq!((rectified.width(), rectified.height()), (8, 6));
        assert!(out.join("frame_000003_blurred.png").exists());
    }

    #[test]
    fn test_run_drains_channel() {
        let (tx, rx) = mpsc::sync_channel(4);
        for i in 0..3 {
            tx.send(processed(i)).unwrap();
        }
        drop(tx);
        let presenter = Presenter::new(None, None).unwrap();
        assert_eq!(presenter.run(rx), 3);
    }
}
